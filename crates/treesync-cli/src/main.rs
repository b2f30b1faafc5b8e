//! # treesync CLI
//!
//! Command-line utilities for encoding, decoding, and inspecting topics.

use anyhow::Result;
use std::env;

use treesync_core::{decode_topic_element, encode_topic_element, topic_to_path};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "encode" => {
            if args.len() < 3 {
                eprintln!("Usage: treesync encode <segment>");
                std::process::exit(1);
            }
            println!("{}", encode_topic_element(&args[2]));
        }
        "decode" => {
            if args.len() < 3 {
                eprintln!("Usage: treesync decode <segment>");
                std::process::exit(1);
            }
            println!("{}", decode_topic_element(&args[2]));
        }
        "parse" => {
            if args.len() < 3 {
                eprintln!("Usage: treesync parse <topic>");
                std::process::exit(1);
            }
            let path = topic_to_path(&args[2]);
            println!("{}", serde_json::to_string(&path)?);
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"treesync CLI

USAGE:
    treesync <COMMAND> [OPTIONS]

COMMANDS:
    encode <segment>  Percent-encode a path segment for use in a topic
    decode <segment>  Decode a percent-encoded topic segment
    parse <topic>     Print a topic's path segments as JSON
    help              Show this help message

EXAMPLES:
    treesync encode "a/b"
    treesync decode "a%2Fb"
    treesync parse "/org/device/@scope/cap/1.0.0"
"#
    );
}
