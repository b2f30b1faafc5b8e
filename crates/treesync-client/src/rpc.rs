//! Request/response over broker topic pairs with correlation IDs.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;

use treesync_proto::{correlation_id, request_topic, response_topic, RpcRequest, RpcResponse};

use crate::mqtt::{PublishOptions, SubscribeOptions};
use crate::sync::{check_grants, MqttSync, RpcHandlerFn, SyncError};

/// QoS for RPC traffic; requests and responses are never retained.
const RPC_QOS: u8 = 2;

impl MqttSync {
    /// Register an async handler for `command`.
    ///
    /// Requests arrive on `<command>/request`; the resolved return value is
    /// published to `<command>/response/<id>`. A handler that panics is
    /// isolated in its task and sends no response.
    ///
    /// # Errors
    ///
    /// Returns an error when the request-topic subscription fails.
    pub async fn register<F, Fut>(self: &Arc<Self>, command: &str, handler: F) -> Result<(), SyncError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Value> + Send + 'static,
    {
        let topic = request_topic(command);
        let wrapped: RpcHandlerFn = Arc::new(move |args| {
            let fut: BoxFuture<'static, Value> = Box::pin(handler(args));
            fut
        });
        self.lock().rpc_handlers.insert(topic.clone(), wrapped);
        let grants = self
            .client
            .subscribe(&topic, SubscribeOptions { qos: RPC_QOS, rap: false })
            .await?;
        check_grants(&topic, &grants)?;
        Ok(())
    }

    /// Invoke `command` on whichever peer registered it, resolving with the
    /// handler's return value.
    ///
    /// There is no timeout: a lost response leaves the future pending.
    ///
    /// # Errors
    ///
    /// Returns an error when subscribing the response topic or publishing
    /// the request fails, or when the response channel closes unresolved.
    pub async fn call(self: &Arc<Self>, command: &str, args: Value) -> Result<Value, SyncError> {
        let id = correlation_id();
        let reply_topic = response_topic(command, &id);
        let (tx, rx) = oneshot::channel();
        self.lock().rpc_callbacks.insert(reply_topic.clone(), tx);
        let grants = self
            .client
            .subscribe(&reply_topic, SubscribeOptions { qos: RPC_QOS, rap: false })
            .await?;
        check_grants(&reply_topic, &grants)?;
        let request = RpcRequest { id, args };
        let payload =
            serde_json::to_vec(&request).map_err(|err| SyncError::Serialize(err.to_string()))?;
        self.client
            .publish(
                &request_topic(command),
                &payload,
                PublishOptions { qos: RPC_QOS, retain: false },
            )
            .await?;
        rx.await.map_err(|_| SyncError::ResponseDropped)
    }

    pub(crate) fn dispatch_rpc_request(
        self: &Arc<Self>,
        topic: &str,
        payload: &[u8],
        handler: RpcHandlerFn,
    ) {
        let request: RpcRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(topic, error = %err, "malformed RPC request");
                return;
            }
        };
        let Some(command) = topic.strip_suffix("/request") else {
            return;
        };
        let reply_topic = response_topic(command, &request.id);
        let id = request.id.clone();
        let client = self.client.clone();
        tokio::spawn(async move {
            let result = handler(request.args).await;
            let response = RpcResponse { id, result };
            match serde_json::to_vec(&response) {
                Ok(payload) => {
                    if let Err(err) = client
                        .publish(
                            &reply_topic,
                            &payload,
                            PublishOptions { qos: RPC_QOS, retain: false },
                        )
                        .await
                    {
                        tracing::warn!(topic = %reply_topic, error = %err, "failed to publish RPC response");
                    }
                }
                Err(err) => {
                    tracing::warn!(topic = %reply_topic, error = %err, "failed to encode RPC response");
                }
            }
        });
    }

    pub(crate) fn dispatch_rpc_response(
        self: &Arc<Self>,
        topic: &str,
        payload: &[u8],
        sender: oneshot::Sender<Value>,
    ) {
        let response: RpcResponse = match serde_json::from_slice(payload) {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(topic, error = %err, "malformed RPC response");
                return;
            }
        };
        let _ = sender.send(response.result);
        let client = self.client.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            let _ = client.unsubscribe(&topic).await;
        });
    }
}
