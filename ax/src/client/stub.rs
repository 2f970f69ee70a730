//! ClientStub - per-tab RPC endpoint

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RpcError;
use crate::transport::{ErrorPayload, MessageKind, OriginPolicy, Port, PortReceiver, RpcMessage};

/// Callback handler; runs on the stub task and should return quickly
pub type Callback = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

enum StubRequest {
    Invoke {
        method: String,
        args: Vec<Value>,
        reply_tx: oneshot::Sender<Result<Value, RpcError>>,
    },
    RegisterCallback {
        name: String,
        callback: Callback,
    },
    Shutdown,
}

/// Cloneable handle to a client stub task
///
/// The task owns the pending-invocation and callback tables; results are
/// matched to callers by invocation id and settle exactly once.
#[derive(Clone)]
pub struct ClientStub {
    tx: mpsc::Sender<StubRequest>,
    client_id: String,
}

impl ClientStub {
    /// Spawn the stub task over a connected pair of ports
    pub fn spawn(client_id: &str, outbound: Port, inbound: PortReceiver, policy: OriginPolicy, buffer: usize) -> Self {
        debug!(%client_id, via = %inbound.kind(), "ClientStub::spawn: called");
        let (tx, rx) = mpsc::channel(buffer);
        tokio::spawn(run(client_id.to_string(), rx, outbound, inbound, policy));
        Self {
            tx,
            client_id: client_id.to_string(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Invoke `method` on the coordinator and wait for its result
    ///
    /// There is no built-in timeout; the future only resolves early with
    /// [`RpcError::Disconnected`] when the stub or the coordinator goes away.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        debug!(client_id = %self.client_id, %method, "ClientStub::invoke: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StubRequest::Invoke {
                method: method.to_string(),
                args,
                reply_tx,
            })
            .await
            .map_err(|_| RpcError::Disconnected)?;
        reply_rx.await.map_err(|_| RpcError::Disconnected)?
    }

    /// Invoke and decode the result
    pub async fn invoke_as<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T, RpcError> {
        let value = self.invoke(method, args).await?;
        serde_json::from_value(value).map_err(|e| RpcError::InvalidPayload(format!("{} returned {}", method, e)))
    }

    /// Register the handler for broadcast `name`, replacing any earlier one
    pub async fn register_callback<F>(&self, name: &str, f: F) -> Result<(), RpcError>
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        debug!(client_id = %self.client_id, %name, "ClientStub::register_callback: called");
        self.tx
            .send(StubRequest::RegisterCallback {
                name: name.to_string(),
                callback: Arc::new(f),
            })
            .await
            .map_err(|_| RpcError::Disconnected)
    }

    /// Stop the stub; pending invocations resolve with [`RpcError::Disconnected`]
    pub async fn shutdown(&self) {
        debug!(client_id = %self.client_id, "ClientStub::shutdown: called");
        let _ = self.tx.send(StubRequest::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn run(
    client_id: String,
    mut rx: mpsc::Receiver<StubRequest>,
    outbound: Port,
    mut inbound: PortReceiver,
    policy: OriginPolicy,
) {
    let mut pending: HashMap<String, oneshot::Sender<Result<Value, RpcError>>> = HashMap::new();
    let mut callbacks: HashMap<String, Callback> = HashMap::new();
    let via = inbound.kind();

    debug!(%client_id, "ClientStub started");

    loop {
        tokio::select! {
            req = rx.recv() => {
                let Some(req) = req else { break };
                match req {
                    StubRequest::Invoke { method, args, reply_tx } => {
                        let id = Uuid::now_v7().to_string();
                        let message = RpcMessage::invoke(id.clone(), method, args, policy.page_origin());
                        if outbound.send(message) {
                            pending.insert(id, reply_tx);
                        } else {
                            let _ = reply_tx.send(Err(RpcError::Disconnected));
                        }
                    }
                    StubRequest::RegisterCallback { name, callback } => {
                        callbacks.insert(name, callback);
                    }
                    StubRequest::Shutdown => break,
                }
            }

            message = inbound.recv() => {
                let Some(message) = message else {
                    info!(%client_id, "Coordinator port closed");
                    break;
                };

                if let Err(e) = policy.check(&message.origin, via) {
                    warn!(%client_id, error = %e, "Dropping inbound message");
                    continue;
                }

                match message.kind {
                    MessageKind::Result | MessageKind::Error => {
                        let Some(reply_tx) = message.id.as_ref().and_then(|id| pending.remove(id)) else {
                            debug!(%client_id, id = ?message.id, "Result for unknown invocation ignored");
                            continue;
                        };
                        let outcome = if message.kind == MessageKind::Result {
                            Ok(message.first_arg())
                        } else {
                            Err(RpcError::from_payload(ErrorPayload::from_value(&message.first_arg())))
                        };
                        let _ = reply_tx.send(outcome);
                    }
                    MessageKind::Callback => match callbacks.get(&message.method) {
                        Some(callback) => callback(message.args),
                        None => debug!(%client_id, method = %message.method, "No callback registered"),
                    },
                    MessageKind::Invoke => {
                        debug!(%client_id, method = %message.method, "Ignoring invoke sent to a client");
                    }
                }
            }
        }
    }

    debug!(%client_id, pending = pending.len(), "ClientStub stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportKind;
    use serde_json::json;
    use std::sync::Mutex;

    const PAGE: &str = "https://site.example";

    /// Stub wired to raw ports standing in for a coordinator
    fn wired() -> (ClientStub, PortReceiver, Port) {
        let (to_coord, coord_rx) = Port::pair(TransportKind::MessagePort);
        let (to_client, client_rx) = Port::pair(TransportKind::MessagePort);
        let stub = ClientStub::spawn("tab-1", to_coord, client_rx, OriginPolicy::new(PAGE), 16);
        (stub, coord_rx, to_client)
    }

    #[tokio::test]
    async fn test_invoke_resolves_with_result() {
        let (stub, mut coord_rx, to_client) = wired();

        let call = tokio::spawn({
            let stub = stub.clone();
            async move { stub.invoke("loadAd", vec![json!({"uid": "s1"})]).await }
        });

        let request = coord_rx.recv().await.unwrap();
        assert_eq!(request.kind, MessageKind::Invoke);
        assert_eq!(request.origin, PAGE);
        let id = request.id.unwrap();
        to_client.send(RpcMessage::result(id.clone(), "loadAd", json!(["bid", "o1"]), PAGE));
        // Second settlement for the same id is ignored
        to_client.send(RpcMessage::result(id, "loadAd", json!("again"), PAGE));

        assert_eq!(call.await.unwrap().unwrap(), json!(["bid", "o1"]));
    }

    #[tokio::test]
    async fn test_invoke_rejects_with_remote_error() {
        let (stub, mut coord_rx, to_client) = wired();
        let call = tokio::spawn({
            let stub = stub.clone();
            async move { stub.invoke("nope", vec![]).await }
        });

        let id = coord_rx.recv().await.unwrap().id.unwrap();
        to_client.send(RpcMessage::error(id, "nope", &ErrorPayload::method_not_found("nope"), ""));

        assert!(matches!(call.await.unwrap(), Err(RpcError::MethodNotFound(_))));
    }

    #[tokio::test]
    async fn test_forged_origin_cannot_settle_or_trigger() {
        let (stub, mut coord_rx, to_client) = wired();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let sink = hits.clone();
        stub.register_callback("ping", move |args| sink.lock().unwrap().push(args))
            .await
            .unwrap();

        let call = tokio::spawn({
            let stub = stub.clone();
            async move { stub.invoke("pong", vec![json!("s1")]).await }
        });
        let id = coord_rx.recv().await.unwrap().id.unwrap();

        to_client.send(RpcMessage::callback("ping", vec![json!("x")], "https://evil.example"));
        to_client.send(RpcMessage::result(id.clone(), "pong", json!("forged"), "https://evil.example"));
        to_client.send(RpcMessage::callback("ping", vec![json!("s1")], ""));
        to_client.send(RpcMessage::result(id, "pong", Value::Null, PAGE));

        assert_eq!(call.await.unwrap().unwrap(), Value::Null);
        assert_eq!(*hits.lock().unwrap(), vec![vec![json!("s1")]]);
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_invocations() {
        let (stub, mut coord_rx, to_client) = wired();
        let call = tokio::spawn({
            let stub = stub.clone();
            async move { stub.invoke("loadAd", vec![]).await }
        });
        coord_rx.recv().await.unwrap();
        drop(to_client);

        assert_eq!(call.await.unwrap(), Err(RpcError::Disconnected));
        assert_eq!(stub.invoke("loadAd", vec![]).await, Err(RpcError::Disconnected));
    }

    #[tokio::test]
    async fn test_invoke_as_reports_bad_payload() {
        let (stub, mut coord_rx, to_client) = wired();
        let call = tokio::spawn({
            let stub = stub.clone();
            async move { stub.invoke_as::<bool>("confirmAd", vec![json!("o1")]).await }
        });
        let id = coord_rx.recv().await.unwrap().id.unwrap();
        to_client.send(RpcMessage::result(id, "confirmAd", json!("yes"), PAGE));

        assert!(matches!(call.await.unwrap(), Err(RpcError::InvalidPayload(_))));
    }
}
