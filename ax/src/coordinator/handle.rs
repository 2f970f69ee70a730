//! CoordinatorHandle - interface to one running coordinator instance

use std::future::Future;
use std::sync::Arc;

use eyre::{Result, eyre};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;
use uuid::Uuid;

use super::election::ElectionState;
use super::messages::{CoordRequest, CoordinatorMetrics};
use super::registry::{Method, method_fn};
use crate::transport::{Port, PortReceiver};

/// Handle to a coordinator task
///
/// This handle is cloneable and is what the executor script, the liveness
/// loop and the transport glue use to talk to the instance.
#[derive(Clone)]
pub struct CoordinatorHandle {
    /// Sender to the Coordinator task
    tx: mpsc::Sender<CoordRequest>,

    /// Election role, published once the window closes
    role: watch::Receiver<ElectionState>,

    instance_id: Uuid,
}

impl CoordinatorHandle {
    pub(crate) fn new(tx: mpsc::Sender<CoordRequest>, role: watch::Receiver<ElectionState>, instance_id: Uuid) -> Self {
        debug!(%instance_id, "CoordinatorHandle::new: called");
        Self { tx, role, instance_id }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    async fn send(&self, request: CoordRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| eyre!("Coordinator channel closed"))
    }

    /// Register or replace a method on the running instance
    pub async fn register_method(&self, name: &str, method: Arc<dyn Method>) -> Result<()> {
        debug!(%name, "CoordinatorHandle::register_method: called");
        self.send(CoordRequest::RegisterMethod {
            name: name.to_string(),
            method,
        })
        .await
    }

    /// Register an async closure as a method on the running instance
    pub async fn register_fn<F, Fut>(&self, name: &str, f: F) -> Result<()>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register_method(name, method_fn(f)).await
    }

    /// Broadcast callback `name` to every connected client
    pub async fn trigger_callback(&self, name: &str, args: Vec<Value>) -> Result<()> {
        debug!(%name, "CoordinatorHandle::trigger_callback: called");
        self.send(CoordRequest::TriggerCallback {
            name: name.to_string(),
            args,
        })
        .await
    }

    /// Connect a client: `outbound` carries messages to it, `inbound` brings its messages in
    ///
    /// Returns once the instance has the client in its table, so every
    /// callback triggered afterwards reaches it. The client is detached
    /// automatically once its inbound port closes.
    pub async fn attach(&self, client_id: &str, outbound: Port, mut inbound: PortReceiver) -> Result<()> {
        debug!(%client_id, via = %inbound.kind(), "CoordinatorHandle::attach: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(CoordRequest::Attach {
            client_id: client_id.to_string(),
            port: outbound,
            reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| eyre!("Coordinator channel closed"))?;

        let tx = self.tx.clone();
        let client_id = client_id.to_string();
        let via = inbound.kind();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let request = CoordRequest::Inbound {
                    client_id: client_id.clone(),
                    via,
                    message,
                };
                if tx.send(request).await.is_err() {
                    return;
                }
            }
            debug!(%client_id, "CoordinatorHandle::attach: inbound port closed");
            let _ = tx.send(CoordRequest::Detach { client_id }).await;
        });
        Ok(())
    }

    pub fn role(&self) -> ElectionState {
        *self.role.borrow()
    }

    /// True while this instance is elected and still running
    pub fn is_master(&self) -> bool {
        self.role() == ElectionState::Elected && !self.tx.is_closed()
    }

    /// Wait for the election window to close; returns whether this instance won
    pub async fn wait_for_election(&self) -> Result<bool> {
        let mut role = self.role.clone();
        let state = *role
            .wait_for(|state| *state != ElectionState::Announcing)
            .await
            .map_err(|_| eyre!("Coordinator channel closed"))?;
        Ok(state == ElectionState::Elected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the instance has stopped
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    /// Get current coordinator metrics
    pub async fn metrics(&self) -> Result<CoordinatorMetrics> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(CoordRequest::GetMetrics { reply_tx }).await?;
        reply_rx.await.map_err(|_| eyre!("Coordinator channel closed"))
    }

    /// Request shutdown of the coordinator
    pub async fn shutdown(&self) -> Result<()> {
        debug!(instance_id = %self.instance_id, "CoordinatorHandle::shutdown: called");
        self.send(CoordRequest::Shutdown).await
    }
}
