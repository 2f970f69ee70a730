//! Message types for the Coordinator

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use super::registry::Method;
use crate::transport::{ErrorPayload, Port, RpcMessage, TransportKind};

/// Internal requests to the Coordinator task
pub enum CoordRequest {
    /// A client context connected; `port` carries messages back to it
    Attach {
        client_id: String,
        port: Port,
        reply_tx: oneshot::Sender<()>,
    },

    /// A client context went away
    Detach { client_id: String },

    /// A message arrived from a client over `via`
    Inbound {
        client_id: String,
        via: TransportKind,
        message: RpcMessage,
    },

    /// Register (or replace) a method after startup
    RegisterMethod { name: String, method: Arc<dyn Method> },

    /// Broadcast a callback to every connected client
    TriggerCallback { name: String, args: Vec<Value> },

    /// A spawned handler finished (internal)
    Completed {
        client_id: String,
        id: String,
        method: String,
        outcome: Result<Value, ErrorPayload>,
    },

    /// The election window elapsed (internal)
    ElectionDeadline,

    /// Get current metrics
    GetMetrics {
        reply_tx: oneshot::Sender<CoordinatorMetrics>,
    },

    /// Shutdown the coordinator
    Shutdown,
}

/// Coordinator metrics for observability
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CoordinatorMetrics {
    pub connected_clients: usize,
    pub registered_methods: usize,
    pub pending_invocations: usize,
    pub invocations: u64,
    pub rejected_messages: u64,
    pub handler_failures: u64,
    pub duplicate_invocations: u64,
    pub callbacks_sent: u64,
}
