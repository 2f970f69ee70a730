//! RPC error types

use thiserror::Error;

use crate::transport::{ErrorCode, ErrorPayload, TransportKind};

/// Errors surfaced to callers of the RPC protocol
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("Untrusted origin '{origin}' over {via}")]
    TransportRejected { origin: String, via: TransportKind },

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Handler failure: {0}")]
    HandlerFailure(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Coordinator disconnected")]
    Disconnected,
}

impl RpcError {
    /// Rebuild the caller-side error from an `error` message payload
    pub fn from_payload(payload: ErrorPayload) -> Self {
        match payload.code {
            ErrorCode::MethodNotFound => RpcError::MethodNotFound(payload.message),
            ErrorCode::HandlerFailure => RpcError::HandlerFailure(payload.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_payload_maps_codes() {
        let err = RpcError::from_payload(ErrorPayload::method_not_found("missing"));
        assert!(matches!(err, RpcError::MethodNotFound(ref m) if m.contains("missing")));

        let err = RpcError::from_payload(ErrorPayload::handler_failure("boom"));
        assert_eq!(err, RpcError::HandlerFailure("boom".to_string()));
    }

    #[test]
    fn test_rejection_message_names_origin_and_transport() {
        let err = RpcError::TransportRejected {
            origin: "https://evil.example".to_string(),
            via: TransportKind::Window,
        };
        let text = err.to_string();
        assert!(text.contains("https://evil.example"));
        assert!(text.contains("window"));
    }
}
