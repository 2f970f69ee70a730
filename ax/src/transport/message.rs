//! Wire message shape shared by every transport

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of an [`RpcMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Invoke,
    Result,
    Error,
    Callback,
}

/// A single protocol message
///
/// `id` is a fresh token per invocation and `None` for callback broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    pub id: Option<String>,
    pub kind: MessageKind,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub origin: String,
}

impl RpcMessage {
    /// Build an invocation request
    pub fn invoke(id: impl Into<String>, method: impl Into<String>, args: Vec<Value>, origin: &str) -> Self {
        Self {
            id: Some(id.into()),
            kind: MessageKind::Invoke,
            method: method.into(),
            args,
            origin: origin.to_string(),
        }
    }

    /// Build a successful result for invocation `id`
    pub fn result(id: impl Into<String>, method: impl Into<String>, value: Value, origin: &str) -> Self {
        Self {
            id: Some(id.into()),
            kind: MessageKind::Result,
            method: method.into(),
            args: vec![value],
            origin: origin.to_string(),
        }
    }

    /// Build an error result for invocation `id`
    pub fn error(id: impl Into<String>, method: impl Into<String>, payload: &ErrorPayload, origin: &str) -> Self {
        let value = serde_json::to_value(payload).unwrap_or(Value::Null);
        Self {
            id: Some(id.into()),
            kind: MessageKind::Error,
            method: method.into(),
            args: vec![value],
            origin: origin.to_string(),
        }
    }

    /// Build a callback broadcast
    pub fn callback(method: impl Into<String>, args: Vec<Value>, origin: &str) -> Self {
        Self {
            id: None,
            kind: MessageKind::Callback,
            method: method.into(),
            args,
            origin: origin.to_string(),
        }
    }

    /// First argument, or `null` when absent
    pub fn first_arg(&self) -> Value {
        self.args.first().cloned().unwrap_or(Value::Null)
    }
}

/// Error category carried in an `error` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    MethodNotFound,
    HandlerFailure,
}

/// Body of an `error` message (`args[0]`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorPayload {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: ErrorCode::MethodNotFound,
            message: format!("Method {} not found", method),
        }
    }

    pub fn handler_failure(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::HandlerFailure,
            message: message.into(),
        }
    }

    /// Decode from the first argument of an `error` message
    ///
    /// Bare strings are accepted and treated as handler failures.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => Self::handler_failure(s.clone()),
            other => serde_json::from_value(other.clone())
                .unwrap_or_else(|_| Self::handler_failure(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let msg = RpcMessage::invoke("id-1", "loadAd", vec![json!({"uid": "s1"})], "https://site.example");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({
                "id": "id-1",
                "kind": "invoke",
                "method": "loadAd",
                "args": [{"uid": "s1"}],
                "origin": "https://site.example"
            })
        );
    }

    #[test]
    fn test_callback_has_null_id() {
        let msg = RpcMessage::callback("ping", vec![json!("s1")], "");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""id":null"#));
        assert!(json.contains(r#""kind":"callback""#));
    }

    #[test]
    fn test_missing_args_and_origin_default() {
        let msg: RpcMessage = serde_json::from_str(r#"{"id":null,"kind":"callback","method":"ping"}"#).unwrap();
        assert!(msg.args.is_empty());
        assert_eq!(msg.origin, "");
        assert_eq!(msg.first_arg(), Value::Null);
    }

    #[test]
    fn test_error_payload_from_value() {
        let msg = RpcMessage::error("id-2", "x", &ErrorPayload::method_not_found("x"), "");
        let payload = ErrorPayload::from_value(&msg.first_arg());
        assert_eq!(payload.code, ErrorCode::MethodNotFound);

        let payload = ErrorPayload::from_value(&json!("plain failure"));
        assert_eq!(payload.code, ErrorCode::HandlerFailure);
        assert_eq!(payload.message, "plain failure");
    }
}
