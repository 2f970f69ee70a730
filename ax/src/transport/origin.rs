//! Strict origin validation for inbound messages

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RpcError;

/// The cross-context primitive a message arrived over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Port of a process shared by every tab
    MessagePort,
    /// A dedicated worker's own global scope
    DedicatedWorker,
    /// Same-origin broadcast channel
    BroadcastChannel,
    /// Window-level post, where the sender controls the reported origin
    Window,
}

impl TransportKind {
    /// Whether the runtime guarantees the origin of messages on this transport
    pub fn cannot_forge_origin(self) -> bool {
        match self {
            TransportKind::MessagePort | TransportKind::DedicatedWorker | TransportKind::BroadcastChannel => true,
            TransportKind::Window => false,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::MessagePort => "message-port",
            TransportKind::DedicatedWorker => "dedicated-worker",
            TransportKind::BroadcastChannel => "broadcast-channel",
            TransportKind::Window => "window",
        };
        f.write_str(name)
    }
}

/// Origin allow-list: the page origin, plus `""` over transports that cannot forge it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginPolicy {
    page_origin: String,
}

impl OriginPolicy {
    pub fn new(page_origin: impl Into<String>) -> Self {
        Self {
            page_origin: page_origin.into(),
        }
    }

    pub fn page_origin(&self) -> &str {
        &self.page_origin
    }

    /// Origins accepted for a message that arrived over `via`
    pub fn allowed_origins(&self, via: TransportKind) -> Vec<&str> {
        let mut allowed = vec![self.page_origin.as_str()];
        if via.cannot_forge_origin() {
            allowed.push("");
        }
        allowed
    }

    /// Accept or reject a message's reported origin
    pub fn check(&self, origin: &str, via: TransportKind) -> Result<(), RpcError> {
        if self.allowed_origins(via).contains(&origin) {
            return Ok(());
        }
        debug!(%origin, %via, page_origin = %self.page_origin, "OriginPolicy::check: rejected");
        Err(RpcError::TransportRejected {
            origin: origin.to_string(),
            via,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = "https://news.example";

    #[test]
    fn test_page_origin_accepted_everywhere() {
        let policy = OriginPolicy::new(PAGE);
        for via in [
            TransportKind::MessagePort,
            TransportKind::DedicatedWorker,
            TransportKind::BroadcastChannel,
            TransportKind::Window,
        ] {
            assert!(policy.check(PAGE, via).is_ok(), "page origin rejected over {via}");
        }
    }

    #[test]
    fn test_empty_origin_only_over_trusted_transports() {
        let policy = OriginPolicy::new(PAGE);
        assert!(policy.check("", TransportKind::MessagePort).is_ok());
        assert!(policy.check("", TransportKind::DedicatedWorker).is_ok());
        assert!(policy.check("", TransportKind::BroadcastChannel).is_ok());
        assert!(matches!(
            policy.check("", TransportKind::Window),
            Err(RpcError::TransportRejected { .. })
        ));
    }

    #[test]
    fn test_foreign_origin_rejected() {
        let policy = OriginPolicy::new(PAGE);
        let err = policy.check("https://evil.example", TransportKind::MessagePort).unwrap_err();
        assert_eq!(
            err,
            RpcError::TransportRejected {
                origin: "https://evil.example".to_string(),
                via: TransportKind::MessagePort,
            }
        );
        // Prefix tricks do not pass
        assert!(policy.check("https://news.example.evil", TransportKind::Window).is_err());
    }

    #[test]
    fn test_allowed_origins() {
        let policy = OriginPolicy::new(PAGE);
        assert_eq!(policy.allowed_origins(TransportKind::Window), vec![PAGE]);
        assert_eq!(policy.allowed_origins(TransportKind::BroadcastChannel), vec![PAGE, ""]);
    }
}
