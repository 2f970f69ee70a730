//! Event types for coordinator and ad-slot activity
//!
//! These events represent observable activity:
//! - Election outcomes and rejected messages
//! - Slot registration, reaping and unregistration
//! - Offer issue, settlement, invalidation and retry scheduling

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transport::TransportKind;

/// Core event enum - the vocabulary of adexec activity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AxEvent {
    // === Coordinator ===
    /// A coordinator instance finished election
    InstanceElected { instance_id: String, is_master: bool },
    /// An inbound message failed origin validation and was dropped
    MessageRejected { origin: String, via: TransportKind },

    // === Slot registry ===
    /// First registration of a slot uid
    SlotRegistered { uid: String },
    /// A slot was explicitly unregistered
    SlotUnregistered { uid: String },
    /// A slot missed a full grace window and was reclaimed
    SlotAbandoned { uid: String },
    /// The master pinged tracked slots
    LivenessTick { slots: usize },

    // === Offers ===
    /// An offer was loaded for a slot
    OfferIssued { uid: String, offer_id: String },
    /// An offer was confirmed or cancelled
    OfferSettled { offer_id: String, confirmed: bool },
    /// The ad-selection collaborator invalidated an offer
    OfferInvalidated { offer_id: String },
    /// A tab scheduled another preparation attempt for a slot
    RetryScheduled { uid: String, failures: u32, delay_ms: u64 },
}

impl AxEvent {
    /// Short name of the event variant
    pub fn event_type(&self) -> &'static str {
        match self {
            AxEvent::InstanceElected { .. } => "InstanceElected",
            AxEvent::MessageRejected { .. } => "MessageRejected",
            AxEvent::SlotRegistered { .. } => "SlotRegistered",
            AxEvent::SlotUnregistered { .. } => "SlotUnregistered",
            AxEvent::SlotAbandoned { .. } => "SlotAbandoned",
            AxEvent::LivenessTick { .. } => "LivenessTick",
            AxEvent::OfferIssued { .. } => "OfferIssued",
            AxEvent::OfferSettled { .. } => "OfferSettled",
            AxEvent::OfferInvalidated { .. } => "OfferInvalidated",
            AxEvent::RetryScheduled { .. } => "RetryScheduled",
        }
    }

    /// Slot uid the event refers to, if any
    pub fn uid(&self) -> Option<&str> {
        match self {
            AxEvent::SlotRegistered { uid }
            | AxEvent::SlotUnregistered { uid }
            | AxEvent::SlotAbandoned { uid }
            | AxEvent::OfferIssued { uid, .. }
            | AxEvent::RetryScheduled { uid, .. } => Some(uid),
            _ => None,
        }
    }
}

/// Timestamped event, as printed by the simulator
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AxEvent,
}

impl EventLogEntry {
    pub fn new(event: AxEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = AxEvent::RetryScheduled {
            uid: "s1".to_string(),
            failures: 2,
            delay_ms: 2700,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"RetryScheduled""#));
        assert!(json.contains(r#""delay_ms":2700"#));
    }

    #[test]
    fn test_uid_accessor() {
        assert_eq!(AxEvent::SlotAbandoned { uid: "s9".into() }.uid(), Some("s9"));
        assert_eq!(AxEvent::LivenessTick { slots: 3 }.uid(), None);
        assert_eq!(
            AxEvent::OfferInvalidated {
                offer_id: "o1".into()
            }
            .event_type(),
            "OfferInvalidated"
        );
    }

    #[test]
    fn test_log_entry_flattens_event() {
        let entry = EventLogEntry::new(AxEvent::SlotRegistered { uid: "s1".into() });
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "SlotRegistered");
        assert_eq!(json["uid"], "s1");
        assert!(json.get("timestamp").is_some());
    }
}
