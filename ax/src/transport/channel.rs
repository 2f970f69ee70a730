//! Same-origin broadcast channel shared by every coordinator instance

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::message::RpcMessage;

/// Default frame capacity of a broadcast channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Frame published on the broadcast channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFrame {
    /// Instance that published the frame
    pub sender: Uuid,
    pub origin: String,
    pub body: FrameBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FrameBody {
    /// An instance entered election with this nonce
    Announce { nonce: u64 },
    /// Reply to an announcement from an instance that is still a contender
    Present { nonce: u64, elected: bool },
    /// A callback broadcast relayed to the clients of every instance
    Relay { message: RpcMessage },
}

/// Fan-out channel; every subscriber sees every frame, including its own
#[derive(Debug, Clone)]
pub struct BroadcastChannel {
    tx: broadcast::Sender<ChannelFrame>,
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "BroadcastChannel::new: called");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget publish; frames with no subscribers are dropped
    pub fn publish(&self, frame: ChannelFrame) {
        let _ = self.tx.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelFrame> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives_frame() {
        let channel = BroadcastChannel::default();
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 2);

        let frame = ChannelFrame {
            sender: Uuid::new_v4(),
            origin: String::new(),
            body: FrameBody::Announce { nonce: 7 },
        };
        channel.publish(frame.clone());

        assert_eq!(a.recv().await.unwrap(), frame);
        assert_eq!(b.recv().await.unwrap(), frame);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let channel = BroadcastChannel::new(4);
        channel.publish(ChannelFrame {
            sender: Uuid::new_v4(),
            origin: String::new(),
            body: FrameBody::Present {
                nonce: 1,
                elected: true,
            },
        });
    }

    #[test]
    fn test_frame_body_serialization() {
        let json = serde_json::to_string(&FrameBody::Present {
            nonce: 3,
            elected: false,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"present","nonce":3,"elected":false}"#);
    }
}
