//! Transport layer
//!
//! Moves [`RpcMessage`] values between contexts:
//! - **Port:** FIFO point-to-point link between a tab and a coordinator
//! - **BroadcastChannel:** same-origin fan-out used for election and callback relay
//! - **OriginPolicy:** strict origin check applied to every inbound message
//!
//! Sends are fire-and-forget. Ordering is FIFO within one channel only.

mod channel;
mod message;
mod origin;
mod port;

pub use channel::{BroadcastChannel, ChannelFrame, FrameBody};
pub use message::{ErrorCode, ErrorPayload, MessageKind, RpcMessage};
pub use origin::{OriginPolicy, TransportKind};
pub use port::{Port, PortReceiver};
