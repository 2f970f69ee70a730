//! Event bus for live observability
//!
//! Every significant coordination action emits an [`AxEvent`]: election results,
//! rejected messages, slot registration and reaping, offer settlement, retries.
//! Consumers (the simulator, tests) subscribe to the bus.
//!
//! ```rust,ignore
//! let bus = Arc::new(EventBus::with_default_capacity());
//! let mut rx = bus.subscribe();
//! bus.emit(AxEvent::SlotRegistered { uid: "s1".into() });
//! while let Ok(event) = rx.recv().await {
//!     println!("{}", event.event_type());
//! }
//! ```

mod bus;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus};
pub use types::{AxEvent, EventLogEntry};
