//! Tab side of the protocol
//!
//! A tab calls [`connect`] with its [`Environment`] and gets a [`Connection`]
//! whose [`ClientStub`] invokes coordinator methods and receives callbacks.

mod connect;
mod environment;
mod stub;

pub use connect::{ConnectMode, Connection, connect};
pub use environment::{Environment, SharedHost};
pub use stub::{Callback, ClientStub};
