//! Coordinator: method registry, RPC dispatch and master election
//!
//! One coordinator instance answers invocations from the clients attached to
//! it and broadcasts callbacks to them:
//! - **Invoke:** positional-argument request, answered by a `result` or `error`
//! - **Callback:** fire-and-forget broadcast to every connected client
//! - **Election:** instances sharing a broadcast channel pick one master
//!
//! Handlers run in their own tasks; a failing or panicking handler only
//! produces an `error` result for its caller.

mod config;
mod core;
mod election;
mod handle;
mod messages;
mod registry;

pub use config::CoordinatorConfig;
pub use core::{Coordinator, ExecutorScript, StartupHook};
pub use election::{Ballot, Election, ElectionState};
pub use handle::CoordinatorHandle;
pub use messages::{CoordRequest, CoordinatorMetrics};
pub use registry::{Method, MethodRegistry, decode_arg, method_fn};
