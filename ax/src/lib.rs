//! adexec - shared ad executor
//!
//! Tabs of the same origin share one logical ad-serving process. A single
//! elected coordinator holds the authoritative slot and offer state; tabs
//! invoke its methods and receive its broadcasts.
//!
//! # Core Concepts
//!
//! - **One authority**: a shared host when available, otherwise one instance
//!   per tab with a deterministic master election over a broadcast channel
//! - **Strict origins**: every inbound message is checked against the page origin
//! - **Liveness**: the master pings slots and reclaims the ones nobody answers for
//! - **Offers settle once**: each offer ticket is consumed by exactly one confirm or cancel
//!
//! # Modules
//!
//! - [`transport`] - wire messages, ports, broadcast channel, origin policy
//! - [`coordinator`] - method registry, election and dispatch
//! - [`client`] - client stub and tab connection
//! - [`ads`] - slot registry, liveness loop and the ad methods
//! - [`offer`] - tab-side offer lifecycle and retry backoff
//! - [`events`] - event bus
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod ads;
pub mod cli;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod offer;
pub mod transport;

// Re-export commonly used types
pub use ads::{AdService, AdspaceInput, Bid, InMemoryCollaborator, SlotRegistry};
pub use client::{ClientStub, ConnectMode, Connection, Environment, connect};
pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorHandle, ElectionState, ExecutorScript};
pub use error::RpcError;
pub use events::{AxEvent, EventBus};
pub use offer::{Presenter, RenderContent, Renderer};
