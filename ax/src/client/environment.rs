//! The cross-context primitives a tab can reach

use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::coordinator::CoordinatorHandle;
use crate::events::EventBus;
use crate::transport::BroadcastChannel;

/// A process shared by every tab of one origin
///
/// The first tab to connect starts the coordinator; later tabs attach to it.
#[derive(Default)]
pub struct SharedHost {
    coordinator: OnceLock<CoordinatorHandle>,
}

impl SharedHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared coordinator, started with `start` on first use
    ///
    /// A coordinator that has shut down is not restarted.
    pub fn coordinator(&self, start: impl FnOnce() -> CoordinatorHandle) -> CoordinatorHandle {
        self.coordinator
            .get_or_init(|| {
                debug!("SharedHost::coordinator: starting shared coordinator");
                start()
            })
            .clone()
    }

    pub fn is_started(&self) -> bool {
        self.coordinator.get().is_some()
    }
}

/// What a tab of `origin` has available
#[derive(Clone)]
pub struct Environment {
    origin: String,
    shared: Option<Arc<SharedHost>>,
    channel: BroadcastChannel,
    events: Arc<EventBus>,
}

impl Environment {
    /// Environment with a shared process available
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            shared: Some(Arc::new(SharedHost::new())),
            channel: BroadcastChannel::default(),
            events: Arc::new(EventBus::default()),
        }
    }

    /// Environment where tabs can only run their own workers
    pub fn without_shared_worker(origin: impl Into<String>) -> Self {
        Self {
            shared: None,
            ..Self::new(origin)
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn shared_host(&self) -> Option<&Arc<SharedHost>> {
        self.shared.as_ref()
    }

    pub fn channel(&self) -> &BroadcastChannel {
        &self.channel
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }
}
