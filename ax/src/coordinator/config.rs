//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Channel buffer size for coordinator requests
    #[serde(rename = "channel-buffer", default = "default_channel_buffer")]
    pub channel_buffer: usize,

    /// Client stub request buffer size
    #[serde(rename = "client-buffer", default = "default_client_buffer")]
    pub client_buffer: usize,

    /// How long an instance collects election frames before deciding
    #[serde(rename = "election-window-ms", default = "default_election_window_ms")]
    pub election_window_ms: u64,

    /// Completed invocation ids remembered per instance to reject replays
    #[serde(rename = "completed-ids", default = "default_completed_ids")]
    pub completed_ids: usize,
}

fn default_channel_buffer() -> usize {
    debug!("default_channel_buffer: called");
    1000
}

fn default_client_buffer() -> usize {
    100
}

fn default_election_window_ms() -> u64 {
    250
}

fn default_completed_ids() -> usize {
    4096
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        debug!("CoordinatorConfig::default: called");
        Self {
            channel_buffer: 1000,
            client_buffer: 100,
            election_window_ms: 250,
            completed_ids: 4096,
        }
    }
}

impl CoordinatorConfig {
    /// Get the election window as a Duration
    pub fn election_window(&self) -> Duration {
        Duration::from_millis(self.election_window_ms)
    }
}
