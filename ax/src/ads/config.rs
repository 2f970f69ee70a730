//! Ad slot configuration: liveness timing and adspace defaults

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Liveness loop timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Interval between ping rounds
    #[serde(rename = "ping-interval-ms", default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// How long a pinged slot has to answer before it is reclaimed
    #[serde(rename = "grace-ms", default = "default_grace_ms")]
    pub grace_ms: u64,

    /// Skip reclamation in the first grace window after a slot registers
    #[serde(rename = "exempt-new-slots", default = "default_exempt_new_slots")]
    pub exempt_new_slots: bool,
}

fn default_ping_interval_ms() -> u64 {
    debug!("default_ping_interval_ms: called");
    10_000
}

fn default_grace_ms() -> u64 {
    5_000
}

fn default_exempt_new_slots() -> bool {
    true
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            grace_ms: default_grace_ms(),
            exempt_new_slots: default_exempt_new_slots(),
        }
    }
}

impl LivenessConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// Site-wide defaults applied to adspace inputs that leave a field empty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayDefaults {
    #[serde(rename = "app-key", default)]
    pub app_key: String,

    #[serde(rename = "price-slot", default = "default_price_slot")]
    pub price_slot: String,

    #[serde(rename = "mime-types", default = "default_mime_types")]
    pub mime_types: Vec<String>,

    #[serde(default)]
    pub category: Vec<String>,

    #[serde(default)]
    pub languages: Vec<String>,

    #[serde(rename = "advertisers-whitelist", default)]
    pub advertisers_whitelist: Vec<String>,

    /// Relays handed to the display collaborator
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,
}

fn default_price_slot() -> String {
    "BTC1_000".to_string()
}

fn default_mime_types() -> Vec<String> {
    ["image/gif", "image/png", "image/jpeg", "text/plain"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_relays() -> Vec<String> {
    [
        "wss://relay.ngengine.org",
        "wss://relay2.ngengine.org",
        "wss://relay.damus.io",
        "wss://relay.primal.net",
        "wss://relay.nostr.band",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for DisplayDefaults {
    fn default() -> Self {
        Self {
            app_key: String::new(),
            price_slot: default_price_slot(),
            mime_types: default_mime_types(),
            category: Vec::new(),
            languages: Vec::new(),
            advertisers_whitelist: Vec::new(),
            relays: default_relays(),
        }
    }
}
