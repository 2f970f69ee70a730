//! Adspace descriptions and bids as they travel over the wire

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::config::DisplayDefaults;

/// Description of one ad slot on a page
///
/// `uid` identifies the slot across reloads; registering the same `uid` again
/// refers to the same slot even if the other fields changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdspaceInput {
    pub uid: String,
    #[serde(default)]
    pub app_key: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub mime_types: Vec<String>,
    #[serde(default)]
    pub category: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub advertisers_whitelist: Vec<String>,
    #[serde(default)]
    pub price_slot: String,
}

/// Why an adspace input cannot be used
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("Adspace uid is empty")]
    MissingUid,

    #[error("Adspace {uid} has no visible size ({width}x{height})")]
    ZeroSize { uid: String, width: u32, height: u32 },

    #[error("Adspace {uid} has no app key")]
    MissingAppKey { uid: String },
}

impl AdspaceInput {
    pub fn new(uid: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            uid: uid.into(),
            app_key: String::new(),
            width,
            height,
            mime_types: Vec::new(),
            category: Vec::new(),
            languages: Vec::new(),
            advertisers_whitelist: Vec::new(),
            price_slot: String::new(),
        }
    }

    /// Fill empty fields from the site-wide defaults
    pub fn apply_defaults(mut self, defaults: &DisplayDefaults) -> Self {
        debug!(uid = %self.uid, "AdspaceInput::apply_defaults: called");
        if self.app_key.is_empty() {
            self.app_key = defaults.app_key.clone();
        }
        if self.price_slot.is_empty() {
            self.price_slot = defaults.price_slot.clone();
        }
        if self.mime_types.is_empty() {
            self.mime_types = defaults.mime_types.clone();
        }
        if self.category.is_empty() {
            self.category = defaults.category.clone();
        }
        if self.languages.is_empty() {
            self.languages = defaults.languages.clone();
        }
        if self.advertisers_whitelist.is_empty() {
            self.advertisers_whitelist = defaults.advertisers_whitelist.clone();
        }
        self
    }

    pub fn validate(&self) -> Result<(), InputError> {
        if self.uid.is_empty() {
            return Err(InputError::MissingUid);
        }
        if self.width == 0 || self.height == 0 {
            return Err(InputError::ZeroSize {
                uid: self.uid.clone(),
                width: self.width,
                height: self.height,
            });
        }
        if self.app_key.is_empty() {
            return Err(InputError::MissingAppKey { uid: self.uid.clone() });
        }
        Ok(())
    }
}

/// A bid event selected for a slot
///
/// `content` is a JSON document; `tags` are `[name, value, ...]` arrays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub id: String,
    #[serde(default)]
    pub pubkey: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
}

impl Bid {
    /// First value of the first tag named `name`
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }
}
