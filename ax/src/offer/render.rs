//! Render content extraction and the renderer seam

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ads::Bid;

/// Mime types a renderer is expected to handle
pub const SUPPORTED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "text/plain"];

/// What has to happen before an offer counts as delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// Shown at all
    View,
    /// Scrolled into view
    Attention,
    /// Clicked
    Link,
}

impl ActionType {
    /// Parse a bid's `k` tag; anything unrecognised is treated as a view
    pub fn from_tag(tag: Option<&str>) -> Self {
        match tag {
            Some("attention") => ActionType::Attention,
            Some("link") => ActionType::Link,
            _ => ActionType::View,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActionType::View => "view",
            ActionType::Attention => "attention",
            ActionType::Link => "link",
        };
        write!(f, "{}", name)
    }
}

/// Render failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("Bid {bid_id} has invalid content: {reason}")]
    InvalidContent { bid_id: String, reason: String },

    #[error("Unsupported mime type: {0}")]
    UnsupportedMimeType(String),

    #[error("Render failed: {0}")]
    Failed(String),
}

/// Everything a renderer needs to present one bid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderContent {
    pub mime_type: String,
    pub payload: String,
    pub link: Option<String>,
    pub description: String,
    pub action_type: ActionType,
    pub call_to_action: Option<String>,
}

impl RenderContent {
    /// Extract render content from the bid's `m`/`k` tags and JSON content
    pub fn from_bid(bid: &Bid) -> Result<Self, RenderError> {
        let invalid = |reason: &str| RenderError::InvalidContent {
            bid_id: bid.id.clone(),
            reason: reason.to_string(),
        };

        let content: Value = serde_json::from_str(&bid.content).map_err(|e| invalid(&e.to_string()))?;
        let field = |name: &str| content.get(name).and_then(Value::as_str).map(str::to_string);

        let mime_type = bid.tag("m").ok_or_else(|| invalid("missing m tag"))?.to_string();
        if !SUPPORTED_MIME_TYPES.contains(&mime_type.as_str()) {
            return Err(RenderError::UnsupportedMimeType(mime_type));
        }
        let payload = field("payload").ok_or_else(|| invalid("missing payload"))?;

        Ok(Self {
            mime_type,
            payload,
            link: field("link"),
            description: field("description").unwrap_or_default(),
            action_type: ActionType::from_tag(bid.tag("k")),
            call_to_action: field("call_to_action"),
        })
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Presents ads inside a tab
///
/// `render` resolves once the content's [`ActionType`] condition is met and
/// fails when the ad cannot be shown. Dropping the future abandons the render.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, uid: &str, content: &RenderContent) -> Result<(), RenderError>;
}
