//! Tab-side offer lifecycle: load, render, confirm or cancel, retry

mod backoff;
mod presenter;
mod render;

pub use backoff::{Backoff, BackoffConfig};
pub use presenter::{OfferState, Presenter, SlotStatus};
pub use render::{ActionType, RenderContent, RenderError, Renderer, SUPPORTED_MIME_TYPES};
