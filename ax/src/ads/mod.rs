//! Ad slots: registration, liveness and offer settlement on the coordinator side
//!
//! [`AdService`] is the executor script. It installs the display methods
//! (`initDisplay`, `registerAdspace`, `unregisterAdspace`, `pong`, `loadAd`,
//! `confirmAd`, `cancelAd`) and the advertiser methods into each coordinator
//! instance, backed by a per-instance [`SlotRegistry`].

mod collaborator;
mod config;
mod input;
pub mod memory;
mod registry;
mod service;

pub use collaborator::{
    AdSelection, Advertiser, ClientOptions, CollaboratorFactory, ImageUpload, InvalidationSink, LoadedAd,
    OfferOutcome, OfferTicket, UploadedImage,
};
pub use config::{DisplayDefaults, LivenessConfig};
pub use input::{AdspaceInput, Bid, InputError};
pub use memory::InMemoryCollaborator;
pub use registry::{PING_CALLBACK, Settlement, SlotRegistry, SlotSnapshot};
pub use service::{AdService, INVALIDATE_CALLBACK};
