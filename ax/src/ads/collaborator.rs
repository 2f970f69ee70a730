//! Interfaces of the external ad-selection and advertiser collaborators

use std::sync::Arc;

use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::input::{AdspaceInput, Bid};

/// How an offer was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OfferOutcome {
    Confirmed,
    Cancelled,
}

/// One-shot settlement handle for an offer, consumed by [`OfferTicket::settle`]
#[derive(Debug)]
pub struct OfferTicket(oneshot::Sender<OfferOutcome>);

impl OfferTicket {
    /// A ticket and the receiver the collaborator waits on
    pub fn new() -> (Self, oneshot::Receiver<OfferOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Settle the offer; false when the collaborator stopped listening
    pub fn settle(self, outcome: OfferOutcome) -> bool {
        self.0.send(outcome).is_ok()
    }
}

/// Result of a successful `load_ad`
#[derive(Debug)]
pub struct LoadedAd {
    pub bid: Bid,
    pub offer_id: String,
    pub ticket: OfferTicket,
}

/// Channel through which the display collaborator pushes offer invalidations
#[derive(Debug, Clone)]
pub struct InvalidationSink(mpsc::UnboundedSender<String>);

impl InvalidationSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    pub fn invalidate(&self, offer_id: &str) -> bool {
        self.0.send(offer_id.to_string()).is_ok()
    }
}

/// Options passed to `initDisplay` and `initAdvertiser`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOptions {
    #[serde(default)]
    pub relays: Vec<String>,
    /// Signing key; the collaborator generates one when absent
    #[serde(default)]
    pub auth: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageUpload {
    pub image_data: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedImage {
    pub url: String,
    pub mime_type: String,
    pub size: usize,
}

/// Bid selection for display slots
#[async_trait]
pub trait AdSelection: Send + Sync {
    async fn register_adspace(&self, input: &AdspaceInput) -> Result<()>;

    async fn unregister_adspace(&self, input: &AdspaceInput) -> Result<()>;

    /// Select a bid for the slot; the returned ticket must be settled once
    async fn load_ad(&self, input: &AdspaceInput) -> Result<LoadedAd>;
}

/// Bid authoring for advertisers
#[async_trait]
pub trait Advertiser: Send + Sync {
    async fn list(&self) -> Result<Vec<Bid>>;

    async fn publish(&self, draft: Value) -> Result<Bid>;

    async fn cancel(&self, bid_id: &str) -> Result<()>;

    async fn get_nip01_meta(&self, pubkey: &str) -> Result<Value>;

    async fn upload_image(&self, upload: ImageUpload) -> Result<UploadedImage>;
}

/// Builds collaborators when a display or advertiser is initialised
#[async_trait]
pub trait CollaboratorFactory: Send + Sync {
    async fn display(&self, options: ClientOptions, invalidations: InvalidationSink) -> Result<Arc<dyn AdSelection>>;

    async fn advertiser(&self, options: ClientOptions) -> Result<Arc<dyn Advertiser>>;
}
