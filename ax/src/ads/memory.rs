//! In-memory collaborators for the simulator and tests

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::{Result, bail};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::collaborator::{
    AdSelection, Advertiser, ClientOptions, CollaboratorFactory, ImageUpload, InvalidationSink, LoadedAd,
    OfferOutcome, OfferTicket, UploadedImage,
};
use super::input::{AdspaceInput, Bid};

#[derive(Default)]
struct State {
    registered: Vec<String>,
    unregistered: Vec<String>,
    outcomes: HashMap<String, OfferOutcome>,
    issued: u64,
    load_failures: u32,
    published: Vec<Bid>,
    sink: Option<InvalidationSink>,
    display_options: Option<ClientOptions>,
}

/// Serves bids from a fixed inventory and records everything it is asked to do
///
/// Clones share state, so the same collaborator can be handed out by the
/// factory and inspected afterwards.
#[derive(Clone, Default)]
pub struct InMemoryCollaborator {
    state: Arc<Mutex<State>>,
    inventory: Arc<Vec<Bid>>,
}

impl InMemoryCollaborator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collaborator cycling through `bids`
    pub fn with_inventory(bids: Vec<Bid>) -> Self {
        Self {
            state: Arc::default(),
            inventory: Arc::new(bids),
        }
    }

    /// A plain-text bid with view semantics
    pub fn sample_bid(n: u64) -> Bid {
        let content = json!({
            "payload": format!("Ad #{}", n),
            "link": format!("https://advertiser.example/{}", n),
            "description": "Sample advertisement",
            "call_to_action": "Visit",
        });
        Bid {
            id: format!("bid-{}", n),
            pubkey: "sample".to_string(),
            content: content.to_string(),
            tags: vec![
                vec!["m".to_string(), "text/plain".to_string()],
                vec!["k".to_string(), "view".to_string()],
            ],
        }
    }

    /// Make the next `n` loads fail
    pub async fn fail_next_loads(&self, n: u32) {
        self.state.lock().await.load_failures = n;
    }

    /// Push an invalidation for `offer_id` through the display sink
    pub async fn invalidate(&self, offer_id: &str) -> bool {
        match &self.state.lock().await.sink {
            Some(sink) => sink.invalidate(offer_id),
            None => false,
        }
    }

    pub async fn registered(&self) -> Vec<String> {
        self.state.lock().await.registered.clone()
    }

    pub async fn unregistered(&self) -> Vec<String> {
        self.state.lock().await.unregistered.clone()
    }

    pub async fn outcome(&self, offer_id: &str) -> Option<OfferOutcome> {
        self.state.lock().await.outcomes.get(offer_id).copied()
    }

    pub async fn issued(&self) -> u64 {
        self.state.lock().await.issued
    }

    pub async fn display_options(&self) -> Option<ClientOptions> {
        self.state.lock().await.display_options.clone()
    }
}

#[async_trait]
impl AdSelection for InMemoryCollaborator {
    async fn register_adspace(&self, input: &AdspaceInput) -> Result<()> {
        debug!(uid = %input.uid, "InMemoryCollaborator::register_adspace: called");
        self.state.lock().await.registered.push(input.uid.clone());
        Ok(())
    }

    async fn unregister_adspace(&self, input: &AdspaceInput) -> Result<()> {
        debug!(uid = %input.uid, "InMemoryCollaborator::unregister_adspace: called");
        self.state.lock().await.unregistered.push(input.uid.clone());
        Ok(())
    }

    async fn load_ad(&self, input: &AdspaceInput) -> Result<LoadedAd> {
        let mut state = self.state.lock().await;
        if state.load_failures > 0 {
            state.load_failures -= 1;
            bail!("No bids available for {}", input.uid);
        }

        state.issued += 1;
        let n = state.issued;
        let bid = if self.inventory.is_empty() {
            Self::sample_bid(n)
        } else {
            self.inventory[(n as usize - 1) % self.inventory.len()].clone()
        };
        let offer_id = format!("offer-{}", n);
        debug!(uid = %input.uid, %offer_id, "InMemoryCollaborator::load_ad: issued");

        let (ticket, outcome_rx) = OfferTicket::new();
        let shared = self.state.clone();
        let recorded_id = offer_id.clone();
        tokio::spawn(async move {
            if let Ok(outcome) = outcome_rx.await {
                shared.lock().await.outcomes.insert(recorded_id, outcome);
            }
        });

        Ok(LoadedAd { bid, offer_id, ticket })
    }
}

#[async_trait]
impl Advertiser for InMemoryCollaborator {
    async fn list(&self) -> Result<Vec<Bid>> {
        Ok(self.state.lock().await.published.clone())
    }

    async fn publish(&self, draft: Value) -> Result<Bid> {
        let tags: Vec<Vec<String>> = match draft.get("tags") {
            Some(tags) => serde_json::from_value(tags.clone())?,
            None => Vec::new(),
        };
        let content = match draft.get("content") {
            Some(Value::String(content)) => content.clone(),
            Some(other) => other.to_string(),
            None => bail!("Bid draft has no content"),
        };
        let bid = Bid {
            id: Uuid::new_v4().to_string(),
            pubkey: "memory".to_string(),
            content,
            tags,
        };
        self.state.lock().await.published.push(bid.clone());
        Ok(bid)
    }

    async fn cancel(&self, bid_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let before = state.published.len();
        state.published.retain(|bid| bid.id != bid_id);
        if state.published.len() == before {
            bail!("Unknown bid {}", bid_id);
        }
        Ok(())
    }

    async fn get_nip01_meta(&self, pubkey: &str) -> Result<Value> {
        let short: String = pubkey.chars().take(8).collect();
        Ok(json!({ "pubkey": pubkey, "name": format!("user-{}", short) }))
    }

    async fn upload_image(&self, upload: ImageUpload) -> Result<UploadedImage> {
        if !upload.mime_type.starts_with("image/") {
            bail!("Not an image: {}", upload.mime_type);
        }
        Ok(UploadedImage {
            url: format!("memory://images/{}", Uuid::new_v4()),
            mime_type: upload.mime_type,
            size: upload.image_data.len(),
        })
    }
}

#[async_trait]
impl CollaboratorFactory for InMemoryCollaborator {
    async fn display(&self, options: ClientOptions, invalidations: InvalidationSink) -> Result<Arc<dyn AdSelection>> {
        let mut state = self.state.lock().await;
        state.sink = Some(invalidations);
        state.display_options = Some(options);
        Ok(Arc::new(self.clone()))
    }

    async fn advertiser(&self, _options: ClientOptions) -> Result<Arc<dyn Advertiser>> {
        Ok(Arc::new(self.clone()))
    }
}
