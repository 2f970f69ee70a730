//! SlotRegistry - managed ad slots, their offers and the liveness loop
//!
//! The registry is an actor owning every managed slot of one coordinator
//! instance. On the master instance a liveness loop periodically asks the
//! registry to ping all slots; a slot whose usage counter is still zero when
//! its grace timer fires is reclaimed and unregistered from the ad-selection
//! collaborator exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use eyre::{Result, eyre};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::collaborator::{AdSelection, OfferOutcome, OfferTicket};
use super::config::LivenessConfig;
use super::input::AdspaceInput;
use crate::coordinator::CoordinatorHandle;
use crate::events::{AxEvent, EventBus};

/// Callback broadcast to challenge a slot
pub const PING_CALLBACK: &str = "ping";

/// Outcome of a confirm/cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Settlement {
    Settled(OfferOutcome),
    AlreadySettled,
}

impl Settlement {
    pub fn took_effect(self) -> bool {
        matches!(self, Settlement::Settled(_))
    }
}

/// Point-in-time view of one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub uid: String,
    pub usage_count: u32,
    pub offer_id: Option<String>,
    pub grace_armed: bool,
}

struct ManagedSlot {
    input: AdspaceInput,
    usage_count: u32,
    grace: Option<JoinHandle<()>>,
    /// Bumped on every ping round; stale grace timers carry an older value
    generation: u64,
    /// Registered since the last ping round
    fresh: bool,
    offer_id: Option<String>,
}

impl ManagedSlot {
    fn disarm(&mut self) {
        if let Some(timer) = self.grace.take() {
            timer.abort();
        }
    }
}

struct PendingOffer {
    uid: String,
    ticket: OfferTicket,
}

enum SlotRequest {
    Register {
        input: AdspaceInput,
        reply_tx: oneshot::Sender<bool>,
    },
    Remove {
        uid: String,
        reply_tx: oneshot::Sender<Option<AdspaceInput>>,
    },
    Pong {
        uid: String,
    },
    AttachSelection {
        selection: Arc<dyn AdSelection>,
    },
    OfferIssued {
        uid: String,
        offer_id: String,
        ticket: OfferTicket,
        reply_tx: oneshot::Sender<()>,
    },
    Settle {
        offer_id: String,
        outcome: OfferOutcome,
        reply_tx: oneshot::Sender<Settlement>,
    },
    Invalidate {
        offer_id: String,
        reply_tx: oneshot::Sender<bool>,
    },
    Tick {
        reply_tx: Option<oneshot::Sender<usize>>,
    },
    GraceExpired {
        uid: String,
        generation: u64,
    },
    Snapshot {
        reply_tx: oneshot::Sender<Vec<SlotSnapshot>>,
    },
    Shutdown,
}

/// Cloneable handle to the slot registry actor
#[derive(Clone)]
pub struct SlotRegistry {
    tx: mpsc::Sender<SlotRequest>,
    config: LivenessConfig,
    coordinator: CoordinatorHandle,
}

impl SlotRegistry {
    /// Spawn the registry actor for one coordinator instance
    pub fn spawn(config: LivenessConfig, coordinator: CoordinatorHandle, events: Arc<EventBus>) -> Self {
        debug!(?config, "SlotRegistry::spawn: called");
        let (tx, rx) = mpsc::channel(256);
        let actor = RegistryActor {
            config: config.clone(),
            coordinator: coordinator.clone(),
            events,
            tx: tx.downgrade(),
            rx,
            slots: HashMap::new(),
            offers: HashMap::new(),
            selection: None,
        };
        tokio::spawn(actor.run());
        Self {
            tx,
            config,
            coordinator,
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> SlotRequest) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| eyre!("Slot registry channel closed"))?;
        reply_rx.await.map_err(|_| eyre!("Slot registry channel closed"))
    }

    async fn send(&self, request: SlotRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| eyre!("Slot registry channel closed"))
    }

    /// Track `input`; returns true on the first registration of its uid
    pub async fn register(&self, input: AdspaceInput) -> Result<bool> {
        debug!(uid = %input.uid, "SlotRegistry::register: called");
        self.request(|reply_tx| SlotRequest::Register { input, reply_tx }).await
    }

    /// Stop tracking `uid`, returning its last input
    pub async fn remove(&self, uid: &str) -> Result<Option<AdspaceInput>> {
        debug!(%uid, "SlotRegistry::remove: called");
        let uid = uid.to_string();
        self.request(|reply_tx| SlotRequest::Remove { uid, reply_tx }).await
    }

    /// Record that a tab still displays `uid`; unknown uids are ignored
    pub async fn pong(&self, uid: &str) -> Result<()> {
        self.send(SlotRequest::Pong { uid: uid.to_string() }).await
    }

    /// Collaborator used to unregister reclaimed slots
    pub async fn attach_selection(&self, selection: Arc<dyn AdSelection>) -> Result<()> {
        self.send(SlotRequest::AttachSelection { selection }).await
    }

    /// Track a freshly loaded offer, cancelling the slot's previous unsettled one
    pub async fn offer_issued(&self, uid: &str, offer_id: &str, ticket: OfferTicket) -> Result<()> {
        debug!(%uid, %offer_id, "SlotRegistry::offer_issued: called");
        let uid = uid.to_string();
        let offer_id = offer_id.to_string();
        self.request(|reply_tx| SlotRequest::OfferIssued {
            uid,
            offer_id,
            ticket,
            reply_tx,
        })
        .await
    }

    /// Confirm or cancel an offer; only the first call per offer takes effect
    pub async fn settle(&self, offer_id: &str, outcome: OfferOutcome) -> Result<Settlement> {
        debug!(%offer_id, ?outcome, "SlotRegistry::settle: called");
        let offer_id = offer_id.to_string();
        self.request(|reply_tx| SlotRequest::Settle {
            offer_id,
            outcome,
            reply_tx,
        })
        .await
    }

    /// Drop the ticket of an invalidated offer; true when it was still pending
    pub async fn invalidate(&self, offer_id: &str) -> Result<bool> {
        let offer_id = offer_id.to_string();
        self.request(|reply_tx| SlotRequest::Invalidate { offer_id, reply_tx })
            .await
    }

    /// Run one ping round now; returns the number of slots pinged
    pub async fn tick(&self) -> Result<usize> {
        self.request(|reply_tx| SlotRequest::Tick {
            reply_tx: Some(reply_tx),
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<Vec<SlotSnapshot>> {
        self.request(|reply_tx| SlotRequest::Snapshot { reply_tx }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(SlotRequest::Shutdown).await
    }

    /// Start the liveness loop
    ///
    /// The first round runs immediately, then every ping interval. The loop
    /// stops for good once its instance is no longer master or has shut down.
    pub fn start_liveness(&self) -> JoinHandle<()> {
        info!(interval_ms = self.config.ping_interval_ms, "Starting liveness loop");
        let tx = self.tx.clone();
        let coordinator = self.coordinator.clone();
        let period = self.config.ping_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = coordinator.closed() => {
                        info!("Liveness loop stopped: instance shut down");
                        break;
                    }
                }
                if !coordinator.is_master() {
                    info!("Liveness loop stopped: instance is not master");
                    break;
                }
                if tx.send(SlotRequest::Tick { reply_tx: None }).await.is_err() {
                    debug!("Liveness loop stopped: registry closed");
                    break;
                }
            }
        })
    }
}

struct RegistryActor {
    config: LivenessConfig,
    coordinator: CoordinatorHandle,
    events: Arc<EventBus>,
    /// Weak so the actor stops once every handle and timer is gone
    tx: mpsc::WeakSender<SlotRequest>,
    rx: mpsc::Receiver<SlotRequest>,
    slots: HashMap<String, ManagedSlot>,
    offers: HashMap<String, PendingOffer>,
    selection: Option<Arc<dyn AdSelection>>,
}

impl RegistryActor {
    async fn run(mut self) {
        debug!("SlotRegistry started");

        while let Some(req) = self.rx.recv().await {
            match req {
                SlotRequest::Register { input, reply_tx } => {
                    let first = self.register(input);
                    let _ = reply_tx.send(first);
                }
                SlotRequest::Remove { uid, reply_tx } => {
                    let removed = self.remove(&uid);
                    if removed.is_some() {
                        self.events.emit(AxEvent::SlotUnregistered { uid });
                    }
                    let _ = reply_tx.send(removed);
                }
                SlotRequest::Pong { uid } => match self.slots.get_mut(&uid) {
                    Some(slot) => slot.usage_count += 1,
                    None => debug!(%uid, "Pong for unknown slot ignored"),
                },
                SlotRequest::AttachSelection { selection } => {
                    self.selection = Some(selection);
                }
                SlotRequest::OfferIssued {
                    uid,
                    offer_id,
                    ticket,
                    reply_tx,
                } => {
                    self.offer_issued(uid, offer_id, ticket);
                    let _ = reply_tx.send(());
                }
                SlotRequest::Settle {
                    offer_id,
                    outcome,
                    reply_tx,
                } => {
                    let settlement = self.settle(&offer_id, outcome);
                    let _ = reply_tx.send(settlement);
                }
                SlotRequest::Invalidate { offer_id, reply_tx } => {
                    let known = self.invalidate(&offer_id);
                    let _ = reply_tx.send(known);
                }
                SlotRequest::Tick { reply_tx } => {
                    let pinged = self.tick().await;
                    if let Some(reply_tx) = reply_tx {
                        let _ = reply_tx.send(pinged);
                    }
                }
                SlotRequest::GraceExpired { uid, generation } => {
                    self.grace_expired(uid, generation);
                }
                SlotRequest::Snapshot { reply_tx } => {
                    let _ = reply_tx.send(self.snapshot());
                }
                SlotRequest::Shutdown => break,
            }
        }

        for slot in self.slots.values_mut() {
            slot.disarm();
        }
        debug!("SlotRegistry stopped");
    }

    fn register(&mut self, input: AdspaceInput) -> bool {
        let uid = input.uid.clone();
        match self.slots.get_mut(&uid) {
            Some(slot) => {
                slot.usage_count += 1;
                slot.input = input;
                debug!(%uid, usage_count = slot.usage_count, "Slot registered again");
                false
            }
            None => {
                self.slots.insert(
                    uid.clone(),
                    ManagedSlot {
                        input,
                        usage_count: 1,
                        grace: None,
                        generation: 0,
                        fresh: true,
                        offer_id: None,
                    },
                );
                info!(%uid, "Slot registered");
                self.events.emit(AxEvent::SlotRegistered { uid });
                true
            }
        }
    }

    fn remove(&mut self, uid: &str) -> Option<AdspaceInput> {
        let mut slot = self.slots.remove(uid)?;
        slot.disarm();
        if let Some(offer_id) = slot.offer_id.take() {
            self.settle(&offer_id, OfferOutcome::Cancelled);
        }
        Some(slot.input)
    }

    fn offer_issued(&mut self, uid: String, offer_id: String, ticket: OfferTicket) {
        let previous = self
            .slots
            .get_mut(&uid)
            .and_then(|slot| slot.offer_id.replace(offer_id.clone()));
        if let Some(previous) = previous.filter(|previous| previous != &offer_id) {
            debug!(%uid, %previous, "Cancelling superseded offer");
            self.settle(&previous, OfferOutcome::Cancelled);
        }
        self.offers.insert(
            offer_id.clone(),
            PendingOffer {
                uid: uid.clone(),
                ticket,
            },
        );
        self.events.emit(AxEvent::OfferIssued { uid, offer_id });
    }

    fn settle(&mut self, offer_id: &str, outcome: OfferOutcome) -> Settlement {
        let Some(pending) = self.offers.remove(offer_id) else {
            debug!(%offer_id, "Offer already settled");
            return Settlement::AlreadySettled;
        };
        if let Some(slot) = self.slots.get_mut(&pending.uid)
            && slot.offer_id.as_deref() == Some(offer_id)
        {
            slot.offer_id = None;
        }
        if !pending.ticket.settle(outcome) {
            debug!(%offer_id, "Collaborator no longer waiting on offer");
        }
        self.events.emit(AxEvent::OfferSettled {
            offer_id: offer_id.to_string(),
            confirmed: outcome == OfferOutcome::Confirmed,
        });
        Settlement::Settled(outcome)
    }

    fn invalidate(&mut self, offer_id: &str) -> bool {
        self.events.emit(AxEvent::OfferInvalidated {
            offer_id: offer_id.to_string(),
        });
        let Some(pending) = self.offers.remove(offer_id) else {
            return false;
        };
        if let Some(slot) = self.slots.get_mut(&pending.uid)
            && slot.offer_id.as_deref() == Some(offer_id)
        {
            slot.offer_id = None;
        }
        true
    }

    async fn tick(&mut self) -> usize {
        let grace = self.config.grace();
        let exempt_new = self.config.exempt_new_slots;
        let timer_tx = self.tx.upgrade();
        let mut uids = Vec::with_capacity(self.slots.len());

        for (uid, slot) in self.slots.iter_mut() {
            slot.disarm();
            slot.generation += 1;
            slot.usage_count = 0;
            uids.push(uid.clone());

            if slot.fresh && exempt_new {
                slot.fresh = false;
                continue;
            }
            slot.fresh = false;

            let Some(tx) = timer_tx.clone() else {
                debug!(%uid, "Registry closing, grace timer not armed");
                continue;
            };
            let uid = uid.clone();
            let generation = slot.generation;
            slot.grace = Some(tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let _ = tx.send(SlotRequest::GraceExpired { uid, generation }).await;
            }));
        }

        debug!(slots = uids.len(), "Liveness tick");
        self.events.emit(AxEvent::LivenessTick { slots: uids.len() });
        for uid in &uids {
            if let Err(e) = self.coordinator.trigger_callback(PING_CALLBACK, vec![json!(uid)]).await {
                warn!(%uid, error = %e, "Failed to ping slot");
            }
        }
        uids.len()
    }

    fn grace_expired(&mut self, uid: String, generation: u64) {
        let abandoned = match self.slots.get(&uid) {
            Some(slot) => slot.generation == generation && slot.usage_count == 0,
            None => false,
        };
        if !abandoned {
            debug!(%uid, "Slot still active");
            return;
        }

        let Some(input) = self.remove(&uid) else {
            return;
        };
        info!(%uid, "No activity for slot, unregistering it");
        match &self.selection {
            Some(selection) => {
                let selection = selection.clone();
                tokio::spawn(async move {
                    if let Err(e) = selection.unregister_adspace(&input).await {
                        warn!(uid = %input.uid, error = %e, "Failed to unregister abandoned slot");
                    }
                });
            }
            None => warn!(%uid, "No display collaborator to unregister abandoned slot"),
        }
        self.events.emit(AxEvent::SlotAbandoned { uid });
    }

    fn snapshot(&self) -> Vec<SlotSnapshot> {
        let mut snapshot: Vec<SlotSnapshot> = self
            .slots
            .iter()
            .map(|(uid, slot)| SlotSnapshot {
                uid: uid.clone(),
                usage_count: slot.usage_count,
                offer_id: slot.offer_id.clone(),
                grace_armed: slot.grace.is_some(),
            })
            .collect();
        snapshot.sort_by(|a, b| a.uid.cmp(&b.uid));
        snapshot
    }
}
