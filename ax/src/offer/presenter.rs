//! Presenter - the tab-side offer lifecycle
//!
//! A presenter owns the slots one tab displays. For each slot it runs
//! attempts (register on first use, `loadAd`, render, then `confirmAd` or
//! `cancelAd`), retries failed attempts with [`Backoff`], answers liveness
//! pings for the slots it still holds and restarts a slot whose offer the
//! collaborator invalidated.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backoff::{Backoff, BackoffConfig};
use super::render::{RenderContent, Renderer};
use crate::ads::{AdspaceInput, Bid, ClientOptions, DisplayDefaults, INVALIDATE_CALLBACK, PING_CALLBACK};
use crate::client::ClientStub;
use crate::events::{AxEvent, EventBus};

/// Invalidated offer ids remembered for loads that have not reported yet
const RECENT_INVALIDATIONS: usize = 64;

/// Where a slot is in its offer cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OfferState {
    Requested,
    Shown,
    Confirmed,
    Cancelled,
}

/// Snapshot of one presented slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SlotStatus {
    pub uid: String,
    pub state: OfferState,
    pub offer_id: Option<String>,
    pub failures: u32,
    pub registered: bool,
    pub retry_pending: bool,
}

enum PresenterMsg {
    Prepare {
        input: AdspaceInput,
    },
    Release {
        uid: String,
    },
    Ping {
        uid: String,
    },
    Invalidated {
        offer_id: String,
    },
    Registered {
        uid: String,
    },
    Loaded {
        uid: String,
        generation: u64,
        offer_id: String,
    },
    Finished {
        uid: String,
        generation: u64,
        outcome: Result<(), String>,
    },
    RetryDue {
        uid: String,
        generation: u64,
    },
    Status {
        reply_tx: oneshot::Sender<Vec<SlotStatus>>,
    },
    Shutdown,
}

/// Handle to a tab's presenter task
#[derive(Clone)]
pub struct Presenter {
    tx: mpsc::UnboundedSender<PresenterMsg>,
}

impl Presenter {
    /// Hook the presenter into `client` and initialize the display collaborator
    pub async fn start(
        client: ClientStub,
        renderer: Arc<dyn Renderer>,
        defaults: DisplayDefaults,
        backoff: BackoffConfig,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        debug!(client_id = %client.client_id(), "Presenter::start: called");
        let (tx, rx) = mpsc::unbounded_channel();

        let ping_tx = tx.clone();
        client
            .register_callback(PING_CALLBACK, move |args| {
                if let Some(uid) = args.first().and_then(Value::as_str) {
                    let _ = ping_tx.send(PresenterMsg::Ping { uid: uid.to_string() });
                }
            })
            .await?;

        let invalidate_tx = tx.clone();
        client
            .register_callback(INVALIDATE_CALLBACK, move |args| {
                if let Some(offer_id) = args.first().and_then(Value::as_str) {
                    let _ = invalidate_tx.send(PresenterMsg::Invalidated {
                        offer_id: offer_id.to_string(),
                    });
                }
            })
            .await?;

        let options = ClientOptions {
            relays: defaults.relays.clone(),
            auth: None,
        };
        client
            .invoke("initDisplay", vec![serde_json::to_value(&options)?])
            .await
            .context("Failed to initialize display")?;

        let actor = PresenterActor {
            client,
            renderer,
            defaults,
            backoff,
            events,
            tx: tx.clone(),
            slots: HashMap::new(),
            invalidated: VecDeque::new(),
            next_generation: 0,
        };
        tokio::spawn(actor.run(rx));

        Ok(Self { tx })
    }

    /// Start presenting `input`; a known uid is restarted with a fresh backoff
    pub fn prepare(&self, input: AdspaceInput) -> Result<()> {
        debug!(uid = %input.uid, "Presenter::prepare: called");
        self.send(PresenterMsg::Prepare { input })
    }

    /// Stop presenting `uid` without unregistering it
    ///
    /// The slot stops answering pings, so the master reclaims it after its
    /// next grace window.
    pub fn release(&self, uid: &str) -> Result<()> {
        debug!(%uid, "Presenter::release: called");
        self.send(PresenterMsg::Release { uid: uid.to_string() })
    }

    /// Status of every held slot, sorted by uid
    pub async fn status(&self) -> Result<Vec<SlotStatus>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(PresenterMsg::Status { reply_tx })?;
        reply_rx.await.map_err(|_| eyre!("Presenter dropped status reply"))
    }

    pub fn shutdown(&self) -> Result<()> {
        debug!("Presenter::shutdown: called");
        self.send(PresenterMsg::Shutdown)
    }

    fn send(&self, msg: PresenterMsg) -> Result<()> {
        self.tx.send(msg).map_err(|_| eyre!("Presenter channel closed"))
    }
}

struct PresentedSlot {
    input: AdspaceInput,
    state: OfferState,
    offer_id: Option<String>,
    backoff: Backoff,
    registered: bool,
    generation: u64,
    retry_pending: bool,
    task: Option<JoinHandle<()>>,
}

impl PresentedSlot {
    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn status(&self) -> SlotStatus {
        SlotStatus {
            uid: self.input.uid.clone(),
            state: self.state,
            offer_id: self.offer_id.clone(),
            failures: self.backoff.failures(),
            registered: self.registered,
            retry_pending: self.retry_pending,
        }
    }
}

struct PresenterActor {
    client: ClientStub,
    renderer: Arc<dyn Renderer>,
    defaults: DisplayDefaults,
    backoff: BackoffConfig,
    events: Arc<EventBus>,
    tx: mpsc::UnboundedSender<PresenterMsg>,
    slots: HashMap<String, PresentedSlot>,
    invalidated: VecDeque<String>,
    next_generation: u64,
}

impl PresenterActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PresenterMsg>) {
        info!(client_id = %self.client.client_id(), "Presenter started");

        while let Some(msg) = rx.recv().await {
            match msg {
                PresenterMsg::Prepare { input } => self.prepare(input),
                PresenterMsg::Release { uid } => {
                    if let Some(mut slot) = self.slots.remove(&uid) {
                        slot.abort();
                        info!(%uid, "Slot released");
                    }
                }
                PresenterMsg::Ping { uid } => self.pong(uid),
                PresenterMsg::Invalidated { offer_id } => self.invalidated(&offer_id),
                PresenterMsg::Registered { uid } => {
                    if let Some(slot) = self.slots.get_mut(&uid) {
                        slot.registered = true;
                    }
                }
                PresenterMsg::Loaded {
                    uid,
                    generation,
                    offer_id,
                } => self.loaded(&uid, generation, offer_id),
                PresenterMsg::Finished {
                    uid,
                    generation,
                    outcome,
                } => self.finished(&uid, generation, outcome),
                PresenterMsg::RetryDue { uid, generation } => {
                    if self.current(&uid, generation).is_some() {
                        self.start_attempt(&uid);
                    }
                }
                PresenterMsg::Status { reply_tx } => {
                    let mut statuses: Vec<SlotStatus> = self.slots.values().map(PresentedSlot::status).collect();
                    statuses.sort_by(|a, b| a.uid.cmp(&b.uid));
                    let _ = reply_tx.send(statuses);
                }
                PresenterMsg::Shutdown => break,
            }
        }

        for slot in self.slots.values_mut() {
            slot.abort();
        }
        info!(client_id = %self.client.client_id(), "Presenter stopped");
    }

    /// The slot for `uid`, only if `generation` is still its live attempt
    fn current(&mut self, uid: &str, generation: u64) -> Option<&mut PresentedSlot> {
        self.slots.get_mut(uid).filter(|slot| slot.generation == generation)
    }

    fn prepare(&mut self, input: AdspaceInput) {
        let input = input.apply_defaults(&self.defaults);
        if let Err(e) = input.validate() {
            warn!(error = %e, "Refusing to present slot");
            return;
        }

        let uid = input.uid.clone();
        match self.slots.get_mut(&uid) {
            Some(slot) => {
                slot.input = input;
                slot.backoff.reset();
            }
            None => {
                self.slots.insert(
                    uid.clone(),
                    PresentedSlot {
                        input,
                        state: OfferState::Requested,
                        offer_id: None,
                        backoff: Backoff::new(self.backoff.clone()),
                        registered: false,
                        generation: 0,
                        retry_pending: false,
                        task: None,
                    },
                );
            }
        }
        self.start_attempt(&uid);
    }

    fn start_attempt(&mut self, uid: &str) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let Some(slot) = self.slots.get_mut(uid) else {
            return;
        };

        slot.abort();
        slot.generation = generation;
        slot.state = OfferState::Requested;
        slot.offer_id = None;
        slot.retry_pending = false;

        debug!(%uid, generation, register = !slot.registered, "Starting attempt");
        let client = self.client.clone();
        let renderer = self.renderer.clone();
        let input = slot.input.clone();
        let register = !slot.registered;
        let tx = self.tx.clone();
        slot.task = Some(tokio::spawn(async move {
            let uid = input.uid.clone();
            let outcome = attempt(&client, renderer.as_ref(), &input, register, generation, &tx)
                .await
                .map_err(|e| format!("{:#}", e));
            let _ = tx.send(PresenterMsg::Finished {
                uid,
                generation,
                outcome,
            });
        }));
    }

    fn finished(&mut self, uid: &str, generation: u64, outcome: Result<(), String>) {
        let tx = self.tx.clone();
        let events = self.events.clone();
        let Some(slot) = self.current(uid, generation) else {
            debug!(%uid, generation, "Stale attempt result ignored");
            return;
        };
        slot.task = None;

        match outcome {
            Ok(()) => {
                slot.state = OfferState::Confirmed;
                slot.backoff.reset();
                info!(%uid, offer_id = ?slot.offer_id, "Offer confirmed");
            }
            Err(reason) => {
                if slot.offer_id.is_some() {
                    slot.state = OfferState::Cancelled;
                }
                let delay = slot.backoff.next_delay();
                let failures = slot.backoff.failures();
                warn!(%uid, %reason, failures, delay_ms = delay.as_millis() as u64, "Attempt failed, retrying");

                slot.retry_pending = true;
                let retry_uid = uid.to_string();
                slot.task = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(PresenterMsg::RetryDue {
                        uid: retry_uid,
                        generation,
                    });
                }));
                events.emit(AxEvent::RetryScheduled {
                    uid: uid.to_string(),
                    failures,
                    delay_ms: delay.as_millis() as u64,
                });
            }
        }
    }

    fn pong(&self, uid: String) {
        if !self.slots.contains_key(&uid) {
            return;
        }
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.invoke("pong", vec![json!(uid)]).await {
                warn!(%uid, error = %e, "Failed to answer ping");
            }
        });
    }

    fn loaded(&mut self, uid: &str, generation: u64, offer_id: String) {
        if let Some(pos) = self.invalidated.iter().position(|id| id == &offer_id) {
            self.invalidated.remove(pos);
            if self.current(uid, generation).is_some() {
                self.restart(uid, &offer_id);
            }
            return;
        }
        if let Some(slot) = self.current(uid, generation) {
            slot.offer_id = Some(offer_id);
            slot.state = OfferState::Shown;
        }
    }

    fn invalidated(&mut self, offer_id: &str) {
        let Some(uid) = self
            .slots
            .values()
            .find(|slot| slot.offer_id.as_deref() == Some(offer_id))
            .map(|slot| slot.input.uid.clone())
        else {
            // The load that issued it may not have reported back yet
            if self.invalidated.len() == RECENT_INVALIDATIONS {
                self.invalidated.pop_front();
            }
            self.invalidated.push_back(offer_id.to_string());
            return;
        };
        self.restart(&uid, offer_id);
    }

    fn restart(&mut self, uid: &str, offer_id: &str) {
        info!(%uid, %offer_id, "Offer invalidated, restarting slot");
        if let Some(slot) = self.slots.get_mut(uid) {
            slot.backoff.reset();
        }
        self.start_attempt(uid);
    }
}

/// One register/load/render/settle pass; `Ok` means the offer was confirmed
async fn attempt(
    client: &ClientStub,
    renderer: &dyn Renderer,
    input: &AdspaceInput,
    register: bool,
    generation: u64,
    tx: &mpsc::UnboundedSender<PresenterMsg>,
) -> Result<()> {
    let uid = input.uid.clone();
    let input_value = serde_json::to_value(input)?;

    if register {
        client
            .invoke("registerAdspace", vec![input_value.clone()])
            .await
            .with_context(|| format!("Failed to register {}", uid))?;
        let _ = tx.send(PresenterMsg::Registered { uid: uid.clone() });
    }

    let (bid, offer_id): (Bid, String) = client
        .invoke_as("loadAd", vec![input_value])
        .await
        .with_context(|| format!("Failed to load ad for {}", uid))?;
    let _ = tx.send(PresenterMsg::Loaded {
        uid: uid.clone(),
        generation,
        offer_id: offer_id.clone(),
    });

    let rendered = match RenderContent::from_bid(&bid) {
        Ok(content) => renderer.render(&uid, &content).await,
        Err(e) => Err(e),
    };

    match rendered {
        Ok(()) => {
            let confirmed = client.invoke("confirmAd", vec![json!(offer_id)]).await?;
            if confirmed != Value::Bool(true) {
                return Err(eyre!("Offer {} for {} was settled before it could be confirmed", offer_id, uid));
            }
            Ok(())
        }
        Err(e) => {
            if let Err(cancel_err) = client.invoke("cancelAd", vec![json!(offer_id)]).await {
                warn!(%uid, %offer_id, error = %cancel_err, "Failed to cancel offer");
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ads::{AdService, InMemoryCollaborator, OfferOutcome};
    use crate::client::{Connection, Environment, connect};
    use crate::config::Config;
    use crate::offer::RenderError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fails the first `failures` renders, then succeeds
    #[derive(Default)]
    struct ScriptedRenderer {
        failures: Mutex<u32>,
        rendered: Mutex<Vec<String>>,
    }

    impl ScriptedRenderer {
        fn failing(failures: u32) -> Self {
            Self {
                failures: Mutex::new(failures),
                rendered: Mutex::default(),
            }
        }
    }

    #[async_trait]
    impl Renderer for ScriptedRenderer {
        async fn render(&self, uid: &str, _content: &RenderContent) -> Result<(), RenderError> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(RenderError::Failed(format!("{} not visible", uid)));
            }
            self.rendered.lock().unwrap().push(uid.to_string());
            Ok(())
        }
    }

    /// Cancels `offer-1` behind the presenter's back during the first render
    #[derive(Default)]
    struct CancelsFirstOffer {
        client: Mutex<Option<ClientStub>>,
    }

    #[async_trait]
    impl Renderer for CancelsFirstOffer {
        async fn render(&self, _uid: &str, _content: &RenderContent) -> Result<(), RenderError> {
            let client = self.client.lock().unwrap().take();
            if let Some(client) = client {
                let cancelled = client
                    .invoke("cancelAd", vec![json!("offer-1")])
                    .await
                    .map_err(|e| RenderError::Failed(e.to_string()))?;
                assert_eq!(cancelled, json!(true));
            }
            Ok(())
        }
    }

    async fn setup(collaborator: &InMemoryCollaborator, renderer: Arc<dyn Renderer>) -> (Connection, Presenter, Arc<EventBus>) {
        let env = Environment::new("https://site.example");
        let mut config = Config::default();
        config.coordinator.election_window_ms = 10;
        config.display.app_key = "key".into();
        let service = AdService::new(Arc::new(collaborator.clone()), config.liveness.clone(), env.events().clone());
        let conn = connect(&env, &service, &config).await.unwrap();
        let presenter = Presenter::start(
            conn.client().clone(),
            renderer,
            config.display.clone(),
            config.backoff.clone(),
            env.events().clone(),
        )
        .await
        .unwrap();
        (conn, presenter, env.events().clone())
    }

    async fn wait_for_state(presenter: &Presenter, uid: &str, state: OfferState) -> SlotStatus {
        loop {
            let status = presenter.status().await.unwrap();
            if let Some(slot) = status.into_iter().find(|s| s.uid == uid && s.state == state) {
                return slot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_prepare_confirms_offer() {
        let collaborator = InMemoryCollaborator::new();
        let renderer = Arc::new(ScriptedRenderer::default());
        let (_conn, presenter, _events) = setup(&collaborator, renderer.clone()).await;

        presenter.prepare(AdspaceInput::new("s1", 300, 250)).unwrap();
        let status = wait_for_state(&presenter, "s1", OfferState::Confirmed).await;

        assert!(status.registered);
        assert_eq!(status.offer_id.as_deref(), Some("offer-1"));
        assert_eq!(collaborator.registered().await, vec!["s1"]);
        assert_eq!(collaborator.outcome("offer-1").await, Some(OfferOutcome::Confirmed));
        assert_eq!(*renderer.rendered.lock().unwrap(), vec!["s1"]);
        assert!(collaborator.display_options().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_failures_back_off() {
        let collaborator = InMemoryCollaborator::new();
        let (_conn, presenter, events) = setup(&collaborator, Arc::new(ScriptedRenderer::failing(2))).await;
        let mut rx = events.subscribe();

        presenter.prepare(AdspaceInput::new("s1", 300, 250)).unwrap();
        let status = wait_for_state(&presenter, "s1", OfferState::Confirmed).await;
        assert_eq!(status.failures, 0);
        assert_eq!(status.offer_id.as_deref(), Some("offer-3"));

        let mut delays = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AxEvent::RetryScheduled { delay_ms, .. } = event {
                delays.push(delay_ms);
            }
        }
        assert_eq!(delays, vec![1500, 2700]);
        assert_eq!(collaborator.outcome("offer-1").await, Some(OfferOutcome::Cancelled));
        assert_eq!(collaborator.outcome("offer-2").await, Some(OfferOutcome::Cancelled));
        assert_eq!(collaborator.outcome("offer-3").await, Some(OfferOutcome::Confirmed));
        assert_eq!(collaborator.registered().await, vec!["s1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_load_retries_without_reregistering() {
        let collaborator = InMemoryCollaborator::new();
        collaborator.fail_next_loads(1).await;
        let (_conn, presenter, _events) = setup(&collaborator, Arc::new(ScriptedRenderer::default())).await;

        presenter.prepare(AdspaceInput::new("s1", 300, 250)).unwrap();
        let status = wait_for_state(&presenter, "s1", OfferState::Confirmed).await;
        assert_eq!(status.offer_id.as_deref(), Some("offer-1"));
        assert_eq!(collaborator.registered().await, vec!["s1"]);
    }

    #[tokio::test]
    async fn test_invalidation_restarts_slot() {
        let collaborator = InMemoryCollaborator::new();
        let (_conn, presenter, _events) = setup(&collaborator, Arc::new(ScriptedRenderer::default())).await;

        presenter.prepare(AdspaceInput::new("s1", 300, 250)).unwrap();
        wait_for_state(&presenter, "s1", OfferState::Confirmed).await;

        assert!(collaborator.invalidate("offer-1").await);
        loop {
            let status = wait_for_state(&presenter, "s1", OfferState::Confirmed).await;
            if status.offer_id.as_deref() == Some("offer-2") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(collaborator.issued().await, 2);
    }

    #[tokio::test]
    async fn test_release_keeps_registration() {
        let collaborator = InMemoryCollaborator::new();
        let (_conn, presenter, _events) = setup(&collaborator, Arc::new(ScriptedRenderer::default())).await;

        presenter.prepare(AdspaceInput::new("s1", 300, 250)).unwrap();
        wait_for_state(&presenter, "s1", OfferState::Confirmed).await;
        presenter.release("s1").unwrap();

        assert!(presenter.status().await.unwrap().is_empty());
        assert!(collaborator.unregistered().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_input_is_ignored() {
        let collaborator = InMemoryCollaborator::new();
        let (_conn, presenter, _events) = setup(&collaborator, Arc::new(ScriptedRenderer::default())).await;

        presenter.prepare(AdspaceInput::new("s1", 0, 250)).unwrap();
        assert!(presenter.status().await.unwrap().is_empty());
        presenter.shutdown().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_before_load_reports_restarts_slot() {
        let collaborator = InMemoryCollaborator::new();
        let (_conn, presenter, _events) = setup(&collaborator, Arc::new(ScriptedRenderer::default())).await;

        // The callback for the first offer overtakes the attempt's own report
        presenter
            .tx
            .send(PresenterMsg::Invalidated {
                offer_id: "offer-1".to_string(),
            })
            .unwrap();
        presenter.prepare(AdspaceInput::new("s1", 300, 250)).unwrap();

        let status = wait_for_state(&presenter, "s1", OfferState::Confirmed).await;
        assert_eq!(status.offer_id.as_deref(), Some("offer-2"));
        assert_eq!(status.failures, 0);
        assert_eq!(collaborator.outcome("offer-2").await, Some(OfferOutcome::Confirmed));
        assert_eq!(collaborator.issued().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_confirm_retries() {
        let collaborator = InMemoryCollaborator::new();
        let renderer = Arc::new(CancelsFirstOffer::default());
        let (conn, presenter, events) = setup(&collaborator, renderer.clone()).await;
        *renderer.client.lock().unwrap() = Some(conn.client().clone());
        let mut rx = events.subscribe();

        presenter.prepare(AdspaceInput::new("s1", 300, 250)).unwrap();
        let status = wait_for_state(&presenter, "s1", OfferState::Confirmed).await;
        assert_eq!(status.offer_id.as_deref(), Some("offer-2"));

        let mut retries = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, AxEvent::RetryScheduled { .. }) {
                retries += 1;
            }
        }
        assert_eq!(retries, 1);
        assert_eq!(collaborator.outcome("offer-1").await, Some(OfferOutcome::Cancelled));
        assert_eq!(collaborator.outcome("offer-2").await, Some(OfferOutcome::Confirmed));
    }
}
