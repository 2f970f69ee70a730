//! AdService - the executor script exposing display and advertiser methods

use std::future::Future;
use std::sync::Arc;

use eyre::{Context, Result, eyre};
use serde_json::{Value, json};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use super::collaborator::{
    AdSelection, Advertiser, ClientOptions, CollaboratorFactory, ImageUpload, InvalidationSink, OfferOutcome,
};
use super::config::LivenessConfig;
use super::input::AdspaceInput;
use super::registry::SlotRegistry;
use crate::coordinator::{CoordinatorHandle, ExecutorScript, MethodRegistry, StartupHook, decode_arg};
use crate::events::EventBus;

/// Callback broadcast when the display collaborator invalidates an offer
pub const INVALIDATE_CALLBACK: &str = "invalidateAd";

/// Installs the ad methods into every coordinator instance
pub struct AdService {
    factory: Arc<dyn CollaboratorFactory>,
    liveness: LivenessConfig,
    events: Arc<EventBus>,
}

impl AdService {
    pub fn new(factory: Arc<dyn CollaboratorFactory>, liveness: LivenessConfig, events: Arc<EventBus>) -> Self {
        Self {
            factory,
            liveness,
            events,
        }
    }
}

/// Per-instance state shared by the method handlers
struct ServiceState {
    coordinator: CoordinatorHandle,
    registry: SlotRegistry,
    factory: Arc<dyn CollaboratorFactory>,
    display: OnceCell<Arc<dyn AdSelection>>,
    advertiser: RwLock<Option<Arc<dyn Advertiser>>>,
}

impl ServiceState {
    fn display(&self) -> Result<Arc<dyn AdSelection>> {
        self.display
            .get()
            .cloned()
            .ok_or_else(|| eyre!("Display client not initialized. Call initDisplay first."))
    }

    async fn advertiser(&self) -> Result<Arc<dyn Advertiser>> {
        self.advertiser
            .read()
            .await
            .clone()
            .ok_or_else(|| eyre!("Advertiser client not initialized. Call initAdvertiser first."))
    }
}

impl ExecutorScript for AdService {
    fn install(&self, methods: &mut MethodRegistry, coordinator: CoordinatorHandle) -> StartupHook {
        debug!(instance_id = %coordinator.instance_id(), "AdService::install: called");
        let registry = SlotRegistry::spawn(self.liveness.clone(), coordinator.clone(), self.events.clone());
        let state = Arc::new(ServiceState {
            coordinator,
            registry: registry.clone(),
            factory: self.factory.clone(),
            display: OnceCell::new(),
            advertiser: RwLock::new(None),
        });

        methods.register_fn("initDisplay", bind(&state, init_display));
        methods.register_fn("registerAdspace", bind(&state, register_adspace));
        methods.register_fn("unregisterAdspace", bind(&state, unregister_adspace));
        methods.register_fn("pong", bind(&state, pong));
        methods.register_fn("loadAd", bind(&state, load_ad));
        methods.register_fn("confirmAd", bind(&state, confirm_ad));
        methods.register_fn("cancelAd", bind(&state, cancel_ad));
        methods.register_fn("initAdvertiser", bind(&state, init_advertiser));
        methods.register_fn("advPublishBid", bind(&state, adv_publish_bid));
        methods.register_fn("advCancelBid", bind(&state, adv_cancel_bid));
        methods.register_fn("advListBids", bind(&state, adv_list_bids));
        methods.register_fn("getNip01Meta", bind(&state, get_nip01_meta));
        methods.register_fn("uploadImage", bind(&state, upload_image));

        Box::new(move |is_master| {
            info!(is_master, "Ad executor initialized");
            if is_master {
                registry.start_liveness();
            }
        })
    }
}

/// Close a handler over the instance state
fn bind<F, Fut>(state: &Arc<ServiceState>, handler: F) -> impl Fn(Vec<Value>) -> Fut + Send + Sync + 'static
where
    F: Fn(Arc<ServiceState>, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    let state = state.clone();
    move |args| handler(state.clone(), args)
}

fn options_arg(args: &[Value], method: &str) -> Result<ClientOptions> {
    match args.first() {
        Some(Value::Null) | None => Ok(ClientOptions::default()),
        Some(_) => decode_arg(args, 0, method),
    }
}

fn adspace_arg(args: &[Value], method: &str) -> Result<AdspaceInput> {
    let input: AdspaceInput = decode_arg(args, 0, method)?;
    input.validate()?;
    Ok(input)
}

async fn init_display(state: Arc<ServiceState>, args: Vec<Value>) -> Result<Value> {
    let options = options_arg(&args, "initDisplay")?;
    if state.display.initialized() {
        info!(relays = ?options.relays, "Display client already initialized");
        return Ok(Value::Null);
    }

    let relays = options.relays.clone();
    let setup = state.clone();
    state
        .display
        .get_or_try_init(|| async move {
            let (sink, mut invalidations) = InvalidationSink::new();
            let display = setup.factory.display(options, sink).await?;
            setup.registry.attach_selection(display.clone()).await?;

            let registry = setup.registry.clone();
            let coordinator = setup.coordinator.clone();
            tokio::spawn(async move {
                loop {
                    let offer_id = tokio::select! {
                        offer_id = invalidations.recv() => match offer_id {
                            Some(offer_id) => offer_id,
                            None => break,
                        },
                        _ = coordinator.closed() => break,
                    };
                    info!(%offer_id, "Ad was invalidated");
                    if let Err(e) = registry.invalidate(&offer_id).await {
                        warn!(%offer_id, error = %e, "Failed to drop invalidated offer");
                    }
                    if let Err(e) = coordinator.trigger_callback(INVALIDATE_CALLBACK, vec![json!(offer_id)]).await {
                        warn!(%offer_id, error = %e, "Failed to broadcast invalidation");
                        break;
                    }
                }
                debug!("Invalidation forwarding stopped");
            });
            Ok::<_, eyre::Report>(display)
        })
        .await
        .context("Failed to initialize display client")?;

    info!(?relays, "Display client initialized");
    Ok(Value::Null)
}

async fn register_adspace(state: Arc<ServiceState>, args: Vec<Value>) -> Result<Value> {
    let input = adspace_arg(&args, "registerAdspace")?;
    let display = state.display()?;

    let first = state.registry.register(input.clone()).await?;
    if first && let Err(e) = display.register_adspace(&input).await {
        state.registry.remove(&input.uid).await?;
        return Err(e.wrap_err(format!("Failed to register adspace {}", input.uid)));
    }
    Ok(json!(first))
}

async fn unregister_adspace(state: Arc<ServiceState>, args: Vec<Value>) -> Result<Value> {
    let input: AdspaceInput = decode_arg(&args, 0, "unregisterAdspace")?;
    let display = state.display()?;

    state.registry.remove(&input.uid).await?;
    display.unregister_adspace(&input).await?;
    Ok(Value::Null)
}

async fn pong(state: Arc<ServiceState>, args: Vec<Value>) -> Result<Value> {
    let uid: String = decode_arg(&args, 0, "pong")?;
    state.registry.pong(&uid).await?;
    Ok(Value::Null)
}

async fn load_ad(state: Arc<ServiceState>, args: Vec<Value>) -> Result<Value> {
    let input = adspace_arg(&args, "loadAd")?;
    let display = state.display()?;

    let loaded = display.load_ad(&input).await?;
    let bid = serde_json::to_value(&loaded.bid)?;
    state
        .registry
        .offer_issued(&input.uid, &loaded.offer_id, loaded.ticket)
        .await?;
    Ok(Value::Array(vec![bid, Value::String(loaded.offer_id)]))
}

async fn settle(state: Arc<ServiceState>, args: Vec<Value>, method: &str, outcome: OfferOutcome) -> Result<Value> {
    let offer_id: String = decode_arg(&args, 0, method)?;
    let settlement = state.registry.settle(&offer_id, outcome).await?;
    Ok(json!(settlement.took_effect()))
}

async fn confirm_ad(state: Arc<ServiceState>, args: Vec<Value>) -> Result<Value> {
    settle(state, args, "confirmAd", OfferOutcome::Confirmed).await
}

async fn cancel_ad(state: Arc<ServiceState>, args: Vec<Value>) -> Result<Value> {
    settle(state, args, "cancelAd", OfferOutcome::Cancelled).await
}

async fn init_advertiser(state: Arc<ServiceState>, args: Vec<Value>) -> Result<Value> {
    let options = options_arg(&args, "initAdvertiser")?;
    let advertiser = state.factory.advertiser(options).await?;
    *state.advertiser.write().await = Some(advertiser);
    info!("Advertiser client initialized");
    Ok(Value::Null)
}

async fn adv_publish_bid(state: Arc<ServiceState>, args: Vec<Value>) -> Result<Value> {
    let draft: Value = decode_arg(&args, 0, "advPublishBid")?;
    let bid = state.advertiser().await?.publish(draft).await?;
    Ok(serde_json::to_value(bid)?)
}

async fn adv_cancel_bid(state: Arc<ServiceState>, args: Vec<Value>) -> Result<Value> {
    let bid_id: String = decode_arg(&args, 0, "advCancelBid")?;
    state.advertiser().await?.cancel(&bid_id).await?;
    Ok(Value::Null)
}

async fn adv_list_bids(state: Arc<ServiceState>, _args: Vec<Value>) -> Result<Value> {
    let bids = state.advertiser().await?.list().await?;
    Ok(serde_json::to_value(bids)?)
}

async fn get_nip01_meta(state: Arc<ServiceState>, args: Vec<Value>) -> Result<Value> {
    let pubkey: String = decode_arg(&args, 0, "getNip01Meta")?;
    state.advertiser().await?.get_nip01_meta(&pubkey).await
}

async fn upload_image(state: Arc<ServiceState>, args: Vec<Value>) -> Result<Value> {
    let upload: ImageUpload = decode_arg(&args, 0, "uploadImage")?;
    let uploaded = state.advertiser().await?.upload_image(upload).await?;
    Ok(serde_json::to_value(uploaded)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ads::memory::InMemoryCollaborator;
    use crate::client::{Connection, Environment, connect};
    use crate::config::Config;
    use crate::error::RpcError;

    async fn tab(collaborator: &InMemoryCollaborator) -> Connection {
        let env = Environment::new("https://site.example");
        let mut config = Config::default();
        config.coordinator.election_window_ms = 10;
        let service = AdService::new(Arc::new(collaborator.clone()), config.liveness.clone(), env.events().clone());
        connect(&env, &service, &config).await.unwrap()
    }

    fn slot(uid: &str) -> Value {
        json!({"uid": uid, "appKey": "key", "width": 300, "height": 250})
    }

    #[tokio::test]
    async fn test_methods_require_init_display() {
        let collaborator = InMemoryCollaborator::new();
        let conn = tab(&collaborator).await;

        let err = conn.client().invoke("loadAd", vec![slot("s1")]).await.unwrap_err();
        match err {
            RpcError::HandlerFailure(message) => assert!(message.contains("initDisplay")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_register_forwards_first_time_only() {
        let collaborator = InMemoryCollaborator::new();
        let conn = tab(&collaborator).await;
        let client = conn.client();

        client.invoke("initDisplay", vec![json!({"relays": ["wss://r"]})]).await.unwrap();
        client.invoke("initDisplay", vec![]).await.unwrap();
        assert_eq!(collaborator.display_options().await.unwrap().relays, vec!["wss://r"]);

        assert_eq!(client.invoke("registerAdspace", vec![slot("s1")]).await.unwrap(), json!(true));
        assert_eq!(client.invoke("registerAdspace", vec![slot("s1")]).await.unwrap(), json!(false));
        assert_eq!(collaborator.registered().await, vec!["s1".to_string()]);

        let err = client
            .invoke("registerAdspace", vec![json!({"uid": "z", "appKey": "k", "width": 0, "height": 5})])
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::HandlerFailure(_)));
    }

    #[tokio::test]
    async fn test_load_and_settle_once() {
        let collaborator = InMemoryCollaborator::new();
        let conn = tab(&collaborator).await;
        let client = conn.client();
        client.invoke("initDisplay", vec![]).await.unwrap();
        client.invoke("registerAdspace", vec![slot("s1")]).await.unwrap();

        let (bid, offer_id): (Value, String) = client.invoke_as("loadAd", vec![slot("s1")]).await.unwrap();
        assert_eq!(bid["id"], "bid-1");

        assert_eq!(client.invoke("confirmAd", vec![json!(offer_id)]).await.unwrap(), json!(true));
        assert_eq!(client.invoke("cancelAd", vec![json!(offer_id)]).await.unwrap(), json!(false));
        tokio::task::yield_now().await;
        assert_eq!(collaborator.outcome(&offer_id).await, Some(OfferOutcome::Confirmed));
    }

    #[tokio::test]
    async fn test_invalidation_is_broadcast() {
        let collaborator = InMemoryCollaborator::new();
        let conn = tab(&collaborator).await;
        let client = conn.client();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        client
            .register_callback(INVALIDATE_CALLBACK, move |args| {
                let _ = tx.send(args);
            })
            .await
            .unwrap();
        client.invoke("initDisplay", vec![]).await.unwrap();
        let (_, offer_id): (Value, String) = client.invoke_as("loadAd", vec![slot("s1")]).await.unwrap();

        assert!(collaborator.invalidate(&offer_id).await);
        assert_eq!(rx.recv().await.unwrap(), vec![json!(offer_id)]);
        assert_eq!(client.invoke("confirmAd", vec![json!(offer_id)]).await.unwrap(), json!(false));
    }

    #[tokio::test]
    async fn test_advertiser_methods() {
        let collaborator = InMemoryCollaborator::new();
        let conn = tab(&collaborator).await;
        let client = conn.client();

        assert!(client.invoke("advListBids", vec![]).await.is_err());
        client.invoke("initAdvertiser", vec![json!({"relays": []})]).await.unwrap();

        let bid = client
            .invoke("advPublishBid", vec![json!({"content": "{\"payload\":\"x\"}"})])
            .await
            .unwrap();
        let listed = client.invoke("advListBids", vec![]).await.unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);

        client.invoke("advCancelBid", vec![bid["id"].clone()]).await.unwrap();
        assert_eq!(client.invoke("advListBids", vec![]).await.unwrap(), json!([]));

        let meta = client.invoke("getNip01Meta", vec![json!("abcdef0123456789")]).await.unwrap();
        assert_eq!(meta["name"], "user-abcdef01");
    }
}
