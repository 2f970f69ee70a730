//! Main Coordinator task implementation

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::CoordinatorConfig;
use super::election::{Ballot, Election, ElectionState};
use super::handle::CoordinatorHandle;
use super::messages::{CoordRequest, CoordinatorMetrics};
use super::registry::MethodRegistry;
use crate::events::{AxEvent, EventBus};
use crate::transport::{
    BroadcastChannel, ChannelFrame, ErrorPayload, FrameBody, MessageKind, OriginPolicy, Port, RpcMessage,
    TransportKind,
};

/// Receives the election outcome exactly once
pub type StartupHook = Box<dyn FnOnce(bool) + Send>;

/// Code installed into every physical coordinator instance
///
/// `install` registers the instance's methods and returns the hook that runs
/// once the instance knows whether it is master.
pub trait ExecutorScript: Send + Sync {
    fn install(&self, methods: &mut MethodRegistry, coordinator: CoordinatorHandle) -> StartupHook;
}

/// One physical coordinator instance
///
/// Owns the method registry, answers invocations from attached clients,
/// broadcasts callbacks and takes part in master election over the
/// broadcast channel.
pub struct Coordinator {
    config: CoordinatorConfig,
    policy: OriginPolicy,
    channel: BroadcastChannel,
    events: Arc<EventBus>,
    /// Relay callbacks over the broadcast channel (compatibility mode)
    relay: bool,
    methods: MethodRegistry,
    instance_id: Uuid,
    election: Election,
    tx: mpsc::Sender<CoordRequest>,
    rx: mpsc::Receiver<CoordRequest>,
    /// Subscribed at construction so nothing published after `new` is missed
    frames: broadcast::Receiver<ChannelFrame>,
    role_tx: watch::Sender<ElectionState>,
    clients: HashMap<String, Port>,
    in_flight: HashSet<(String, String)>,
    completed: CompletedIds,
    metrics: CoordinatorMetrics,
}

impl Coordinator {
    /// Create a new Coordinator with the given configuration
    pub fn new(config: CoordinatorConfig, policy: OriginPolicy, channel: BroadcastChannel, events: Arc<EventBus>) -> Self {
        let instance_id = Uuid::now_v7();
        debug!(%instance_id, "Coordinator::new: called");
        let (tx, rx) = mpsc::channel(config.channel_buffer);
        let (role_tx, _) = watch::channel(ElectionState::Announcing);
        let frames = channel.subscribe();
        let completed = CompletedIds::new(config.completed_ids);
        Self {
            config,
            policy,
            channel,
            events,
            relay: false,
            methods: MethodRegistry::new(),
            instance_id,
            election: Election::new(Ballot::random(instance_id)),
            tx,
            rx,
            frames,
            role_tx,
            clients: HashMap::new(),
            in_flight: HashSet::new(),
            completed,
            metrics: CoordinatorMetrics::default(),
        }
    }

    /// Also relay callback broadcasts to the clients of every other instance
    pub fn with_relay(mut self, relay: bool) -> Self {
        self.relay = relay;
        self
    }

    /// Replace the random election ballot nonce
    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.election = Election::new(Ballot::new(nonce, self.instance_id));
        self
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn methods_mut(&mut self) -> &mut MethodRegistry {
        &mut self.methods
    }

    /// Create a handle to this instance
    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle::new(self.tx.clone(), self.role_tx.subscribe(), self.instance_id)
    }

    /// Install `script`, spawn the coordinator task and return its handle
    pub fn start(mut self, script: &dyn ExecutorScript) -> CoordinatorHandle {
        let handle = self.handle();
        let hook = script.install(&mut self.methods, handle.clone());
        tokio::spawn(self.run(hook));
        handle
    }

    /// Run the Coordinator task
    ///
    /// This consumes the Coordinator and runs until shutdown is requested.
    pub async fn run(mut self, startup: StartupHook) {
        let mut startup = Some(startup);

        self.publish(self.election.announcement());
        let deadline_tx = self.tx.clone();
        let window = self.config.election_window();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = deadline_tx.send(CoordRequest::ElectionDeadline).await;
        });

        info!(instance_id = %self.instance_id, relay = self.relay, "Coordinator started");

        loop {
            tokio::select! {
                req = self.rx.recv() => {
                    let Some(req) = req else { break };
                    match req {
                        CoordRequest::Attach { client_id, port, reply_tx } => {
                            debug!(%client_id, via = %port.kind(), "Attaching client");
                            self.clients.insert(client_id, port);
                            self.metrics.connected_clients = self.clients.len();
                            let _ = reply_tx.send(());
                        }

                        CoordRequest::Detach { client_id } => {
                            debug!(%client_id, "Detaching client");
                            self.clients.remove(&client_id);
                            self.in_flight.retain(|(owner, _)| owner != &client_id);
                            self.metrics.connected_clients = self.clients.len();
                        }

                        CoordRequest::Inbound { client_id, via, message } => {
                            self.on_inbound(client_id, via, message);
                        }

                        CoordRequest::RegisterMethod { name, method } => {
                            self.methods.register(name, method);
                        }

                        CoordRequest::TriggerCallback { name, args } => {
                            self.trigger_callback(name, args);
                        }

                        CoordRequest::Completed { client_id, id, method, outcome } => {
                            self.on_completed(client_id, id, method, outcome);
                        }

                        CoordRequest::ElectionDeadline => {
                            let elected = self.election.decide();
                            self.role_tx.send_replace(self.election.state());
                            info!(instance_id = %self.instance_id, elected, "Election finished");
                            self.events.emit(AxEvent::InstanceElected {
                                instance_id: self.instance_id.to_string(),
                                is_master: elected,
                            });
                            if let Some(hook) = startup.take() {
                                hook(elected);
                            }
                        }

                        CoordRequest::GetMetrics { reply_tx } => {
                            self.metrics.registered_methods = self.methods.len();
                            self.metrics.pending_invocations = self.in_flight.len();
                            let _ = reply_tx.send(self.metrics.clone());
                        }

                        CoordRequest::Shutdown => {
                            info!(instance_id = %self.instance_id, "Coordinator shutting down");
                            break;
                        }
                    }
                }

                frame = self.frames.recv() => {
                    match frame {
                        Ok(frame) => self.on_frame(frame),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Coordinator lagged behind broadcast channel");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        info!(instance_id = %self.instance_id, "Coordinator stopped");
    }

    fn on_inbound(&mut self, client_id: String, via: TransportKind, message: RpcMessage) {
        if let Err(e) = self.policy.check(&message.origin, via) {
            self.reject(&client_id, e, message.origin, via);
            return;
        }

        if message.kind != MessageKind::Invoke {
            debug!(%client_id, kind = ?message.kind, "Ignoring non-invoke message from client");
            return;
        }

        let Some(id) = message.id.clone() else {
            warn!(%client_id, method = %message.method, "Invocation without id dropped");
            return;
        };

        let key = (client_id.clone(), id.clone());
        if self.completed.contains(&key) || !self.in_flight.insert(key) {
            warn!(%client_id, %id, "Duplicate invocation id dropped");
            self.metrics.duplicate_invocations += 1;
            return;
        }

        let Some(method) = self.methods.get(&message.method) else {
            debug!(%client_id, method = %message.method, "Method not found");
            self.on_completed(
                client_id,
                id,
                message.method.clone(),
                Err(ErrorPayload::method_not_found(&message.method)),
            );
            return;
        };

        self.metrics.invocations += 1;
        debug!(%client_id, %id, method = %message.method, "Dispatching invocation");

        let tx = self.tx.clone();
        let name = message.method;
        let args = message.args;
        tokio::spawn(async move {
            // Inner task isolates handler panics from the completion path
            let joined = tokio::spawn(async move { method.call(args).await }).await;
            let outcome = match joined {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(ErrorPayload::handler_failure(format!("{:#}", e))),
                Err(e) => Err(ErrorPayload::handler_failure(format!("{} panicked: {}", name, e))),
            };
            let _ = tx
                .send(CoordRequest::Completed {
                    client_id,
                    id,
                    method: name,
                    outcome,
                })
                .await;
        });
    }

    fn on_completed(&mut self, client_id: String, id: String, method: String, outcome: Result<Value, ErrorPayload>) {
        let key = (client_id.clone(), id.clone());
        self.in_flight.remove(&key);
        self.completed.insert(key);

        let origin = self.policy.page_origin();
        let reply = match outcome {
            Ok(value) => RpcMessage::result(id, method, value, origin),
            Err(payload) => {
                self.metrics.handler_failures += 1;
                warn!(%client_id, %method, message = %payload.message, "Invocation failed");
                RpcMessage::error(id, method, &payload, origin)
            }
        };

        match self.clients.get(&client_id) {
            Some(port) if port.send(reply) => {}
            _ => debug!(%client_id, "Client gone before its result was delivered"),
        }
    }

    fn trigger_callback(&mut self, name: String, args: Vec<Value>) {
        debug!(%name, clients = self.clients.len(), relay = self.relay, "Coordinator::trigger_callback: called");
        let message = RpcMessage::callback(name, args, self.policy.page_origin());
        self.deliver_callback(&message);
        if self.relay {
            self.publish(FrameBody::Relay { message });
        }
    }

    fn deliver_callback(&mut self, message: &RpcMessage) {
        for port in self.clients.values() {
            port.send(message.clone());
        }
        self.metrics.callbacks_sent += 1;
    }

    fn on_frame(&mut self, frame: ChannelFrame) {
        if frame.sender == self.instance_id {
            return;
        }
        if let Err(e) = self.policy.check(&frame.origin, TransportKind::BroadcastChannel) {
            self.reject(&frame.sender.to_string(), e, frame.origin, TransportKind::BroadcastChannel);
            return;
        }

        match frame.body {
            FrameBody::Announce { nonce } => {
                if let Some(reply) = self.election.on_announce(Ballot::new(nonce, frame.sender)) {
                    self.publish(reply);
                }
            }
            FrameBody::Present { nonce, elected } => {
                self.election.on_present(Ballot::new(nonce, frame.sender), elected);
            }
            FrameBody::Relay { message } => {
                if self.relay && message.kind == MessageKind::Callback {
                    self.deliver_callback(&message);
                }
            }
        }
    }

    fn reject(&mut self, from: &str, error: crate::error::RpcError, origin: String, via: TransportKind) {
        warn!(%from, %error, "Dropping inbound message");
        self.metrics.rejected_messages += 1;
        self.events.emit(AxEvent::MessageRejected { origin, via });
    }

    fn publish(&self, body: FrameBody) {
        self.channel.publish(ChannelFrame {
            sender: self.instance_id,
            origin: self.policy.page_origin().to_string(),
            body,
        });
    }
}

/// Bounded memory of answered `(client, id)` pairs, oldest evicted first
struct CompletedIds {
    capacity: usize,
    order: VecDeque<(String, String)>,
    ids: HashSet<(String, String)>,
}

impl CompletedIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    fn contains(&self, key: &(String, String)) -> bool {
        self.ids.contains(key)
    }

    fn insert(&mut self, key: (String, String)) {
        if self.capacity == 0 || !self.ids.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}
