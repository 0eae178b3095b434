//! Membership service
//!
//! [`MembershipService`] wires the dispatcher, failure detector, view manager
//! and heartbeat emitter together and exposes the operations applications
//! use: join, leave, removal requests and view queries.
//!
//! Workers:
//! - the dispatcher's receive loop routes inbound frames to the failure
//!   detector queue or the view manager queue,
//! - the failure detector worker tracks heartbeats and reports suspicions,
//! - the view manager worker is the only task that touches the
//!   [`ViewManager`] and the only publisher of installed views,
//! - the outbound sender sends the view manager's messages one at a time,
//!   so a prepare never overtakes the install that follows it,
//! - the heartbeat emitter broadcasts a heartbeat every interval.

use crate::codec::MessageCodec;
use crate::config::MembershipConfig;
use crate::dispatcher::{MessageDispatcher, MessageHandler};
use crate::error::{MembershipError, Result};
use crate::failure_detector::{spawn_failure_detector, DetectorEvent, DetectorInput, FailureDetector};
use crate::member::MemberIdentifier;
use crate::message::{Message, MessageBody, MessageKind, Recipients};
use crate::registry::{Authenticator, AuthenticatorRegistry, CodecRegistry};
use crate::stats::{AtomicConnectionStatistics, ConnectionStatistics};
use crate::transport::{Datagram, Transport, UdpTransport};
use crate::view::{View, ViewDiff};
use crate::view_manager::{ViewAction, ViewManager};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Notification for membership listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MembershipEvent {
    ViewInstalled {
        view_number: u64,
        coordinator: Option<MemberIdentifier>,
        members: usize,
        timestamp: DateTime<Utc>,
    },
    MemberJoined {
        member: MemberIdentifier,
        view_number: u64,
        timestamp: DateTime<Utc>,
    },
    MemberLeft {
        member: MemberIdentifier,
        view_number: u64,
        timestamp: DateTime<Utc>,
    },
    MemberRemoved {
        member: MemberIdentifier,
        view_number: u64,
        timestamp: DateTime<Utc>,
    },
    CoordinatorChanged {
        coordinator: MemberIdentifier,
        view_number: u64,
        timestamp: DateTime<Utc>,
    },
    MemberSuspected {
        member: MemberIdentifier,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    SuspicionRefuted {
        member: MemberIdentifier,
        timestamp: DateTime<Utc>,
    },
    JoinRejected {
        reason: String,
        timestamp: DateTime<Utc>,
    },
    Left {
        timestamp: DateTime<Utc>,
    },
    Disconnected {
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

/// Lifecycle of the local member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ServiceStatus {
    Idle,
    Joining,
    Member,
    Leaving,
    Left,
    Rejected(String),
    Disconnected(String),
}

impl ServiceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Left | Self::Rejected(_) | Self::Disconnected(_))
    }
}

/// Pluggable parts of the service
pub struct ServiceComponents {
    pub authenticators: AuthenticatorRegistry,
    pub codecs: CodecRegistry,
    pub stats: Arc<dyn ConnectionStatistics>,
}

impl Default for ServiceComponents {
    fn default() -> Self {
        Self {
            authenticators: AuthenticatorRegistry::default(),
            codecs: CodecRegistry::default(),
            stats: Arc::new(AtomicConnectionStatistics::new()),
        }
    }
}

/// Input of the view manager worker
#[derive(Debug)]
enum ManagerInput {
    Message(MessageBody),
    Outbound(Message),
    PeerView { sender: MemberIdentifier, view_number: u64 },
    Found,
    Leave,
    Remove { target: MemberIdentifier, reason: String },
}

/// Receivers handed to the workers on start
struct PendingWorkers {
    inbound: mpsc::Receiver<Datagram>,
    manager_inputs: mpsc::Receiver<ManagerInput>,
    detector_inputs: mpsc::Receiver<DetectorInput>,
    detector_events: mpsc::Receiver<DetectorEvent>,
    detector_events_tx: mpsc::Sender<DetectorEvent>,
}

pub struct MembershipService {
    config: MembershipConfig,
    local: MemberIdentifier,
    authenticator: Arc<dyn Authenticator>,
    stats: Arc<dyn ConnectionStatistics>,
    dispatcher: Arc<MessageDispatcher>,
    heartbeater: Arc<Heartbeater>,
    manager_tx: mpsc::Sender<ManagerInput>,
    detector_tx: mpsc::Sender<DetectorInput>,
    view_tx: Arc<watch::Sender<Option<Arc<View>>>>,
    view_rx: watch::Receiver<Option<Arc<View>>>,
    status_tx: Arc<watch::Sender<ServiceStatus>>,
    event_tx: broadcast::Sender<MembershipEvent>,
    pending: Mutex<Option<PendingWorkers>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl MembershipService {
    /// Create a service with the built-in registries
    pub fn new(
        config: MembershipConfig,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Datagram>,
    ) -> Result<Self> {
        Self::with_components(config, transport, inbound, ServiceComponents::default())
    }

    /// Bind a UDP transport at the configured address and create a service
    /// on it
    pub async fn bind_udp(config: MembershipConfig) -> Result<Self> {
        let (transport, inbound) = UdpTransport::bind(config.bind_address, config.queue_capacity).await?;
        Self::new(config, Arc::new(transport), inbound)
    }

    pub fn with_components(
        config: MembershipConfig,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Datagram>,
        components: ServiceComponents,
    ) -> Result<Self> {
        config.validate()?;

        let authenticator = components.authenticators.create(&config)?;
        let codec: Arc<dyn MessageCodec> = components.codecs.create(&config.wire_protocol)?;
        let local = config.local_member();

        let (view_tx, view_rx) = watch::channel(None);
        let (status_tx, _) = watch::channel(ServiceStatus::Idle);
        let (event_tx, _) = broadcast::channel(1000);
        let (manager_tx, manager_inputs) = mpsc::channel(config.queue_capacity);
        let (detector_tx, detector_inputs) = mpsc::channel(config.queue_capacity);
        let (detector_events_tx, detector_events) = mpsc::channel(config.queue_capacity);

        let router: Arc<dyn MessageHandler> = Arc::new(InboundRouter {
            local: local.clone(),
            authenticator: authenticator.clone(),
            manager: manager_tx.clone(),
            detector: detector_tx.clone(),
        });
        let dispatcher = MessageKind::ALL.iter().fold(
            MessageDispatcher::new(
                codec.clone(),
                transport,
                components.stats.clone(),
                view_rx.clone(),
                config.protocol_version,
            ),
            |dispatcher, kind| dispatcher.with_handler(*kind, router.clone()),
        );
        let dispatcher = Arc::new(dispatcher);

        let heartbeater = Arc::new(Heartbeater {
            local: local.clone(),
            dispatcher: dispatcher.clone(),
            views: view_rx.clone(),
            sequence: AtomicU64::new(0),
        });

        tracing::debug!(
            "Membership service for {} using {} authentication and {} wire protocol",
            local,
            authenticator.name(),
            codec.name()
        );

        Ok(Self {
            config,
            local,
            authenticator,
            stats: components.stats,
            dispatcher,
            heartbeater,
            manager_tx,
            detector_tx,
            view_tx: Arc::new(view_tx),
            view_rx,
            status_tx: Arc::new(status_tx),
            event_tx,
            pending: Mutex::new(Some(PendingWorkers {
                inbound,
                manager_inputs,
                detector_inputs,
                detector_events,
                detector_events_tx,
            })),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn local_member(&self) -> &MemberIdentifier {
        &self.local
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<dyn ConnectionStatistics> {
        self.stats.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ServiceStatus {
        self.status_tx.borrow().clone()
    }

    /// Currently installed view
    pub fn current_view(&self) -> Option<Arc<View>> {
        self.view_rx.borrow().clone()
    }

    pub fn coordinator(&self) -> Option<MemberIdentifier> {
        self.current_view().and_then(|view| view.coordinator().cloned())
    }

    /// Installed views as they are published
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<View>>> {
        self.view_rx.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.event_tx.subscribe()
    }

    /// Start the workers, then found the cluster or join it
    pub async fn start(&self) -> Result<Arc<View>> {
        let pending = self
            .pending
            .lock()
            .await
            .take()
            .ok_or_else(|| MembershipError::configuration("Membership service already started"))?;

        tracing::info!(
            "Starting membership service for {} in cluster {}",
            self.local,
            self.config.cluster_name
        );

        let detector = FailureDetector::new(
            self.local.clone(),
            self.config.heartbeat_interval,
            self.config.suspicion.clone(),
        );
        let (outbound, outbound_queue) = mpsc::channel(self.config.queue_capacity);
        let worker = ManagerWorker {
            manager: ViewManager::new(self.local.clone(), self.config.installation.clone()),
            outbound,
            heartbeater: self.heartbeater.clone(),
            detector: self.detector_tx.clone(),
            view_tx: self.view_tx.clone(),
            status_tx: self.status_tx.clone(),
            event_tx: self.event_tx.clone(),
            stats: self.stats.clone(),
        };

        {
            let mut tasks = self.tasks.lock().await;
            tasks.push(self.dispatcher.clone().spawn_receiver(pending.inbound));
            tasks.push(spawn_failure_detector(
                detector,
                self.config.heartbeat_interval,
                pending.detector_inputs,
                self.view_rx.clone(),
                pending.detector_events_tx,
            ));
            tasks.push(spawn_outbound(self.dispatcher.clone(), outbound_queue));
            tasks.push(tokio::spawn(worker.run(pending.manager_inputs, pending.detector_events)));
            tasks.push(spawn_heartbeats(self.heartbeater.clone(), self.config.heartbeat_interval));
        }
        self.running.store(true, Ordering::SeqCst);

        if self.config.is_initial_member {
            self.found().await
        } else {
            self.join().await
        }
    }

    async fn found(&self) -> Result<Arc<View>> {
        self.status_tx.send_replace(ServiceStatus::Joining);
        self.to_manager(ManagerInput::Found).await?;

        match self
            .wait_for_status(self.config.join_timeout, |status| *status != ServiceStatus::Joining)
            .await
        {
            Some(ServiceStatus::Member) => self.current_view().ok_or(MembershipError::NotRunning),
            Some(ServiceStatus::Disconnected(reason)) => Err(MembershipError::forced_disconnect(reason)),
            _ => Err(MembershipError::JoinTimeout(self.config.join_timeout)),
        }
    }

    /// Join through the configured locators, retrying until a view that
    /// contains the local member is installed
    pub async fn join(&self) -> Result<Arc<View>> {
        if !self.is_running() {
            return Err(MembershipError::NotRunning);
        }
        if let Some(view) = self.current_view() {
            return Ok(view);
        }

        self.status_tx.send_replace(ServiceStatus::Joining);
        let request = Message::join_request(
            Recipients::Broadcast,
            self.local.clone(),
            self.authenticator.credentials(&self.local),
        );
        let local_addr = self.dispatcher.local_addr();
        let locators: Vec<SocketAddr> = self
            .config
            .locators
            .iter()
            .copied()
            .filter(|locator| *locator != local_addr)
            .collect();

        tracing::info!("Joining cluster {} via {} locators", self.config.cluster_name, locators.len());
        let deadline = Instant::now() + self.config.join_timeout;

        loop {
            let report = self.dispatcher.send_to(&request, &locators).await;
            if report.delivered.is_empty() {
                tracing::debug!("No locator reachable yet");
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let outcome = self
                .wait_for_status(self.config.join_retry_interval.min(remaining), |status| {
                    *status != ServiceStatus::Joining
                })
                .await;
            match outcome {
                Some(ServiceStatus::Member) => {
                    let view = self.current_view().ok_or(MembershipError::NotRunning)?;
                    tracing::info!("Joined cluster {} at view {}", self.config.cluster_name, view.view_number());
                    return Ok(view);
                }
                Some(ServiceStatus::Rejected(reason)) => return Err(MembershipError::join_rejected(reason)),
                Some(ServiceStatus::Disconnected(reason)) => return Err(MembershipError::forced_disconnect(reason)),
                Some(ServiceStatus::Left) => return Err(MembershipError::NotRunning),
                _ => {}
            }
        }

        tracing::error!("Could not join cluster {} within {:?}", self.config.cluster_name, self.config.join_timeout);
        Err(MembershipError::JoinTimeout(self.config.join_timeout))
    }

    /// Leave the cluster and stop the workers
    pub async fn leave(&self) -> Result<()> {
        if !self.is_running() {
            return Err(MembershipError::NotRunning);
        }

        self.status_tx.send_replace(ServiceStatus::Leaving);
        self.to_manager(ManagerInput::Leave).await?;

        match self
            .wait_for_status(self.config.leave_timeout, ServiceStatus::is_terminal)
            .await
        {
            Some(ServiceStatus::Left) => tracing::info!("{} left cluster {}", self.local, self.config.cluster_name),
            Some(status) => tracing::warn!("Leaving in state {:?}", status),
            None => tracing::warn!(
                "No departure view within {:?}, leaving anyway",
                self.config.leave_timeout
            ),
        }

        self.shutdown().await
    }

    /// Ask the coordinator to remove `target`; it is shunned afterwards
    pub async fn request_removal(&self, target: &MemberIdentifier, reason: &str) -> Result<()> {
        if !self.is_running() {
            return Err(MembershipError::NotRunning);
        }
        let view = self.current_view().ok_or(MembershipError::NotRunning)?;
        if !view.contains(target) {
            return Err(MembershipError::member_not_found(target.to_string()));
        }

        tracing::info!("Requesting removal of {}: {}", target, reason);
        self.to_manager(ManagerInput::Remove {
            target: target.clone(),
            reason: reason.to_string(),
        })
        .await
    }

    /// Stop all workers without announcing a departure
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down membership service for {}", self.local);
        self.running.store(false, Ordering::SeqCst);

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }

    async fn to_manager(&self, input: ManagerInput) -> Result<()> {
        self.manager_tx
            .send(input)
            .await
            .map_err(|_| MembershipError::NotRunning)
    }

    async fn wait_for_status<F>(&self, timeout: Duration, done: F) -> Option<ServiceStatus>
    where
        F: Fn(&ServiceStatus) -> bool,
    {
        let mut status = self.status_tx.subscribe();
        tokio::time::timeout(timeout, async {
            loop {
                let current = status.borrow_and_update().clone();
                if done(&current) {
                    return Some(current);
                }
                if status.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await
        .ok()
        .flatten()
    }
}

impl Drop for MembershipService {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

/// Routes decoded messages to the failure detector or the view manager
struct InboundRouter {
    local: MemberIdentifier,
    authenticator: Arc<dyn Authenticator>,
    manager: mpsc::Sender<ManagerInput>,
    detector: mpsc::Sender<DetectorInput>,
}

impl InboundRouter {
    async fn to_manager(&self, input: ManagerInput) -> Result<()> {
        self.manager.send(input).await.map_err(|_| MembershipError::NotRunning)
    }

    async fn to_detector(&self, input: DetectorInput) -> Result<()> {
        self.detector.send(input).await.map_err(|_| MembershipError::NotRunning)
    }
}

#[async_trait]
impl MessageHandler for InboundRouter {
    async fn handle(&self, message: Message, from: SocketAddr) -> Result<()> {
        match message.body {
            MessageBody::Heartbeat {
                sender,
                sequence,
                view_number,
            } => {
                self.to_detector(DetectorInput::Heartbeat {
                    sender: sender.clone(),
                    sequence,
                })
                .await?;
                if view_number > 0 {
                    self.to_manager(ManagerInput::PeerView { sender, view_number }).await?;
                }
                Ok(())
            }
            MessageBody::SuspectMembers {
                reporter,
                suspects,
                reason,
            } => {
                self.to_detector(DetectorInput::Suspicion {
                    reporter,
                    suspects,
                    reason,
                })
                .await
            }
            MessageBody::JoinRequest { candidate, credentials } => {
                if let Err(e) = self.authenticator.authenticate(&candidate, credentials.as_deref()) {
                    tracing::warn!("Rejecting join of {} from {}: {}", candidate, from, e);
                    let reply = Message::new(
                        Recipients::Single(candidate.clone()),
                        MessageBody::JoinRejected {
                            candidate,
                            reason: e.to_string(),
                        },
                    );
                    return self.to_manager(ManagerInput::Outbound(reply)).await;
                }
                self.to_manager(ManagerInput::Message(MessageBody::JoinRequest { candidate, credentials }))
                    .await
            }
            body => {
                if let Some(origin) = body.origin() {
                    if *origin != self.local {
                        self.to_detector(DetectorInput::Activity { sender: origin.clone() }).await?;
                    }
                }
                self.to_manager(ManagerInput::Message(body)).await
            }
        }
    }
}

/// Emits the local member's heartbeats
struct Heartbeater {
    local: MemberIdentifier,
    dispatcher: Arc<MessageDispatcher>,
    views: watch::Receiver<Option<Arc<View>>>,
    sequence: AtomicU64,
}

impl Heartbeater {
    async fn beat(&self) {
        let view_number = match self.views.borrow().as_ref() {
            Some(view) if view.contains(&self.local) => view.view_number(),
            _ => return,
        };
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        let message = Message::heartbeat(Recipients::Broadcast, self.local.clone(), sequence, view_number);
        self.dispatcher.send(&message).await;
    }
}

fn spawn_heartbeats(heartbeater: Arc<Heartbeater>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            heartbeater.beat().await;
        }
    })
}

/// Send queued messages in order, each one to all its recipients before the next
fn spawn_outbound(dispatcher: Arc<MessageDispatcher>, mut queue: mpsc::Receiver<Message>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = queue.recv().await {
            dispatcher.send(&message).await;
        }
        tracing::debug!("Outbound queue closed, sender stopping");
    })
}

/// Owner of the view manager; applies its actions
struct ManagerWorker {
    manager: ViewManager,
    outbound: mpsc::Sender<Message>,
    heartbeater: Arc<Heartbeater>,
    detector: mpsc::Sender<DetectorInput>,
    view_tx: Arc<watch::Sender<Option<Arc<View>>>>,
    status_tx: Arc<watch::Sender<ServiceStatus>>,
    event_tx: broadcast::Sender<MembershipEvent>,
    stats: Arc<dyn ConnectionStatistics>,
}

impl ManagerWorker {
    async fn run(
        mut self,
        mut inputs: mpsc::Receiver<ManagerInput>,
        mut detector_events: mpsc::Receiver<DetectorEvent>,
    ) {
        loop {
            let deadline = self.manager.next_deadline();
            let actions = tokio::select! {
                input = inputs.recv() => match input {
                    Some(input) => self.on_input(input),
                    None => break,
                },
                event = detector_events.recv() => match event {
                    Some(event) => self.on_detector_event(event),
                    None => break,
                },
                _ = wait_until(deadline) => self.manager.tick(Instant::now()),
            };

            self.execute(actions);

            if self.manager.is_stopped() {
                tracing::debug!("View manager for {} stopped", self.manager.local());
                break;
            }
        }
    }

    fn on_input(&mut self, input: ManagerInput) -> Vec<ViewAction> {
        let now = Instant::now();
        match input {
            ManagerInput::Message(body) => self.manager.handle_message(body, now),
            ManagerInput::Outbound(message) => vec![ViewAction::Send(message)],
            ManagerInput::PeerView { sender, view_number } => self.manager.observe_peer_view(sender, view_number),
            ManagerInput::Found => match self.manager.found(now) {
                Ok(actions) => actions,
                Err(e) => vec![ViewAction::Disconnected(e)],
            },
            ManagerInput::Leave => self.manager.request_leave(now),
            ManagerInput::Remove { target, reason } => self.manager.handle_removal(target, &reason, now),
        }
    }

    fn on_detector_event(&mut self, event: DetectorEvent) -> Vec<ViewAction> {
        match event {
            DetectorEvent::Suspected { member, reason } => {
                self.emit(MembershipEvent::MemberSuspected {
                    member: member.clone(),
                    reason: reason.clone(),
                    timestamp: Utc::now(),
                });
                self.manager.handle_suspected(member, reason)
            }
            DetectorEvent::Refuted { member } => {
                self.emit(MembershipEvent::SuspicionRefuted {
                    member,
                    timestamp: Utc::now(),
                });
                Vec::new()
            }
            DetectorEvent::ConfirmedDead { member, reason } => {
                self.manager.handle_confirmed_dead(member, &reason, Instant::now())
            }
            DetectorEvent::RefuteLocalSuspicion => {
                let heartbeater = self.heartbeater.clone();
                tokio::spawn(async move { heartbeater.beat().await });
                Vec::new()
            }
        }
    }

    fn execute(&mut self, actions: Vec<ViewAction>) {
        for action in actions {
            match action {
                ViewAction::Send(message) => {
                    if let Err(e) = self.outbound.try_send(message) {
                        tracing::warn!("Dropping outbound message: {}", e);
                    }
                }
                ViewAction::Installed { view, diff } => self.publish(view, diff),
                ViewAction::Suspect { members, reason } => {
                    // Never block on the detector queue: the detector may be
                    // waiting on our event queue
                    for member in members {
                        let input = DetectorInput::LocalSuspicion {
                            member,
                            reason: reason.clone(),
                        };
                        if let Err(e) = self.detector.try_send(input) {
                            tracing::warn!("Dropping local suspicion: {}", e);
                        }
                    }
                }
                ViewAction::JoinRejected { reason } => {
                    self.status_tx.send_replace(ServiceStatus::Rejected(reason.clone()));
                    self.emit(MembershipEvent::JoinRejected {
                        reason,
                        timestamp: Utc::now(),
                    });
                }
                ViewAction::Left => {
                    self.status_tx.send_replace(ServiceStatus::Left);
                    self.emit(MembershipEvent::Left { timestamp: Utc::now() });
                }
                ViewAction::Disconnected(error) => {
                    let reason = error.to_string();
                    self.status_tx.send_replace(ServiceStatus::Disconnected(reason.clone()));
                    self.emit(MembershipEvent::Disconnected {
                        reason,
                        timestamp: Utc::now(),
                    });
                }
            }
        }
    }

    fn publish(&mut self, view: Arc<View>, diff: ViewDiff) {
        let previous_coordinator = self
            .view_tx
            .borrow()
            .as_ref()
            .and_then(|previous| previous.coordinator().cloned());
        let number = view.view_number();
        let local = self.manager.local().clone();
        let timestamp = Utc::now();

        self.view_tx.send_replace(Some(view.clone()));
        self.status_tx.send_if_modified(|status| {
            if matches!(status, ServiceStatus::Idle | ServiceStatus::Joining) {
                *status = ServiceStatus::Member;
                true
            } else {
                false
            }
        });

        self.emit(MembershipEvent::ViewInstalled {
            view_number: number,
            coordinator: view.coordinator().cloned(),
            members: view.size(),
            timestamp,
        });

        for member in diff.joined.into_iter().filter(|member| *member != local) {
            self.stats.member_connected(&member);
            self.emit(MembershipEvent::MemberJoined {
                member,
                view_number: number,
                timestamp,
            });
        }
        for member in diff.departed {
            self.stats.member_disconnected(&member);
            let event = if diff.removed.contains(&member) {
                MembershipEvent::MemberRemoved {
                    member,
                    view_number: number,
                    timestamp,
                }
            } else {
                MembershipEvent::MemberLeft {
                    member,
                    view_number: number,
                    timestamp,
                }
            };
            self.emit(event);
        }

        if let Some(coordinator) = view.coordinator() {
            if previous_coordinator.as_ref() != Some(coordinator) {
                tracing::info!("Coordinator of view {} is {}", number, coordinator);
                self.emit(MembershipEvent::CoordinatorChanged {
                    coordinator: coordinator.clone(),
                    view_number: number,
                    timestamp,
                });
            }
        }
    }

    fn emit(&self, event: MembershipEvent) {
        // No listeners is fine
        let _ = self.event_tx.send(event);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
