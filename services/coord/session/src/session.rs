//! Session facade.

use crate::config::CoordinationConfig;
use crate::control::{ControlClient, ControlCommand, ControlLoop, ControlOutput};
use crate::election::elect;
use crate::event::{SessionEvent, SessionEventNotifier};
use crate::handshake::confirm_connection;
use crate::SessionError;
use chrono::Utc;
use coord_resource::{ResourceEvent, ResourceManager, ResourceUsage, Transport};
use coord_runtime::{
    spawn_supervised, Layer, LayerRegistry, StreamError, StreamHandle, StreamOp, StreamRegistry,
    StreamReport, StreamState, UnitHandle, UnitStatus,
};
use coord_state::{CoordinationPhase, StateSnapshot};
use coord_wire::{
    ConfigUpdate, CreateStream, MessageBody, Metadata, Node, NodeRole, ResumeStream, StartStream,
    StreamConfig, StreamTarget, UserMessage,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;
const CONTROL_CAPACITY: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Local node with its current role
    pub node: Node,
    /// Current phase
    pub phase: CoordinationPhase,
    /// Whether the local node is the coordinator
    pub is_coordinator: bool,
    /// Coordinator uid once established
    pub coordinator_uid: Option<String>,
    /// Local node followed by the roster
    pub topology: Vec<Node>,
    /// Local streams and their states
    pub streams: Vec<(String, StreamState)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    Idle,
    Joining,
    Joined,
    Left,
}

struct Units {
    control: UnitHandle<ControlCommand>,
    pump: JoinHandle<()>,
}

/// Stream starts waiting for their `startAt`, keyed by stream name
#[derive(Debug, Default)]
struct PendingStarts {
    tasks: Mutex<HashMap<String, AbortHandle>>,
}

impl PendingStarts {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, AbortHandle>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track `task` as the pending start of `name`, replacing an earlier one
    fn schedule(&self, name: &str, task: JoinHandle<()>) {
        if let Some(previous) = self.lock().insert(name.to_string(), task.abort_handle()) {
            previous.abort();
        }
    }

    /// Cancel the pending start of `name`. Returns whether one was still waiting.
    fn cancel(&self, name: &str) -> bool {
        match self.lock().remove(name) {
            Some(task) => {
                let waiting = !task.is_finished();
                task.abort();
                waiting
            }
            None => false,
        }
    }

    /// Cancel every pending start. Returns how many were still waiting.
    fn cancel_all(&self) -> usize {
        let tasks: Vec<AbortHandle> = self.lock().drain().map(|(_, task)| task).collect();
        tasks
            .into_iter()
            .filter(|task| {
                let waiting = !task.is_finished();
                task.abort();
                waiting
            })
            .count()
    }
}

/// One node's membership in a coordination network.
///
/// Creating a session spawns its control unit right away; [`join`] then
/// discovers the network and takes a role. A session that has [`left`] cannot
/// join again.
///
/// [`join`]: CoordinationSession::join
/// [`left`]: CoordinationSession::leave
pub struct CoordinationSession {
    config: CoordinationConfig,
    local: Node,
    layers: LayerRegistry,
    resources: Arc<ResourceManager>,
    streams: Arc<StreamRegistry>,
    notifier: SessionEventNotifier,
    control: ControlClient,
    snapshot: watch::Receiver<StateSnapshot>,
    pending_starts: Arc<PendingStarts>,
    membership: Mutex<Membership>,
    units: Mutex<Option<Units>>,
}

impl CoordinationSession {
    /// Create a session for `local` on `transport`. Must be called inside a tokio runtime.
    pub fn new(
        config: CoordinationConfig,
        local: Node,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let layers = LayerRegistry::new();
        let resources = Arc::new(ResourceManager::new(transport));
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let notifier = SessionEventNotifier::new(local.uid(), events_tx);

        let (streams, reports) = StreamRegistry::new(
            local.uid(),
            layers.clone(),
            resources.clone(),
            config.recovery.clone(),
        );
        let streams = Arc::new(streams);

        let (control_loop, snapshot) =
            ControlLoop::new(local.clone(), config.clone(), resources.clone(), notifier.clone());
        let unit_id = format!("control:{}", local.uid());
        let (control_unit, outputs) = spawn_supervised(
            &layers,
            Layer::Control,
            unit_id.clone(),
            control_loop,
            config.recovery.clone(),
            CONTROL_CAPACITY,
        )?;
        let control = ControlClient::new(control_unit.sender());
        let pending_starts = Arc::new(PendingStarts::default());

        let pump = tokio::spawn(
            SessionPump {
                streams: streams.clone(),
                control: control.clone(),
                notifier: notifier.clone(),
                snapshot: snapshot.clone(),
                pending_starts: pending_starts.clone(),
                unit_id,
            }
            .run(outputs, reports, control_unit.status_watch()),
        );

        info!("Created session for node {} ({})", local.id(), local.uid());
        Ok(Self {
            config,
            local,
            layers,
            resources,
            streams,
            notifier,
            control,
            snapshot,
            pending_starts,
            membership: Mutex::new(Membership::Idle),
            units: Mutex::new(Some(Units {
                control: control_unit,
                pump,
            })),
        })
    }

    fn membership(&self) -> Membership {
        *self.membership.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_membership(&self, next: Membership) {
        *self.membership.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    fn ensure_joined(&self) -> Result<(), SessionError> {
        match self.membership() {
            Membership::Joined => Ok(()),
            Membership::Left => Err(SessionError::Disposed),
            Membership::Idle | Membership::Joining => Err(SessionError::NotJoined),
        }
    }

    /// Local node identity
    pub fn local(&self) -> &Node {
        &self.local
    }

    /// Session configuration
    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// Current phase
    pub fn phase(&self) -> CoordinationPhase {
        self.snapshot.borrow().phase
    }

    /// Whether the local node is the coordinator
    pub fn is_coordinator(&self) -> bool {
        self.snapshot.borrow().is_coordinator
    }

    /// Discover the network and take a role.
    ///
    /// Runs up to `discovery_rounds` rounds looking for a node announcing
    /// itself as coordinator. Without one, the discovered candidates elect a
    /// coordinator. A participant confirms two-way reachability before it
    /// sends its join request. The whole join is bounded by `join_timeout`;
    /// on failure the session withdraws, emits `JoinFailed`, and may join again.
    pub async fn join(&self) -> Result<(), SessionError> {
        {
            let mut membership = self.membership.lock().unwrap_or_else(|e| e.into_inner());
            match *membership {
                Membership::Idle => *membership = Membership::Joining,
                Membership::Joining | Membership::Joined => return Err(SessionError::AlreadyJoined),
                Membership::Left => return Err(SessionError::Disposed),
            }
        }

        let timeout = self.config.join_timeout;
        let result = match tokio::time::timeout(timeout, self.run_join()).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::JoinTimeout(timeout)),
        };

        match result {
            Ok(()) => {
                self.set_membership(Membership::Joined);
                Ok(())
            }
            Err(e) => {
                self.notifier.notify_join_failed(&e.to_string());
                if let Err(reset) = self.control.reset().await {
                    debug!("Could not reset after failed join: {}", reset);
                }
                self.set_membership(Membership::Idle);
                Err(e)
            }
        }
    }

    async fn run_join(&self) -> Result<(), SessionError> {
        self.control.start_discovery().await?;
        info!("Discovering network {}", self.config.network_name);

        let mut coordinator = None;
        for round in 1..=self.config.discovery_rounds {
            tokio::time::sleep(self.config.discovery_interval).await;
            let report = self.control.discovery(false).await?;
            if let Some(hint) = report.coordinator_hint {
                info!("Found coordinator {} in discovery round {}", hint, round);
                coordinator = Some(hint);
                break;
            }
            debug!(
                "Discovery round {}/{}: {} candidates",
                round,
                self.config.discovery_rounds,
                report.candidates.len()
            );
        }

        let coordinator = match coordinator {
            Some(uid) => uid,
            None => {
                let report = self.control.discovery(true).await?;
                let elected = elect(self.config.promotion_strategy, &report.candidates)
                    .map(|candidate| candidate.uid.clone())
                    .unwrap_or_else(|| self.local.uid().to_string());
                info!(
                    "Elected {} among {} candidates ({} strategy)",
                    elected,
                    report.candidates.len(),
                    self.config.promotion_strategy
                );
                elected
            }
        };

        if coordinator == self.local.uid() {
            self.control.become_coordinator().await?;
            info!("Coordinating network {}", self.config.network_name);
            return Ok(());
        }

        self.control.become_participant(coordinator.clone()).await?;
        confirm_connection(&self.control, &self.config.connection_test).await?;
        let topology = self.control.join().await?;
        info!(
            "Joined network {} under {} ({} nodes)",
            self.config.network_name,
            coordinator,
            topology.len()
        );
        Ok(())
    }

    /// Leave the network: destroy streams, announce departure, release
    /// endpoints, and stop every unit. Failures along the way are logged.
    pub async fn leave(&self) -> Result<(), SessionError> {
        {
            let mut membership = self.membership.lock().unwrap_or_else(|e| e.into_inner());
            if *membership == Membership::Left {
                return Ok(());
            }
            *membership = Membership::Left;
        }

        let cancelled = self.pending_starts.cancel_all();
        if cancelled > 0 {
            debug!("Cancelled {} delayed stream starts", cancelled);
        }
        self.streams.destroy_all().await;
        if let Err(e) = self.control.leave().await {
            debug!("Control loop already stopped: {}", e);
        }

        let units = self.units.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(units) = units {
            units.control.shutdown(SHUTDOWN_GRACE).await;
            units.pump.abort();
        }

        let released = self.resources.destroy_all().await;
        info!(
            "Node {} left network {} ({} resources released)",
            self.local.uid(),
            self.config.network_name,
            released
        );
        Ok(())
    }

    /// Create a stream. On the coordinator the creation is broadcast to every participant.
    pub async fn create_stream(&self, config: StreamConfig) -> Result<StreamHandle, SessionError> {
        self.ensure_joined()?;
        let handle = self.streams.create(config.clone()).await?;
        if self.is_coordinator() {
            self.control
                .send(CreateStream {
                    stream_name: config.id.clone(),
                    config,
                })
                .await?;
        }
        Ok(handle)
    }

    async fn drive(&self, name: &str, op: StreamOp, body: MessageBody) -> Result<StreamState, SessionError> {
        self.ensure_joined()?;
        let state = self.streams.apply(name, op).await?;
        if self.is_coordinator() {
            self.control.send(body).await?;
        }
        Ok(state)
    }

    /// Start a stream (everywhere, when called on the coordinator)
    pub async fn start_stream(&self, name: &str) -> Result<StreamState, SessionError> {
        let body = StartStream {
            stream_name: name.to_string(),
            start_at: None,
        };
        self.drive(name, StreamOp::Start, body.into()).await
    }

    /// Pause a stream
    pub async fn pause_stream(&self, name: &str) -> Result<StreamState, SessionError> {
        let body = MessageBody::PauseStream(StreamTarget::named(name));
        self.drive(name, StreamOp::Pause, body).await
    }

    /// Resume a stream, optionally discarding samples buffered while paused
    pub async fn resume_stream(&self, name: &str, flush_before_resume: bool) -> Result<StreamState, SessionError> {
        let body = ResumeStream {
            stream_name: name.to_string(),
            flush_before_resume,
        };
        self.drive(name, StreamOp::Resume { flush_before_resume }, body.into())
            .await
    }

    /// Discard samples buffered on a stream
    pub async fn flush_stream(&self, name: &str) -> Result<StreamState, SessionError> {
        let body = MessageBody::FlushStream(StreamTarget::named(name));
        self.drive(name, StreamOp::Flush, body).await
    }

    /// Stop a stream, keeping it restartable
    pub async fn stop_stream(&self, name: &str) -> Result<StreamState, SessionError> {
        let body = MessageBody::StopStream(StreamTarget::named(name));
        self.drive(name, StreamOp::Stop, body).await
    }

    /// Destroy a stream. Its handle becomes invalid.
    pub async fn destroy_stream(&self, name: &str) -> Result<(), SessionError> {
        self.ensure_joined()?;
        self.pending_starts.cancel(name);
        self.streams.destroy(name).await?;
        if self.is_coordinator() {
            self.control
                .send(MessageBody::DestroyStream(StreamTarget::named(name)))
                .await?;
        }
        Ok(())
    }

    /// Handle of a live local stream
    pub async fn stream(&self, name: &str) -> Option<StreamHandle> {
        self.streams.get(name).await
    }

    /// Wait until the topology (local node included) has at least `count` nodes
    pub async fn wait_for_nodes(&self, count: usize, timeout: Duration) -> Result<(), SessionError> {
        let mut snapshot = self.snapshot.clone();
        let wait = snapshot.wait_for(|state| state.connected_nodes.len() + 1 >= count);
        let reached = tokio::time::timeout(timeout, wait)
            .await
            .map(|waited| waited.map(drop));
        match reached {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(SessionError::ControlClosed),
            Err(_) => Err(SessionError::NodesTimeout {
                expected: count,
                found: self.snapshot.borrow().connected_nodes.len() + 1,
                timeout,
            }),
        }
    }

    /// Broadcast an application message. Returns its message id.
    pub async fn send_user_message(&self, payload: Metadata) -> Result<String, SessionError> {
        self.ensure_joined()?;
        let message_id = uuid::Uuid::new_v4().to_string();
        self.control
            .send(UserMessage {
                message_id: message_id.clone(),
                payload,
            })
            .await?;
        Ok(message_id)
    }

    /// Broadcast a configuration change
    pub async fn update_config(&self, config: Metadata) -> Result<(), SessionError> {
        self.ensure_joined()?;
        self.control.send(ConfigUpdate { config }).await
    }

    /// Subscribe to session events sent from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.notifier.subscribe()
    }

    /// Session events sent from now on, as a stream
    pub fn events(&self) -> BroadcastStream<SessionEvent> {
        BroadcastStream::new(self.notifier.subscribe())
    }

    /// Resource churn notifications
    pub fn resource_events(&self) -> broadcast::Receiver<ResourceEvent> {
        self.resources.subscribe_events()
    }

    /// Live resource counts
    pub fn resource_usage(&self) -> ResourceUsage {
        self.resources.stats()
    }

    /// Unit registry of this session
    pub fn layers(&self) -> &LayerRegistry {
        &self.layers
    }

    /// Point-in-time view of phase, role, topology, and streams
    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.snapshot.borrow().clone();
        let role = if !state.phase.is_established() {
            NodeRole::Unassigned
        } else if state.is_coordinator {
            NodeRole::Coordinator
        } else {
            NodeRole::Participant
        };
        let node = self.local.with_role(role);

        let mut topology = Vec::with_capacity(state.connected_nodes.len() + 1);
        topology.push(node.clone());
        topology.extend(state.connected_nodes.iter().cloned());

        SessionSnapshot {
            node,
            phase: state.phase,
            is_coordinator: state.is_coordinator,
            coordinator_uid: state.coordinator_uid,
            topology,
            streams: self.streams.states().await,
        }
    }
}

impl Drop for CoordinationSession {
    fn drop(&mut self) {
        let units = self.units.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(units) = units {
            units.control.abort();
            units.pump.abort();
        }
        self.pending_starts.cancel_all();
    }
}

/// Applies control-loop output and stream reports on behalf of the facade
struct SessionPump {
    streams: Arc<StreamRegistry>,
    control: ControlClient,
    notifier: SessionEventNotifier,
    snapshot: watch::Receiver<StateSnapshot>,
    pending_starts: Arc<PendingStarts>,
    unit_id: String,
}

impl SessionPump {
    async fn run(
        self,
        mut outputs: mpsc::Receiver<ControlOutput>,
        mut reports: mpsc::Receiver<StreamReport>,
        mut status: watch::Receiver<UnitStatus>,
    ) {
        let mut watching = true;
        loop {
            tokio::select! {
                Some(output) = outputs.recv() => match output {
                    ControlOutput::StreamCommand(body) => self.apply_remote(body).await,
                },
                Some(report) = reports.recv() => self.on_report(report).await,
                changed = status.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let current = status.borrow_and_update().clone();
                    match current {
                        UnitStatus::Disabled { reason } => {
                            self.notifier.notify_fatal(&self.unit_id, &reason);
                        }
                        UnitStatus::Recovering { attempt, delay } => {
                            warn!("Control unit recovering (attempt {}) in {:?}", attempt, delay);
                        }
                        UnitStatus::Running | UnitStatus::Stopped => {}
                    }
                }
                else => break,
            }
        }
    }

    fn is_coordinator(&self) -> bool {
        self.snapshot.borrow().is_coordinator
    }

    async fn report_ready(&self, stream: &str) {
        if self.is_coordinator() {
            return;
        }
        if let Err(e) = self.control.send(MessageBody::StreamReady(StreamTarget::named(stream))).await {
            debug!("Could not report stream {} ready: {}", stream, e);
        }
    }

    /// Replay a stream command from the coordinator. Replays are harmless:
    /// creating an existing stream or destroying a missing one is not an error.
    async fn apply_remote(&self, body: MessageBody) {
        let Some(name) = body.stream_name().map(str::to_string) else {
            return;
        };

        let result = match body {
            MessageBody::CreateStream(create) => {
                let mut config = create.config;
                config.id = create.stream_name;
                match self.streams.create(config).await {
                    Ok(_) | Err(StreamError::Duplicate(_)) => {
                        self.report_ready(&name).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            MessageBody::StartStream(start) => {
                let delay = start
                    .start_at
                    .and_then(|at| (at - Utc::now()).to_std().ok())
                    .unwrap_or_default();
                if delay.is_zero() {
                    self.pending_starts.cancel(&name);
                    self.start(&name).await
                } else {
                    debug!("Starting stream {} in {:?}", name, delay);
                    let pump = SessionPump {
                        streams: self.streams.clone(),
                        control: self.control.clone(),
                        notifier: self.notifier.clone(),
                        snapshot: self.snapshot.clone(),
                        pending_starts: self.pending_starts.clone(),
                        unit_id: self.unit_id.clone(),
                    };
                    let stream = name.clone();
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Err(e) = pump.start(&stream).await {
                            warn!("Delayed start of stream {} failed: {}", stream, e);
                        }
                    });
                    self.pending_starts.schedule(&name, task);
                    Ok(())
                }
            }
            MessageBody::PauseStream(_) => self.streams.apply(&name, StreamOp::Pause).await.map(drop),
            MessageBody::ResumeStream(resume) => self
                .streams
                .apply(
                    &name,
                    StreamOp::Resume {
                        flush_before_resume: resume.flush_before_resume,
                    },
                )
                .await
                .map(drop),
            MessageBody::FlushStream(_) => self.streams.apply(&name, StreamOp::Flush).await.map(drop),
            MessageBody::StopStream(_) => {
                self.pending_starts.cancel(&name);
                self.streams.apply(&name, StreamOp::Stop).await.map(drop)
            }
            MessageBody::DestroyStream(_) => {
                if self.pending_starts.cancel(&name) {
                    debug!("Cancelled delayed start of stream {}", name);
                }
                self.destroy_local(&name).await
            }
            other => {
                debug!("Not a stream command: {}", other.message_type());
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Stream command for {} failed: {}", name, e);
        }
    }

    async fn destroy_local(&self, name: &str) -> Result<(), StreamError> {
        match self.streams.destroy(name).await {
            Ok(()) | Err(StreamError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn start(&self, name: &str) -> Result<(), StreamError> {
        self.streams.apply(name, StreamOp::Start).await?;
        self.report_ready(name).await;
        Ok(())
    }

    async fn on_report(&self, report: StreamReport) {
        match report {
            StreamReport::StateChanged { stream, state } => {
                self.notifier.notify_stream_state(&stream, state);
                let states = self.streams.states().await;
                let active = states.iter().filter(|(_, s)| *s == StreamState::Active).count();
                let paused = states.iter().filter(|(_, s)| *s == StreamState::Paused).count();
                if let Err(e) = self
                    .control
                    .post(ControlCommand::StreamsChanged { active, paused })
                    .await
                {
                    debug!("Control loop gone: {}", e);
                }
            }
            StreamReport::Flushed { stream, dropped } => {
                debug!("Stream {} flushed {} samples", stream, dropped);
            }
            StreamReport::InletLost { stream, source_id } => {
                info!("Stream {} lost producer {}", stream, source_id);
            }
        }
    }
}
