//! Control-plane execution unit.
//!
//! [`ControlLoop`] is the single owner of the node's [`CoordinationState`].
//! It runs as a supervised unit in the control layer and talks to the session
//! facade only through [`ControlCommand`]s in and [`ControlOutput`]s out; the
//! facade observes state through a `watch` snapshot. Coordination traffic
//! travels over a coordination endpoint published by every node: each peer's
//! endpoint is subscribed through the [`ResourceManager`] and drained by a
//! small forwarder task that feeds raw frames back into the loop.

use crate::config::CoordinationConfig;
use crate::election::{Candidate, NETWORK_PROPERTY, NODE_ID_PROPERTY};
use crate::event::{SessionEventKind, SessionEventNotifier};
use crate::handshake::PendingTests;
use crate::keepalive::{heartbeat, sweep_stale};
use crate::protocol::{handler_for, HandlerContext, ProtocolEffect};
use crate::{ProtocolError, SessionError};
use async_trait::async_trait;
use bytes::Bytes;
use coord_resource::{
    DiscoveryFilter, ResourceId, ResourceManager, StreamDescriptor, COORDINATION_STREAM_TYPE,
};
use coord_runtime::{IsolateError, UnitWorker};
use coord_state::{CoordinationPhase, CoordinationState, StateSnapshot};
use coord_wire::{
    decode_frame, encode_frame, ConnectionTest, CoordinationMessage, JoinRequest, MessageBody,
    Node, NodeLeaving, NodeRole,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

const FRAME_QUEUE_CAPACITY: usize = 256;

/// What discovery has seen so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Election candidates, the local node included
    pub candidates: Vec<Candidate>,
    /// Node that announced itself as coordinator, if any
    pub coordinator_hint: Option<String>,
}

/// Requests from the session facade
#[derive(Debug)]
pub enum ControlCommand {
    /// Publish the coordination endpoint and start discovering peers
    StartDiscovery {
        /// Completion
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    /// Report discovery results; with `electing` the phase moves to `Electing`
    Discovery {
        /// Whether an election follows
        electing: bool,
        /// Completion
        reply: oneshot::Sender<DiscoveryReport>,
    },
    /// Take the coordinator role
    BecomeCoordinator {
        /// Completion
        reply: oneshot::Sender<()>,
    },
    /// Take the participant role under `coordinator_uid`
    BecomeParticipant {
        /// Chosen coordinator
        coordinator_uid: String,
        /// Completion
        reply: oneshot::Sender<()>,
    },
    /// Send a connection test; `reply` completes when it is answered
    ConnectionTest {
        /// Test id
        test_id: String,
        /// Completion
        reply: oneshot::Sender<()>,
    },
    /// Send a join request; `reply` completes on accept or reject
    Join {
        /// Completion with the accepted topology
        reply: oneshot::Sender<Result<Vec<Node>, SessionError>>,
    },
    /// Broadcast a message
    Send {
        /// Message body
        body: MessageBody,
    },
    /// Local stream activity changed
    StreamsChanged {
        /// Streams currently active
        active: usize,
        /// Streams currently paused
        paused: usize,
    },
    /// Withdraw from the network and return to `Idle`
    Reset {
        /// Completion
        reply: oneshot::Sender<()>,
    },
    /// Announce departure, release endpoints, move to `Disposing`, and stop the unit
    Leave {
        /// Completion
        reply: oneshot::Sender<()>,
    },
}

/// Work the control loop hands back to the session facade
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOutput {
    /// Stream lifecycle command from the coordinator
    StreamCommand(MessageBody),
}

/// Sending side of the control unit's inbox
#[derive(Debug, Clone)]
pub struct ControlClient {
    commands: mpsc::Sender<ControlCommand>,
}

impl ControlClient {
    /// Wrap the inbox sender of a control unit
    pub fn new(commands: mpsc::Sender<ControlCommand>) -> Self {
        Self { commands }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControlCommand,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SessionError::ControlClosed)?;
        response.await.map_err(|_| SessionError::ControlClosed)
    }

    /// Deliver a command without waiting for completion
    pub async fn post(&self, command: ControlCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::ControlClosed)
    }

    /// Publish the coordination endpoint and start discovering
    pub async fn start_discovery(&self) -> Result<(), SessionError> {
        self.request(|reply| ControlCommand::StartDiscovery { reply })
            .await?
    }

    /// Current discovery results
    pub async fn discovery(&self, electing: bool) -> Result<DiscoveryReport, SessionError> {
        self.request(|reply| ControlCommand::Discovery { electing, reply })
            .await
    }

    /// Take the coordinator role
    pub async fn become_coordinator(&self) -> Result<(), SessionError> {
        self.request(|reply| ControlCommand::BecomeCoordinator { reply })
            .await
    }

    /// Take the participant role
    pub async fn become_participant(&self, coordinator_uid: impl Into<String>) -> Result<(), SessionError> {
        let coordinator_uid = coordinator_uid.into();
        self.request(|reply| ControlCommand::BecomeParticipant {
            coordinator_uid,
            reply,
        })
        .await
    }

    /// Send a join request and wait for the verdict
    pub async fn join(&self) -> Result<Vec<Node>, SessionError> {
        self.request(|reply| ControlCommand::Join { reply }).await?
    }

    /// Broadcast a message
    pub async fn send(&self, body: impl Into<MessageBody>) -> Result<(), SessionError> {
        self.post(ControlCommand::Send { body: body.into() }).await
    }

    /// Withdraw from the network
    pub async fn reset(&self) -> Result<(), SessionError> {
        self.request(|reply| ControlCommand::Reset { reply }).await
    }

    /// Announce departure and release endpoints
    pub async fn leave(&self) -> Result<(), SessionError> {
        self.request(|reply| ControlCommand::Leave { reply }).await
    }
}

#[async_trait]
impl crate::handshake::ConnectionProbe for ControlClient {
    async fn send_test(&self, test_id: &str) -> Result<oneshot::Receiver<()>, SessionError> {
        let (reply, response) = oneshot::channel();
        self.post(ControlCommand::ConnectionTest {
            test_id: test_id.to_string(),
            reply,
        })
        .await?;
        Ok(response)
    }
}

#[derive(Debug)]
enum PeerFrame {
    Frame { node_uid: String, bytes: Bytes },
    Lost { node_uid: String, resource: ResourceId },
}

#[derive(Debug)]
struct PeerLink {
    resource: ResourceId,
    descriptor_uid: String,
    forwarder: JoinHandle<()>,
}

/// Owner of the coordination state, run as a control-layer unit
pub struct ControlLoop {
    local: Node,
    config: CoordinationConfig,
    state: CoordinationState,
    resources: Arc<ResourceManager>,
    notifier: SessionEventNotifier,
    snapshot_tx: watch::Sender<StateSnapshot>,
    outlet: Option<ResourceId>,
    own_candidate: Option<Candidate>,
    resolver: Option<ResourceId>,
    peers: HashMap<String, PeerLink>,
    frames_tx: mpsc::Sender<PeerFrame>,
    frames_rx: mpsc::Receiver<PeerFrame>,
    pending_tests: PendingTests,
    join_waiter: Option<oneshot::Sender<Result<Vec<Node>, SessionError>>>,
    coordinator_hint: Option<String>,
}

impl ControlLoop {
    /// Create an idle control loop for `local`
    pub fn new(
        local: Node,
        config: CoordinationConfig,
        resources: Arc<ResourceManager>,
        notifier: SessionEventNotifier,
    ) -> (Self, watch::Receiver<StateSnapshot>) {
        let mut state = CoordinationState::new(local.uid());
        state.set_event_handler(Arc::new(notifier.clone()));
        let (snapshot_tx, snapshot_rx) = watch::channel(state.snapshot());
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);

        (
            Self {
                local,
                config,
                state,
                resources,
                notifier,
                snapshot_tx,
                outlet: None,
                own_candidate: None,
                resolver: None,
                peers: HashMap::new(),
                frames_tx,
                frames_rx,
                pending_tests: PendingTests::new(),
                join_waiter: None,
                coordinator_hint: None,
            },
            snapshot_rx,
        )
    }

    fn resource_id(&self, suffix: &str) -> ResourceId {
        ResourceId::from(format!("control/{}/{}", self.local.uid(), suffix))
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_if_modified(|current| {
            let next = self.state.snapshot();
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Broadcast `body` on the local coordination endpoint
    fn broadcast(&self, body: impl Into<MessageBody>) -> Result<(), IsolateError> {
        let Some(outlet) = &self.outlet else {
            trace!("No coordination endpoint, dropping outgoing message");
            return Ok(());
        };

        let message = CoordinationMessage::new(self.local.uid(), body);
        let message_type = message.message_type();
        let frame = encode_frame(&message)
            .map_err(|e| IsolateError::new(format!("failed to encode {}", message_type)).with_cause(e))?;
        self.resources
            .push(outlet, frame)
            .map_err(|e| IsolateError::new("coordination endpoint rejected a message").with_cause(e))?;
        trace!("Sent {}", message_type);
        Ok(())
    }

    async fn publish_endpoint(&mut self) -> Result<(), SessionError> {
        if self.outlet.is_some() {
            return Ok(());
        }

        let network = self.config.network_name.clone();
        let descriptor = StreamDescriptor::new(
            format!("{}/coordination/{}", network, self.local.uid()),
            COORDINATION_STREAM_TYPE,
            self.local.uid(),
        )
        .with_property(NETWORK_PROPERTY, network.clone())
        .with_property(NODE_ID_PROPERTY, self.local.id());
        self.own_candidate = Some(Candidate::from_descriptor(&descriptor));

        let outlet = self
            .resources
            .create_publisher(self.resource_id("outlet"), descriptor)
            .await?;
        self.outlet = Some(outlet);

        let filter = DiscoveryFilter::any()
            .stream_type(COORDINATION_STREAM_TYPE)
            .property(NETWORK_PROPERTY, network.clone())
            .excluding_source(self.local.uid());
        let resolver = self
            .resources
            .create_continuous_resolver(self.resource_id("resolver"), filter)?;
        self.resolver = Some(resolver);

        info!("Published coordination endpoint on network {}", network);
        Ok(())
    }

    fn wants_peer(&self, uid: &str) -> bool {
        if !self.state.phase().is_established()
            || self.state.is_coordinator()
            || self.config.topology.is_full_mesh()
        {
            return true;
        }
        self.state.coordinator_uid() == Some(uid)
    }

    /// Align peer links with what the resolver currently reports
    async fn refresh_peers(&mut self) {
        let Some(resolver) = &self.resolver else {
            return;
        };
        let descriptors = match self.resources.resolve(resolver) {
            Ok(descriptors) => descriptors,
            Err(e) => {
                warn!("Coordination discovery failed: {}", e);
                return;
            }
        };

        let wanted: Vec<StreamDescriptor> = descriptors
            .into_iter()
            .filter(|d| self.wants_peer(&d.source_id))
            .collect();

        let obsolete: Vec<String> = self
            .peers
            .iter()
            .filter(|(uid, link)| {
                !wanted
                    .iter()
                    .any(|d| &d.source_id == *uid && d.uid == link.descriptor_uid)
            })
            .map(|(uid, _)| uid.clone())
            .collect();
        for uid in obsolete {
            self.drop_peer(&uid).await;
        }

        for descriptor in wanted {
            if !self.peers.contains_key(&descriptor.source_id) {
                self.connect_peer(descriptor).await;
            }
        }
    }

    async fn connect_peer(&mut self, descriptor: StreamDescriptor) {
        let node_uid = descriptor.source_id.clone();
        let id = self.resource_id(&format!("peer/{}", descriptor.uid));
        let resource = match self.resources.subscribe(id, &descriptor).await {
            Ok(resource) => resource,
            Err(e) => {
                warn!("Could not subscribe to coordination endpoint of {}: {}", node_uid, e);
                return;
            }
        };
        debug!("Linked to coordination endpoint of {}", node_uid);

        let resources = self.resources.clone();
        let frames = self.frames_tx.clone();
        let pulled = resource.clone();
        let peer = node_uid.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match resources.pull(&pulled).await {
                    Ok(bytes) => {
                        let frame = PeerFrame::Frame {
                            node_uid: peer.clone(),
                            bytes,
                        };
                        if frames.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Coordination link to {} ended: {}", peer, e);
                        let _ = frames
                            .send(PeerFrame::Lost {
                                node_uid: peer,
                                resource: pulled,
                            })
                            .await;
                        break;
                    }
                }
            }
        });

        self.peers.insert(
            node_uid,
            PeerLink {
                resource,
                descriptor_uid: descriptor.uid,
                forwarder,
            },
        );
    }

    async fn drop_peer(&mut self, uid: &str) {
        if let Some(link) = self.peers.remove(uid) {
            link.forwarder.abort();
            self.resources.destroy(&link.resource).await;
            debug!("Unlinked coordination endpoint of {}", uid);
        }
    }

    async fn teardown(&mut self) {
        let uids: Vec<String> = self.peers.keys().cloned().collect();
        for uid in uids {
            self.drop_peer(&uid).await;
        }
        if let Some(resolver) = self.resolver.take() {
            self.resources.destroy(&resolver).await;
        }
        if let Some(outlet) = self.outlet.take() {
            self.resources.destroy(&outlet).await;
        }
        self.own_candidate = None;
        self.coordinator_hint = None;
        self.join_waiter = None;
        self.pending_tests = PendingTests::new();
    }

    fn discovery_report(&self) -> DiscoveryReport {
        let mut candidates: Vec<Candidate> = self.own_candidate.iter().cloned().collect();
        if let Some(resolver) = &self.resolver {
            match self.resources.resolve(resolver) {
                Ok(descriptors) => {
                    for descriptor in &descriptors {
                        let candidate = Candidate::from_descriptor(descriptor);
                        if !candidates.iter().any(|c| c.uid == candidate.uid) {
                            candidates.push(candidate);
                        }
                    }
                }
                Err(e) => warn!("Coordination discovery failed: {}", e),
            }
        }
        DiscoveryReport {
            candidates,
            coordinator_hint: self.coordinator_hint.clone(),
        }
    }

    fn on_streams_changed(&mut self, active: usize, paused: usize) {
        let phase = self.state.phase();
        if phase < CoordinationPhase::Ready || phase == CoordinationPhase::Disposing {
            return;
        }
        let next = if active > 0 {
            CoordinationPhase::Active
        } else if paused > 0 {
            CoordinationPhase::Paused
        } else {
            CoordinationPhase::Ready
        };
        self.state.transition_to(next);
    }

    async fn leave(&mut self) {
        if self.state.phase() == CoordinationPhase::Disposing {
            return;
        }
        if self.outlet.is_some() {
            let leaving = NodeLeaving {
                reason: Some("leaving".to_string()),
            };
            if let Err(e) = self.broadcast(leaving) {
                warn!("Could not announce departure: {}", e);
            }
        }
        self.state.transition_to(CoordinationPhase::Disposing);
        for uid in self.state.node_uids() {
            self.state.remove_node(&uid);
        }
        self.teardown().await;
        info!("Node {} left the network", self.local.uid());
    }

    /// Handle one facade request. Replies are sent after the snapshot is
    /// republished, so a caller woken by a reply observes the new state.
    async fn handle_command(&mut self, command: ControlCommand) -> Result<(), IsolateError> {
        match command {
            ControlCommand::StartDiscovery { reply } => {
                let result = if self.state.phase() == CoordinationPhase::Disposing {
                    Err(SessionError::Disposed)
                } else {
                    self.publish_endpoint().await
                };
                if result.is_ok() {
                    self.state.transition_to(CoordinationPhase::Discovering);
                    self.refresh_peers().await;
                }
                self.publish_snapshot();
                let _ = reply.send(result);
            }
            ControlCommand::Discovery { electing, reply } => {
                self.refresh_peers().await;
                if electing && !self.state.phase().is_established() {
                    self.state.transition_to(CoordinationPhase::Electing);
                }
                self.publish_snapshot();
                let _ = reply.send(self.discovery_report());
            }
            ControlCommand::BecomeCoordinator { reply } => {
                info!("Node {} is now coordinator", self.local.uid());
                self.state.become_coordinator(self.local.uid());
                self.state.transition_to(CoordinationPhase::Accepting);
                crate::protocol::refresh_readiness(&mut self.state, &self.config);
                self.refresh_peers().await;
                self.broadcast(heartbeat(&self.state))?;
                self.publish_snapshot();
                let _ = reply.send(());
            }
            ControlCommand::BecomeParticipant { coordinator_uid, reply } => {
                info!("Node {} follows coordinator {}", self.local.uid(), coordinator_uid);
                self.state.become_participant(Some(coordinator_uid));
                self.refresh_peers().await;
                self.publish_snapshot();
                let _ = reply.send(());
            }
            ControlCommand::ConnectionTest { test_id, reply } => {
                self.pending_tests.register(test_id.clone(), reply);
                self.broadcast(ConnectionTest { test_id })?;
            }
            ControlCommand::Join { reply } => {
                self.join_waiter = Some(reply);
                let node = self.local.with_role(NodeRole::Participant);
                self.broadcast(JoinRequest { node })?;
            }
            ControlCommand::Send { body } => {
                self.broadcast(body)?;
            }
            ControlCommand::StreamsChanged { active, paused } => {
                self.on_streams_changed(active, paused);
            }
            ControlCommand::Reset { reply } => {
                self.teardown().await;
                self.state.reset();
                self.publish_snapshot();
                let _ = reply.send(());
            }
            ControlCommand::Leave { reply } => {
                // Handled by `run`, which ends the unit afterwards
                self.leave().await;
                self.publish_snapshot();
                let _ = reply.send(());
            }
        }
        Ok(())
    }

    async fn handle_frame(
        &mut self,
        frame: PeerFrame,
        outbox: &mpsc::Sender<ControlOutput>,
    ) -> Result<(), IsolateError> {
        match frame {
            PeerFrame::Frame { node_uid, bytes } => {
                let message = match decode_frame(&bytes) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Dropping malformed frame from {}: {}", node_uid, e);
                        return Ok(());
                    }
                };
                if message.from_node_uid() == self.local.uid() {
                    return Ok(());
                }
                self.dispatch(message, outbox).await
            }
            PeerFrame::Lost { node_uid, resource } => {
                let current = self
                    .peers
                    .get(&node_uid)
                    .map(|link| link.resource == resource)
                    .unwrap_or(false);
                if current {
                    self.drop_peer(&node_uid).await;
                }
                Ok(())
            }
        }
    }

    async fn dispatch(
        &mut self,
        message: CoordinationMessage,
        outbox: &mpsc::Sender<ControlOutput>,
    ) -> Result<(), IsolateError> {
        let from = message.from_node_uid().to_string();
        let phase = self.state.phase();

        if !phase.is_established() {
            if let MessageBody::Heartbeat(beat) = message.body() {
                if beat.is_coordinator && self.coordinator_hint.as_deref() != Some(from.as_str()) {
                    debug!("Discovered coordinator {}", from);
                    self.coordinator_hint = Some(from);
                }
            }
            return Ok(());
        }

        let handler = handler_for(&self.state);
        if !handler.can_handle(message.message_type()) {
            trace!("{} handler skips {}", handler.role(), message.message_type());
            return Ok(());
        }

        let mut ctx = HandlerContext::new(&mut self.state, &self.local, &self.config);
        let result = handler.handle(&mut ctx, &message);
        let (outgoing, effects) = ctx.into_outputs();

        for body in outgoing {
            self.broadcast(body)?;
        }

        match result {
            Ok(()) => {}
            Err(ProtocolError::JoinRejected(reason)) => match self.join_waiter.take() {
                Some(waiter) => {
                    self.publish_snapshot();
                    let _ = waiter.send(Err(SessionError::JoinRejected(reason)));
                }
                None => warn!("Rejected by {} without a pending join: {}", from, reason),
            },
            Err(e) => warn!("Failed to handle {} from {}: {}", message.message_type(), from, e),
        }

        for effect in effects {
            self.apply_effect(effect, outbox).await?;
        }
        Ok(())
    }

    async fn apply_effect(
        &mut self,
        effect: ProtocolEffect,
        outbox: &mpsc::Sender<ControlOutput>,
    ) -> Result<(), IsolateError> {
        match effect {
            ProtocolEffect::StreamCommand(body) => {
                if outbox.send(ControlOutput::StreamCommand(body)).await.is_err() {
                    debug!("Session gone, dropping stream command");
                }
            }
            ProtocolEffect::StreamReady { stream, node_uid } => {
                self.notifier.notify_stream_ready(&stream, &node_uid);
            }
            ProtocolEffect::UserMessage {
                from,
                message_id,
                payload,
            } => {
                self.notifier.send(SessionEventKind::UserMessage {
                    from,
                    message_id,
                    payload,
                });
            }
            ProtocolEffect::ConfigUpdate { from, config } => {
                self.notifier.send(SessionEventKind::ConfigUpdate { from, config });
            }
            ProtocolEffect::JoinAccepted { topology } => {
                self.refresh_peers().await;
                if let Some(waiter) = self.join_waiter.take() {
                    self.publish_snapshot();
                    let _ = waiter.send(Ok(topology));
                }
            }
            ProtocolEffect::Rejoin => {
                let node = self.local.with_role(NodeRole::Participant);
                self.broadcast(JoinRequest { node })?;
            }
            ProtocolEffect::ConnectionConfirmed { test_id } => {
                self.pending_tests.resolve(&test_id);
            }
            ProtocolEffect::CoordinatorLeft { uid } => {
                self.notifier.notify_coordinator_lost(&uid);
            }
        }
        Ok(())
    }

    fn on_heartbeat_tick(&mut self) -> Result<(), IsolateError> {
        let phase = self.state.phase();
        if phase != CoordinationPhase::Idle && phase != CoordinationPhase::Disposing {
            self.broadcast(heartbeat(&self.state))?;
        }
        self.pending_tests
            .prune(self.config.connection_test.timeout * 2);
        Ok(())
    }

    fn on_stale_tick(&mut self) -> Result<(), IsolateError> {
        let sweep = sweep_stale(
            &mut self.state,
            self.config.node_timeout,
            self.config.topology.is_full_mesh(),
        );
        if let Some(uid) = &sweep.coordinator_lost {
            self.notifier.notify_coordinator_lost(uid);
        }
        if sweep.changed() && self.state.is_coordinator() {
            let topology = self.state.topology(&self.local);
            self.broadcast(coord_wire::TopologyUpdate { topology })?;
        }
        Ok(())
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[async_trait]
impl UnitWorker for ControlLoop {
    type Inbound = ControlCommand;
    type Outbound = ControlOutput;

    async fn run(
        &mut self,
        inbox: &mut mpsc::Receiver<ControlCommand>,
        outbox: &mpsc::Sender<ControlOutput>,
    ) -> Result<(), IsolateError> {
        let mut heartbeat_tick = ticker(self.config.heartbeat_interval);
        let mut stale_tick = ticker(self.config.node_timeout);
        let mut discovery_tick = ticker(self.config.discovery_interval);

        loop {
            tokio::select! {
                command = inbox.recv() => match command {
                    Some(ControlCommand::Leave { reply }) => {
                        self.leave().await;
                        self.publish_snapshot();
                        let _ = reply.send(());
                        return Ok(());
                    }
                    Some(command) => self.handle_command(command).await?,
                    None => {
                        self.leave().await;
                        self.publish_snapshot();
                        return Ok(());
                    }
                },
                Some(frame) = self.frames_rx.recv() => {
                    self.handle_frame(frame, outbox).await?;
                }
                _ = heartbeat_tick.tick() => {
                    self.on_heartbeat_tick()?;
                }
                _ = stale_tick.tick() => {
                    self.on_stale_tick()?;
                }
                _ = discovery_tick.tick() => {
                    self.refresh_peers().await;
                }
            }
            self.publish_snapshot();
        }
    }
}
