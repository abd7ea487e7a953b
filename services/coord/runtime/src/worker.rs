//! Data-plane stream units.
//!
//! Every stream runs as its own [`StreamWorker`] unit in the data layer. The
//! worker owns the stream's lifecycle and endpoints; callers drive it through
//! a cloneable [`StreamHandle`] that sends commands and awaits replies.

use crate::error::StreamError;
use crate::recovery::RecoveryPolicy;
use crate::registry::{Layer, LayerRegistry};
use crate::stream::{StreamLifecycle, StreamState};
use crate::unit::{spawn_supervised, UnitHandle, UnitWorker};
use crate::IsolateError;
use async_trait::async_trait;
use bytes::Bytes;
use coord_resource::{DiscoveryFilter, ResourceError, ResourceId, ResourceManager, ResourceState, StreamDescriptor};
use coord_wire::{ParticipationMode, StreamConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

/// Stream type of data outlets
pub const DATA_STREAM_TYPE: &str = "data";

/// How often consumers look for new producers
const REFRESH_INTERVAL: Duration = Duration::from_millis(250);

/// Inbox/outbox capacity of a stream unit
const STREAM_UNIT_CAPACITY: usize = 64;

/// Buffered samples per sample subscriber
const SAMPLE_CHANNEL_CAPACITY: usize = 1024;

/// Grace period for a destroyed stream unit to exit
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Operation on a stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOp {
    /// Open endpoints and start moving samples
    Start,
    /// Stop moving samples, keep endpoints
    Pause,
    /// Move samples again
    Resume {
        /// Discard samples buffered while paused
        flush_before_resume: bool,
    },
    /// Discard buffered samples
    Flush,
    /// Release endpoints
    Stop,
    /// Release everything and end the unit
    Destroy,
    /// Publish one sample
    Push(Bytes),
}

impl StreamOp {
    fn name(&self) -> &'static str {
        match self {
            StreamOp::Start => "start",
            StreamOp::Pause => "pause",
            StreamOp::Resume { .. } => "resume",
            StreamOp::Flush => "flush",
            StreamOp::Stop => "stop",
            StreamOp::Destroy => "destroy",
            StreamOp::Push(_) => "push",
        }
    }
}

/// Command delivered to a stream unit
#[derive(Debug)]
pub struct StreamCommand {
    /// Operation
    pub op: StreamOp,
    /// Where to send the outcome
    pub reply: Option<oneshot::Sender<Result<StreamState, StreamError>>>,
}

/// Notifications from a stream unit to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum StreamReport {
    /// Lifecycle state changed
    StateChanged {
        /// Stream name
        stream: String,
        /// New state
        state: StreamState,
    },
    /// Buffered samples were discarded
    Flushed {
        /// Stream name
        stream: String,
        /// Samples dropped
        dropped: usize,
    },
    /// A producer went away
    InletLost {
        /// Stream name
        stream: String,
        /// Node that published the lost stream
        source_id: String,
    },
}

/// Unit body of one stream
pub struct StreamWorker {
    config: StreamConfig,
    local_uid: String,
    resources: Arc<ResourceManager>,
    lifecycle: StreamLifecycle,
    outlet: Option<ResourceId>,
    resolver: Option<ResourceId>,
    /// Subscribed inlets with the publisher node of each
    inlets: Vec<(ResourceId, StreamDescriptor)>,
    state_tx: watch::Sender<StreamState>,
    samples_tx: broadcast::Sender<Bytes>,
}

impl StreamWorker {
    fn resource_id(&self, suffix: &str) -> ResourceId {
        ResourceId::from(format!("stream/{}/{}", self.config.id, suffix))
    }

    async fn open_endpoints(&mut self) -> Result<(), StreamError> {
        if self.config.produces() && self.outlet.is_none() {
            let descriptor = StreamDescriptor::new(&self.config.id, DATA_STREAM_TYPE, &self.local_uid)
                .with_format(self.config.channel_count, self.config.sample_rate, self.config.encoding);
            let id = self
                .resources
                .create_publisher(self.resource_id("out"), descriptor)
                .await?;
            self.outlet = Some(id);
        }

        if self.config.consumes() && self.resolver.is_none() {
            let filter = DiscoveryFilter::any()
                .name(&self.config.id)
                .stream_type(DATA_STREAM_TYPE)
                .excluding_source(&self.local_uid);
            let id = self
                .resources
                .create_continuous_resolver(self.resource_id("resolver"), filter)?;
            self.resolver = Some(id);
        }

        self.refresh_inlets().await;
        Ok(())
    }

    /// Subscribe to producers the resolver has found since the last refresh
    async fn refresh_inlets(&mut self) {
        let Some(resolver) = self.resolver.clone() else {
            return;
        };

        let found = match self.resources.resolve(&resolver) {
            Ok(found) => found,
            Err(e) => {
                warn!("Stream {} could not resolve producers: {}", self.config.id, e);
                return;
            }
        };

        for descriptor in found {
            if self.config.participation == ParticipationMode::PointToPoint && !self.inlets.is_empty() {
                break;
            }
            if self.inlets.iter().any(|(_, known)| known.uid == descriptor.uid) {
                continue;
            }

            let id = self.resource_id(&format!("in/{}", descriptor.uid));
            match self.resources.subscribe(id, &descriptor).await {
                Ok(id) => {
                    if self.lifecycle.state() == StreamState::Active {
                        self.mark(&id, ResourceState::Active);
                    }
                    info!("Stream {} subscribed to {}", self.config.id, descriptor.source_id);
                    self.inlets.push((id, descriptor));
                }
                Err(e) => warn!("Stream {} failed to subscribe to {}: {}", self.config.id, descriptor, e),
            }
        }
    }

    async fn close_endpoints(&mut self) {
        for (id, _) in std::mem::take(&mut self.inlets) {
            self.resources.destroy(&id).await;
        }
        if let Some(id) = self.resolver.take() {
            self.resources.destroy(&id).await;
        }
        if let Some(id) = self.outlet.take() {
            self.resources.destroy(&id).await;
        }
    }

    fn mark(&self, id: &ResourceId, state: ResourceState) {
        if let Err(e) = self.resources.set_state(id, state) {
            debug!("Stream {} endpoint state not updated: {}", self.config.id, e);
        }
    }

    fn mark_endpoints(&self, state: ResourceState) {
        let data_endpoints = self.outlet.iter().chain(self.inlets.iter().map(|(id, _)| id));
        for id in data_endpoints {
            self.mark(id, state);
        }
    }

    async fn flush_inlets(&self) -> usize {
        let mut dropped = 0;
        for (id, _) in &self.inlets {
            match self.resources.flush(id).await {
                Ok(count) => dropped += count,
                Err(e) => debug!("Stream {} flush of {} failed: {}", self.config.id, id, e),
            }
        }
        dropped
    }

    async fn apply(
        &mut self,
        op: StreamOp,
        outbox: &mpsc::Sender<StreamReport>,
    ) -> Result<StreamState, StreamError> {
        match op {
            StreamOp::Start => {
                if self.lifecycle.begin_start()? {
                    if let Err(e) = self.open_endpoints().await {
                        warn!("Stream {} failed to start: {}", self.config.id, e);
                        self.close_endpoints().await;
                        self.lifecycle.abort_start();
                        return Err(e);
                    }
                    self.lifecycle.activate()?;
                    self.mark_endpoints(ResourceState::Active);
                }
            }
            StreamOp::Pause => {
                self.lifecycle.pause()?;
                self.mark_endpoints(ResourceState::Paused);
            }
            StreamOp::Resume { flush_before_resume } => {
                if flush_before_resume && self.lifecycle.state() == StreamState::Paused {
                    let dropped = self.flush_inlets().await;
                    report(outbox, StreamReport::Flushed {
                        stream: self.config.id.clone(),
                        dropped,
                    })
                    .await;
                }
                self.lifecycle.resume()?;
                self.mark_endpoints(ResourceState::Active);
            }
            StreamOp::Flush => {
                self.lifecycle.check_flush()?;
                let dropped = self.flush_inlets().await;
                report(outbox, StreamReport::Flushed {
                    stream: self.config.id.clone(),
                    dropped,
                })
                .await;
            }
            StreamOp::Stop => {
                self.lifecycle.stop()?;
                self.close_endpoints().await;
            }
            StreamOp::Destroy => {
                self.lifecycle.destroy()?;
                self.close_endpoints().await;
            }
            StreamOp::Push(sample) => {
                self.lifecycle.check_push()?;
                let outlet = self
                    .outlet
                    .as_ref()
                    .ok_or_else(|| StreamError::NotProducer(self.config.id.clone()))?;
                self.resources.push(outlet, sample)?;
            }
        }
        Ok(self.lifecycle.state())
    }

    async fn handle_command(&mut self, command: StreamCommand, outbox: &mpsc::Sender<StreamReport>) {
        let before = self.lifecycle.state();
        let operation = command.op.name();
        let result = self.apply(command.op, outbox).await;

        let after = self.lifecycle.state();
        if after != before {
            self.state_tx.send_replace(after);
            report(outbox, StreamReport::StateChanged {
                stream: self.config.id.clone(),
                state: after,
            })
            .await;
        }

        if let Err(e) = &result {
            debug!("Stream {} {} rejected: {}", self.config.id, operation, e);
        }
        if let Some(reply) = command.reply {
            // Caller may have given up waiting
            let _ = reply.send(result);
        }
    }

    async fn drop_inlet(&mut self, id: &ResourceId, error: ResourceError, outbox: &mpsc::Sender<StreamReport>) {
        let Some(position) = self.inlets.iter().position(|(known, _)| known == id) else {
            return;
        };
        let (id, descriptor) = self.inlets.remove(position);
        info!(
            "Stream {} lost producer {}: {}",
            self.config.id, descriptor.source_id, error
        );
        self.resources.destroy(&id).await;
        report(outbox, StreamReport::InletLost {
            stream: self.config.id.clone(),
            source_id: descriptor.source_id,
        })
        .await;
    }
}

async fn report(outbox: &mpsc::Sender<StreamReport>, report: StreamReport) {
    if outbox.send(report).await.is_err() {
        debug!("Stream report dropped, owner is gone");
    }
}

/// Wait for a sample on any of `inlets`; never resolves when there are none
async fn next_sample(
    resources: Arc<ResourceManager>,
    inlets: Vec<ResourceId>,
) -> (ResourceId, Result<Bytes, ResourceError>) {
    if inlets.is_empty() {
        return std::future::pending().await;
    }

    let pulls = inlets.into_iter().map(|id| {
        let resources = resources.clone();
        Box::pin(async move {
            let result = resources.pull(&id).await;
            (id, result)
        })
    });
    let (first, _, _) = futures::future::select_all(pulls).await;
    first
}

#[async_trait]
impl UnitWorker for StreamWorker {
    type Inbound = StreamCommand;
    type Outbound = StreamReport;

    async fn run(
        &mut self,
        inbox: &mut mpsc::Receiver<StreamCommand>,
        outbox: &mpsc::Sender<StreamReport>,
    ) -> Result<(), IsolateError> {
        let mut refresh = interval(REFRESH_INTERVAL);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let state = self.lifecycle.state();
            if state == StreamState::Disposed {
                return Ok(());
            }

            let pulling = state == StreamState::Active && !self.inlets.is_empty();
            let refreshing = matches!(state, StreamState::Active | StreamState::Paused)
                && self.resolver.is_some();
            let inlet_ids: Vec<ResourceId> = if pulling {
                self.inlets.iter().map(|(id, _)| id.clone()).collect()
            } else {
                Vec::new()
            };

            tokio::select! {
                command = inbox.recv() => match command {
                    Some(command) => self.handle_command(command, outbox).await,
                    None => {
                        debug!("Stream {} inbox closed", self.config.id);
                        self.close_endpoints().await;
                        return Ok(());
                    }
                },
                (id, result) = next_sample(self.resources.clone(), inlet_ids), if pulling => match result {
                    Ok(sample) => {
                        // Nobody listening is fine
                        let _ = self.samples_tx.send(sample);
                    }
                    Err(e) => self.drop_inlet(&id, e, outbox).await,
                },
                _ = refresh.tick(), if refreshing => self.refresh_inlets().await,
            }
        }
    }
}

/// Caller side of a stream unit
#[derive(Debug, Clone)]
pub struct StreamHandle {
    name: String,
    config: StreamConfig,
    commands: mpsc::Sender<StreamCommand>,
    state: watch::Receiver<StreamState>,
    samples: broadcast::Sender<Bytes>,
}

impl StreamHandle {
    /// Stream name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stream configuration
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Last reported state
    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Whether the stream has been destroyed
    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Disposed || self.commands.is_closed()
    }

    async fn request(&self, op: StreamOp) -> Result<StreamState, StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed(self.name.clone()));
        }

        let (reply, response) = oneshot::channel();
        self.commands
            .send(StreamCommand {
                op,
                reply: Some(reply),
            })
            .await
            .map_err(|_| StreamError::Closed(self.name.clone()))?;

        response
            .await
            .map_err(|_| StreamError::Closed(self.name.clone()))?
    }

    /// Open endpoints and start moving samples
    pub async fn start(&self) -> Result<StreamState, StreamError> {
        self.request(StreamOp::Start).await
    }

    /// Stop moving samples without releasing endpoints
    pub async fn pause(&self) -> Result<StreamState, StreamError> {
        self.request(StreamOp::Pause).await
    }

    /// Move samples again, optionally discarding what buffered while paused
    pub async fn resume(&self, flush_before_resume: bool) -> Result<StreamState, StreamError> {
        self.request(StreamOp::Resume { flush_before_resume }).await
    }

    /// Discard buffered samples
    pub async fn flush(&self) -> Result<StreamState, StreamError> {
        self.request(StreamOp::Flush).await
    }

    /// Release endpoints; the stream can be started again
    pub async fn stop(&self) -> Result<StreamState, StreamError> {
        self.request(StreamOp::Stop).await
    }

    /// Release everything. Every later operation fails with [`StreamError::Closed`].
    pub async fn destroy(&self) -> Result<StreamState, StreamError> {
        self.request(StreamOp::Destroy).await
    }

    /// Publish one sample
    pub async fn push(&self, sample: impl Into<Bytes>) -> Result<(), StreamError> {
        self.request(StreamOp::Push(sample.into())).await.map(|_| ())
    }

    /// Receive samples pulled from producers
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.samples.subscribe()
    }

    /// Samples pulled from producers as a `Stream`
    pub fn samples(&self) -> BroadcastStream<Bytes> {
        BroadcastStream::new(self.samples.subscribe())
    }

    /// Wait until the stream reaches `state`
    pub async fn wait_for_state(&self, state: StreamState, timeout: Duration) -> Result<(), StreamError> {
        let mut watch = self.state.clone();
        let reached = tokio::time::timeout(timeout, watch.wait_for(|current| *current == state))
            .await
            .map(|waited| waited.map(drop));
        match reached {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(StreamError::Closed(self.name.clone())),
            Err(_) => Err(StreamError::InvalidState {
                stream: self.name.clone(),
                operation: "wait for",
                state: self.state(),
            }),
        }
    }
}

struct StreamEntry {
    handle: StreamHandle,
    unit: UnitHandle<StreamCommand>,
}

/// Streams of one node, each running as a data-layer unit
pub struct StreamRegistry {
    local_uid: String,
    layers: LayerRegistry,
    resources: Arc<ResourceManager>,
    policy: RecoveryPolicy,
    streams: RwLock<HashMap<String, StreamEntry>>,
    reports: mpsc::Sender<StreamReport>,
}

impl StreamRegistry {
    /// Create a registry. Reports of every stream are merged into the returned receiver.
    pub fn new(
        local_uid: impl Into<String>,
        layers: LayerRegistry,
        resources: Arc<ResourceManager>,
        policy: RecoveryPolicy,
    ) -> (Self, mpsc::Receiver<StreamReport>) {
        let (reports, reports_rx) = mpsc::channel(STREAM_UNIT_CAPACITY);
        (
            Self {
                local_uid: local_uid.into(),
                layers,
                resources,
                policy,
                streams: RwLock::new(HashMap::new()),
                reports,
            },
            reports_rx,
        )
    }

    /// Create a stream in `Created` and spawn its unit
    pub async fn create(&self, config: StreamConfig) -> Result<StreamHandle, StreamError> {
        let name = config.id.clone();
        let mut streams = self.streams.write().await;

        if let Some(existing) = streams.remove(&name) {
            if !existing.handle.is_closed() {
                streams.insert(name.clone(), existing);
                return Err(StreamError::Duplicate(name));
            }
            // Destroyed through its handle; wait for the old unit to release its id
            existing.unit.shutdown(SHUTDOWN_GRACE).await;
        }

        let (state_tx, state_rx) = watch::channel(StreamState::Created);
        let (samples_tx, _) = broadcast::channel(SAMPLE_CHANNEL_CAPACITY);
        let worker = StreamWorker {
            lifecycle: StreamLifecycle::new(&name),
            config: config.clone(),
            local_uid: self.local_uid.clone(),
            resources: self.resources.clone(),
            outlet: None,
            resolver: None,
            inlets: Vec::new(),
            state_tx,
            samples_tx: samples_tx.clone(),
        };

        let (unit, mut outbox) = spawn_supervised(
            &self.layers,
            Layer::Data,
            format!("stream:{}", name),
            worker,
            self.policy.clone(),
            STREAM_UNIT_CAPACITY,
        )?;

        let reports = self.reports.clone();
        tokio::spawn(async move {
            while let Some(report) = outbox.recv().await {
                if reports.send(report).await.is_err() {
                    break;
                }
            }
        });

        let handle = StreamHandle {
            name: name.clone(),
            config,
            commands: unit.sender(),
            state: state_rx,
            samples: samples_tx,
        };
        info!("Created stream {}", name);
        streams.insert(name, StreamEntry {
            handle: handle.clone(),
            unit,
        });
        Ok(handle)
    }

    /// Handle of a live stream
    pub async fn get(&self, name: &str) -> Option<StreamHandle> {
        self.streams
            .read()
            .await
            .get(name)
            .map(|entry| entry.handle.clone())
            .filter(|handle| !handle.is_closed())
    }

    /// Names of live streams
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .streams
            .read()
            .await
            .iter()
            .filter(|(_, entry)| !entry.handle.is_closed())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// States of live streams
    pub async fn states(&self) -> Vec<(String, StreamState)> {
        let mut states: Vec<(String, StreamState)> = self
            .streams
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.handle.state()))
            .filter(|(_, state)| *state != StreamState::Disposed)
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Apply an operation to the named stream
    pub async fn apply(&self, name: &str, op: StreamOp) -> Result<StreamState, StreamError> {
        let handle = self
            .get(name)
            .await
            .ok_or_else(|| StreamError::NotFound(name.to_string()))?;
        handle.request(op).await
    }

    /// Destroy a stream and wait for its unit to exit
    pub async fn destroy(&self, name: &str) -> Result<(), StreamError> {
        let entry = self
            .streams
            .write()
            .await
            .remove(name)
            .ok_or_else(|| StreamError::NotFound(name.to_string()))?;

        match entry.handle.destroy().await {
            Ok(_) | Err(StreamError::Closed(_)) => {}
            Err(e) => warn!("Stream {} did not destroy cleanly: {}", name, e),
        }
        entry.unit.shutdown(SHUTDOWN_GRACE).await;
        info!("Destroyed stream {}", name);
        Ok(())
    }

    /// Destroy every stream
    pub async fn destroy_all(&self) {
        let names: Vec<String> = self.streams.read().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.destroy(&name).await {
                debug!("Stream {} already gone: {}", name, e);
            }
        }
    }
}
