//! Lifetime management for transport endpoints.
//!
//! Every outlet, inlet and resolver the engine uses is created through the
//! [`ResourceManager`] under a caller-chosen id and destroyed through it again.
//! Creation failures are reported on the event channel and returned to the
//! caller; teardown failures are reported and swallowed so shutdown never
//! blocks on a misbehaving endpoint.

use crate::transport::{DiscoveryFilter, Inlet, Outlet, Resolver, StreamDescriptor, Transport};
use crate::{ResourceError, TransportError};
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the resource event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Opaque handle to a managed resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceId(String);

impl ResourceId {
    /// Id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Kind of endpoint behind a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    /// Outlet
    Publisher,
    /// Inlet
    Subscriber,
    /// Continuous resolver
    Resolver,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Publisher => write!(f, "publisher"),
            ResourceKind::Subscriber => write!(f, "subscriber"),
            ResourceKind::Resolver => write!(f, "resolver"),
        }
    }
}

/// Lifecycle of a managed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceState {
    /// Registered, nothing opened yet
    Created,
    /// Underlying handle being opened
    Initializing,
    /// Open, not carrying data
    Idle,
    /// Carrying data
    Active,
    /// Open but intentionally not carrying data
    Paused,
    /// Being torn down
    Stopping,
    /// Gone
    Disposed,
    /// Failed
    Error,
}

impl ResourceState {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResourceState::Disposed)
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: ResourceState) -> bool {
        use ResourceState::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Error, Stopping) => true,
            (Error, _) => false,
            (_, Error) | (_, Stopping) => true,
            (Created, Initializing)
            | (Initializing, Idle)
            | (Idle, Active)
            | (Active, Paused)
            | (Paused, Active)
            | (Active, Idle)
            | (Paused, Idle)
            | (Stopping, Disposed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceState::Created => "created",
            ResourceState::Initializing => "initializing",
            ResourceState::Idle => "idle",
            ResourceState::Active => "active",
            ResourceState::Paused => "paused",
            ResourceState::Stopping => "stopping",
            ResourceState::Disposed => "disposed",
            ResourceState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Resource churn notifications
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    /// Resource finished creation
    Created {
        /// Resource id
        id: ResourceId,
        /// Resource kind
        kind: ResourceKind,
    },
    /// Resource was destroyed
    Destroyed {
        /// Resource id
        id: ResourceId,
        /// Resource kind
        kind: ResourceKind,
    },
    /// Resource failed during creation, use or teardown
    Error {
        /// Resource id
        id: ResourceId,
        /// Resource kind
        kind: ResourceKind,
        /// Failure description
        message: String,
    },
}

/// Read-only information about a managed resource
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResource {
    /// Resource id
    pub id: ResourceId,
    /// Resource kind
    pub kind: ResourceKind,
    /// Lifecycle state
    pub state: ResourceState,
    /// Stream the endpoint is bound to (publishers and subscribers)
    pub descriptor: Option<StreamDescriptor>,
    /// Most recent failure
    pub last_error: Option<String>,
}

/// Aggregated resource counts, computed on demand
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// Live publishers
    pub publishers: usize,
    /// Live subscribers
    pub subscribers: usize,
    /// Live resolvers
    pub resolvers: usize,
    /// Resources in the error state
    pub errored: usize,
}

#[derive(Debug, Clone)]
enum Handle {
    Publisher(Arc<dyn Outlet>),
    Subscriber(Arc<dyn Inlet>),
    Resolver(Arc<dyn Resolver>),
}

impl Handle {
    async fn close(&self) -> Result<(), TransportError> {
        match self {
            Handle::Publisher(outlet) => outlet.close().await,
            Handle::Subscriber(inlet) => inlet.close().await,
            Handle::Resolver(resolver) => resolver.close().await,
        }
    }
}

#[derive(Debug)]
struct Entry {
    info: ManagedResource,
    handle: Option<Handle>,
}

/// Owner of every endpoint obtained from a [`Transport`]
#[derive(Debug)]
pub struct ResourceManager {
    transport: Arc<dyn Transport>,
    resources: DashMap<ResourceId, Entry>,
    events: broadcast::Sender<ResourceEvent>,
}

impl ResourceManager {
    /// Create a manager on top of `transport`
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            resources: DashMap::new(),
            events,
        }
    }

    /// Subscribe to resource events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    /// Underlying transport
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    fn emit(&self, event: ResourceEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Register `id` in the initializing state. An errored entry may be replaced.
    fn reserve(&self, id: ResourceId, kind: ResourceKind) -> Result<ResourceId, ResourceError> {
        match self.resources.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if slot.get().info.state != ResourceState::Error {
                    return Err(ResourceError::Duplicate(id.to_string()));
                }
                debug!("Replacing errored resource {}", id);
                slot.insert(Entry::new(id.clone(), kind));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Entry::new(id.clone(), kind));
            }
        }
        self.set_state_unchecked(&id, ResourceState::Initializing);
        Ok(id)
    }

    fn complete(&self, id: &ResourceId, handle: Handle, descriptor: Option<StreamDescriptor>) {
        let kind = match self.resources.get_mut(id) {
            Some(mut entry) => {
                entry.info.state = ResourceState::Idle;
                entry.info.descriptor = descriptor;
                entry.handle = Some(handle);
                entry.info.kind
            }
            None => return,
        };
        info!("Created {} {}", kind, id);
        self.emit(ResourceEvent::Created {
            id: id.clone(),
            kind,
        });
    }

    fn fail_creation(&self, id: &ResourceId, kind: ResourceKind, source: TransportError) -> ResourceError {
        warn!("Failed to create {} {}: {}", kind, id, source);
        self.mark_error(id, kind, source.to_string());
        ResourceError::Creation {
            id: id.to_string(),
            source,
        }
    }

    fn mark_error(&self, id: &ResourceId, kind: ResourceKind, message: String) {
        if let Some(mut entry) = self.resources.get_mut(id) {
            entry.info.state = ResourceState::Error;
            entry.info.last_error = Some(message.clone());
        }
        self.emit(ResourceEvent::Error {
            id: id.clone(),
            kind,
            message,
        });
    }

    fn set_state_unchecked(&self, id: &ResourceId, state: ResourceState) {
        if let Some(mut entry) = self.resources.get_mut(id) {
            entry.info.state = state;
        }
    }

    fn handle(&self, id: &ResourceId) -> Result<Handle, ResourceError> {
        let entry = self
            .resources
            .get(id)
            .ok_or_else(|| ResourceError::NotFound(id.to_string()))?;
        entry
            .handle
            .clone()
            .ok_or_else(|| ResourceError::NotFound(id.to_string()))
    }

    fn outlet(&self, id: &ResourceId) -> Result<Arc<dyn Outlet>, ResourceError> {
        match self.handle(id)? {
            Handle::Publisher(outlet) => Ok(outlet),
            other => Err(wrong_kind(id, ResourceKind::Publisher, &other)),
        }
    }

    fn inlet(&self, id: &ResourceId) -> Result<Arc<dyn Inlet>, ResourceError> {
        match self.handle(id)? {
            Handle::Subscriber(inlet) => Ok(inlet),
            other => Err(wrong_kind(id, ResourceKind::Subscriber, &other)),
        }
    }

    fn resolver(&self, id: &ResourceId) -> Result<Arc<dyn Resolver>, ResourceError> {
        match self.handle(id)? {
            Handle::Resolver(resolver) => Ok(resolver),
            other => Err(wrong_kind(id, ResourceKind::Resolver, &other)),
        }
    }

    fn transport_failure(&self, id: &ResourceId, kind: ResourceKind, source: TransportError) -> ResourceError {
        warn!("Transport failure on {} {}: {}", kind, id, source);
        self.mark_error(id, kind, source.to_string());
        ResourceError::Transport {
            id: id.to_string(),
            source,
        }
    }

    /// Publish a stream under `id`
    pub async fn create_publisher(
        &self,
        id: impl Into<ResourceId>,
        descriptor: StreamDescriptor,
    ) -> Result<ResourceId, ResourceError> {
        let id = self.reserve(id.into(), ResourceKind::Publisher)?;

        match self.transport.publish(descriptor).await {
            Ok(outlet) => {
                let descriptor = outlet.descriptor().clone();
                self.complete(&id, Handle::Publisher(Arc::from(outlet)), Some(descriptor));
                Ok(id)
            }
            Err(e) => Err(self.fail_creation(&id, ResourceKind::Publisher, e)),
        }
    }

    /// Attach an inlet to a known stream under `id`
    pub async fn subscribe(
        &self,
        id: impl Into<ResourceId>,
        descriptor: &StreamDescriptor,
    ) -> Result<ResourceId, ResourceError> {
        let id = self.reserve(id.into(), ResourceKind::Subscriber)?;

        match self.transport.open(descriptor).await {
            Ok(inlet) => {
                self.complete(&id, Handle::Subscriber(Arc::from(inlet)), Some(descriptor.clone()));
                Ok(id)
            }
            Err(e) => Err(self.fail_creation(&id, ResourceKind::Subscriber, e)),
        }
    }

    /// Create a resolver under `id` that stays live until destroyed
    pub fn create_continuous_resolver(
        &self,
        id: impl Into<ResourceId>,
        filter: DiscoveryFilter,
    ) -> Result<ResourceId, ResourceError> {
        let id = self.reserve(id.into(), ResourceKind::Resolver)?;

        match self.transport.create_continuous_resolver(filter) {
            Ok(resolver) => {
                self.complete(&id, Handle::Resolver(Arc::from(resolver)), None);
                Ok(id)
            }
            Err(e) => Err(self.fail_creation(&id, ResourceKind::Resolver, e)),
        }
    }

    /// Find a stream matching `filter` and subscribe to it under `id`.
    ///
    /// A resolver registered as `<id>.resolver` is probed first; only when it
    /// has no match does this wait up to `wait` for one. The resolver is kept
    /// alive afterwards so later subscribers can reuse the same discovery.
    pub async fn discover_and_subscribe(
        &self,
        id: impl Into<ResourceId>,
        filter: DiscoveryFilter,
        wait: Duration,
    ) -> Result<(ResourceId, StreamDescriptor), ResourceError> {
        let id = id.into();
        let resolver_id = ResourceId(format!("{}.resolver", id));
        if !self.contains(&resolver_id) {
            self.create_continuous_resolver(resolver_id.clone(), filter.clone())?;
        }

        let mut matches = self.resolve(&resolver_id)?;
        if matches.is_empty() {
            debug!("No immediate match for {}, waiting up to {:?}", filter, wait);
            matches = self
                .transport
                .discover(&filter, wait)
                .await
                .map_err(|e| self.transport_failure(&resolver_id, ResourceKind::Resolver, e))?;
        }

        let Some(descriptor) = matches.into_iter().next() else {
            let error = ResourceError::NoMatch(filter.to_string());
            self.emit(ResourceEvent::Error {
                id: id.clone(),
                kind: ResourceKind::Subscriber,
                message: error.to_string(),
            });
            return Err(error);
        };

        let id = self.subscribe(id, &descriptor).await?;
        Ok((id, descriptor))
    }

    /// Current matches of a resolver
    pub fn resolve(&self, id: &ResourceId) -> Result<Vec<StreamDescriptor>, ResourceError> {
        let resolver = self.resolver(id)?;
        resolver
            .results()
            .map_err(|e| self.transport_failure(id, ResourceKind::Resolver, e))
    }

    /// Push a sample through a publisher
    pub fn push(&self, id: &ResourceId, sample: Bytes) -> Result<(), ResourceError> {
        let outlet = self.outlet(id)?;
        outlet
            .push(sample)
            .map_err(|e| self.transport_failure(id, ResourceKind::Publisher, e))
    }

    /// Number of inlets attached to a publisher
    pub fn consumer_count(&self, id: &ResourceId) -> Result<usize, ResourceError> {
        Ok(self.outlet(id)?.consumer_count())
    }

    /// Wait for the next sample on a subscriber
    pub async fn pull(&self, id: &ResourceId) -> Result<Bytes, ResourceError> {
        let inlet = self.inlet(id)?;
        inlet
            .pull()
            .await
            .map_err(|e| self.transport_failure(id, ResourceKind::Subscriber, e))
    }

    /// Next buffered sample on a subscriber, if any
    pub async fn try_pull(&self, id: &ResourceId) -> Result<Option<Bytes>, ResourceError> {
        let inlet = self.inlet(id)?;
        inlet
            .try_pull()
            .await
            .map_err(|e| self.transport_failure(id, ResourceKind::Subscriber, e))
    }

    /// Discard buffered samples on a subscriber
    pub async fn flush(&self, id: &ResourceId) -> Result<usize, ResourceError> {
        let inlet = self.inlet(id)?;
        Ok(inlet.flush().await)
    }

    /// Move a resource along its lifecycle
    pub fn set_state(&self, id: &ResourceId, state: ResourceState) -> Result<(), ResourceError> {
        let mut entry = self
            .resources
            .get_mut(id)
            .ok_or_else(|| ResourceError::NotFound(id.to_string()))?;

        let from = entry.info.state;
        if from == state {
            return Ok(());
        }
        if !from.can_transition_to(state) {
            return Err(ResourceError::InvalidTransition {
                id: id.to_string(),
                from,
                to: state,
            });
        }
        entry.info.state = state;
        debug!("Resource {} {} -> {}", id, from, state);
        Ok(())
    }

    /// Current state of a resource
    pub fn state(&self, id: &ResourceId) -> Option<ResourceState> {
        self.resources.get(id).map(|entry| entry.info.state)
    }

    /// Information about a resource
    pub fn info(&self, id: &ResourceId) -> Option<ManagedResource> {
        self.resources.get(id).map(|entry| entry.info.clone())
    }

    /// Whether `id` is registered
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.resources.contains_key(id)
    }

    /// Ids of every registered resource
    pub fn ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self.resources.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Destroy a resource. Teardown failures are reported and swallowed.
    ///
    /// Returns whether the resource existed.
    pub async fn destroy(&self, id: &ResourceId) -> bool {
        let Some((_, mut entry)) = self.resources.remove(id) else {
            return false;
        };

        let kind = entry.info.kind;
        entry.info.state = ResourceState::Stopping;
        if let Some(handle) = entry.handle.take() {
            if let Err(e) = handle.close().await {
                warn!("Error while destroying {} {}: {}", kind, id, e);
                self.emit(ResourceEvent::Error {
                    id: id.clone(),
                    kind,
                    message: e.to_string(),
                });
            }
        }
        entry.info.state = ResourceState::Disposed;

        info!("Destroyed {} {}", kind, id);
        self.emit(ResourceEvent::Destroyed {
            id: id.clone(),
            kind,
        });
        true
    }

    /// Destroy every resource, returning how many were destroyed
    pub async fn destroy_all(&self) -> usize {
        let mut destroyed = 0;
        for id in self.ids() {
            if self.destroy(&id).await {
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Count resources by kind and error state
    pub fn stats(&self) -> ResourceUsage {
        let mut usage = ResourceUsage::default();
        for entry in self.resources.iter() {
            if entry.info.state == ResourceState::Error {
                usage.errored += 1;
                continue;
            }
            match entry.info.kind {
                ResourceKind::Publisher => usage.publishers += 1,
                ResourceKind::Subscriber => usage.subscribers += 1,
                ResourceKind::Resolver => usage.resolvers += 1,
            }
        }
        usage
    }
}

impl Entry {
    fn new(id: ResourceId, kind: ResourceKind) -> Self {
        Self {
            info: ManagedResource {
                id,
                kind,
                state: ResourceState::Created,
                descriptor: None,
                last_error: None,
            },
            handle: None,
        }
    }
}

fn wrong_kind(id: &ResourceId, expected: ResourceKind, actual: &Handle) -> ResourceError {
    let actual = match actual {
        Handle::Publisher(_) => ResourceKind::Publisher,
        Handle::Subscriber(_) => ResourceKind::Subscriber,
        Handle::Resolver(_) => ResourceKind::Resolver,
    };
    ResourceError::WrongKind {
        id: id.to_string(),
        expected,
        actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryTransport;
    use async_trait::async_trait;

    fn manager() -> (ResourceManager, MemoryTransport) {
        let transport = MemoryTransport::default();
        (ResourceManager::new(Arc::new(transport.clone())), transport)
    }

    fn data_stream(name: &str) -> StreamDescriptor {
        StreamDescriptor::new(name, "data", "uid-a")
    }

    #[tokio::test]
    async fn test_publish_subscribe_roundtrip() {
        let (manager, _) = manager();
        let mut events = manager.subscribe_events();

        let publisher = manager.create_publisher("eeg.out", data_stream("eeg")).await.unwrap();
        let descriptor = manager.info(&publisher).unwrap().descriptor.unwrap();
        let subscriber = manager.subscribe("eeg.in", &descriptor).await.unwrap();

        assert_eq!(manager.state(&publisher), Some(ResourceState::Idle));
        assert_eq!(manager.consumer_count(&publisher).unwrap(), 1);

        manager.push(&publisher, Bytes::from_static(b"x")).unwrap();
        assert_eq!(manager.pull(&subscriber).await.unwrap(), Bytes::from_static(b"x"));

        assert_eq!(
            events.recv().await.unwrap(),
            ResourceEvent::Created {
                id: publisher.clone(),
                kind: ResourceKind::Publisher
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ResourceEvent::Created {
                id: subscriber,
                kind: ResourceKind::Subscriber
            }
        );
    }

    #[tokio::test]
    async fn test_duplicate_and_wrong_kind() {
        let (manager, _) = manager();
        let publisher = manager.create_publisher("eeg.out", data_stream("eeg")).await.unwrap();

        assert_eq!(
            manager.create_publisher("eeg.out", data_stream("eeg")).await.unwrap_err(),
            ResourceError::Duplicate("eeg.out".into())
        );
        assert!(matches!(
            manager.pull(&publisher).await,
            Err(ResourceError::WrongKind { .. })
        ));
        assert!(matches!(
            manager.push(&ResourceId::from("missing"), Bytes::new()),
            Err(ResourceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_creation_failure_is_reported_and_returned() {
        let (manager, transport) = manager();
        let mut events = manager.subscribe_events();
        let unpublished = data_stream("ghost");

        let err = manager.subscribe("ghost.in", &unpublished).await.unwrap_err();
        assert!(matches!(err, ResourceError::Creation { .. }));
        assert!(matches!(events.recv().await.unwrap(), ResourceEvent::Error { .. }));

        let id = ResourceId::from("ghost.in");
        assert_eq!(manager.state(&id), Some(ResourceState::Error));
        assert_eq!(manager.stats().errored, 1);

        // An errored id may be reused once the stream exists
        let outlet = transport.publish(unpublished.clone()).await.unwrap();
        manager.subscribe("ghost.in", outlet.descriptor()).await.unwrap();
        assert_eq!(manager.stats().errored, 0);
        assert_eq!(manager.stats().subscribers, 1);
    }

    #[tokio::test]
    async fn test_discover_and_subscribe_keeps_resolver() {
        let (manager, transport) = manager();
        let _outlet = transport.publish(data_stream("eeg")).await.unwrap();

        let filter = DiscoveryFilter::any().name("eeg");
        let (id, descriptor) = manager
            .discover_and_subscribe("eeg.in", filter.clone(), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(descriptor.name, "eeg");
        assert!(manager.contains(&id));

        let usage = manager.stats();
        assert_eq!(usage.subscribers, 1);
        assert_eq!(usage.resolvers, 1);

        // Resubscribing after the inlet is gone reuses the live resolver
        assert!(manager.destroy(&id).await);
        let (again, _) = manager
            .discover_and_subscribe("eeg.in", filter, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(again, id);
        assert_eq!(manager.stats().resolvers, 1);
        assert!(manager.contains(&ResourceId::from("eeg.in.resolver")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_and_subscribe_without_match() {
        let (manager, _) = manager();
        let err = manager
            .discover_and_subscribe("eeg.in", DiscoveryFilter::any().name("eeg"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::NoMatch(_)));
        assert!(!manager.contains(&ResourceId::from("eeg.in")));
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (manager, _) = manager();
        let id = manager.create_publisher("eeg.out", data_stream("eeg")).await.unwrap();

        manager.set_state(&id, ResourceState::Active).unwrap();
        manager.set_state(&id, ResourceState::Paused).unwrap();
        manager.set_state(&id, ResourceState::Active).unwrap();
        assert!(matches!(
            manager.set_state(&id, ResourceState::Initializing),
            Err(ResourceError::InvalidTransition { .. })
        ));
        manager.set_state(&id, ResourceState::Error).unwrap();
        assert!(manager.set_state(&id, ResourceState::Active).is_err());
        manager.set_state(&id, ResourceState::Stopping).unwrap();
    }

    #[tokio::test]
    async fn test_destroy_and_destroy_all() {
        let (manager, transport) = manager();
        let mut events = manager.subscribe_events();
        let id = manager.create_publisher("eeg.out", data_stream("eeg")).await.unwrap();
        manager
            .create_continuous_resolver("all", DiscoveryFilter::any())
            .unwrap();
        assert_eq!(transport.stream_count(), 1);

        assert!(manager.destroy(&id).await);
        assert!(!manager.destroy(&id).await);
        assert_eq!(transport.stream_count(), 0);

        assert_eq!(manager.destroy_all().await, 1);
        assert_eq!(manager.stats(), ResourceUsage::default());

        let mut destroyed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ResourceEvent::Destroyed { .. }) {
                destroyed += 1;
            }
        }
        assert_eq!(destroyed, 2);
    }

    #[derive(Debug)]
    struct StickyOutlet(StreamDescriptor);

    #[async_trait]
    impl Outlet for StickyOutlet {
        fn descriptor(&self) -> &StreamDescriptor {
            &self.0
        }

        fn push(&self, _sample: Bytes) -> Result<(), TransportError> {
            Ok(())
        }

        fn consumer_count(&self) -> usize {
            0
        }

        async fn close(&self) -> Result<(), TransportError> {
            Err(TransportError::Backend("endpoint stuck".into()))
        }
    }

    #[derive(Debug)]
    struct StickyTransport;

    #[async_trait]
    impl Transport for StickyTransport {
        async fn publish(&self, descriptor: StreamDescriptor) -> Result<Box<dyn Outlet>, TransportError> {
            Ok(Box::new(StickyOutlet(descriptor)))
        }

        async fn discover(
            &self,
            _filter: &DiscoveryFilter,
            _wait: Duration,
        ) -> Result<Vec<StreamDescriptor>, TransportError> {
            Ok(Vec::new())
        }

        async fn open(&self, descriptor: &StreamDescriptor) -> Result<Box<dyn Inlet>, TransportError> {
            Err(TransportError::NotFound(descriptor.uid.clone()))
        }

        fn create_continuous_resolver(
            &self,
            _filter: DiscoveryFilter,
        ) -> Result<Box<dyn Resolver>, TransportError> {
            Err(TransportError::Backend("unsupported".into()))
        }
    }

    #[tokio::test]
    async fn test_teardown_failure_is_swallowed() {
        let manager = ResourceManager::new(Arc::new(StickyTransport));
        let id = manager.create_publisher("stuck", data_stream("eeg")).await.unwrap();
        let mut events = manager.subscribe_events();

        assert!(manager.destroy(&id).await);
        assert!(!manager.contains(&id));
        assert!(matches!(events.recv().await.unwrap(), ResourceEvent::Error { .. }));
        assert!(matches!(events.recv().await.unwrap(), ResourceEvent::Destroyed { .. }));
    }
}
