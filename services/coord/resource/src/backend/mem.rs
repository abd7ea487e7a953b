//! In-process transport for development and testing

use crate::transport::{DiscoveryFilter, Inlet, Outlet, Resolver, StreamDescriptor, Transport};
use crate::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Default per-stream buffer (samples)
pub const DEFAULT_STREAM_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Published {
    descriptor: StreamDescriptor,
    tx: broadcast::Sender<Bytes>,
}

#[derive(Debug)]
struct Hub {
    /// Published streams keyed by descriptor uid
    streams: DashMap<String, Published>,
    /// Signalled whenever the set of published streams changes
    changed: Notify,
    capacity: usize,
}

impl Hub {
    fn matching(&self, filter: &DiscoveryFilter) -> Vec<StreamDescriptor> {
        let mut found: Vec<StreamDescriptor> = self
            .streams
            .iter()
            .filter(|entry| filter.matches(&entry.descriptor))
            .map(|entry| entry.descriptor.clone())
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.uid.cmp(&b.uid)));
        found
    }

    fn withdraw(&self, uid: &str) {
        if self.streams.remove(uid).is_some() {
            debug!("Withdrew stream {}", uid);
            self.changed.notify_waiters();
        }
    }
}

/// Transport backed by in-process broadcast channels.
///
/// Clones share the same set of published streams, so every node of a local
/// simulation can be handed a clone of one transport.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
}

impl MemoryTransport {
    /// Create a transport buffering up to `capacity` samples per inlet
    pub fn new(capacity: usize) -> Self {
        Self {
            hub: Arc::new(Hub {
                streams: DashMap::new(),
                changed: Notify::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Number of currently published streams
    pub fn stream_count(&self) -> usize {
        self.hub.streams.len()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_CAPACITY)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, descriptor: StreamDescriptor) -> Result<Box<dyn Outlet>, TransportError> {
        let uid = descriptor.uid.clone();
        match self.hub.streams.entry(uid.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransportError::Duplicate(uid));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let (tx, _) = broadcast::channel(self.hub.capacity);
                slot.insert(Published {
                    descriptor: descriptor.clone(),
                    tx,
                });
            }
        }

        debug!("Published stream {}", descriptor);
        self.hub.changed.notify_waiters();

        Ok(Box::new(MemoryOutlet {
            hub: self.hub.clone(),
            descriptor,
            closed: AtomicBool::new(false),
        }))
    }

    async fn discover(
        &self,
        filter: &DiscoveryFilter,
        wait: Duration,
    ) -> Result<Vec<StreamDescriptor>, TransportError> {
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before checking so a publish in between is not missed
            let changed = self.hub.changed.notified();

            let found = self.hub.matching(filter);
            if !found.is_empty() || wait.is_zero() {
                return Ok(found);
            }

            tokio::select! {
                _ = changed => {}
                _ = sleep_until(deadline) => return Ok(self.hub.matching(filter)),
            }
        }
    }

    async fn open(&self, descriptor: &StreamDescriptor) -> Result<Box<dyn Inlet>, TransportError> {
        let published = self
            .hub
            .streams
            .get(&descriptor.uid)
            .ok_or_else(|| TransportError::NotFound(descriptor.uid.clone()))?;

        let rx = published.tx.subscribe();
        debug!("Opened inlet on {}", published.descriptor);

        Ok(Box::new(MemoryInlet {
            descriptor: published.descriptor.clone(),
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }))
    }

    fn create_continuous_resolver(
        &self,
        filter: DiscoveryFilter,
    ) -> Result<Box<dyn Resolver>, TransportError> {
        Ok(Box::new(MemoryResolver {
            hub: self.hub.clone(),
            filter,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Outlet of a [`MemoryTransport`]; withdraws its stream on close or drop
#[derive(Debug)]
pub struct MemoryOutlet {
    hub: Arc<Hub>,
    descriptor: StreamDescriptor,
    closed: AtomicBool,
}

#[async_trait]
impl Outlet for MemoryOutlet {
    fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    fn push(&self, sample: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let published = self
            .hub
            .streams
            .get(&self.descriptor.uid)
            .ok_or(TransportError::Closed)?;

        // No consumers is not an error for a pub/sub outlet
        let _ = published.tx.send(sample);
        Ok(())
    }

    fn consumer_count(&self) -> usize {
        self.hub
            .streams
            .get(&self.descriptor.uid)
            .map(|published| published.tx.receiver_count())
            .unwrap_or(0)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.hub.withdraw(&self.descriptor.uid);
        }
        Ok(())
    }
}

impl Drop for MemoryOutlet {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.hub.withdraw(&self.descriptor.uid);
        }
    }
}

/// Inlet of a [`MemoryTransport`]
#[derive(Debug)]
pub struct MemoryInlet {
    descriptor: StreamDescriptor,
    rx: Mutex<broadcast::Receiver<Bytes>>,
    closed: AtomicBool,
    close_signal: Notify,
}

#[async_trait]
impl Inlet for MemoryInlet {
    fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    async fn pull(&self) -> Result<Bytes, TransportError> {
        let close_signal = self.close_signal.notified();
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let receive = async {
            let mut rx = self.rx.lock().await;
            loop {
                match rx.recv().await {
                    Ok(sample) => return Ok(sample),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Inlet on {} lagged, skipped {} samples", self.descriptor, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(TransportError::Closed),
                }
            }
        };

        tokio::select! {
            _ = close_signal => Err(TransportError::Closed),
            result = receive => result,
        }
    }

    async fn try_pull(&self) -> Result<Option<Bytes>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut rx = self.rx.lock().await;
        loop {
            match rx.try_recv() {
                Ok(sample) => return Ok(Some(sample)),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Inlet on {} lagged, skipped {} samples", self.descriptor, skipped);
                }
                Err(broadcast::error::TryRecvError::Closed) => return Err(TransportError::Closed),
            }
        }
    }

    async fn flush(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut dropped = 0;
        loop {
            match rx.try_recv() {
                Ok(_) => dropped += 1,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => dropped += skipped as usize,
                Err(_) => break,
            }
        }
        if dropped > 0 {
            debug!("Flushed {} samples from inlet on {}", dropped, self.descriptor);
        }
        dropped
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        self.close_signal.notify_waiters();
        Ok(())
    }
}

/// Continuous resolver of a [`MemoryTransport`]
#[derive(Debug)]
pub struct MemoryResolver {
    hub: Arc<Hub>,
    filter: DiscoveryFilter,
    closed: AtomicBool,
}

#[async_trait]
impl Resolver for MemoryResolver {
    fn filter(&self) -> &DiscoveryFilter {
        &self.filter
    }

    fn results(&self) -> Result<Vec<StreamDescriptor>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(self.hub.matching(&self.filter))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
