//! Transport capability consumed by the coordination engine.

use crate::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use coord_wire::SampleEncoding;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Stream type used by every node's coordination outlet
pub const COORDINATION_STREAM_TYPE: &str = "coordination";

/// Description of a published stream as seen through discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDescriptor {
    /// Unique id of this publication
    pub uid: String,
    /// Stream name
    pub name: String,
    /// Stream type (e.g. `coordination`, `data`)
    pub stream_type: String,
    /// Uid of the publishing node
    pub source_id: String,
    /// Channels per sample
    pub channel_count: u32,
    /// Nominal rate in Hz (0 for irregular streams)
    pub sample_rate: f64,
    /// Sample encoding
    pub encoding: SampleEncoding,
    /// When the stream was published
    pub created_at: DateTime<Utc>,
    /// Free-form properties
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl StreamDescriptor {
    /// Create a descriptor with a fresh uid
    pub fn new(
        name: impl Into<String>,
        stream_type: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            uid: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            stream_type: stream_type.into(),
            source_id: source_id.into(),
            channel_count: 1,
            sample_rate: 0.0,
            encoding: SampleEncoding::String,
            created_at: Utc::now(),
            properties: BTreeMap::new(),
        }
    }

    /// Set channel layout
    pub fn with_format(mut self, channel_count: u32, sample_rate: f64, encoding: SampleEncoding) -> Self {
        self.channel_count = channel_count;
        self.sample_rate = sample_rate;
        self.encoding = encoding;
        self
    }

    /// Add a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Look up a property
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}] from {}", self.name, self.stream_type, self.source_id)
    }
}

/// Predicate over stream descriptors. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryFilter {
    /// Required stream name
    pub name: Option<String>,
    /// Required stream type
    pub stream_type: Option<String>,
    /// Required publishing node
    pub source_id: Option<String>,
    /// Publishing node to ignore
    pub exclude_source: Option<String>,
    /// Required property values
    pub properties: BTreeMap<String, String>,
}

impl DiscoveryFilter {
    /// Filter matching every stream
    pub fn any() -> Self {
        Self::default()
    }

    /// Require a stream name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Require a stream type
    pub fn stream_type(mut self, stream_type: impl Into<String>) -> Self {
        self.stream_type = Some(stream_type.into());
        self
    }

    /// Require a publishing node
    pub fn source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    /// Ignore streams published by a node
    pub fn excluding_source(mut self, source_id: impl Into<String>) -> Self {
        self.exclude_source = Some(source_id.into());
        self
    }

    /// Require a property value
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Whether `descriptor` satisfies the filter
    pub fn matches(&self, descriptor: &StreamDescriptor) -> bool {
        if let Some(name) = &self.name {
            if &descriptor.name != name {
                return false;
            }
        }
        if let Some(stream_type) = &self.stream_type {
            if &descriptor.stream_type != stream_type {
                return false;
            }
        }
        if let Some(source_id) = &self.source_id {
            if &descriptor.source_id != source_id {
                return false;
            }
        }
        if let Some(excluded) = &self.exclude_source {
            if &descriptor.source_id == excluded {
                return false;
            }
        }
        self.properties
            .iter()
            .all(|(key, value)| descriptor.property(key) == Some(value.as_str()))
    }
}

impl fmt::Display for DiscoveryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(name) = &self.name {
            parts.push(format!("name={}", name));
        }
        if let Some(stream_type) = &self.stream_type {
            parts.push(format!("type={}", stream_type));
        }
        if let Some(source_id) = &self.source_id {
            parts.push(format!("source={}", source_id));
        }
        if let Some(excluded) = &self.exclude_source {
            parts.push(format!("source!={}", excluded));
        }
        for (key, value) in &self.properties {
            parts.push(format!("{}={}", key, value));
        }
        if parts.is_empty() {
            write!(f, "*")
        } else {
            write!(f, "{}", parts.join(","))
        }
    }
}

/// Publishing end of a stream
#[async_trait]
pub trait Outlet: Send + Sync + fmt::Debug {
    /// Published descriptor
    fn descriptor(&self) -> &StreamDescriptor;

    /// Push one sample to every current consumer
    fn push(&self, sample: Bytes) -> Result<(), TransportError>;

    /// Number of inlets currently attached
    fn consumer_count(&self) -> usize;

    /// Withdraw the stream
    async fn close(&self) -> Result<(), TransportError>;
}

/// Subscribing end of a stream
#[async_trait]
pub trait Inlet: Send + Sync + fmt::Debug {
    /// Descriptor of the stream this inlet is attached to
    fn descriptor(&self) -> &StreamDescriptor;

    /// Wait for the next sample
    async fn pull(&self) -> Result<Bytes, TransportError>;

    /// Next sample if one is buffered
    async fn try_pull(&self) -> Result<Option<Bytes>, TransportError>;

    /// Discard buffered samples, returning how many were dropped
    async fn flush(&self) -> usize;

    /// Detach from the stream
    async fn close(&self) -> Result<(), TransportError>;
}

/// Long-lived discovery handle
#[async_trait]
pub trait Resolver: Send + Sync + fmt::Debug {
    /// Filter this resolver was created with
    fn filter(&self) -> &DiscoveryFilter;

    /// Current matches. Never blocks.
    fn results(&self) -> Result<Vec<StreamDescriptor>, TransportError>;

    /// Stop resolving
    async fn close(&self) -> Result<(), TransportError>;
}

/// Pub/sub transport capability
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Publish a stream
    async fn publish(&self, descriptor: StreamDescriptor) -> Result<Box<dyn Outlet>, TransportError>;

    /// Find published streams matching `filter`.
    ///
    /// With a zero `wait` this is a non-blocking probe; otherwise it waits up
    /// to `wait` for at least one match.
    async fn discover(
        &self,
        filter: &DiscoveryFilter,
        wait: Duration,
    ) -> Result<Vec<StreamDescriptor>, TransportError>;

    /// Attach an inlet to a published stream
    async fn open(&self, descriptor: &StreamDescriptor) -> Result<Box<dyn Inlet>, TransportError>;

    /// Create a resolver that keeps reporting matches until closed
    fn create_continuous_resolver(
        &self,
        filter: DiscoveryFilter,
    ) -> Result<Box<dyn Resolver>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matching() {
        let descriptor = StreamDescriptor::new("lab-coord", COORDINATION_STREAM_TYPE, "uid-a")
            .with_property("network", "lab");

        assert!(DiscoveryFilter::any().matches(&descriptor));
        assert!(DiscoveryFilter::any()
            .stream_type(COORDINATION_STREAM_TYPE)
            .property("network", "lab")
            .matches(&descriptor));
        assert!(!DiscoveryFilter::any()
            .property("network", "other")
            .matches(&descriptor));
        assert!(!DiscoveryFilter::any()
            .excluding_source("uid-a")
            .matches(&descriptor));
        assert!(!DiscoveryFilter::any().name("eeg").matches(&descriptor));
    }
}
