//! Data stream configuration carried by stream lifecycle messages.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// What a node may do with a stream
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct StreamCapabilities: u8 {
        /// Node publishes samples on the stream
        const PRODUCER = 1 << 0;
        /// Node subscribes to samples on the stream
        const CONSUMER = 1 << 1;
    }
}

impl Default for StreamCapabilities {
    fn default() -> Self {
        StreamCapabilities::PRODUCER | StreamCapabilities::CONSUMER
    }
}

/// Sample value encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SampleEncoding {
    /// 32-bit IEEE float
    Float32,
    /// 64-bit IEEE float
    Double64,
    /// 32-bit signed integer
    Int32,
    /// 16-bit signed integer
    Int16,
    /// 8-bit signed integer
    Int8,
    /// Variable-length UTF-8 string
    String,
}

/// Which nodes exchange samples on a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParticipationMode {
    /// Every node produces to and consumes from every other node
    AllNodes,
    /// Samples only flow between the coordinator and each participant
    PointToPoint,
}

/// Description of a named data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    /// Stream name, unique within a session
    pub id: String,
    /// Channels per sample
    pub channel_count: u32,
    /// Nominal sample rate in Hz (0 for irregular streams)
    pub sample_rate: f64,
    /// Sample value encoding
    pub encoding: SampleEncoding,
    /// Which nodes exchange samples
    pub participation: ParticipationMode,
    /// Producer/consumer flags
    #[serde(default)]
    pub capabilities: StreamCapabilities,
}

impl StreamConfig {
    /// Create a stream configuration with all-nodes participation
    pub fn new(id: impl Into<String>, channel_count: u32, sample_rate: f64) -> Self {
        Self {
            id: id.into(),
            channel_count,
            sample_rate,
            encoding: SampleEncoding::Float32,
            participation: ParticipationMode::AllNodes,
            capabilities: StreamCapabilities::default(),
        }
    }

    /// Set the sample encoding
    pub fn with_encoding(mut self, encoding: SampleEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set the participation mode
    pub fn with_participation(mut self, participation: ParticipationMode) -> Self {
        self.participation = participation;
        self
    }

    /// Set the producer/consumer flags
    pub fn with_capabilities(mut self, capabilities: StreamCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Whether nodes with this configuration publish samples
    pub fn produces(&self) -> bool {
        self.capabilities.contains(StreamCapabilities::PRODUCER)
    }

    /// Whether nodes with this configuration subscribe to samples
    pub fn consumes(&self) -> bool {
        self.capabilities.contains(StreamCapabilities::CONSUMER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capabilities() {
        let config = StreamConfig::new("eeg", 8, 250.0);
        assert!(config.produces());
        assert!(config.consumes());

        let consumer = config.with_capabilities(StreamCapabilities::CONSUMER);
        assert!(!consumer.produces());
        assert!(consumer.consumes());
    }

    #[test]
    fn test_missing_capabilities_default_to_both() {
        let value = serde_json::json!({
            "id": "markers",
            "channelCount": 1,
            "sampleRate": 0.0,
            "encoding": "string",
            "participation": "pointToPoint"
        });
        let config: StreamConfig = serde_json::from_value(value).unwrap();

        assert_eq!(config.participation, ParticipationMode::PointToPoint);
        assert_eq!(config.encoding, SampleEncoding::String);
        assert_eq!(config.capabilities, StreamCapabilities::default());
    }
}
