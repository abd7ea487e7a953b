//! Coordination message structures for the wire protocol.
//!
//! Every message is a [`CoordinationMessage`]: a common envelope
//! (`fromNodeUId`, `timestamp`, `metadata`) around one [`MessageBody`]
//! variant. On the wire the envelope and body fields share one flat map and
//! the body is selected by the `type` discriminator.

use crate::node::Node;
use crate::stream::StreamConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Open, forward-compatible key/value map carried by every message
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Periodic liveness signal
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Whether the sender currently holds the coordinator role
    #[serde(default)]
    pub is_coordinator: bool,
}

/// Reachability probe sent by a joining node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTest {
    /// Correlation ID echoed by the response
    pub test_id: String,
}

/// Reply proving the probe arrived and the reply path works
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestResponse {
    /// Correlation ID from the probe
    pub test_id: String,
    /// Whether the responder confirms the connection
    #[serde(default)]
    pub confirmed: bool,
}

/// Coordinator advertisement, optionally aimed at one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinOffer {
    /// Node the offer is addressed to (None = anyone)
    #[serde(rename = "targetNodeUId", default)]
    pub target_node_uid: Option<String>,
    /// Network the coordinator manages
    pub network_name: String,
    /// Current number of connected nodes
    pub node_count: u32,
    /// Capacity of the network
    pub max_nodes: u32,
}

/// Request to become a member of the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    /// Identity of the joining node
    pub node: Node,
}

/// Admission of a node into the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinAccept {
    /// Node that was admitted
    #[serde(rename = "acceptedNodeUId")]
    pub accepted_node_uid: String,
    /// Full roster after admission, coordinator included
    pub current_topology: Vec<Node>,
}

/// Refusal to admit a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinReject {
    /// Node that was refused
    #[serde(rename = "rejectedNodeUId")]
    pub rejected_node_uid: String,
    /// Human-readable refusal reason
    pub reason: String,
}

/// Authoritative roster broadcast by the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyUpdate {
    /// Full roster, coordinator included
    pub topology: Vec<Node>,
}

/// Stream creation command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStream {
    /// Stream name
    pub stream_name: String,
    /// Stream configuration
    pub config: StreamConfig,
}

/// Stream start command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartStream {
    /// Stream name
    pub stream_name: String,
    /// Optional synchronized start instant
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
}

/// Stream resume command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeStream {
    /// Stream name
    pub stream_name: String,
    /// Discard buffered samples before re-enabling flow
    #[serde(default = "default_flush_before_resume")]
    pub flush_before_resume: bool,
}

fn default_flush_before_resume() -> bool {
    true
}

/// Stream command that only names its target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamTarget {
    /// Stream name
    pub stream_name: String,
}

impl StreamTarget {
    /// Target the stream called `stream_name`
    pub fn named(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
        }
    }
}

/// Application-level message relayed through the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    /// Application-chosen message ID
    pub message_id: String,
    /// Application payload
    #[serde(default)]
    pub payload: Metadata,
}

/// Session-wide configuration change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    /// Changed configuration keys
    #[serde(default)]
    pub config: Metadata,
}

/// Graceful departure notice
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeLeaving {
    /// Optional departure reason
    #[serde(default)]
    pub reason: Option<String>,
}

/// Variant-specific part of a coordination message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessageBody {
    /// Liveness signal
    Heartbeat(Heartbeat),
    /// Reachability probe
    ConnectionTest(ConnectionTest),
    /// Reachability confirmation
    ConnectionTestResponse(ConnectionTestResponse),
    /// Coordinator advertisement
    JoinOffer(JoinOffer),
    /// Membership request
    JoinRequest(JoinRequest),
    /// Membership granted
    JoinAccept(JoinAccept),
    /// Membership refused
    JoinReject(JoinReject),
    /// Roster broadcast
    TopologyUpdate(TopologyUpdate),
    /// Stream creation
    CreateStream(CreateStream),
    /// Stream start
    StartStream(StartStream),
    /// Stream is ready on the sender
    StreamReady(StreamTarget),
    /// Stream stop
    StopStream(StreamTarget),
    /// Stream pause
    PauseStream(StreamTarget),
    /// Stream resume
    ResumeStream(ResumeStream),
    /// Stream buffer flush
    FlushStream(StreamTarget),
    /// Stream teardown
    DestroyStream(StreamTarget),
    /// Application message
    UserMessage(UserMessage),
    /// Configuration change
    ConfigUpdate(ConfigUpdate),
    /// Departure notice
    NodeLeaving(NodeLeaving),
}

/// Discriminator of a [`MessageBody`] variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    /// Liveness signal
    Heartbeat,
    /// Reachability probe
    ConnectionTest,
    /// Reachability confirmation
    ConnectionTestResponse,
    /// Coordinator advertisement
    JoinOffer,
    /// Membership request
    JoinRequest,
    /// Membership granted
    JoinAccept,
    /// Membership refused
    JoinReject,
    /// Roster broadcast
    TopologyUpdate,
    /// Stream creation
    CreateStream,
    /// Stream start
    StartStream,
    /// Stream is ready on the sender
    StreamReady,
    /// Stream stop
    StopStream,
    /// Stream pause
    PauseStream,
    /// Stream resume
    ResumeStream,
    /// Stream buffer flush
    FlushStream,
    /// Stream teardown
    DestroyStream,
    /// Application message
    UserMessage,
    /// Configuration change
    ConfigUpdate,
    /// Departure notice
    NodeLeaving,
}

impl MessageType {
    /// Every message type, in declaration order
    pub const ALL: [MessageType; 19] = [
        MessageType::Heartbeat,
        MessageType::ConnectionTest,
        MessageType::ConnectionTestResponse,
        MessageType::JoinOffer,
        MessageType::JoinRequest,
        MessageType::JoinAccept,
        MessageType::JoinReject,
        MessageType::TopologyUpdate,
        MessageType::CreateStream,
        MessageType::StartStream,
        MessageType::StreamReady,
        MessageType::StopStream,
        MessageType::PauseStream,
        MessageType::ResumeStream,
        MessageType::FlushStream,
        MessageType::DestroyStream,
        MessageType::UserMessage,
        MessageType::ConfigUpdate,
        MessageType::NodeLeaving,
    ];

    /// Wire discriminator for this type
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Heartbeat => "heartbeat",
            MessageType::ConnectionTest => "connectionTest",
            MessageType::ConnectionTestResponse => "connectionTestResponse",
            MessageType::JoinOffer => "joinOffer",
            MessageType::JoinRequest => "joinRequest",
            MessageType::JoinAccept => "joinAccept",
            MessageType::JoinReject => "joinReject",
            MessageType::TopologyUpdate => "topologyUpdate",
            MessageType::CreateStream => "createStream",
            MessageType::StartStream => "startStream",
            MessageType::StreamReady => "streamReady",
            MessageType::StopStream => "stopStream",
            MessageType::PauseStream => "pauseStream",
            MessageType::ResumeStream => "resumeStream",
            MessageType::FlushStream => "flushStream",
            MessageType::DestroyStream => "destroyStream",
            MessageType::UserMessage => "userMessage",
            MessageType::ConfigUpdate => "configUpdate",
            MessageType::NodeLeaving => "nodeLeaving",
        }
    }

    /// Whether this type drives the stream lifecycle on the receiver
    pub fn is_stream_command(&self) -> bool {
        matches!(
            self,
            MessageType::CreateStream
                | MessageType::StartStream
                | MessageType::StopStream
                | MessageType::PauseStream
                | MessageType::ResumeStream
                | MessageType::FlushStream
                | MessageType::DestroyStream
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = crate::WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| crate::WireError::UnknownType(s.to_string()))
    }
}

impl MessageBody {
    /// Discriminator of this body
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Heartbeat(_) => MessageType::Heartbeat,
            MessageBody::ConnectionTest(_) => MessageType::ConnectionTest,
            MessageBody::ConnectionTestResponse(_) => MessageType::ConnectionTestResponse,
            MessageBody::JoinOffer(_) => MessageType::JoinOffer,
            MessageBody::JoinRequest(_) => MessageType::JoinRequest,
            MessageBody::JoinAccept(_) => MessageType::JoinAccept,
            MessageBody::JoinReject(_) => MessageType::JoinReject,
            MessageBody::TopologyUpdate(_) => MessageType::TopologyUpdate,
            MessageBody::CreateStream(_) => MessageType::CreateStream,
            MessageBody::StartStream(_) => MessageType::StartStream,
            MessageBody::StreamReady(_) => MessageType::StreamReady,
            MessageBody::StopStream(_) => MessageType::StopStream,
            MessageBody::PauseStream(_) => MessageType::PauseStream,
            MessageBody::ResumeStream(_) => MessageType::ResumeStream,
            MessageBody::FlushStream(_) => MessageType::FlushStream,
            MessageBody::DestroyStream(_) => MessageType::DestroyStream,
            MessageBody::UserMessage(_) => MessageType::UserMessage,
            MessageBody::ConfigUpdate(_) => MessageType::ConfigUpdate,
            MessageBody::NodeLeaving(_) => MessageType::NodeLeaving,
        }
    }

    /// Name of the stream a stream-related body refers to
    pub fn stream_name(&self) -> Option<&str> {
        match self {
            MessageBody::CreateStream(m) => Some(&m.stream_name),
            MessageBody::StartStream(m) => Some(&m.stream_name),
            MessageBody::ResumeStream(m) => Some(&m.stream_name),
            MessageBody::StreamReady(m)
            | MessageBody::StopStream(m)
            | MessageBody::PauseStream(m)
            | MessageBody::FlushStream(m)
            | MessageBody::DestroyStream(m) => Some(&m.stream_name),
            _ => None,
        }
    }
}

macro_rules! impl_into_body {
    ($($payload:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$payload> for MessageBody {
                fn from(payload: $payload) -> Self {
                    MessageBody::$variant(payload)
                }
            }
        )*
    };
}

impl_into_body! {
    Heartbeat => Heartbeat,
    ConnectionTest => ConnectionTest,
    ConnectionTestResponse => ConnectionTestResponse,
    JoinOffer => JoinOffer,
    JoinRequest => JoinRequest,
    JoinAccept => JoinAccept,
    JoinReject => JoinReject,
    TopologyUpdate => TopologyUpdate,
    CreateStream => CreateStream,
    StartStream => StartStream,
    ResumeStream => ResumeStream,
    UserMessage => UserMessage,
    ConfigUpdate => ConfigUpdate,
    NodeLeaving => NodeLeaving,
}

/// Immutable coordination message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationMessage {
    /// Unique ID of the sending node
    #[serde(rename = "fromNodeUId")]
    from_node_uid: String,
    /// Creation time at the sender
    timestamp: DateTime<Utc>,
    /// Free-form metadata
    #[serde(default)]
    metadata: Metadata,
    /// Variant payload
    #[serde(flatten)]
    body: MessageBody,
}

impl CoordinationMessage {
    /// Create a message stamped with the current time
    pub fn new(from_node_uid: impl Into<String>, body: impl Into<MessageBody>) -> Self {
        Self {
            from_node_uid: from_node_uid.into(),
            timestamp: Utc::now(),
            metadata: Metadata::new(),
            body: body.into(),
        }
    }

    /// Override the timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Unique ID of the sending node
    pub fn from_node_uid(&self) -> &str {
        &self.from_node_uid
    }

    /// Creation time at the sender
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Free-form metadata
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Variant payload
    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    /// Consume the message, keeping only its payload
    pub fn into_body(self) -> MessageBody {
        self.body
    }

    /// Discriminator of the payload
    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_strings_match_serde_tags() {
        let body = MessageBody::StreamReady(StreamTarget {
            stream_name: "s1".to_string(),
        });
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["type"], body.message_type().as_str());

        for ty in MessageType::ALL {
            assert_eq!(ty.as_str().parse::<MessageType>().unwrap(), ty);
        }
    }

    #[test]
    fn test_stream_command_classification() {
        let commands: Vec<_> = MessageType::ALL
            .iter()
            .filter(|t| t.is_stream_command())
            .collect();
        assert_eq!(commands.len(), 7);
        assert!(!MessageType::StreamReady.is_stream_command());
    }

    #[test]
    fn test_stream_name_accessor() {
        let body: MessageBody = ResumeStream {
            stream_name: "s1".to_string(),
            flush_before_resume: false,
        }
        .into();
        assert_eq!(body.stream_name(), Some("s1"));
        assert_eq!(MessageBody::Heartbeat(Heartbeat::default()).stream_name(), None);
    }
}
