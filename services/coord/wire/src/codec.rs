//! Encoding and decoding for the wire protocol.
//!
//! Messages are first lowered to a structural map (a JSON-compatible value
//! keyed by field name with a `type` discriminator) and then, for transport,
//! serialized as CBOR behind a [`FrameHeader`].

use crate::header::{FrameHeader, FRAME_HEADER_SIZE, MAX_FRAME_BODY};
use crate::message::{CoordinationMessage, MessageType};
use crate::WireError;
use bytes::{Buf, Bytes, BytesMut};
use serde_json::Value;
use tracing::trace;

/// Lower a message to its structural map
pub fn encode_value(message: &CoordinationMessage) -> Result<Value, WireError> {
    serde_json::to_value(message).map_err(|e| WireError::Malformed(e.to_string()))
}

/// Rebuild a message from its structural map.
///
/// Dispatch happens purely on the `type` discriminator; unknown fields are
/// ignored and missing optional fields take their per-variant defaults.
pub fn decode_value(value: Value) -> Result<CoordinationMessage, WireError> {
    let type_tag = value
        .as_object()
        .ok_or_else(|| WireError::Malformed("message is not a map".to_string()))?
        .get("type")
        .ok_or(WireError::MissingType)?
        .as_str()
        .ok_or_else(|| WireError::Malformed("type discriminator is not a string".to_string()))?;

    // Reject unknown variants up front so they surface as their own error
    type_tag.parse::<MessageType>()?;

    serde_json::from_value(value).map_err(|e| WireError::Malformed(e.to_string()))
}

/// Serialize a message into a complete frame
pub fn encode_frame(message: &CoordinationMessage) -> Result<Bytes, WireError> {
    let value = encode_value(message)?;

    let mut body = Vec::new();
    ciborium::into_writer(&value, &mut body).map_err(|e| WireError::Cbor(e.to_string()))?;
    if body.len() > MAX_FRAME_BODY {
        return Err(WireError::Size(body.len()));
    }

    let header = FrameHeader::for_body(&body);
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
    header.encode(&mut buf);
    buf.extend_from_slice(&body);

    trace!(
        "Encoded {} frame ({} body bytes)",
        message.message_type(),
        body.len()
    );
    Ok(buf.freeze())
}

/// Decode exactly one frame
pub fn decode_frame(frame: &[u8]) -> Result<CoordinationMessage, WireError> {
    let header = FrameHeader::parse(frame)?;
    if frame.len() < header.frame_len() {
        return Err(WireError::Incomplete);
    }
    if frame.len() > header.frame_len() {
        return Err(WireError::Malformed(format!(
            "{} trailing bytes after frame",
            frame.len() - header.frame_len()
        )));
    }

    decode_body(&header, &frame[FRAME_HEADER_SIZE..])
}

fn decode_body(header: &FrameHeader, body: &[u8]) -> Result<CoordinationMessage, WireError> {
    header.verify(body)?;
    let value: Value = ciborium::from_reader(body).map_err(|e| WireError::Cbor(e.to_string()))?;
    decode_value(value)
}

/// Streaming frame decoder for byte-stream transports
#[derive(Debug, Default)]
pub struct FrameDecoder {
    header: Option<FrameHeader>,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to decode one message from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Consumed bytes are
    /// removed from `buf`; a frame that fails validation is consumed too so the
    /// caller can keep reading after logging the error.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<CoordinationMessage>, WireError> {
        let header = match self.header {
            Some(header) => header,
            None => match FrameHeader::parse(buf) {
                Ok(header) => {
                    buf.advance(FRAME_HEADER_SIZE);
                    self.header = Some(header);
                    header
                }
                Err(WireError::Incomplete) => return Ok(None),
                Err(e) => return Err(e),
            },
        };

        let body_len = header.body_len as usize;
        if buf.len() < body_len {
            buf.reserve(body_len - buf.len());
            return Ok(None);
        }

        self.header = None;
        let body = buf.split_to(body_len);
        decode_body(&header, &body).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::*;
    use crate::node::{Node, NodeRole};
    use crate::stream::{ParticipationMode, StreamCapabilities, StreamConfig};
    use serde_json::json;

    fn sample_messages() -> Vec<CoordinationMessage> {
        let coordinator = Node::new("coord", "uid-c").with_role(NodeRole::Coordinator);
        let member = Node::new("amp", "uid-a")
            .with_role(NodeRole::Participant)
            .with_capability("channels", "32");
        let config = StreamConfig::new("s1", 8, 500.0)
            .with_participation(ParticipationMode::PointToPoint)
            .with_capabilities(StreamCapabilities::CONSUMER);
        let target = |name: &str| StreamTarget {
            stream_name: name.to_string(),
        };

        let bodies: Vec<MessageBody> = vec![
            Heartbeat { is_coordinator: true }.into(),
            ConnectionTest { test_id: "t-1".into() }.into(),
            ConnectionTestResponse { test_id: "t-1".into(), confirmed: true }.into(),
            JoinOffer {
                target_node_uid: Some("uid-a".into()),
                network_name: "lab".into(),
                node_count: 1,
                max_nodes: 4,
            }
            .into(),
            JoinRequest { node: member.clone() }.into(),
            JoinAccept {
                accepted_node_uid: "uid-a".into(),
                current_topology: vec![coordinator.clone(), member.clone()],
            }
            .into(),
            JoinReject {
                rejected_node_uid: "uid-z".into(),
                reason: "Maximum nodes reached".into(),
            }
            .into(),
            TopologyUpdate { topology: vec![coordinator, member] }.into(),
            CreateStream { stream_name: "s1".into(), config }.into(),
            StartStream {
                stream_name: "s1".into(),
                start_at: Some(chrono::Utc::now()),
            }
            .into(),
            MessageBody::StreamReady(target("s1")),
            MessageBody::StopStream(target("s1")),
            MessageBody::PauseStream(target("s1")),
            ResumeStream { stream_name: "s1".into(), flush_before_resume: false }.into(),
            MessageBody::FlushStream(target("s1")),
            MessageBody::DestroyStream(target("s1")),
            UserMessage {
                message_id: "m-1".into(),
                payload: [("marker".to_string(), json!("stimulus-on"))].into_iter().collect(),
            }
            .into(),
            ConfigUpdate {
                config: [("heartbeatInterval".to_string(), json!(250))].into_iter().collect(),
            }
            .into(),
            NodeLeaving { reason: Some("shutdown".into()) }.into(),
        ];

        bodies
            .into_iter()
            .map(|body| CoordinationMessage::new("uid-c", body).with_metadata("session", "lab-1"))
            .collect()
    }

    #[test]
    fn test_every_variant_survives_both_encodings() {
        let messages = sample_messages();
        let covered: std::collections::BTreeSet<_> =
            messages.iter().map(|m| m.message_type()).collect();
        assert_eq!(covered.len(), MessageType::ALL.len());

        for message in messages {
            let value = encode_value(&message).unwrap();
            assert_eq!(value["type"], message.message_type().as_str());
            assert_eq!(value["fromNodeUId"], "uid-c");
            assert_eq!(decode_value(value).unwrap(), message);

            let frame = encode_frame(&message).unwrap();
            assert_eq!(decode_frame(&frame).unwrap(), message);
        }
    }

    #[test]
    fn test_defaults_and_unknown_fields() {
        let value = json!({
            "type": "resumeStream",
            "fromNodeUId": "uid-c",
            "timestamp": "2024-05-01T12:00:00Z",
            "streamName": "s1",
            "someFutureField": 42
        });

        let message = decode_value(value).unwrap();
        assert!(message.metadata().is_empty());
        match message.body() {
            MessageBody::ResumeStream(resume) => {
                assert_eq!(resume.stream_name, "s1");
                assert!(resume.flush_before_resume);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_rejects_unknown_and_missing_type() {
        let unknown = json!({
            "type": "electionBallot",
            "fromNodeUId": "uid-c",
            "timestamp": "2024-05-01T12:00:00Z"
        });
        assert!(matches!(
            decode_value(unknown),
            Err(WireError::UnknownType(t)) if t == "electionBallot"
        ));

        let missing = json!({ "fromNodeUId": "uid-c" });
        assert!(matches!(decode_value(missing), Err(WireError::MissingType)));

        let wrong_shape = json!({
            "type": "joinRequest",
            "fromNodeUId": "uid-c",
            "timestamp": "2024-05-01T12:00:00Z"
        });
        assert!(matches!(decode_value(wrong_shape), Err(WireError::Malformed(_))));
    }

    #[test]
    fn test_corrupted_frame_is_rejected() {
        let message = CoordinationMessage::new("uid-a", Heartbeat::default());
        let mut frame = BytesMut::from(encode_frame(&message).unwrap().as_ref());
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;

        assert!(matches!(
            decode_frame(&frame),
            Err(WireError::Checksum { .. })
        ));
    }

    #[test]
    fn test_streaming_decoder_handles_partial_input() {
        let first = CoordinationMessage::new("uid-a", Heartbeat::default());
        let second = CoordinationMessage::new(
            "uid-a",
            NodeLeaving {
                reason: None,
            },
        );

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_frame(&first).unwrap());
        wire.extend_from_slice(&encode_frame(&second).unwrap());

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();

        // Feed a few bytes at a time
        for chunk in wire.chunks(7) {
            buf.extend_from_slice(chunk);
            while let Some(message) = decoder.decode(&mut buf).unwrap() {
                decoded.push(message);
            }
        }

        assert_eq!(decoded, vec![first, second]);
        assert!(buf.is_empty());
    }
}
