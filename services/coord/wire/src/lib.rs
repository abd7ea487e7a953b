//! Typed coordination messages, structural-map codec, and CBOR framing for coord.
//!
//! This crate defines everything that travels between coordination nodes:
//! node identities, stream configurations, and the closed set of
//! [`CoordinationMessage`] variants exchanged between the coordinator and its
//! participants.
//!
//! ## Encodings
//!
//! Every message has two encodings:
//!
//! - **Structural map**: a JSON-compatible map keyed by field name with a
//!   `type` discriminator, produced by [`encode_value`] and decoded by
//!   [`decode_value`].
//! - **Frame**: the structural map serialized as CBOR behind a fixed header,
//!   produced by [`encode_frame`] and decoded by [`decode_frame`] or the
//!   streaming [`FrameDecoder`].
//!
//! ## Frame Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | magic "CM" (2B)      | frame marker               |
//! +----------------------+----------------------------+
//! | version (1B)         | WIRE_VERSION               |
//! +----------------------+----------------------------+
//! | reserved (1B)        | must be zero               |
//! +----------------------+----------------------------+
//! | u32 body_len (BE)    | length of the CBOR body    |
//! +----------------------+----------------------------+
//! | u32 crc32 (BE)       | checksum of the CBOR body  |
//! +----------------------+----------------------------+
//! | body                 | CBOR structural map        |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod header;
pub mod message;
pub mod node;
pub mod stream;

// Re-export main types
pub use codec::{decode_frame, decode_value, encode_frame, encode_value, FrameDecoder};
pub use error::WireError;
pub use header::{FrameHeader, FRAME_HEADER_SIZE, FRAME_MAGIC, MAX_FRAME_BODY, WIRE_VERSION};
pub use message::{
    ConfigUpdate, ConnectionTest, ConnectionTestResponse, CoordinationMessage, CreateStream,
    Heartbeat, JoinAccept, JoinOffer, JoinReject, JoinRequest, MessageBody, MessageType, Metadata,
    NodeLeaving, ResumeStream, StartStream, StreamTarget, TopologyUpdate, UserMessage,
};
pub use node::{Node, NodeRole};
pub use stream::{ParticipationMode, SampleEncoding, StreamCapabilities, StreamConfig};
