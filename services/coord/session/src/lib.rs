//! Coordination protocol engine and session facade for coord.
//!
//! A [`CoordinationSession`] discovers other nodes of a network, elects or
//! finds a coordinator, joins under it, and keeps the roster current through
//! heartbeats and topology updates. Stream lifecycle commands issued on the
//! coordinator are replayed on every participant.
//!
//! ## Units
//!
//! Each session runs one control-layer unit ([`ControlLoop`]) that owns the
//! coordination state and speaks the protocol, plus one data-layer unit per
//! stream. The facade only exchanges messages with them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod control;
pub mod election;
pub mod error;
pub mod event;
pub mod handshake;
pub mod keepalive;
pub mod protocol;
pub mod session;

pub use config::{ConnectionTestConfig, CoordinationConfig, PromotionStrategy, TopologyMode};
pub use control::{ControlClient, ControlCommand, ControlLoop, ControlOutput, DiscoveryReport};
pub use election::{elect, Candidate};
pub use error::{ProtocolError, SessionError};
pub use event::{SessionEvent, SessionEventKind, SessionEventNotifier};
pub use handshake::{confirm_connection, ConnectionProbe, PendingTests};
pub use protocol::{
    CoordinatorHandler, HandlerContext, ParticipantHandler, ProtocolEffect, ProtocolHandler,
};
pub use session::{CoordinationSession, SessionSnapshot};
