//! Protocol and session errors.

use coord_resource::ResourceError;
use coord_runtime::{IsolationError, StreamError};
use coord_state::StateError;
use thiserror::Error;

/// Errors raised while handling a protocol message
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Coordinator refused this node
    #[error("join rejected: {0}")]
    JoinRejected(String),
    /// Roster mutation failed
    #[error(transparent)]
    State(#[from] StateError),
}

/// Errors surfaced by the session facade
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Coordinator refused this node
    #[error("join rejected: {0}")]
    JoinRejected(String),
    /// No connection test response arrived
    #[error("unable to confirm bidirectional connection")]
    ConnectionUnconfirmed,
    /// Join did not complete in time
    #[error("join timed out after {0:?}")]
    JoinTimeout(std::time::Duration),
    /// Not enough nodes showed up in time
    #[error("only {found} of {expected} nodes present after {timeout:?}")]
    NodesTimeout {
        /// Nodes required
        expected: usize,
        /// Nodes present
        found: usize,
        /// Time waited
        timeout: std::time::Duration,
    },
    /// Session already joined a network
    #[error("session already joined")]
    AlreadyJoined,
    /// Operation needs a joined session
    #[error("session has not joined a network")]
    NotJoined,
    /// Session was left and cannot be reused
    #[error("session has been disposed")]
    Disposed,
    /// Control loop is not running
    #[error("control loop unavailable")]
    ControlClosed,
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Roster or phase violation
    #[error(transparent)]
    State(#[from] StateError),
    /// Stream operation failed
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// Endpoint management failed
    #[error(transparent)]
    Resource(#[from] ResourceError),
    /// Execution unit failed
    #[error(transparent)]
    Isolation(#[from] IsolationError),
}

impl From<ProtocolError> for SessionError {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::JoinRejected(reason) => SessionError::JoinRejected(reason),
            ProtocolError::State(e) => SessionError::State(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_keep_their_kind() {
        let rejected: SessionError = ProtocolError::JoinRejected("Maximum nodes reached".into()).into();
        assert_eq!(rejected, SessionError::JoinRejected("Maximum nodes reached".into()));

        let state: SessionError = ProtocolError::State(StateError::Disposing).into();
        assert_eq!(state, SessionError::State(StateError::Disposing));
        assert_eq!(state.to_string(), "coordination state is disposing");
    }
}
