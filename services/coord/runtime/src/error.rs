//! Isolation and stream errors.

use crate::{Layer, StreamState};
use coord_resource::ResourceError;
use thiserror::Error;

/// Fault reported by an execution unit
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct IsolateError {
    /// What went wrong
    pub message: String,
    /// Underlying cause, if known
    pub cause: Option<String>,
    /// Whether recovery must not be attempted
    pub fatal: bool,
}

impl IsolateError {
    /// Recoverable fault
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            fatal: false,
        }
    }

    /// Fault that permanently disables the unit
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            fatal: true,
            ..Self::new(message)
        }
    }

    /// Attach a cause
    pub fn with_cause(mut self, cause: impl ToString) -> Self {
        self.cause = Some(cause.to_string());
        self
    }
}

/// Errors raised by the isolation layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IsolationError {
    /// Registering the unit would put it in both layers
    #[error("unit {id} is already registered in the {existing} layer")]
    Overlap {
        /// Unit id
        id: String,
        /// Layer the unit already belongs to
        existing: Layer,
    },
    /// Unit id already active in the same layer
    #[error("unit {id} is already registered in the {layer} layer")]
    Duplicate {
        /// Unit id
        id: String,
        /// Layer
        layer: Layer,
    },
    /// Unit was permanently disabled after a fault
    #[error("unit {id} disabled: {reason}")]
    Disabled {
        /// Unit id
        id: String,
        /// Why recovery was refused
        reason: String,
    },
    /// Unit is no longer accepting messages
    #[error("unit {0} is closed")]
    Closed(String),
}

/// Errors raised by stream operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    /// Operation is not valid in the current state
    #[error("cannot {operation} stream {stream} while {state}")]
    InvalidState {
        /// Stream name
        stream: String,
        /// Attempted operation
        operation: &'static str,
        /// Current state
        state: StreamState,
    },
    /// Stream was destroyed
    #[error("stream {0} is closed")]
    Closed(String),
    /// Stream name already in use
    #[error("stream {0} already exists")]
    Duplicate(String),
    /// No stream with this name
    #[error("stream {0} not found")]
    NotFound(String),
    /// Stream does not publish samples
    #[error("stream {0} is not a producer")]
    NotProducer(String),
    /// Endpoint management failed
    #[error(transparent)]
    Resource(#[from] ResourceError),
    /// Execution unit failed
    #[error(transparent)]
    Isolation(#[from] IsolationError),
}
