//! Coordination state errors.

use thiserror::Error;

/// Errors raised by roster mutations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The local node can never be part of its own roster
    #[error("node {0} is the local node")]
    LocalNode(String),

    /// State is being torn down
    #[error("coordination state is disposing")]
    Disposing,
}
