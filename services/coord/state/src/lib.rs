//! Coordination phase state machine, node roster, and heartbeat bookkeeping for coord.
//!
//! [`CoordinationState`] is the single owner of a node's view of the
//! coordination network. Every mutation goes through its methods, and
//! listeners registered through [`StateEventHandler`] are notified only after
//! the mutation has been committed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod event;
pub mod phase;
pub mod state;

pub use error::StateError;
pub use event::StateEventHandler;
pub use phase::CoordinationPhase;
pub use state::{CoordinationState, StateSnapshot};
