//! Control/data plane isolation, supervised execution units, and stream lifecycle for coord.
//!
//! Work runs in independent execution units of two disjoint categories:
//!
//! - **Control plane**: coordination heartbeats, elections, roster upkeep.
//!   Low frequency.
//! - **Data plane**: one unit per active stream moving samples. High
//!   frequency and latency sensitive.
//!
//! The [`LayerRegistry`] guarantees that no unit id is ever registered in both
//! categories at once. Units talk to their owner only through an inbound and
//! an outbound channel, and are restarted by [`spawn_supervised`] according to
//! a [`RecoveryPolicy`] when they fault.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod recovery;
pub mod registry;
pub mod stream;
pub mod unit;
pub mod worker;

pub use error::{IsolateError, IsolationError, StreamError};
pub use recovery::{ErrorWindow, RecoveryDecision, RecoveryPolicy, RecoveryTracker};
pub use registry::{Layer, LayerRegistry, Registration};
pub use stream::{StreamLifecycle, StreamState};
pub use unit::{spawn_supervised, UnitHandle, UnitStatus, UnitWorker};
pub use worker::{
    StreamCommand, StreamHandle, StreamOp, StreamRegistry, StreamReport, StreamWorker,
    DATA_STREAM_TYPE,
};
