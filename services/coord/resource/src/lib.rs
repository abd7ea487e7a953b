//! Transport capability, in-memory transport, and endpoint lifetime management for coord.
//!
//! The coordination engine never talks to a concrete pub/sub system. It
//! consumes the narrow [`Transport`] capability (publish, discover, open,
//! continuous resolution) and leaves the lifetime of every handle it obtains
//! to the [`ResourceManager`]:
//!
//! - [`Outlet`]: publishing end of a stream
//! - [`Inlet`]: subscribing end of a stream
//! - [`Resolver`]: long-lived discovery handle
//!
//! [`backend::MemoryTransport`] implements the capability in-process for
//! tests and local simulations.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod manager;
pub mod transport;

use thiserror::Error;

pub use manager::{
    ManagedResource, ResourceEvent, ResourceId, ResourceKind, ResourceManager, ResourceState,
    ResourceUsage,
};
pub use transport::{
    DiscoveryFilter, Inlet, Outlet, Resolver, StreamDescriptor, Transport, COORDINATION_STREAM_TYPE,
};

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Handle was closed (locally or by the remote end)
    #[error("handle closed")]
    Closed,
    /// No stream with this uid is published
    #[error("stream not found: {0}")]
    NotFound(String),
    /// A stream with this uid is already published
    #[error("stream already published: {0}")]
    Duplicate(String),
    /// Backend-specific error
    #[error("transport error: {0}")]
    Backend(String),
}

/// Resource manager errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// A live resource already uses this id
    #[error("resource already exists: {0}")]
    Duplicate(String),
    /// No resource with this id
    #[error("resource not found: {0}")]
    NotFound(String),
    /// Resource exists but is of a different kind
    #[error("resource {id} is a {actual}, expected a {expected}")]
    WrongKind {
        /// Resource id
        id: String,
        /// Kind the operation needs
        expected: ResourceKind,
        /// Kind actually registered
        actual: ResourceKind,
    },
    /// Requested state change is not part of the lifecycle
    #[error("resource {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Resource id
        id: String,
        /// Current state
        from: ResourceState,
        /// Requested state
        to: ResourceState,
    },
    /// Discovery finished without any matching stream
    #[error("no stream matched {0}")]
    NoMatch(String),
    /// Creating the underlying handle failed
    #[error("failed to create {id}: {source}")]
    Creation {
        /// Resource id
        id: String,
        /// Transport failure
        #[source]
        source: TransportError,
    },
    /// Operating on the underlying handle failed
    #[error("transport failure on {id}: {source}")]
    Transport {
        /// Resource id
        id: String,
        /// Transport failure
        #[source]
        source: TransportError,
    },
}
