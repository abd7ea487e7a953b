//! Transport backends.

pub mod mem;

pub use mem::MemoryTransport;
