//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Incomplete frame (need more data)
    #[error("incomplete frame")]
    Incomplete,

    /// Frame does not start with the coordination magic
    #[error("bad frame magic")]
    Magic,

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Reserved bits nonzero
    #[error("reserved bits nonzero")]
    Reserved,

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Body checksum mismatch
    #[error("body checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum {
        /// Checksum carried in the header
        expected: u32,
        /// Checksum computed over the received body
        actual: u32,
    },

    /// CBOR body could not be encoded or decoded
    #[error("cbor body invalid: {0}")]
    Cbor(String),

    /// Structural map has no `type` discriminator
    #[error("missing type discriminator")]
    MissingType,

    /// Unknown message type discriminator
    #[error("unknown type {0}")]
    UnknownType(String),

    /// Structural map does not match the variant named by its discriminator
    #[error("malformed message: {0}")]
    Malformed(String),
}
