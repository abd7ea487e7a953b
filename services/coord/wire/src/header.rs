//! Fixed frame header for the wire protocol.
//!
//! Every frame starts with a 12-byte header that lets a reader validate the
//! frame and size its buffer before touching the CBOR body.

use crate::WireError;
use bytes::{Buf, BufMut, BytesMut};

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Frame marker
pub const FRAME_MAGIC: [u8; 2] = *b"CM";

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 12;

/// Largest accepted body (1 MiB)
pub const MAX_FRAME_BODY: usize = 1024 * 1024;

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version
    pub version: u8,
    /// Body length in bytes
    pub body_len: u32,
    /// CRC-32 of the body
    pub crc32: u32,
}

impl FrameHeader {
    /// Build a header describing `body`
    pub fn for_body(body: &[u8]) -> Self {
        Self {
            version: WIRE_VERSION,
            body_len: body.len() as u32,
            crc32: crc32fast::hash(body),
        }
    }

    /// Append the header to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&FRAME_MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(0);
        buf.put_u32(self.body_len);
        buf.put_u32(self.crc32);
    }

    /// Parse a header from the start of `buf` without consuming it
    pub fn parse(mut buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(WireError::Incomplete);
        }

        let mut magic = [0u8; 2];
        buf.copy_to_slice(&mut magic);
        if magic != FRAME_MAGIC {
            return Err(WireError::Magic);
        }

        let version = buf.get_u8();
        if version != WIRE_VERSION {
            return Err(WireError::Version(version));
        }

        if buf.get_u8() != 0 {
            return Err(WireError::Reserved);
        }

        let body_len = buf.get_u32();
        if body_len as usize > MAX_FRAME_BODY {
            return Err(WireError::Size(body_len as usize));
        }

        let crc32 = buf.get_u32();

        Ok(Self {
            version,
            body_len,
            crc32,
        })
    }

    /// Total frame length (header + body)
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.body_len as usize
    }

    /// Verify `body` against the checksum carried in the header
    pub fn verify(&self, body: &[u8]) -> Result<(), WireError> {
        let actual = crc32fast::hash(body);
        if actual != self.crc32 {
            return Err(WireError::Checksum {
                expected: self.crc32,
                actual,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let body = b"hello coordination";
        let header = FrameHeader::for_body(body);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), FRAME_HEADER_SIZE);

        let parsed = FrameHeader::parse(&buf).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.verify(body).is_ok());
        assert!(parsed.verify(b"tampered").is_err());
    }

    #[test]
    fn test_rejects_bad_magic_and_version() {
        let mut buf = BytesMut::new();
        FrameHeader::for_body(b"x").encode(&mut buf);

        let mut bad_magic = buf.clone();
        bad_magic[0] = b'X';
        assert!(matches!(FrameHeader::parse(&bad_magic), Err(WireError::Magic)));

        let mut bad_version = buf.clone();
        bad_version[2] = 9;
        assert!(matches!(
            FrameHeader::parse(&bad_version),
            Err(WireError::Version(9))
        ));

        let mut bad_reserved = buf;
        bad_reserved[3] = 1;
        assert!(matches!(
            FrameHeader::parse(&bad_reserved),
            Err(WireError::Reserved)
        ));
    }

    #[test]
    fn test_rejects_oversized_body() {
        let header = FrameHeader {
            version: WIRE_VERSION,
            body_len: (MAX_FRAME_BODY + 1) as u32,
            crc32: 0,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert!(matches!(FrameHeader::parse(&buf), Err(WireError::Size(_))));
    }
}
