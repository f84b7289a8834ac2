//! Embedded frame header (RDH) codec and validation.
//!
//! Each DMA-written page starts with a fixed 16-byte header and may chain
//! further headers through `offset_next_packet`. The layout is
//! little-endian:
//!
//! ```text
//! offset  field                width
//! 0       version              u8
//! 1       header_size          u8     bytes, multiple of 4
//! 2       block_length         u16    payload bytes after this header
//! 4       offset_next_packet   u16    bytes to the next header, 0 = end
//! 6       cru_id               u16    equipment id source
//! 8       link_id              u8     [0, MAX_LINKS) or 0xFF
//! 9       packet_counter       u8     per-link mod-256 counter
//! 10      hb_orbit             u32    heartbeat-orbit counter
//! 14      (padding)            2 bytes
//! ```
//!
//! Validation never touches the payload; the producer walks the chain with
//! [`RdhHeader::decode`] + [`RdhHeader::validate`] and stops a page at the
//! first failure.

use crate::data::{MAX_LINKS, UNDEFINED_LINK};
use thiserror::Error;

/// Size of the on-wire header record in bytes.
pub const RDH_SIZE: usize = 16;

/// Header format versions accepted by the validator.
pub const RDH_VERSIONS: &[u8] = &[6, 7];

/// Largest `header_size` accepted by the validator.
const MAX_HEADER_SIZE: u8 = 128;

/// Validation failure for one embedded frame header.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdhError {
    #[error("unknown header version {0}")]
    UnknownVersion(u8),
    #[error("header size {0} out of bounds")]
    BadHeaderSize(u8),
    #[error("link id {0} out of range")]
    BadLinkId(u8),
    #[error("offset to next packet {offset} smaller than header size {header_size}")]
    BadNextOffset { offset: u16, header_size: u8 },
}

/// Decoded embedded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdhHeader {
    pub version: u8,
    pub header_size: u8,
    pub block_length: u16,
    pub offset_next_packet: u16,
    pub cru_id: u16,
    pub link_id: u8,
    pub packet_counter: u8,
    pub hb_orbit: u32,
}

impl RdhHeader {
    /// Decode a header from the start of `data`.
    ///
    /// Returns `None` when fewer than [`RDH_SIZE`] bytes remain; the fields
    /// are not validated, call [`validate`](Self::validate) next.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < RDH_SIZE {
            return None;
        }
        Some(Self {
            version: data[0],
            header_size: data[1],
            block_length: u16::from_le_bytes([data[2], data[3]]),
            offset_next_packet: u16::from_le_bytes([data[4], data[5]]),
            cru_id: u16::from_le_bytes([data[6], data[7]]),
            link_id: data[8],
            packet_counter: data[9],
            hb_orbit: u32::from_le_bytes([data[10], data[11], data[12], data[13]]),
        })
    }

    /// Encode this header into the first [`RDH_SIZE`] bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`RDH_SIZE`].
    pub fn encode_into(&self, buf: &mut [u8]) {
        assert!(buf.len() >= RDH_SIZE, "buffer too small for frame header");
        buf[0] = self.version;
        buf[1] = self.header_size;
        buf[2..4].copy_from_slice(&self.block_length.to_le_bytes());
        buf[4..6].copy_from_slice(&self.offset_next_packet.to_le_bytes());
        buf[6..8].copy_from_slice(&self.cru_id.to_le_bytes());
        buf[8] = self.link_id;
        buf[9] = self.packet_counter;
        buf[10..14].copy_from_slice(&self.hb_orbit.to_le_bytes());
        buf[14] = 0;
        buf[15] = 0;
    }

    /// Check the structural rules a well-formed header must satisfy.
    ///
    /// Whether `offset_next_packet` stays within the page is the caller's
    /// check; this function only knows the header itself.
    pub fn validate(&self) -> Result<(), RdhError> {
        if !RDH_VERSIONS.contains(&self.version) {
            return Err(RdhError::UnknownVersion(self.version));
        }
        if self.header_size < RDH_SIZE as u8
            || self.header_size > MAX_HEADER_SIZE
            || self.header_size % 4 != 0
        {
            return Err(RdhError::BadHeaderSize(self.header_size));
        }
        if self.link_id >= MAX_LINKS && self.link_id != UNDEFINED_LINK {
            return Err(RdhError::BadLinkId(self.link_id));
        }
        if self.offset_next_packet != 0 && self.offset_next_packet < self.header_size as u16 {
            return Err(RdhError::BadNextOffset {
                offset: self.offset_next_packet,
                header_size: self.header_size,
            });
        }
        Ok(())
    }
}

/// Render up to `max` bytes of `data` as 32-bit hex words for error logs.
pub fn hex_dump(data: &[u8], max: usize) -> String {
    let mut out = String::new();
    for (i, chunk) in data[..data.len().min(max)].chunks(4).enumerate() {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:08X}", u32::from_le_bytes(word)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RdhHeader {
        RdhHeader {
            version: 6,
            header_size: RDH_SIZE as u8,
            block_length: 1024,
            offset_next_packet: 1040,
            cru_id: 3,
            link_id: 2,
            packet_counter: 9,
            hb_orbit: 0xDEAD_BEEF,
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let h = sample();
        let mut buf = [0u8; RDH_SIZE];
        h.encode_into(&mut buf);
        let back = RdhHeader::decode(&buf).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn test_decode_short_buffer() {
        assert!(RdhHeader::decode(&[0u8; RDH_SIZE - 1]).is_none());
    }

    #[test]
    fn test_validate_accepts_sample() {
        assert_eq!(sample().validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_unknown_version() {
        let mut h = sample();
        h.version = 1;
        assert_eq!(h.validate(), Err(RdhError::UnknownVersion(1)));
    }

    #[test]
    fn test_validate_rejects_bad_header_size() {
        let mut h = sample();
        h.header_size = 18; // not a multiple of 4
        assert!(matches!(h.validate(), Err(RdhError::BadHeaderSize(18))));
        h.header_size = 8; // below the record size
        assert!(matches!(h.validate(), Err(RdhError::BadHeaderSize(8))));
    }

    #[test]
    fn test_validate_rejects_bad_link() {
        let mut h = sample();
        h.link_id = MAX_LINKS;
        assert_eq!(h.validate(), Err(RdhError::BadLinkId(MAX_LINKS)));
        h.link_id = UNDEFINED_LINK;
        assert_eq!(h.validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_short_next_offset() {
        let mut h = sample();
        h.offset_next_packet = 8;
        assert!(matches!(h.validate(), Err(RdhError::BadNextOffset { .. })));
        h.offset_next_packet = 0; // chain terminator is fine
        assert_eq!(h.validate(), Ok(()));
    }

    #[test]
    fn test_hex_dump_groups_words() {
        let data = [0x01, 0x00, 0x00, 0x00, 0xFF, 0x00, 0x00, 0x00];
        assert_eq!(hex_dump(&data, 8), "00000001 000000FF");
    }
}
