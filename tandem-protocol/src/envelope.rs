//! Binary envelope for carrying frames over byte-stream connections.
//!
//! Envelope layout (18 bytes header + header extension + payload):
//!
//! ```text
//! +--------+---------+--------+------------+-------------+--------+
//! | magic  | version | flags  | header_len | payload_len | crc32c |
//! | 4 bytes| 2 bytes |2 bytes |  2 bytes   |   4 bytes   | 4 bytes|
//! +--------+---------+--------+------------+-------------+--------+
//! | frame header (JSON) | payload                                 |
//! | header_len bytes    | payload_len bytes                       |
//! +---------------------+-----------------------------------------+
//! ```
//!
//! The checksum covers the header extension followed by the payload.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes identifying tandem envelopes: "TNDM"
pub const MAGIC: [u8; 4] = *b"TNDM";

/// Size of the fixed envelope header in bytes (4+2+2+2+4+4 = 18).
pub const ENVELOPE_HEADER_SIZE: usize = 18;

/// Envelope flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvelopeFlags(u16);

impl EnvelopeFlags {
    /// CRC32C checksum is present and valid.
    pub const CRC_PRESENT: u16 = 1 << 0;

    const VALID_V1_MASK: u16 = Self::CRC_PRESENT;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_crc(mut self) -> Self {
        self.0 |= Self::CRC_PRESENT;
        self
    }

    pub fn has_crc(&self) -> bool {
        self.0 & Self::CRC_PRESENT != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_V1_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// A raw envelope: opaque header bytes plus opaque payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub version: u16,
    pub flags: EnvelopeFlags,
    pub header: Bytes,
    pub payload: Bytes,
}

fn checksum(header: &[u8], payload: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(header), payload)
}

impl Envelope {
    pub fn new(header: Bytes, payload: Bytes) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            flags: EnvelopeFlags::new().with_crc(),
            header,
            payload,
        }
    }

    /// Encodes the envelope into `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.header.len() > u16::MAX as usize {
            return Err(ProtocolError::HeaderTooLarge {
                size: self.header.len(),
                max: u16::MAX as usize,
            });
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: u32::try_from(self.payload.len()).unwrap_or(u32::MAX),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        buf.reserve(ENVELOPE_HEADER_SIZE + self.header.len() + self.payload.len());
        buf.put_slice(&MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.flags.bits());
        buf.put_u16(self.header.len() as u16);
        buf.put_u32(self.payload.len() as u32);
        let crc = if self.flags.has_crc() {
            checksum(&self.header, &self.payload)
        } else {
            0
        };
        buf.put_u32(crc);
        buf.put_slice(&self.header);
        buf.put_slice(&self.payload);
        Ok(())
    }

    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decodes one envelope from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched if more data is needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < ENVELOPE_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if version != crate::PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags = EnvelopeFlags::from_bits(u16::from_be_bytes([buf[6], buf[7]]))?;
        let header_len = u16::from_be_bytes([buf[8], buf[9]]) as usize;
        let payload_len = u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]);
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let crc_expected = u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]);

        let total_len = ENVELOPE_HEADER_SIZE + header_len + payload_len as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        buf.advance(ENVELOPE_HEADER_SIZE);
        let header = buf.split_to(header_len).freeze();
        let payload = buf.split_to(payload_len as usize).freeze();

        if flags.has_crc() {
            let crc_actual = checksum(&header, &payload);
            if crc_actual != crc_expected {
                return Err(ProtocolError::CrcMismatch {
                    expected: crc_expected,
                    actual: crc_actual,
                });
            }
        }

        Ok(Some(Self {
            version,
            flags,
            header,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::new(Bytes::from_static(b"{\"h\":1}"), Bytes::from_static(b"[1,2,3]"))
    }

    #[test]
    fn test_envelope_roundtrip() {
        let mut buf = sample().encode().unwrap();
        let decoded = Envelope::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, sample());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_crc_covers_header() {
        let mut buf = sample().encode().unwrap();
        buf[ENVELOPE_HEADER_SIZE] ^= 0xFF;
        let result = Envelope::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::CrcMismatch { .. })));
    }

    #[test]
    fn test_crc_covers_payload() {
        let mut buf = sample().encode().unwrap();
        let len = buf.len();
        buf[len - 1] ^= 0xFF;
        let result = Envelope::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::CrcMismatch { .. })));
    }

    #[test]
    fn test_without_crc() {
        let mut envelope = sample();
        envelope.flags = EnvelopeFlags::new();
        let mut buf = envelope.encode().unwrap();
        let len = buf.len();
        buf[len - 1] = b'}';
        let decoded = Envelope::decode(&mut buf).unwrap().unwrap();
        assert!(!decoded.flags.has_crc());
        assert_eq!(decoded.payload.as_ref(), b"[1,2,3}");
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf =
            BytesMut::from(&b"BADX\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Envelope::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::InvalidMagic(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf =
            BytesMut::from(&b"TNDM\x00\x63\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Envelope::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(99))));
    }

    #[test]
    fn test_invalid_flags() {
        let result = EnvelopeFlags::from_bits(0x0100);
        assert!(matches!(result, Err(ProtocolError::InvalidFlags(0x0100))));

        // Only the checksum bit is defined.
        let result = EnvelopeFlags::from_bits(0x0002);
        assert!(matches!(result, Err(ProtocolError::InvalidFlags(0x0002))));
        assert!(EnvelopeFlags::from_bits(EnvelopeFlags::CRC_PRESENT).unwrap().has_crc());
    }

    #[test]
    fn test_incomplete_envelope() {
        let full = sample().encode().unwrap();

        let mut buf = BytesMut::from(&full[..10]);
        assert!(Envelope::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 10);

        let mut buf = BytesMut::from(&full[..full.len() - 1]);
        assert!(Envelope::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), full.len() - 1);
    }

    #[test]
    fn test_payload_too_large() {
        let envelope = Envelope::new(
            Bytes::new(),
            Bytes::from(vec![0u8; (MAX_PAYLOAD_SIZE + 1) as usize]),
        );
        assert!(matches!(
            envelope.encode(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_header_too_large() {
        let envelope = Envelope::new(Bytes::from(vec![b' '; 70_000]), Bytes::new());
        assert!(matches!(
            envelope.encode(),
            Err(ProtocolError::HeaderTooLarge { size: 70_000, .. })
        ));
    }

    #[test]
    fn test_multiple_envelopes_in_buffer() {
        let first = Envelope::new(Bytes::from_static(b"a"), Bytes::from_static(b"1"));
        let second = Envelope::new(Bytes::from_static(b"b"), Bytes::from_static(b"2"));

        let mut buf = BytesMut::new();
        first.encode_into(&mut buf).unwrap();
        second.encode_into(&mut buf).unwrap();

        assert_eq!(Envelope::decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(Envelope::decode(&mut buf).unwrap().unwrap(), second);
        assert!(Envelope::decode(&mut buf).unwrap().is_none());
    }
}
