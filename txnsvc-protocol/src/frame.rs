//! Binary frame format.
//!
//! Every message travels in one frame with a fixed 16-byte header:
//!
//! ```text
//! +--------+---------+--------+-------------+--------+---------------+
//! | magic  | version | flags  | payload_len | crc32c | payload       |
//! | 4 bytes| 2 bytes |2 bytes |   4 bytes   | 4 bytes| payload_len   |
//! +--------+---------+--------+-------------+--------+---------------+
//! ```
//!
//! All integers are big-endian. The payload is UTF-8 JSON.

use crate::error::ProtocolError;
use crate::{MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes opening every frame: "TXNS".
pub const MAGIC: [u8; 4] = *b"TXNS";

/// Size of the fixed frame header in bytes (4+2+2+4+4).
pub const FRAME_HEADER_SIZE: usize = 16;

/// Frame flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// The CRC32C field holds the payload checksum.
    pub const CRC_PRESENT: u16 = 1 << 0;

    const VALID_MASK: u16 = Self::CRC_PRESENT;

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
        if bits & !Self::VALID_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// A single protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub version: u16,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Creates a checksummed frame around `payload`.
    pub fn new(payload: Bytes) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: FrameFlags::new().with_crc(),
            payload,
        }
    }

    /// Creates a frame whose payload is `value` serialized as JSON.
    pub fn from_json<T: serde::Serialize>(value: &T) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(Bytes::from(payload)))
    }

    /// Serializes the frame, header first.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let size = u32::try_from(self.payload.len()).unwrap_or(u32::MAX);
        if size > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_slice(&MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.flags.bits());
        buf.put_u32(size);
        let crc = if self.flags.has_crc() {
            crc32c::crc32c(&self.payload)
        } else {
            0
        };
        buf.put_u32(crc);
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched while the frame is still
    /// incomplete. A complete frame is consumed from the buffer.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags = FrameFlags::from_bits(u16::from_be_bytes([buf[6], buf[7]]))?;

        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let payload_len = payload_len as usize;

        let crc_expected = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);

        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        if flags.has_crc() {
            let crc_actual = crc32c::crc32c(&payload);
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
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_frame_roundtrip() {
        let payload = Bytes::from(r#"{"type":"request","id":"1","op":"PING","params":{}}"#);
        let mut buf = Frame::new(payload.clone()).encode().unwrap();
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + payload.len());

        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert!(decoded.flags.has_crc());
        assert_eq!(decoded.payload, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_crc_validation() {
        let mut encoded = Frame::new(Bytes::from(r#"{"balance":500}"#))
            .encode()
            .unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        let result = Frame::decode(&mut encoded);
        assert!(matches!(result, Err(ProtocolError::CrcMismatch { .. })));
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf = BytesMut::from(&b"BADX\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Frame::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::InvalidMagic(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf = BytesMut::from(&b"TXNS\x00\x09\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Frame::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(9))));
    }

    #[test]
    fn test_oversized_length_rejected_before_buffering() {
        let mut buf = BytesMut::from(&b"TXNS\x00\x01\x00\x01\xFF\xFF\xFF\xFF\x00\x00\x00\x00"[..]);
        let result = Frame::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_frame_too_large_on_encode() {
        let huge = vec![0u8; MAX_PAYLOAD_SIZE as usize + 1];
        let result = Frame::new(Bytes::from(huge)).encode();
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_invalid_flags() {
        let result = FrameFlags::from_bits(0x0004);
        assert!(matches!(result, Err(ProtocolError::InvalidFlags(0x0004))));
    }

    #[test]
    fn test_frame_without_crc() {
        let mut frame = Frame::new(Bytes::from(r#"{"pong":true}"#));
        frame.flags = FrameFlags::new();

        let mut buf = frame.encode().unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(!decoded.flags.has_crc());
    }

    #[test]
    fn test_two_frames_in_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Frame::new(Bytes::from("1")).encode().unwrap());
        buf.extend_from_slice(&Frame::new(Bytes::from("2")).encode().unwrap());

        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap().payload, "1");
        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap().payload, "2");
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    proptest! {
        #[test]
        fn truncated_frames_wait_for_more_data(
            payload in proptest::collection::vec(any::<u8>(), 0..512),
            cut in 0usize..528,
        ) {
            let encoded = Frame::new(Bytes::from(payload)).encode().unwrap();
            let cut = cut.min(encoded.len().saturating_sub(1));
            let mut partial = BytesMut::from(&encoded[..cut]);

            prop_assert!(Frame::decode(&mut partial).unwrap().is_none());
            prop_assert_eq!(partial.len(), cut);
        }
    }
}
