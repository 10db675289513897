/*!
 * Fixed binary frames: `[opcode][length][payload; length][checksum]`.
 *
 * The checksum is the sum of every preceding byte modulo 256. Replies
 * acknowledge a command with the command opcode OR'ed with the codec's ack
 * bit, or refuse it with a NAK frame whose payload is `[opcode, reason]`.
 */
use bytes::{BufMut, BytesMut};

use super::{Codec, Framing};
use crate::error::CodecError;

/// Largest payload a one-byte length field can describe
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

/// One binary frame without its length and checksum bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Opcode
    pub opcode: u8,
    /// Payload bytes
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame
    pub fn new(opcode: u8, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }

    /// Create a frame with no payload
    pub fn bare(opcode: u8) -> Self {
        Self::new(opcode, Vec::new())
    }

    fn field(&self, offset: usize, len: usize, name: &str) -> Result<&[u8], CodecError> {
        self.payload.get(offset..offset + len).ok_or_else(|| {
            CodecError::Malformed(format!(
                "{} needs bytes {}..{} of a {} byte payload",
                name,
                offset,
                offset + len,
                self.payload.len()
            ))
        })
    }

    /// Big-endian u8 at `offset`
    pub fn u8_at(&self, offset: usize, name: &str) -> Result<u8, CodecError> {
        Ok(self.field(offset, 1, name)?[0])
    }

    /// Big-endian i16 at `offset`
    pub fn i16_at(&self, offset: usize, name: &str) -> Result<i16, CodecError> {
        let b = self.field(offset, 2, name)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    /// Big-endian i32 at `offset`
    pub fn i32_at(&self, offset: usize, name: &str) -> Result<i32, CodecError> {
        let b = self.field(offset, 4, name)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Sum of bytes modulo 256
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Codec for checksummed binary frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryCodec {
    /// Bit set on the opcode of an acknowledgement
    pub ack_bit: u8,
    /// Opcode of a refusal frame
    pub nak_opcode: u8,
}

impl Default for BinaryCodec {
    fn default() -> Self {
        Self {
            ack_bit: 0x80,
            nak_opcode: 0x7F,
        }
    }
}

impl BinaryCodec {
    /// Whether a decoded reply is a refusal, and if so its reason code
    pub fn nak_reason(&self, reply: &Frame) -> Option<u8> {
        (reply.opcode == self.nak_opcode).then(|| reply.payload.get(1).copied().unwrap_or(0))
    }

    /// Encode a frame to bytes (also used by device simulators for replies)
    pub fn frame_bytes(frame: &Frame) -> Result<Vec<u8>, CodecError> {
        if frame.payload.len() > MAX_PAYLOAD {
            return Err(CodecError::Malformed(format!(
                "payload of {} bytes exceeds {}",
                frame.payload.len(),
                MAX_PAYLOAD
            )));
        }
        let mut buf = BytesMut::with_capacity(frame.payload.len() + 3);
        buf.put_u8(frame.opcode);
        buf.put_u8(frame.payload.len() as u8);
        buf.put_slice(&frame.payload);
        let sum = checksum(&buf);
        buf.put_u8(sum);
        Ok(buf.to_vec())
    }

    /// Parse raw bytes into a frame, verifying checksum then length
    pub fn parse(raw: &[u8]) -> Result<Frame, CodecError> {
        if raw.len() < 3 {
            return Err(CodecError::Malformed(format!(
                "frame of {} bytes is shorter than header and checksum",
                raw.len()
            )));
        }
        let (body, trailer) = raw.split_at(raw.len() - 1);
        let computed = checksum(body);
        if computed != trailer[0] {
            return Err(CodecError::ChecksumMismatch {
                computed,
                received: trailer[0],
            });
        }

        let declared = body[1] as usize;
        let payload = &body[2..];
        if payload.len() != declared {
            return Err(CodecError::Malformed(format!(
                "length byte says {} but payload has {}",
                declared,
                payload.len()
            )));
        }

        Ok(Frame::new(body[0], payload.to_vec()))
    }
}

impl Codec for BinaryCodec {
    type Command = Frame;
    type Reply = Frame;

    fn encode(&self, command: &Frame) -> Result<Vec<u8>, CodecError> {
        Self::frame_bytes(command)
    }

    fn decode(&self, command: &Frame, raw: &[u8]) -> Result<Frame, CodecError> {
        let reply = Self::parse(raw)?;
        let expected = command.opcode | self.ack_bit;
        if reply.opcode != expected && reply.opcode != self.nak_opcode {
            return Err(CodecError::UnexpectedEcho {
                expected: format!("{:#04x}", expected),
                actual: format!("{:#04x}", reply.opcode),
            });
        }
        if reply.opcode == self.nak_opcode && reply.payload.first() != Some(&command.opcode) {
            return Err(CodecError::UnexpectedEcho {
                expected: format!("NAK for {:#04x}", command.opcode),
                actual: format!("NAK for {:?}", reply.payload.first()),
            });
        }
        Ok(reply)
    }

    fn framing(&self) -> Framing {
        Framing::LengthPrefixed {
            header: 2,
            length_at: 1,
            trailer: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let bytes = BinaryCodec::default()
            .encode(&Frame::new(0x10, vec![0x00, 0x00, 0x07, 0xD0]))
            .unwrap();
        assert_eq!(bytes, vec![0x10, 0x04, 0x00, 0x00, 0x07, 0xD0, 0xEB]);
    }

    #[test]
    fn test_decode_ack() {
        let codec = BinaryCodec::default();
        let reply = BinaryCodec::frame_bytes(&Frame::new(0x82, vec![1, 2])).unwrap();
        let frame = codec.decode(&Frame::bare(0x02), &reply).unwrap();
        assert_eq!(frame.payload, vec![1, 2]);
        assert_eq!(codec.nak_reason(&frame), None);
    }

    #[test]
    fn test_dropped_byte_is_checksum_mismatch() {
        let codec = BinaryCodec::default();
        let mut reply = BinaryCodec::frame_bytes(&Frame::new(0x90, vec![0, 0, 7, 0xD0])).unwrap();
        reply.remove(4);
        assert!(matches!(
            codec.decode(&Frame::bare(0x10), &reply),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_length_checked_after_checksum() {
        // Valid checksum over a frame whose length byte lies
        let mut raw = vec![0x82, 0x05, 0x01];
        raw.push(checksum(&raw));
        assert!(matches!(BinaryCodec::parse(&raw), Err(CodecError::Malformed(_))));
        assert!(matches!(BinaryCodec::parse(&[0x82]), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_wrong_opcode_is_unexpected_echo() {
        let codec = BinaryCodec::default();
        let reply = BinaryCodec::frame_bytes(&Frame::bare(0x81)).unwrap();
        assert!(matches!(
            codec.decode(&Frame::bare(0x02), &reply),
            Err(CodecError::UnexpectedEcho { .. })
        ));
    }

    #[test]
    fn test_nak() {
        let codec = BinaryCodec::default();
        let reply = BinaryCodec::frame_bytes(&Frame::new(0x7F, vec![0x10, 0x03])).unwrap();
        let frame = codec.decode(&Frame::bare(0x10), &reply).unwrap();
        assert_eq!(codec.nak_reason(&frame), Some(0x03));
    }

    #[test]
    fn test_field_accessors() {
        let frame = Frame::new(0x82, vec![0x00, 0x00, 0x03, 0xE8, 0x01, 0xFF, 0x38]);
        assert_eq!(frame.i32_at(0, "position").unwrap(), 1000);
        assert_eq!(frame.u8_at(4, "moving").unwrap(), 1);
        assert_eq!(frame.i16_at(5, "temperature").unwrap(), -200);
        assert!(matches!(frame.i32_at(4, "position"), Err(CodecError::Malformed(_))));
    }
}
