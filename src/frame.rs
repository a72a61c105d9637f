//! Wire frame encoding and decoding.
//!
//! One frame carries exactly one registered payload:
//!
//! ```text
//! MAGIC (2B) | VER (1B) | TYPE (16B) | PAY_LEN (4B BE) | PAYLOAD | CRC16 (2B BE)
//! ```
//!
//! - **MAGIC**: `0x43 0x4f` ("CO")
//! - **VER**: protocol version (`0x01`)
//! - **TYPE**: the payload's [`MessageTypeId`] bytes
//! - **PAY_LEN**: big-endian payload length
//! - **CRC16**: checksum over TYPE | PAYLOAD

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Buf, BytesMut};
use crc_any::CRCu16;

use crate::error::{ConetError, Result};
use crate::message::MessageTypeId;

/// Protocol magic bytes ("CO").
pub const MAGIC: [u8; 2] = [0x43, 0x4f];
/// Protocol version.
pub const VERSION: u8 = 0x01;

/// Fixed header length: magic + version + type id + payload length.
const HEADER_LEN: usize = 2 + 1 + 16 + 4;
/// Trailing checksum length.
const CRC_LEN: usize = 2;

/// One encoded payload on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Wire id of the payload type.
    pub type_id: MessageTypeId,
    /// Raw encoded payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame from a type id and its encoded payload.
    pub fn new(type_id: MessageTypeId, payload: Vec<u8>) -> Self {
        Self { type_id, payload }
    }

    /// Total size of this frame once encoded.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + CRC_LEN
    }
}

fn checksum(type_id: &MessageTypeId, payload: &[u8]) -> u16 {
    let mut crc = CRCu16::crc16();
    crc.digest(type_id.as_bytes());
    crc.digest(payload);
    crc.get_crc()
}

/// Encode a frame to bytes.
pub fn encode_frame(frame: &Frame, max_frame_size: usize) -> Result<Vec<u8>> {
    if frame.encoded_len() > max_frame_size {
        return Err(ConetError::MessageTooLarge {
            size: frame.encoded_len(),
            max: max_frame_size,
        });
    }
    let mut buf = Vec::with_capacity(frame.encoded_len());
    buf.extend_from_slice(&MAGIC);
    buf.push(VERSION);
    buf.extend_from_slice(frame.type_id.as_bytes());
    buf.write_u32::<BigEndian>(frame.payload.len() as u32)
        .expect("write to Vec");
    buf.extend_from_slice(&frame.payload);
    buf.write_u16::<BigEndian>(checksum(&frame.type_id, &frame.payload))
        .expect("write to Vec");
    Ok(buf)
}

/// Try to decode one frame from the front of `src`.
///
/// Returns `Ok(None)` until a full frame is buffered. Malformed header or
/// checksum is an error; the buffer is left unusable for resynchronisation,
/// so callers should drop the stream.
pub fn try_decode_frame(src: &mut BytesMut, max_frame_size: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }

    let mut cur = Cursor::new(&src[..]);
    let mut magic = [0u8; 2];
    std::io::Read::read_exact(&mut cur, &mut magic)?;
    if magic != MAGIC {
        return Err(ConetError::Unmarshal(format!(
            "bad magic {:02x}{:02x}",
            magic[0], magic[1]
        )));
    }
    let version = cur.read_u8()?;
    if version != VERSION {
        return Err(ConetError::Unmarshal(format!(
            "unsupported version {version}"
        )));
    }
    let mut type_bytes = [0u8; 16];
    std::io::Read::read_exact(&mut cur, &mut type_bytes)?;
    let type_id = MessageTypeId::from_bytes(type_bytes);
    let pay_len = cur.read_u32::<BigEndian>()? as usize;

    let total = HEADER_LEN + pay_len + CRC_LEN;
    if total > max_frame_size {
        return Err(ConetError::MessageTooLarge {
            size: total,
            max: max_frame_size,
        });
    }
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    let mut data = src.split_to(total);
    data.advance(HEADER_LEN);
    let payload = data.split_to(pay_len).to_vec();
    let mut crc_cur = Cursor::new(&data[..]);
    let wire_crc = crc_cur.read_u16::<BigEndian>()?;
    if wire_crc != checksum(&type_id, &payload) {
        return Err(ConetError::Unmarshal("checksum mismatch".into()));
    }

    Ok(Some(Frame { type_id, payload }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024;

    fn sample() -> Frame {
        Frame::new(
            MessageTypeId::from_name("test.Sample"),
            b"some payload bytes".to_vec(),
        )
    }

    #[test]
    fn roundtrip() {
        let frame = sample();
        let bytes = encode_frame(&frame, MAX).unwrap();
        assert_eq!(bytes.len(), frame.encoded_len());

        let mut buf = BytesMut::from(&bytes[..]);
        let decoded = try_decode_frame(&mut buf, MAX).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_payload_roundtrip() {
        let frame = Frame::new(MessageTypeId::from_name("test.Empty"), Vec::new());
        let bytes = encode_frame(&frame, MAX).unwrap();
        let mut buf = BytesMut::from(&bytes[..]);
        assert_eq!(try_decode_frame(&mut buf, MAX).unwrap().unwrap(), frame);
    }

    #[test]
    fn short_buffer_wants_more() {
        let bytes = encode_frame(&sample(), MAX).unwrap();
        let mut buf = BytesMut::from(&bytes[..10]);
        assert!(try_decode_frame(&mut buf, MAX).unwrap().is_none());

        let mut buf = BytesMut::from(&bytes[..bytes.len() - 1]);
        assert!(try_decode_frame(&mut buf, MAX).unwrap().is_none());
    }

    #[test]
    fn two_frames_back_to_back() {
        let a = sample();
        let b = Frame::new(MessageTypeId::from_name("test.Other"), vec![7; 3]);
        let mut bytes = encode_frame(&a, MAX).unwrap();
        bytes.extend(encode_frame(&b, MAX).unwrap());

        let mut buf = BytesMut::from(&bytes[..]);
        assert_eq!(try_decode_frame(&mut buf, MAX).unwrap().unwrap(), a);
        assert_eq!(try_decode_frame(&mut buf, MAX).unwrap().unwrap(), b);
        assert!(try_decode_frame(&mut buf, MAX).unwrap().is_none());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = encode_frame(&sample(), MAX).unwrap();
        bytes[0] = 0xff;
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            try_decode_frame(&mut buf, MAX),
            Err(ConetError::Unmarshal(_))
        ));
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let frame = sample();
        let mut bytes = encode_frame(&frame, MAX).unwrap();
        let flip = HEADER_LEN + 2;
        bytes[flip] ^= 0x01;
        let mut buf = BytesMut::from(&bytes[..]);
        match try_decode_frame(&mut buf, MAX) {
            Err(ConetError::Unmarshal(msg)) => assert!(msg.contains("checksum")),
            other => panic!("expected checksum failure, got {other:?}"),
        }
    }

    #[test]
    fn oversized_frame_is_rejected_both_ways() {
        let big = Frame::new(MessageTypeId::from_name("test.Big"), vec![0; 2048]);
        assert!(matches!(
            encode_frame(&big, MAX),
            Err(ConetError::MessageTooLarge { .. })
        ));

        let bytes = encode_frame(&big, 4096).unwrap();
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            try_decode_frame(&mut buf, MAX),
            Err(ConetError::MessageTooLarge { .. })
        ));
    }
}
