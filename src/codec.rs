//! tokio-util codec wrapping the frame format.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ConetError;
use crate::frame::{encode_frame, try_decode_frame, Frame};

/// Default maximum encoded frame size: 1 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1_048_576;

/// Frame codec for use with [`Framed`](tokio_util::codec::Framed).
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// A codec enforcing the given maximum frame size.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ConetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ConetError> {
        try_decode_frame(src, self.max_frame_size)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ConetError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), ConetError> {
        let bytes = encode_frame(&item, self.max_frame_size)?;
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageTypeId;

    #[test]
    fn codec_roundtrip() {
        let mut codec = FrameCodec::default();
        let frame = Frame::new(MessageTypeId::from_name("test.Codec"), vec![1, 2, 3]);

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn partial_input_yields_none() {
        let mut codec = FrameCodec::default();
        let frame = Frame::new(MessageTypeId::from_name("test.Codec"), vec![9; 100]);

        let mut full = BytesMut::new();
        codec.encode(frame, &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() / 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }
}
