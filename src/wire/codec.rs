//! Two-stage framing pipeline.
//!
//! Stage 1 is a `LengthDelimitedCodec` with a 3-byte big-endian length
//! prefix; stage 2 decodes/encodes complete chunks as [`Frame`]s. The
//! stage order is structural: the length stage always wraps the frame
//! stage on the inbound path, and the encode path is its mirror.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::frame::{Frame, WireError};

/// Largest frame expressible with a u24 length prefix.
pub const MAX_FRAME_LEN: usize = (1 << 24) - 1;

/// Codec installed on every accepted connection.
pub struct FrameCodec {
    length: LengthDelimitedCodec,
    max_frame_len: usize,
}

impl FrameCodec {
    /// `max_frame_len` is clamped to what the 3-byte prefix can carry.
    pub fn new(max_frame_len: usize) -> Self {
        let max_frame_len = max_frame_len.min(MAX_FRAME_LEN);
        let length = LengthDelimitedCodec::builder()
            .length_field_length(3)
            .max_frame_length(max_frame_len)
            .new_codec();
        Self {
            length,
            max_frame_len,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        // Stage 1: wait for a complete length-delimited chunk.
        let chunk = match self.length.decode(src)? {
            Some(chunk) => chunk,
            None => return Ok(None),
        };
        // Stage 2: decode the chunk into a typed frame.
        Frame::decode(chunk.freeze()).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WireError> {
        let len = frame.encoded_len();
        if len > self.max_frame_len {
            return Err(WireError::Oversize {
                len,
                max: self.max_frame_len,
            });
        }
        let mut body = BytesMut::with_capacity(len);
        frame.encode(&mut body);
        self.length.encode(body.freeze(), dst)?;
        Ok(())
    }
}
