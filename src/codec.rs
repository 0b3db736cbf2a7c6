use bytes::{Buf, BytesMut};
use std::io::Cursor;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::frame::{self, Frame};
use crate::Error;

/// Splits a byte stream into reply frames.
///
/// Used directly by the blocking connection and through `FramedRead` by the async one, so both
/// see exactly the same framing rules.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> FrameCodec {
        FrameCodec { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&src[..]);
        let frame = match Frame::parse(&mut cursor) {
            Ok(frame) => frame,
            Err(frame::Error::Incomplete) => {
                // Only an unfinished frame can keep growing, so that is where the limit applies.
                if src.len() > self.max_frame_size {
                    return Err(frame::Error::Invalid(format!(
                        "frame exceeds the limit of {} bytes",
                        self.max_frame_size
                    ))
                    .into());
                }
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let position = cursor.position() as usize;

        // Remove the parsed frame from the buffer.
        src.advance(position);

        trace!(bytes = position, "decoded reply frame");

        Ok(Some(frame))
    }
}
