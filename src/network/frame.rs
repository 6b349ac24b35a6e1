// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{Message, LENGTH_FIELD_SIZE};
use crate::service::FrameError;
use crate::{AppError, AppResult};

/// One decoded frame together with the exact bytes it arrived as, length
/// prefix included, so it can be forwarded untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message: Message,
    raw: Bytes,
}

impl Frame {
    pub fn from_message(message: Message) -> Self {
        let raw = message.to_frame();
        Frame { message, raw }
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn into_raw(self) -> Bytes {
        self.raw
    }
}

/// Incremental frame decoder over a growing read buffer.
///
/// A frame whose declared length exceeds `max_frame_size` is reported once
/// as `FrameError::TooLarge` and its bytes are then skipped as they arrive,
/// without ever being buffered, so the stream stays aligned.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame_size: usize,
    discarding: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        FrameDecoder {
            max_frame_size,
            discarding: 0,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Bytes of an oversized frame still to be skipped.
    pub fn discarding(&self) -> usize {
        self.discarding
    }

    fn skip(&mut self, buffer: &mut BytesMut) {
        let n = self.discarding.min(buffer.remaining());
        buffer.advance(n);
        self.discarding -= n;
    }

    /// Ensures a complete frame sits at the head of the buffer and returns
    /// its payload length.
    pub fn check(&mut self, buffer: &mut BytesMut) -> Result<usize, FrameError> {
        if self.discarding > 0 {
            self.skip(buffer);
            if self.discarding > 0 {
                return Err(FrameError::Incomplete);
            }
        }
        if buffer.remaining() < LENGTH_FIELD_SIZE {
            return Err(FrameError::Incomplete);
        }
        let mut length_field = [0u8; LENGTH_FIELD_SIZE];
        length_field.copy_from_slice(&buffer[..LENGTH_FIELD_SIZE]);
        let frame_size = u32::from_be_bytes(length_field) as usize;
        if frame_size > self.max_frame_size {
            buffer.advance(LENGTH_FIELD_SIZE);
            self.discarding = frame_size;
            self.skip(buffer);
            return Err(FrameError::TooLarge {
                size: frame_size,
                max: self.max_frame_size,
            });
        }
        let total = LENGTH_FIELD_SIZE + frame_size;
        if buffer.remaining() < total {
            buffer.reserve(total - buffer.remaining());
            return Err(FrameError::Incomplete);
        }
        Ok(frame_size)
    }

    /// Peels one frame off the buffer. `Ok(None)` means more bytes are
    /// needed; an error consumes the offending frame and leaves the buffer
    /// positioned at whatever follows it.
    pub fn parse(&mut self, buffer: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self.check(buffer) {
            Ok(frame_size) => {
                let raw = buffer.split_to(LENGTH_FIELD_SIZE + frame_size).freeze();
                let message = Message::decode(raw.slice(LENGTH_FIELD_SIZE..))?;
                Ok(Some(Frame { message, raw }))
            }
            Err(FrameError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// `tokio-util` codec over the same framing, used by the dialing client.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    decoder: FrameDecoder,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        FrameCodec {
            decoder: FrameDecoder::new(max_frame_size),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> AppResult<Option<Message>> {
        Ok(self.decoder.parse(src)?.map(|frame| frame.message))
    }
}

impl<'a> Encoder<&'a Message> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: &'a Message, dst: &mut BytesMut) -> AppResult<()> {
        let size = item.encoded_len();
        if size > self.decoder.max_frame_size() {
            return Err(FrameError::TooLarge {
                size,
                max: self.decoder.max_frame_size(),
            }
            .into());
        }
        item.encode_frame(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;
    use crate::protocol::MessageType;

    fn chat(body: &'static str) -> Message {
        Message::new(MessageType::Chat, &b"h"[..], body.as_bytes())
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut decoder = FrameDecoder::new(1024);
        let frame = chat("hello").to_frame();
        let mut buffer = BytesMut::from(&frame[..3]);
        assert_eq!(decoder.parse(&mut buffer).unwrap(), None);
        buffer.put_slice(&frame[3..frame.len() - 1]);
        assert_eq!(decoder.parse(&mut buffer).unwrap(), None);
        buffer.put_slice(&frame[frame.len() - 1..]);
        let parsed = decoder.parse(&mut buffer).unwrap().unwrap();
        assert_eq!(parsed.message, chat("hello"));
        assert_eq!(parsed.raw(), &frame);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_oversize_frame_is_skipped() {
        let mut decoder = FrameDecoder::new(16);
        let mut buffer = BytesMut::new();
        buffer.put_u32(100);
        buffer.put_slice(&[0xAA; 10]);
        assert_eq!(
            decoder.parse(&mut buffer).unwrap_err(),
            FrameError::TooLarge { size: 100, max: 16 }
        );
        // nothing of the oversized frame is retained
        assert!(buffer.is_empty());
        assert_eq!(decoder.discarding(), 90);

        buffer.put_slice(&[0xAA; 90]);
        let good = chat("ok").to_frame();
        buffer.put_slice(&good);
        let parsed = decoder.parse(&mut buffer).unwrap().unwrap();
        assert_eq!(parsed.message, chat("ok"));
        assert_eq!(decoder.discarding(), 0);
    }

    #[test]
    fn test_malformed_envelope_consumes_only_that_frame() {
        let mut decoder = FrameDecoder::new(1024);
        let mut buffer = BytesMut::new();
        buffer.put_u32(2);
        buffer.put_slice(&[9, 9]);
        buffer.put_slice(&chat("next").to_frame());
        assert_eq!(
            decoder.parse(&mut buffer).unwrap_err(),
            FrameError::UnknownType(9)
        );
        let parsed = decoder.parse(&mut buffer).unwrap().unwrap();
        assert_eq!(parsed.message, chat("next"));
    }

    #[test]
    fn test_codec_rejects_oversize_encode() {
        let mut codec = FrameCodec::new(8);
        let mut dst = BytesMut::new();
        let err = codec.encode(&chat("too long body"), &mut dst).unwrap_err();
        assert!(err.is_frame_error());
        assert!(dst.is_empty());
    }
}
