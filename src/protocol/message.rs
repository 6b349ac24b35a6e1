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

use bytes::{BufMut, Bytes, BytesMut};

use super::header::{ChatHeader, RequestHeader, ResponseHeader};
use super::metadata::ServerMetadata;
use super::primary_types::{read_bytes, read_u8, write_bytes};
use super::WireFormat;
use crate::service::FrameError;

/// Size of the big-endian length prefix in front of every envelope.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// `type` byte of the envelope; it decides how `head` must be decoded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Chat = 2,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::Response),
            2 => Ok(MessageType::Chat),
            invalid => Err(FrameError::UnknownType(invalid)),
        }
    }
}

/// The wire envelope: `type u8 | head_len u32 | head | body_len u32 | body`.
///
/// `head` and `body` stay opaque here. Decoding them is a second step that
/// callers perform with the typed accessors once they know the type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub head: Bytes,
    pub body: Bytes,
}

impl Message {
    pub fn new(msg_type: MessageType, head: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        Message {
            msg_type,
            head: head.into(),
            body: body.into(),
        }
    }

    pub fn request(header: &RequestHeader, metadata: &ServerMetadata) -> Self {
        Message::new(MessageType::Request, header.to_bytes(), metadata.to_bytes())
    }

    pub fn response(header: &ResponseHeader, body: impl Into<Bytes>) -> Self {
        Message::new(MessageType::Response, header.to_bytes(), body)
    }

    pub fn chat(header: &ChatHeader, body: impl Into<Bytes>) -> Self {
        Message::new(MessageType::Chat, header.to_bytes(), body)
    }

    fn expect_type(&self, expected: MessageType) -> Result<(), FrameError> {
        if self.msg_type != expected {
            return Err(FrameError::Malformed(format!(
                "expected a {:?} head, message is {:?}",
                expected, self.msg_type
            )));
        }
        Ok(())
    }

    pub fn request_header(&self) -> Result<RequestHeader, FrameError> {
        self.expect_type(MessageType::Request)?;
        RequestHeader::from_bytes(self.head.clone())
    }

    pub fn response_header(&self) -> Result<ResponseHeader, FrameError> {
        self.expect_type(MessageType::Response)?;
        ResponseHeader::from_bytes(self.head.clone())
    }

    pub fn chat_header(&self) -> Result<ChatHeader, FrameError> {
        self.expect_type(MessageType::Chat)?;
        ChatHeader::from_bytes(self.head.clone())
    }

    pub fn metadata(&self) -> Result<ServerMetadata, FrameError> {
        self.expect_type(MessageType::Request)?;
        ServerMetadata::from_bytes(self.body.clone())
    }

    /// Envelope size, without the length prefix.
    pub fn encoded_len(&self) -> usize {
        1 + 4 + self.head.len() + 4 + self.body.len()
    }

    pub fn encode(&self, writer: &mut BytesMut) {
        writer.reserve(self.encoded_len());
        writer.put_u8(self.msg_type as u8);
        write_bytes(writer, &self.head);
        write_bytes(writer, &self.body);
    }

    /// Writes the length prefix followed by the envelope.
    pub fn encode_frame(&self, writer: &mut BytesMut) {
        writer.reserve(LENGTH_FIELD_SIZE + self.encoded_len());
        writer.put_u32(self.encoded_len() as u32);
        self.encode(writer);
    }

    pub fn to_frame(&self) -> Bytes {
        let mut writer = BytesMut::with_capacity(LENGTH_FIELD_SIZE + self.encoded_len());
        self.encode_frame(&mut writer);
        writer.freeze()
    }

    /// Decodes one envelope, `payload` must be exactly the bytes that
    /// followed the length prefix. `head` and `body` share its storage.
    pub fn decode(mut payload: Bytes) -> Result<Message, FrameError> {
        let msg_type = MessageType::from_u8(read_u8(&mut payload)?)?;
        let head = read_bytes(&mut payload)?;
        let body = read_bytes(&mut payload)?;
        if !payload.is_empty() {
            return Err(FrameError::Malformed(format!(
                "{} bytes after envelope body",
                payload.len()
            )));
        }
        Ok(Message {
            msg_type,
            head,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_layout() {
        let message = Message::new(MessageType::Chat, &b"hd"[..], &b"xyz"[..]);
        let frame = message.to_frame();
        assert_eq!(
            &frame[..],
            &[
                0, 0, 0, 14, // frame length
                2, // type
                0, 0, 0, 2, b'h', b'd', // head
                0, 0, 0, 3, b'x', b'y', b'z', // body
            ]
        );
        let decoded = Message::decode(frame.slice(LENGTH_FIELD_SIZE..)).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_decode_unknown_type() {
        let payload = Bytes::from_static(&[7, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            Message::decode(payload).unwrap_err(),
            FrameError::UnknownType(7)
        );
    }

    #[test]
    fn test_decode_head_overrun() {
        let payload = Bytes::from_static(&[0, 0, 0, 0, 20, 1, 2]);
        assert!(matches!(
            Message::decode(payload),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_typed_head_accessors() {
        let header = ChatHeader::new("127.0.0.1:1", "a", "b");
        let message = Message::chat(&header, "hello");
        assert_eq!(message.chat_header().unwrap(), header);
        assert!(message.request_header().is_err());
        assert!(message.metadata().is_err());

        let request = Message::request(
            &RequestHeader::new("127.0.0.1:1"),
            &ServerMetadata::login("a", "pw"),
        );
        assert_eq!(request.metadata().unwrap(), ServerMetadata::login("a", "pw"));
    }
}
