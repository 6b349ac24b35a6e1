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

use super::metadata::StatusCode;
use super::primary_types::{read_i32, read_string, read_u8, string_size, write_string};
use super::WireFormat;
use crate::service::FrameError;

/// Fixed identity every client-to-server request is addressed to.
pub const SERVER_ADDRESS: &str = "server";

/// Head of a `Request` envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub source_address: String,
    pub destination_address: String,
}

impl RequestHeader {
    pub fn new(source_address: impl Into<String>) -> Self {
        RequestHeader {
            source_address: source_address.into(),
            destination_address: SERVER_ADDRESS.to_string(),
        }
    }
}

impl WireFormat for RequestHeader {
    fn encode(&self, writer: &mut BytesMut) {
        write_string(writer, &self.source_address);
        write_string(writer, &self.destination_address);
    }

    fn decode(buffer: &mut Bytes) -> Result<Self, FrameError> {
        Ok(RequestHeader {
            source_address: read_string(buffer)?,
            destination_address: read_string(buffer)?,
        })
    }

    fn wire_format_size(&self) -> usize {
        string_size(&self.source_address) + string_size(&self.destination_address)
    }
}

/// Head of a `Response` envelope. `operation` echoes the raw tag of the
/// request being answered, even when that tag was not understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    pub operation: u8,
    pub sequence: i32,
    pub status: StatusCode,
    pub destination_address: String,
}

impl WireFormat for ResponseHeader {
    fn encode(&self, writer: &mut BytesMut) {
        writer.put_u8(self.operation);
        writer.put_i32(self.sequence);
        writer.put_i32(self.status.as_i32());
        write_string(writer, &self.destination_address);
    }

    fn decode(buffer: &mut Bytes) -> Result<Self, FrameError> {
        let operation = read_u8(buffer)?;
        let sequence = read_i32(buffer)?;
        let status = StatusCode::from_i32(read_i32(buffer)?)?;
        Ok(ResponseHeader {
            operation,
            sequence,
            status,
            destination_address: read_string(buffer)?,
        })
    }

    fn wire_format_size(&self) -> usize {
        1 + 4 + 4 + string_size(&self.destination_address)
    }
}

/// Head of a `Chat` envelope. The destination is a user identity; the
/// router resolves it to a transport address through presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatHeader {
    pub source_address: String,
    pub source_user_id: String,
    pub destination_user_id: String,
}

impl ChatHeader {
    pub fn new(
        source_address: impl Into<String>,
        source_user_id: impl Into<String>,
        destination_user_id: impl Into<String>,
    ) -> Self {
        ChatHeader {
            source_address: source_address.into(),
            source_user_id: source_user_id.into(),
            destination_user_id: destination_user_id.into(),
        }
    }
}

impl WireFormat for ChatHeader {
    fn encode(&self, writer: &mut BytesMut) {
        write_string(writer, &self.source_address);
        write_string(writer, &self.source_user_id);
        write_string(writer, &self.destination_user_id);
    }

    fn decode(buffer: &mut Bytes) -> Result<Self, FrameError> {
        Ok(ChatHeader {
            source_address: read_string(buffer)?,
            source_user_id: read_string(buffer)?,
            destination_user_id: read_string(buffer)?,
        })
    }

    fn wire_format_size(&self) -> usize {
        string_size(&self.source_address)
            + string_size(&self.source_user_id)
            + string_size(&self.destination_user_id)
    }
}
