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

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::service::FrameError;

///
/// Every header and body structure carried inside an envelope implements this.
/// Structures are encoded independently of the envelope, a caller decodes
/// them only after it has classified the envelope type.
///
/// All integers are big-endian; strings are a u32 byte count followed by UTF-8.
///
pub trait WireFormat: Sized {
    fn encode(&self, writer: &mut BytesMut);
    fn decode(buffer: &mut Bytes) -> Result<Self, FrameError>;
    fn wire_format_size(&self) -> usize;

    fn to_bytes(&self) -> Bytes {
        let mut writer = BytesMut::with_capacity(self.wire_format_size());
        self.encode(&mut writer);
        writer.freeze()
    }

    /// Decodes a whole buffer, trailing bytes are treated as corruption.
    fn from_bytes(mut buffer: Bytes) -> Result<Self, FrameError> {
        let value = Self::decode(&mut buffer)?;
        if buffer.has_remaining() {
            return Err(FrameError::Malformed(format!(
                "{} trailing bytes",
                buffer.remaining()
            )));
        }
        Ok(value)
    }
}

macro_rules! read_fixed {
    ($buffer:expr, $read_method:ident, $size:expr, $what:expr) => {{
        if $buffer.remaining() < $size {
            return Err(FrameError::Malformed(format!("can not read a {}", $what)));
        }
        Ok($buffer.$read_method())
    }};
}

pub fn read_u8(buffer: &mut Bytes) -> Result<u8, FrameError> {
    read_fixed!(buffer, get_u8, 1, "u8")
}

pub fn read_u32(buffer: &mut Bytes) -> Result<u32, FrameError> {
    read_fixed!(buffer, get_u32, 4, "u32")
}

pub fn read_i32(buffer: &mut Bytes) -> Result<i32, FrameError> {
    read_fixed!(buffer, get_i32, 4, "i32")
}

/// Reads a u32 length followed by that many bytes, sharing the buffer.
pub fn read_bytes(buffer: &mut Bytes) -> Result<Bytes, FrameError> {
    let len = read_u32(buffer)? as usize;
    if buffer.remaining() < len {
        return Err(FrameError::Malformed(format!(
            "declared {} bytes, only {} left",
            len,
            buffer.remaining()
        )));
    }
    Ok(buffer.split_to(len))
}

pub fn read_string(buffer: &mut Bytes) -> Result<String, FrameError> {
    let raw = read_bytes(buffer)?;
    String::from_utf8(raw.to_vec()).map_err(|e| FrameError::Malformed(e.to_string()))
}

pub fn write_bytes(writer: &mut BytesMut, value: &[u8]) {
    writer.put_u32(value.len() as u32);
    writer.put_slice(value);
}

pub fn write_string(writer: &mut BytesMut, value: &str) {
    write_bytes(writer, value.as_bytes());
}

pub fn string_size(value: &str) -> usize {
    4 + value.len()
}
