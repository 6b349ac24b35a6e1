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

use super::primary_types::{read_string, read_u32, read_u8, string_size, write_string};
use super::WireFormat;
use crate::service::FrameError;
use crate::{AppError, AppResult};

/// Server-bound operations carried in the body of a `Request` envelope.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    Register = 1,
    Login = 2,
    Logout = 3,
    Delete = 4,
    SearchFriend = 5,
    MakeFriend = 6,
    DeleteFriend = 7,
    ListFriend = 8,
}

impl Operation {
    pub fn from_u8(value: u8) -> AppResult<Self> {
        match value {
            1 => Ok(Operation::Register),
            2 => Ok(Operation::Login),
            3 => Ok(Operation::Logout),
            4 => Ok(Operation::Delete),
            5 => Ok(Operation::SearchFriend),
            6 => Ok(Operation::MakeFriend),
            7 => Ok(Operation::DeleteFriend),
            8 => Ok(Operation::ListFriend),
            invalid => Err(AppError::InvalidOperation(invalid)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Outcome reported in every `ResponseHeader`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 0,
    Failed = 1,
    Timeout = 2,
    InvalidOperation = 3,
}

impl StatusCode {
    pub fn from_i32(value: i32) -> Result<Self, FrameError> {
        match value {
            0 => Ok(StatusCode::Ok),
            1 => Ok(StatusCode::Failed),
            2 => Ok(StatusCode::Timeout),
            3 => Ok(StatusCode::InvalidOperation),
            invalid => Err(FrameError::Malformed(format!(
                "status code:{} is invalid",
                invalid
            ))),
        }
    }

    pub fn as_i32(&self) -> i32 {
        *self as i32
    }
}

/// Body of a `Request` envelope, only the request processor decodes it.
///
/// `operation` stays a raw tag on the wire so that an unknown tag can still
/// be decoded, echoed and answered with `InvalidOperation`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerMetadata {
    pub operation: u8,
    pub username: String,
    pub user_id: String,
    pub password: String,
    pub dest_username: String,
    pub dest_user_id: String,
}

impl ServerMetadata {
    fn with_operation(operation: Operation) -> Self {
        ServerMetadata {
            operation: operation.as_u8(),
            ..Default::default()
        }
    }

    pub fn register(username: impl Into<String>, password: impl Into<String>) -> Self {
        ServerMetadata {
            username: username.into(),
            password: password.into(),
            ..Self::with_operation(Operation::Register)
        }
    }

    pub fn login(user_id: impl Into<String>, password: impl Into<String>) -> Self {
        ServerMetadata {
            user_id: user_id.into(),
            password: password.into(),
            ..Self::with_operation(Operation::Login)
        }
    }

    pub fn logout(user_id: impl Into<String>) -> Self {
        ServerMetadata {
            user_id: user_id.into(),
            ..Self::with_operation(Operation::Logout)
        }
    }

    pub fn delete(user_id: impl Into<String>) -> Self {
        ServerMetadata {
            user_id: user_id.into(),
            ..Self::with_operation(Operation::Delete)
        }
    }

    pub fn search_friend(username: impl Into<String>, user_id: impl Into<String>) -> Self {
        ServerMetadata {
            username: username.into(),
            user_id: user_id.into(),
            ..Self::with_operation(Operation::SearchFriend)
        }
    }

    pub fn make_friend(user_id: impl Into<String>, dest_user_id: impl Into<String>) -> Self {
        ServerMetadata {
            user_id: user_id.into(),
            dest_user_id: dest_user_id.into(),
            ..Self::with_operation(Operation::MakeFriend)
        }
    }

    pub fn delete_friend(user_id: impl Into<String>, dest_user_id: impl Into<String>) -> Self {
        ServerMetadata {
            user_id: user_id.into(),
            dest_user_id: dest_user_id.into(),
            ..Self::with_operation(Operation::DeleteFriend)
        }
    }

    pub fn list_friend(user_id: impl Into<String>) -> Self {
        ServerMetadata {
            user_id: user_id.into(),
            ..Self::with_operation(Operation::ListFriend)
        }
    }

    pub fn operation(&self) -> AppResult<Operation> {
        Operation::from_u8(self.operation)
    }
}

impl WireFormat for ServerMetadata {
    fn encode(&self, writer: &mut BytesMut) {
        writer.put_u8(self.operation);
        write_string(writer, &self.username);
        write_string(writer, &self.user_id);
        write_string(writer, &self.password);
        write_string(writer, &self.dest_username);
        write_string(writer, &self.dest_user_id);
    }

    fn decode(buffer: &mut Bytes) -> Result<Self, FrameError> {
        Ok(ServerMetadata {
            operation: read_u8(buffer)?,
            username: read_string(buffer)?,
            user_id: read_string(buffer)?,
            password: read_string(buffer)?,
            dest_username: read_string(buffer)?,
            dest_user_id: read_string(buffer)?,
        })
    }

    fn wire_format_size(&self) -> usize {
        1 + string_size(&self.username)
            + string_size(&self.user_id)
            + string_size(&self.password)
            + string_size(&self.dest_username)
            + string_size(&self.dest_user_id)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum UserState {
    Offline = 0,
    Online = 1,
}

impl UserState {
    fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(UserState::Offline),
            1 => Ok(UserState::Online),
            invalid => Err(FrameError::Malformed(format!(
                "user state:{} is invalid",
                invalid
            ))),
        }
    }
}

/// Public view of a user, as returned by searches and friend lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BriefUser {
    pub id: String,
    pub name: String,
    pub state: UserState,
}

/// Response body of the search and friend operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserList(pub Vec<BriefUser>);

impl UserList {
    /// Online users first, ties broken by id.
    pub fn sort_by_presence(&mut self) {
        self.0
            .sort_by(|a, b| b.state.cmp(&a.state).then_with(|| a.id.cmp(&b.id)));
    }

    pub fn ids(&self) -> Vec<&str> {
        self.0.iter().map(|u| u.id.as_str()).collect()
    }
}

impl WireFormat for UserList {
    fn encode(&self, writer: &mut BytesMut) {
        writer.put_u32(self.0.len() as u32);
        for user in &self.0 {
            write_string(writer, &user.id);
            write_string(writer, &user.name);
            writer.put_u8(user.state as u8);
        }
    }

    fn decode(buffer: &mut Bytes) -> Result<Self, FrameError> {
        let count = read_u32(buffer)? as usize;
        // every entry takes at least 9 bytes, so a huge count fails here instead of allocating
        if count > buffer.len() / 9 {
            return Err(FrameError::Malformed(format!(
                "user list declares {} entries in {} bytes",
                count,
                buffer.len()
            )));
        }
        let mut users = Vec::with_capacity(count);
        for _ in 0..count {
            users.push(BriefUser {
                id: read_string(buffer)?,
                name: read_string(buffer)?,
                state: UserState::from_u8(read_u8(buffer)?)?,
            });
        }
        Ok(UserList(users))
    }

    fn wire_format_size(&self) -> usize {
        4 + self
            .0
            .iter()
            .map(|u| string_size(&u.id) + string_size(&u.name) + 1)
            .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_from_u8() {
        assert_eq!(Operation::from_u8(1).unwrap(), Operation::Register);
        assert_eq!(Operation::from_u8(8).unwrap(), Operation::ListFriend);
        assert!(matches!(
            Operation::from_u8(0),
            Err(AppError::InvalidOperation(0))
        ));
        assert!(matches!(
            Operation::from_u8(42),
            Err(AppError::InvalidOperation(42))
        ));
    }

    #[test]
    fn test_metadata_keeps_unknown_tag() {
        let meta = ServerMetadata {
            operation: 99,
            ..ServerMetadata::logout("1")
        };
        let decoded = ServerMetadata::from_bytes(meta.to_bytes()).unwrap();
        assert_eq!(decoded.operation, 99);
        assert!(decoded.operation().is_err());
    }

    #[test]
    fn test_user_list_sorting() {
        let mut list = UserList(vec![
            BriefUser {
                id: "3".into(),
                name: "c".into(),
                state: UserState::Offline,
            },
            BriefUser {
                id: "2".into(),
                name: "b".into(),
                state: UserState::Online,
            },
            BriefUser {
                id: "1".into(),
                name: "a".into(),
                state: UserState::Offline,
            },
        ]);
        list.sort_by_presence();
        assert_eq!(list.ids(), vec!["2", "1", "3"]);

        let decoded = UserList::from_bytes(list.to_bytes()).unwrap();
        assert_eq!(decoded, list);
    }

    #[test]
    fn test_user_list_bogus_count() {
        let bytes = Bytes::from_static(&[0xff, 0xff, 0xff, 0xff]);
        assert!(UserList::from_bytes(bytes).is_err());
    }
}
