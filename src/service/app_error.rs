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

pub type AppResult<T> = Result<T, AppError>;

/// Errors raised while peeling frames off a byte stream or decoding the
/// envelope and headers inside them.
///
/// A `FrameError` only ever affects the single frame it was raised for; the
/// connection it arrived on stays open unless errors keep repeating.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// marker error, more bytes are needed before a frame can be parsed
    #[error("incomplete frame")]
    Incomplete,

    #[error("frame of length {size} exceeds the maximum of {max}")]
    TooLarge { size: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown message type: {0}")]
    UnknownType(u8),
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// protocol errors
    #[error("invalid operation: {0}")]
    InvalidOperation(u8),

    /// directory errors
    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("password mismatch for user {0}")]
    PasswordMismatch(String),
}

impl AppError {
    /// Whether the error was caused by the bytes of a single frame rather than
    /// by the transport underneath it.
    pub fn is_frame_error(&self) -> bool {
        matches!(self, AppError::Frame(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_error_conversion() {
        let err: AppError = FrameError::UnknownType(9).into();
        assert!(err.is_frame_error());
        assert!(err.to_string().contains("unknown message type: 9"));

        let err: AppError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(!err.is_frame_error());
    }

    #[test]
    fn test_too_large_message() {
        let err = FrameError::TooLarge { size: 10, max: 4 };
        assert_eq!(
            err.to_string(),
            "frame of length 10 exceeds the maximum of 4"
        );
    }
}
