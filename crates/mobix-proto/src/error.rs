//! Error types for protocol operations

use std::time::Duration;
use thiserror::Error;
use crate::message::{ErrorCode, ErrorDetails};

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Payload does not start with the expected magic bytes
    #[error("Invalid object stream header")]
    InvalidHeader,

    /// Payload written by an incompatible protocol version
    #[error("Unsupported object stream version: {0}")]
    UnsupportedVersion(u16),

    /// Unit larger than the channel allows
    #[error("Unit too large: more than {max} bytes")]
    UnitTooLarge {
        /// Maximum allowed size
        max: usize
    },

    /// Sender did not finish the unit in time
    #[error("Channel timed out after {0:?}")]
    ChannelTimeout(Duration),

    /// Channel failed while reading
    #[error("Channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(format!("MessagePack encode error: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(format!("MessagePack decode error: {}", err))
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}

impl From<&ProtocolError> for ErrorDetails {
    fn from(error: &ProtocolError) -> Self {
        match error {
            ProtocolError::Serialization(msg) => {
                ErrorDetails::new(ErrorCode::InvalidRequest, msg.clone())
            }
            ProtocolError::InvalidHeader | ProtocolError::UnsupportedVersion(_) => {
                ErrorDetails::new(ErrorCode::InvalidRequest, error.to_string())
            }
            ProtocolError::UnitTooLarge { .. } => {
                ErrorDetails::new(ErrorCode::ResourceExhausted, error.to_string())
            }
            ProtocolError::ChannelTimeout(_) => {
                ErrorDetails::new(ErrorCode::Timeout, error.to_string())
            }
            ProtocolError::Io(_) => {
                ErrorDetails::new(ErrorCode::InternalError, error.to_string())
            }
        }
    }
}
