//! # Mobix Protocol
//!
//! Payload contracts for the Mobix code-mobility engine: service requests and
//! responses, the serialized agent envelope, host domain types and the byte
//! channels that carry transferred code.

#![warn(missing_docs)]

/// Request/response message types
pub mod message;

/// Serialized agent envelope
pub mod object;

/// Host domain types exchanged with the middleware
pub mod host;

/// Byte channels carrying agents and class definitions
pub mod channel;

/// Error types for protocol operations
pub mod error;

pub use channel::{ChannelSet, DataChannel, MAX_UNIT_SIZE};
pub use error::ProtocolError;
pub use host::{Call, DriverData, HostResponse, MapForm, Notify, UpDevice, UpDriver, UpNetworkInterface};
pub use message::{ErrorCode, ErrorDetails, Request, Response};
pub use object::ObjectStream;
