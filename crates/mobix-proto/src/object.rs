//! Serialized agent envelope
//!
//! An agent crosses the wire as a MessagePack encoded [`ObjectStream`]: the
//! name of the class that reconstructs it, its state as a JSON-shaped value,
//! and any further classes the state refers to. The receiver resolves every
//! one of those names before the agent is rebuilt.

use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Magic bytes leading every object stream
pub const STREAM_MAGIC: [u8; 4] = *b"MBXO";

/// Current object stream version
pub const STREAM_VERSION: u16 = 1;

/// Serialized agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStream {
    magic: [u8; 4],
    version: u16,
    /// Class that reconstructs the agent
    pub class: String,
    /// Agent state
    pub state: Value,
    /// Further classes referenced by the state
    pub requires: Vec<String>,
}

impl ObjectStream {
    /// Create a stream for an agent of `class` carrying `state`
    pub fn new(class: impl Into<String>, state: Value) -> Self {
        Self {
            magic: STREAM_MAGIC,
            version: STREAM_VERSION,
            class: class.into(),
            state,
            requires: Vec::new(),
        }
    }

    /// Create a stream from any serializable agent value
    pub fn from_value<T: Serialize>(class: impl Into<String>, agent: &T) -> Result<Self, ProtocolError> {
        Ok(Self::new(class, serde_json::to_value(agent)?))
    }

    /// Declare an additional class the state depends on
    pub fn with_requirement(mut self, class: impl Into<String>) -> Self {
        self.requires.push(class.into());
        self
    }

    /// Every class name this stream refers to, root class first
    pub fn referenced_classes(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.class.as_str()).chain(self.requires.iter().map(String::as_str))
    }

    /// Encode to MessagePack bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Decode from MessagePack bytes, checking magic and version
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let stream: Self = rmp_serde::from_slice(bytes)?;
        if stream.magic != STREAM_MAGIC {
            return Err(ProtocolError::InvalidHeader);
        }
        if stream.version != STREAM_VERSION {
            return Err(ProtocolError::UnsupportedVersion(stream.version));
        }
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Counter {
        step: u32,
    }

    #[test]
    fn test_referenced_classes_root_first() {
        let stream = ObjectStream::new("Foo", json!({}))
            .with_requirement("Bar")
            .with_requirement("Baz");

        let names: Vec<&str> = stream.referenced_classes().collect();
        assert_eq!(names, vec!["Foo", "Bar", "Baz"]);
    }

    #[test]
    fn test_from_value() {
        let stream = ObjectStream::from_value("Counter", &Counter { step: 3 }).unwrap();
        assert_eq!(stream.state, json!({"step": 3}));

        let decoded = ObjectStream::from_bytes(&stream.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, stream);
    }

    #[test]
    fn test_rejects_garbage() {
        let result = ObjectStream::from_bytes(&[0xFF, 0x00, 0x13]);
        assert!(matches!(result, Err(ProtocolError::Serialization(_))));
    }

    #[test]
    fn test_rejects_wrong_magic() {
        let mut stream = ObjectStream::new("Foo", Value::Null);
        stream.magic = *b"JAVA";
        let bytes = rmp_serde::to_vec(&stream).unwrap();

        assert!(matches!(ObjectStream::from_bytes(&bytes), Err(ProtocolError::InvalidHeader)));
    }

    #[test]
    fn test_rejects_future_version() {
        let mut stream = ObjectStream::new("Foo", Value::Null);
        stream.version = STREAM_VERSION + 1;
        let bytes = rmp_serde::to_vec(&stream).unwrap();

        assert!(matches!(
            ObjectStream::from_bytes(&bytes),
            Err(ProtocolError::UnsupportedVersion(v)) if v == STREAM_VERSION + 1
        ));
    }
}
