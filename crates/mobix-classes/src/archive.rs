//! Class archives carrying several modules

use crate::error::ClassError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Magic bytes leading every class archive
pub const ARCHIVE_MAGIC: [u8; 4] = *b"MBXA";

/// One named module inside an archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// Class name the module registers under
    pub name: String,
    /// Raw module bytes
    pub bytes: Bytes,
}

/// A bundle of class modules transferred as one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassArchive {
    magic: [u8; 4],
    entries: Vec<ArchiveEntry>,
}

impl Default for ClassArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassArchive {
    /// Create an empty archive
    pub fn new() -> Self {
        Self {
            magic: ARCHIVE_MAGIC,
            entries: Vec::new(),
        }
    }

    /// Add a module under `name`
    pub fn with_entry(mut self, name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        self.entries.push(ArchiveEntry {
            name: name.into(),
            bytes: bytes.into(),
        });
        self
    }

    /// Archive entries in insertion order
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Encode to MessagePack bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ClassError> {
        rmp_serde::to_vec(self).map_err(|e| ClassError::Archive(e.to_string()))
    }

    /// Decode from MessagePack bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ClassError> {
        let archive: Self = rmp_serde::from_slice(bytes)
            .map_err(|e| ClassError::Archive(e.to_string()))?;
        if archive.magic != ARCHIVE_MAGIC {
            return Err(ClassError::Archive("missing archive header".to_string()));
        }
        Ok(archive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_entries_keep_order() {
        let archive = ClassArchive::new()
            .with_entry("B", vec![1u8])
            .with_entry("A", vec![2u8]);

        let decoded = ClassArchive::from_bytes(&archive.to_bytes().unwrap()).unwrap();
        let names: Vec<&str> = decoded.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["B", "A"]);
        assert_eq!(&decoded.entries()[1].bytes[..], &[2]);
    }

    #[test]
    fn test_archive_rejects_garbage() {
        let result = ClassArchive::from_bytes(b"PK\x03\x04 not ours");
        assert!(matches!(result, Err(ClassError::Archive(_))));
    }

    #[test]
    fn test_archive_rejects_foreign_header() {
        let mut archive = ClassArchive::new().with_entry("A", vec![0u8]);
        archive.magic = *b"JAR!";
        let bytes = rmp_serde::to_vec(&archive).unwrap();

        assert!(matches!(ClassArchive::from_bytes(&bytes), Err(ClassError::Archive(_))));
    }
}
