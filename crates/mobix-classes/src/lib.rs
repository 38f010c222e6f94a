//! # Mobix Classes
//!
//! Dynamic class loading for Mobix. A class is a WebAssembly module that a
//! remote peer transfers together with (or ahead of) an agent; the
//! [`ClassRegistry`] validates, compiles and keeps them, and the
//! [`ClassRuntime`] runs the agents they define.

#![warn(missing_docs)]

/// Class module loading and validation
pub mod module;

/// Class archives carrying several modules
pub mod archive;

/// Process-wide class registry with blacklist
pub mod registry;

/// Execution runtime for class-defined agents
pub mod runtime;

/// Class-specific error types
pub mod error;

/// Test modules shared with downstream crates
pub mod test_utils;

pub use archive::{ArchiveEntry, ClassArchive};
pub use error::ClassError;
pub use module::{ClassCapability, ClassModule, ModuleImport, ModuleMetadata};
pub use registry::{ClassDefinition, ClassHandle, ClassRegistry, RegistryConfig};
pub use runtime::{ClassRuntime, ClassRuntimeConfig, HostBridge, ENTRY_POINT, FACADE_MODULE};
