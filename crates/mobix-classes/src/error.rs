//! Class loading and execution error types

use thiserror::Error;

/// Errors raised while loading, resolving or running classes
#[derive(Debug, Error)]
pub enum ClassError {
    /// Name matches a blacklisted fragment
    #[error("Class name '{name}' is blacklisted (matches '{fragment}')")]
    Blacklisted {
        /// Rejected class name
        name: String,
        /// Blacklist fragment it contains
        fragment: String,
    },

    /// Module loading error
    #[error("Module loading error: {0}")]
    ModuleLoad(String),

    /// Module validation error
    #[error("Module validation error: {0}")]
    ModuleValidation(String),

    /// Invalid module format
    #[error("Invalid module format: {0}")]
    InvalidFormat(String),

    /// Unsupported capability
    #[error("Unsupported capability: {0}")]
    UnsupportedCapability(String),

    /// Malformed class archive
    #[error("Invalid class archive: {0}")]
    Archive(String),

    /// Missing or mistyped entry point
    #[error("Entry point error: {0}")]
    EntryPoint(String),

    /// Execution error
    #[error("Execution error: {0}")]
    Execution(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wasmtime error
    #[error("Wasmtime error: {0}")]
    Wasmtime(#[from] wasmtime::Error),
}

impl ClassError {
    /// Whether this error came from loading rather than running a class
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            Self::Blacklisted { .. }
                | Self::ModuleLoad(_)
                | Self::ModuleValidation(_)
                | Self::InvalidFormat(_)
                | Self::UnsupportedCapability(_)
                | Self::Archive(_)
        )
    }
}
