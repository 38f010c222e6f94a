//! Class module loading and validation

use crate::error::ClassError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use wasmtime::{Engine, Module};

/// Maximum module size (64MB)
pub const MAX_MODULE_SIZE: usize = 64 * 1024 * 1024;

/// Capabilities a class module asks the host for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassCapability {
    /// WASI filesystem access
    WasiFs,
    /// WASI environment variables
    WasiEnv,
    /// WASI command line arguments
    WasiArgs,
    /// WASI standard I/O
    WasiStdio,
    /// WASI networking
    WasiNet,
    /// Host facade imports
    Facade,
    /// Other custom host functions
    HostFunctions,
}

/// Metadata extracted from a class module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleMetadata {
    /// SHA256 hash of the module bytes
    pub hash: String,
    /// Size of the module in bytes
    pub size: usize,
    /// Detected capabilities required by the module
    pub capabilities: HashSet<ClassCapability>,
    /// Exported items
    pub exports: Vec<String>,
    /// Imported functions required by the module
    pub imports: Vec<ModuleImport>,
    /// Whether the module imports WASI
    pub is_wasi: bool,
}

/// Information about a module import
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleImport {
    /// Module name (e.g., "wasi_snapshot_preview1")
    pub module: String,
    /// Function name
    pub name: String,
}

/// A validated and compiled class module
#[derive(Debug, Clone)]
pub struct ClassModule {
    /// Module metadata
    pub metadata: ModuleMetadata,
    compiled: Module,
}

impl ClassModule {
    /// Validate `bytes` and compile them with `engine`.
    ///
    /// Nothing is cached on failure, so a rejected module leaves no trace.
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, ClassError> {
        Self::validate_basic_format(bytes)?;

        let compiled = Module::from_binary(engine, bytes)
            .map_err(|e| ClassError::ModuleLoad(e.to_string()))?;
        let metadata = Self::extract_metadata(bytes, &compiled);
        Self::validate_module(&metadata)?;

        Ok(ClassModule { metadata, compiled })
    }

    /// The compiled wasmtime module
    pub fn compiled(&self) -> &Module {
        &self.compiled
    }

    /// Get the module hash
    pub fn hash(&self) -> &str {
        &self.metadata.hash
    }

    /// Whether the module exports an item called `name`
    pub fn exports(&self, name: &str) -> bool {
        self.metadata.exports.iter().any(|export| export == name)
    }

    /// Check if the module requires a specific capability
    pub fn requires_capability(&self, capability: &ClassCapability) -> bool {
        self.metadata.capabilities.contains(capability)
    }

    /// Check if the module imports WASI
    pub fn is_wasi(&self) -> bool {
        self.metadata.is_wasi
    }

    fn extract_metadata(bytes: &[u8], module: &Module) -> ModuleMetadata {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let hash = format!("{:x}", hasher.finalize());

        let mut capabilities = HashSet::new();
        let mut imports = Vec::new();
        let mut is_wasi = false;

        let exports = module.exports().map(|export| export.name().to_string()).collect();

        for import in module.imports() {
            if import.module().starts_with("wasi_") {
                is_wasi = true;

                match import.name() {
                    name if name.starts_with("fd_") => {
                        capabilities.insert(ClassCapability::WasiFs);
                        capabilities.insert(ClassCapability::WasiStdio);
                    }
                    name if name.starts_with("environ_") => {
                        capabilities.insert(ClassCapability::WasiEnv);
                    }
                    name if name.starts_with("args_") => {
                        capabilities.insert(ClassCapability::WasiArgs);
                    }
                    name if name.starts_with("sock_") => {
                        capabilities.insert(ClassCapability::WasiNet);
                    }
                    _ => {}
                }
            } else if import.module() == crate::runtime::FACADE_MODULE {
                capabilities.insert(ClassCapability::Facade);
            } else if import.module() != "env" {
                capabilities.insert(ClassCapability::HostFunctions);
            }

            imports.push(ModuleImport {
                module: import.module().to_string(),
                name: import.name().to_string(),
            });
        }

        if is_wasi {
            capabilities.insert(ClassCapability::WasiStdio);
        }

        ModuleMetadata {
            hash,
            size: bytes.len(),
            capabilities,
            exports,
            imports,
            is_wasi,
        }
    }

    fn validate_basic_format(bytes: &[u8]) -> Result<(), ClassError> {
        if bytes.len() < 8 {
            return Err(ClassError::InvalidFormat(
                "module too small (minimum 8 bytes)".to_string()
            ));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(ClassError::InvalidFormat(
                "invalid WASM magic number".to_string()
            ));
        }

        if bytes.len() > MAX_MODULE_SIZE {
            return Err(ClassError::ModuleValidation(format!(
                "module too large: {} bytes (max: {} bytes)",
                bytes.len(), MAX_MODULE_SIZE
            )));
        }

        Ok(())
    }

    fn validate_module(metadata: &ModuleMetadata) -> Result<(), ClassError> {
        if metadata.capabilities.contains(&ClassCapability::WasiNet) {
            return Err(ClassError::UnsupportedCapability(
                "WASI networking is not supported".to_string()
            ));
        }

        if metadata.capabilities.contains(&ClassCapability::HostFunctions) {
            let unknown: Vec<String> = metadata.imports.iter()
                .filter(|imp| !imp.module.starts_with("wasi_")
                    && imp.module != crate::runtime::FACADE_MODULE
                    && imp.module != "env")
                .map(|imp| format!("{}::{}", imp.module, imp.name))
                .collect();
            return Err(ClassError::UnsupportedCapability(format!(
                "unknown host imports: {}", unknown.join(", ")
            )));
        }

        Ok(())
    }
}
