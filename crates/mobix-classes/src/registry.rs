//! Process-wide class registry with blacklist
//!
//! Registrations are all-or-nothing: a module is validated and compiled before
//! the write lock is taken, and an archive only becomes visible once every
//! entry in it has been accepted. Blacklist fragments are checked on every
//! registration and every lookup, so adding one hides classes that were
//! registered earlier.

use crate::archive::ClassArchive;
use crate::error::ClassError;
use crate::module::ClassModule;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};
use wasmtime::Engine;

/// Shared handle to a loaded class
pub type ClassHandle = Arc<ClassDefinition>;

/// A named, compiled class
#[derive(Debug)]
pub struct ClassDefinition {
    name: String,
    module: ClassModule,
}

impl ClassDefinition {
    /// Class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compiled module
    pub fn module(&self) -> &ClassModule {
        &self.module
    }
}

/// Registry configuration
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    /// Name fragments that may never be loaded or resolved
    pub blacklist: Vec<String>,
}

impl RegistryConfig {
    /// Add a blacklisted name fragment
    pub fn with_blacklisted(mut self, fragment: impl Into<String>) -> Self {
        self.blacklist.push(fragment.into());
        self
    }
}

/// Registry of dynamically loaded classes
pub struct ClassRegistry {
    engine: Engine,
    known: RwLock<HashMap<String, ClassHandle>>,
    blacklist: RwLock<BTreeSet<String>>,
}

impl std::fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("known", &self.list_known())
            .field("blacklist", &*self.blacklist.read().unwrap_or_else(PoisonError::into_inner))
            .finish()
    }
}

impl ClassRegistry {
    /// Create an empty registry compiling with `engine`
    pub fn new(engine: Engine) -> Self {
        Self::with_config(engine, RegistryConfig::default())
    }

    /// Create a registry with an initial blacklist
    pub fn with_config(engine: Engine, config: RegistryConfig) -> Self {
        let registry = Self {
            engine,
            known: RwLock::new(HashMap::new()),
            blacklist: RwLock::new(BTreeSet::new()),
        };
        for fragment in config.blacklist {
            registry.blacklist(fragment);
        }
        registry
    }

    /// Engine used to compile registered modules
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Register a single class from raw module bytes.
    ///
    /// Registering a name again replaces the previous definition.
    pub fn register_from_bytes(&self, name: &str, bytes: &[u8]) -> Result<ClassHandle, ClassError> {
        self.check_name(name)?;
        let handle = self.compile(name, bytes)?;

        let mut known = self.known.write().unwrap_or_else(PoisonError::into_inner);
        // The blacklist may have grown while compiling.
        self.check_name(name)?;
        if known.insert(name.to_string(), Arc::clone(&handle)).is_some() {
            debug!("Replaced class definition: {}", name);
        }
        info!("Registered class {} ({} bytes, hash {})", name, bytes.len(), handle.module.hash());
        Ok(handle)
    }

    /// Register every class in an archive, or none of them
    pub fn register_from_archive(&self, bytes: &[u8]) -> Result<Vec<ClassHandle>, ClassError> {
        let archive = ClassArchive::from_bytes(bytes)?;

        let mut handles = Vec::with_capacity(archive.entries().len());
        for entry in archive.entries() {
            self.check_name(&entry.name)?;
            handles.push(self.compile(&entry.name, &entry.bytes)?);
        }

        let mut known = self.known.write().unwrap_or_else(PoisonError::into_inner);
        for handle in &handles {
            self.check_name(handle.name())?;
        }
        for handle in &handles {
            known.insert(handle.name().to_string(), Arc::clone(handle));
        }
        info!("Registered {} classes from archive", handles.len());
        Ok(handles)
    }

    /// Look up a class; blacklisted names never resolve
    pub fn resolve(&self, name: &str) -> Option<ClassHandle> {
        if self.matching_fragment(name).is_some() {
            debug!("Refusing to resolve blacklisted class: {}", name);
            return None;
        }
        let known = self.known.read().unwrap_or_else(PoisonError::into_inner);
        known.get(name).cloned()
    }

    /// Whether `name` resolves
    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Blacklist every name containing `fragment`, including registered ones
    pub fn blacklist(&self, fragment: impl Into<String>) {
        let fragment = fragment.into();
        if fragment.is_empty() {
            warn!("Ignoring empty blacklist fragment");
            return;
        }
        debug!("Blacklisting class name fragment: {}", fragment);
        self.blacklist
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fragment);
    }

    /// Whether `name` contains a blacklisted fragment
    pub fn is_blacklisted(&self, name: &str) -> bool {
        self.matching_fragment(name).is_some()
    }

    /// Sorted names of resolvable classes
    pub fn list_known(&self) -> Vec<String> {
        let known = self.known.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = known
            .keys()
            .filter(|name| !self.is_blacklisted(name))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Number of resolvable classes
    pub fn len(&self) -> usize {
        self.list_known().len()
    }

    /// Whether no class resolves
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn compile(&self, name: &str, bytes: &[u8]) -> Result<ClassHandle, ClassError> {
        let module = ClassModule::from_bytes(&self.engine, bytes)?;
        Ok(Arc::new(ClassDefinition {
            name: name.to_string(),
            module,
        }))
    }

    fn check_name(&self, name: &str) -> Result<(), ClassError> {
        match self.matching_fragment(name) {
            Some(fragment) => {
                warn!("Rejected blacklisted class {} (matches '{}')", name, fragment);
                Err(ClassError::Blacklisted {
                    name: name.to_string(),
                    fragment,
                })
            }
            None => Ok(()),
        }
    }

    fn matching_fragment(&self, name: &str) -> Option<String> {
        let blacklist = self.blacklist.read().unwrap_or_else(PoisonError::into_inner);
        blacklist.iter().find(|fragment| name.contains(fragment.as_str())).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_modules::{facade_agent_wasm, minimal_wasm, simple_function_wasm, INVALID_MAGIC_WASM};
    use proptest::prelude::*;

    fn registry() -> ClassRegistry {
        ClassRegistry::new(Engine::default())
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = registry();
        let handle = registry.register_from_bytes("Foo", facade_agent_wasm()).unwrap();

        assert_eq!(handle.name(), "Foo");
        let resolved = registry.resolve("Foo").unwrap();
        assert!(Arc::ptr_eq(&handle, &resolved));
        assert!(registry.resolve("Bar").is_none());
    }

    #[test]
    fn test_reregistering_identical_bytes() {
        let registry = registry();
        let first = registry.register_from_bytes("Foo", minimal_wasm()).unwrap();
        let second = registry.register_from_bytes("Foo", minimal_wasm()).unwrap();

        assert_eq!(first.module().hash(), second.module().hash());
        let resolved = registry.resolve("Foo").unwrap();
        assert!(Arc::ptr_eq(&second, &resolved));
        assert_eq!(registry.list_known(), vec!["Foo".to_string()]);
    }

    #[test]
    fn test_last_write_wins() {
        let registry = registry();
        registry.register_from_bytes("Foo", minimal_wasm()).unwrap();
        registry.register_from_bytes("Foo", simple_function_wasm()).unwrap();

        assert!(registry.resolve("Foo").unwrap().module().exports("add"));
    }

    #[test]
    fn test_malformed_bytes_leave_no_trace() {
        let registry = registry();
        let result = registry.register_from_bytes("Broken", INVALID_MAGIC_WASM);

        assert!(matches!(result, Err(ClassError::InvalidFormat(_))));
        assert!(registry.resolve("Broken").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_blacklisted_name_rejected() {
        let registry = ClassRegistry::with_config(
            Engine::default(),
            RegistryConfig::default().with_blacklisted("host."),
        );

        let result = registry.register_from_bytes("host.Gateway", minimal_wasm());
        assert!(matches!(result, Err(ClassError::Blacklisted { ref fragment, .. }) if fragment == "host."));
        assert!(registry.resolve("host.Gateway").is_none());
    }

    #[test]
    fn test_blacklist_is_retroactive() {
        let registry = registry();
        registry.register_from_bytes("evil.Payload", minimal_wasm()).unwrap();
        registry.register_from_bytes("Foo", minimal_wasm()).unwrap();
        assert!(registry.contains("evil.Payload"));

        registry.blacklist("evil");

        assert!(registry.resolve("evil.Payload").is_none());
        assert!(registry.register_from_bytes("evil.Other", minimal_wasm()).is_err());
        assert_eq!(registry.list_known(), vec!["Foo".to_string()]);
    }

    #[test]
    fn test_empty_fragment_ignored() {
        let registry = registry();
        registry.blacklist("");
        assert!(registry.register_from_bytes("Foo", minimal_wasm()).is_ok());
    }

    #[test]
    fn test_archive_registration() {
        let registry = registry();
        let archive = ClassArchive::new()
            .with_entry("Foo", facade_agent_wasm().to_vec())
            .with_entry("Adder", simple_function_wasm().to_vec());

        let handles = registry.register_from_archive(&archive.to_bytes().unwrap()).unwrap();

        assert_eq!(handles.len(), 2);
        assert_eq!(registry.list_known(), vec!["Adder".to_string(), "Foo".to_string()]);
    }

    #[test]
    fn test_archive_is_atomic() {
        let registry = registry();
        let archive = ClassArchive::new()
            .with_entry("Good", minimal_wasm().to_vec())
            .with_entry("Bad", INVALID_MAGIC_WASM.to_vec());

        let result = registry.register_from_archive(&archive.to_bytes().unwrap());

        assert!(result.is_err());
        assert!(registry.resolve("Good").is_none());
    }

    #[test]
    fn test_archive_with_blacklisted_entry_registers_nothing() {
        let registry = registry();
        registry.blacklist("forbidden");
        let archive = ClassArchive::new()
            .with_entry("Good", minimal_wasm().to_vec())
            .with_entry("forbidden.Thing", minimal_wasm().to_vec());

        let result = registry.register_from_archive(&archive.to_bytes().unwrap());

        assert!(matches!(result, Err(ClassError::Blacklisted { .. })));
        assert!(registry.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_blacklisted_fragment_never_resolves(
            prefix in "[a-z]{0,6}",
            fragment in "[A-Z]{1,4}",
            suffix in "[a-z]{0,6}",
        ) {
            let registry = registry();
            let name = format!("{}{}{}", prefix, fragment, suffix);
            registry.register_from_bytes(&name, minimal_wasm()).unwrap();

            registry.blacklist(fragment.clone());

            prop_assert!(registry.resolve(&name).is_none());
            prop_assert!(registry.register_from_bytes(&name, minimal_wasm()).is_err());
            prop_assert!(!registry.list_known().contains(&name));
        }
    }
}
