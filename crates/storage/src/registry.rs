//! State store backend registry
//!
//! Backends are looked up by the name in `state_store.backend`. The
//! registry lets a new backend be added without touching the code that
//! opens stores.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let store = BackendRegistry::global().open(dir, &config, supervisor)?;
//!
//! let mut registry = BackendRegistry::new();
//! registry.register("custom", Arc::new(|dir, config, supervisor| { ... }));
//! ```

use crate::mvcc::{MvccDb, MvccOptions};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use versiondb_core::{Error, Result, StateStore, StateStoreConfig, Supervisor};

/// Opens a state store of one backend in a directory.
pub type BackendConstructor = Arc<
    dyn Fn(&Path, &StateStoreConfig, Arc<dyn Supervisor>) -> Result<Arc<dyn StateStore>>
        + Send
        + Sync,
>;

/// Name of the fjall LSM backend.
pub const FJALL_BACKEND: &str = "fjall";

/// Name of the in-memory backend.
pub const MEMORY_BACKEND: &str = "memory";

static GLOBAL: Lazy<BackendRegistry> = Lazy::new(BackendRegistry::with_defaults);

/// Backend name to constructor.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, BackendConstructor>,
}

impl BackendRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `fjall` and `memory` backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            FJALL_BACKEND,
            Arc::new(|dir: &Path, config: &StateStoreConfig, supervisor: Arc<dyn Supervisor>| {
                let options = MvccOptions::new(config.clone()).with_supervisor(supervisor);
                Ok(Arc::new(MvccDb::open(dir, options)?) as Arc<dyn StateStore>)
            }),
        );
        registry.register(
            MEMORY_BACKEND,
            Arc::new(|_dir: &Path, config: &StateStoreConfig, supervisor: Arc<dyn Supervisor>| {
                let options = MvccOptions::new(config.clone()).with_supervisor(supervisor);
                Ok(Arc::new(MvccDb::in_memory(options)?) as Arc<dyn StateStore>)
            }),
        );
        registry
    }

    /// Process-wide registry with the default backends.
    pub fn global() -> &'static BackendRegistry {
        &GLOBAL
    }

    /// Register (or replace) a backend.
    pub fn register(&mut self, name: impl Into<String>, constructor: BackendConstructor) {
        self.backends.insert(name.into(), constructor);
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Open a store with the backend named in `config`.
    pub fn open(
        &self,
        dir: &Path,
        config: &StateStoreConfig,
        supervisor: Arc<dyn Supervisor>,
    ) -> Result<Arc<dyn StateStore>> {
        let constructor = self
            .backends
            .get(&config.backend)
            .ok_or_else(|| Error::UnknownBackend(config.backend.clone()))?;
        debug!(backend = %config.backend, dir = %dir.display(), "opening state store");
        constructor(dir, config, supervisor)
    }
}
