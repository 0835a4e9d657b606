//! Per-environment version counters.
//!
//! [`VersionLedger`] is the only component that mutates a counter, and it
//! does so through an injected [`CounterStore`], so the commit step can be
//! exercised without touching a real manifest.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{info, warn};

use crate::config::Environment;
use crate::error::PackError;
use crate::manifest::Manifest;

/// Backing storage for version counters.
pub trait CounterStore {
    /// The stored counter, or `None` when the environment has never been published.
    fn read_counter(&self, env: Environment) -> Result<Option<u64>, PackError>;

    fn write_counter(&mut self, env: Environment, value: u64) -> Result<(), PackError>;
}

/// Counters kept in `config.pack` of a `package.json`.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Anything that goes wrong while writing the counter back is a persist failure.
    fn persist_error(&self, err: PackError) -> PackError {
        match err {
            PackError::Manifest { path, source } => PackError::Persist { path, source },
            other => PackError::PersistManifest { path: self.path.clone(), source: Box::new(other) },
        }
    }
}

impl CounterStore for ManifestStore {
    fn read_counter(&self, env: Environment) -> Result<Option<u64>, PackError> {
        Ok(Manifest::load(&self.path)?.pack_config()?.counter(env))
    }

    fn write_counter(&mut self, env: Environment, value: u64) -> Result<(), PackError> {
        // Re-read so edits made while the archive was being written survive.
        let manifest = Manifest::load(&self.path)
            .and_then(|mut manifest| {
                manifest.set_pack_value(env.counter_key(), Value::from(value))?;
                Ok(manifest)
            })
            .map_err(|err| self.persist_error(err))?;
        manifest
            .save()
            .map_err(|source| PackError::Persist { path: self.path.clone(), source })
    }
}

/// Counters held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    counters: HashMap<Environment, u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_counter(mut self, env: Environment, value: u64) -> Self {
        self.counters.insert(env, value);
        self
    }
}

impl CounterStore for MemoryStore {
    fn read_counter(&self, env: Environment) -> Result<Option<u64>, PackError> {
        Ok(self.counters.get(&env).copied())
    }

    fn write_counter(&mut self, env: Environment, value: u64) -> Result<(), PackError> {
        self.counters.insert(env, value);
        Ok(())
    }
}

pub struct VersionLedger<S: CounterStore> {
    store: S,
}

impl<S: CounterStore> VersionLedger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Stored counter plus one. Does not change anything.
    pub fn next_version(&self, env: Environment) -> Result<u64, PackError> {
        Ok(self.store.read_counter(env)?.unwrap_or(0) + 1)
    }

    /// Records `version` as the latest published version for `env`.
    ///
    /// Only call this once the archive has been finalized. A version that does
    /// not advance the counter is still written, with a warning.
    pub fn commit(&mut self, env: Environment, version: u64) -> Result<(), PackError> {
        match self.store.read_counter(env) {
            Ok(Some(current)) if version <= current => {
                warn!(
                    environment = env.counter_key(),
                    current,
                    version,
                    "committed version does not advance the counter"
                );
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "could not read current counter before commit");
            }
        }
        self.store.write_counter(env, version)?;
        info!(environment = env.counter_key(), version, "version counter updated");
        Ok(())
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }
}
