#![forbid(unsafe_code)]

//! Projection settings and manifests.
//!
//! [`ProjectionConfig`] is a plain struct with defaults and `with_*`
//! builders. A [`ProjectionManifest`] bundles a config with the type
//! descriptors to register and can be parsed from JSON, or from TOML with
//! the `config-file` feature:
//!
//! ```toml
//! [projection]
//! hydrate_on_mount = true
//!
//! [[types]]
//! name = "user"
//! storage = "collection"
//!
//! [[types]]
//! name = "session"
//! storage = "singleton"
//! ```

use projector_core::TypeDescriptor;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Behaviour knobs of a mounted projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Seed the store from the repository's current contents at mount.
    /// Default: false (the store starts empty and fills from events).
    pub hydrate_on_mount: bool,

    /// Number of event faults retained for inspection.
    /// Default: 64.
    pub diagnostics_capacity: usize,

    /// Number of `(source, id, target)` relation views kept cached.
    /// Oldest is evicted first. Default: 256.
    pub relation_cache_capacity: usize,

    /// Emit a `debug` event for every applied batch.
    /// Default: true.
    pub log_batches: bool,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            hydrate_on_mount: false,
            diagnostics_capacity: 64,
            relation_cache_capacity: 256,
            log_batches: true,
        }
    }
}

impl ProjectionConfig {
    #[must_use]
    pub fn with_hydrate_on_mount(mut self, hydrate: bool) -> Self {
        self.hydrate_on_mount = hydrate;
        self
    }

    #[must_use]
    pub fn with_diagnostics_capacity(mut self, capacity: usize) -> Self {
        self.diagnostics_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_relation_cache_capacity(mut self, capacity: usize) -> Self {
        self.relation_cache_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_log_batches(mut self, log: bool) -> Self {
        self.log_batches = log;
        self
    }
}

/// Config plus the types to register.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionManifest {
    #[serde(default)]
    pub projection: ProjectionConfig,
    #[serde(default)]
    pub types: Vec<TypeDescriptor>,
}

impl ProjectionManifest {
    pub fn from_json_str(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    #[cfg(feature = "config-file")]
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }
}
