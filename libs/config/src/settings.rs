//! Runtime Settings Module
//!
//! Loads [`RuntimeSettings`] from an optional TOML file with `ISOLATION_*`
//! environment overrides on top. Missing keys fall back to [`crate::defaults`].

use crate::defaults;

use anyhow::{ensure, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Settings for building an isolation runtime
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Worker threads in the shared pool (0 = one per core)
    pub worker_threads: usize,

    /// Name of the OS thread bound to the main domain
    pub main_thread_name: String,

    /// Name prefix of pool worker threads
    pub pool_thread_name: String,

    /// Continuations a pooled drain runs before handing its worker back
    pub drain_budget: usize,

    /// Queue length that triggers a backpressure warning (0 disables)
    pub queue_warn_depth: usize,

    /// `tracing` filter directive used by binaries
    pub log_level: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            worker_threads: defaults::threads::WORKER_THREADS,
            main_thread_name: defaults::threads::MAIN_THREAD_NAME.to_string(),
            pool_thread_name: defaults::threads::POOL_THREAD_NAME.to_string(),
            drain_budget: defaults::executor::DRAIN_BUDGET,
            queue_warn_depth: defaults::executor::QUEUE_WARN_DEPTH,
            log_level: defaults::logging::LOG_LEVEL.to_string(),
        }
    }
}

impl RuntimeSettings {
    /// Load settings from `path` (if any), then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading runtime settings: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        // Override with environment variables (ISOLATION_ prefix)
        builder = builder.add_source(
            Environment::with_prefix(defaults::ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build runtime settings")?;

        let settings: Self = config
            .try_deserialize()
            .context("Failed to deserialize runtime settings")?;
        settings.validate()?;

        debug!(?settings, "Runtime settings loaded");
        Ok(settings)
    }

    /// Reject settings a runtime cannot be built from
    pub fn validate(&self) -> Result<()> {
        ensure!(self.drain_budget > 0, "drain_budget must be at least 1");
        ensure!(
            !self.main_thread_name.trim().is_empty(),
            "main_thread_name must not be empty"
        );
        ensure!(
            !self.pool_thread_name.trim().is_empty(),
            "pool_thread_name must not be empty"
        );
        ensure!(!self.log_level.trim().is_empty(), "log_level must not be empty");
        Ok(())
    }

    /// Pool size to request, `None` for one worker per core
    pub fn worker_threads(&self) -> Option<usize> {
        (self.worker_threads > 0).then_some(self.worker_threads)
    }

    /// Render as TOML, e.g. to write out a starting settings file
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize runtime settings")
    }
}

/// Convenience function to load settings with defaults
pub fn load_settings(path: Option<&Path>) -> Result<RuntimeSettings> {
    RuntimeSettings::load(path)
}
