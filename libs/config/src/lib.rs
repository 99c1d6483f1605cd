//! # Runtime Configuration
//!
//! Settings and defaults for the isolation runtime and the services built on
//! it.
//!
//! ## Sources
//!
//! 1. Built-in defaults ([`defaults`])
//! 2. An optional TOML settings file
//! 3. `ISOLATION_*` environment variables
//!
//! ## Usage
//!
//! ```rust,no_run
//! use runtime_config::RuntimeSettings;
//! use std::path::Path;
//!
//! let settings = RuntimeSettings::load(Some(Path::new("config/runtime.toml")))?;
//! println!("drain budget: {}", settings.drain_budget);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod defaults;
pub mod settings;

// Re-export commonly used types
pub use settings::{load_settings, RuntimeSettings};
