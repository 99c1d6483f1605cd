//! Runtime defaults
//!
//! Default values used when neither a settings file nor the environment
//! provides one.

/// Executor defaults
pub mod executor {
    /// Continuations a pooled drain runs before handing its worker back
    pub const DRAIN_BUDGET: usize = 64;

    /// Queue length that triggers a backpressure warning (0 disables)
    pub const QUEUE_WARN_DEPTH: usize = 1024;
}

/// Thread defaults
pub mod threads {
    /// Worker threads in the shared pool (0 = one per core)
    pub const WORKER_THREADS: usize = 0;

    /// Name of the OS thread bound to the main domain
    pub const MAIN_THREAD_NAME: &str = "isolation-main";

    /// Name prefix of pool worker threads
    pub const POOL_THREAD_NAME: &str = "isolation-worker";
}

/// Logging defaults
pub mod logging {
    pub const LOG_LEVEL: &str = "info";
}

/// Prefix of environment variable overrides, e.g. `ISOLATION_DRAIN_BUDGET`
pub const ENV_PREFIX: &str = "ISOLATION";
