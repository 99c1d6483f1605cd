//! Runtime Metrics
//!
//! Lock-free counters shared by every executor, task and actor of a runtime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Runtime-wide metrics
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    pub continuations_run: AtomicU64,
    pub continuation_panics: AtomicU64,
    pub total_run_time_ns: AtomicU64,

    // Task lifecycle
    pub tasks_spawned: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_cancelled: AtomicU64,
    pub suspensions: AtomicU64,

    // Actors
    pub actors_spawned: AtomicU64,
    pub actors_stopped: AtomicU64,

    // Backpressure
    pub queue_depth_warnings: AtomicU64,
}

impl RuntimeMetrics {
    pub fn record_continuation(&self, duration: Duration) {
        self.continuations_run.fetch_add(1, Ordering::Relaxed);
        self.total_run_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.continuation_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spawn(&self) {
        self.tasks_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suspension(&self) {
        self.suspensions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how a task finished
    pub fn record_outcome<T>(&self, outcome: &crate::Result<T>) {
        match outcome {
            Ok(_) => self.tasks_completed.fetch_add(1, Ordering::Relaxed),
            Err(e) if e.is_cancelled() => self.tasks_cancelled.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.tasks_failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_queue_depth_warning(&self) {
        self.queue_depth_warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_continuation_time_ns(&self) -> f64 {
        let count = self.continuations_run.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let total = self.total_run_time_ns.load(Ordering::Relaxed);
        total as f64 / count as f64
    }

    /// Get metrics snapshot
    pub fn snapshot(&self) -> RuntimeStats {
        RuntimeStats {
            continuations_run: self.continuations_run.load(Ordering::Relaxed),
            continuation_panics: self.continuation_panics.load(Ordering::Relaxed),
            avg_continuation_time_ns: self.avg_continuation_time_ns(),
            tasks_spawned: self.tasks_spawned.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            suspensions: self.suspensions.load(Ordering::Relaxed),
            actors_spawned: self.actors_spawned.load(Ordering::Relaxed),
            actors_stopped: self.actors_stopped.load(Ordering::Relaxed),
            queue_depth_warnings: self.queue_depth_warnings.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RuntimeMetrics`]
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeStats {
    pub continuations_run: u64,
    pub continuation_panics: u64,
    pub avg_continuation_time_ns: f64,
    pub tasks_spawned: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub suspensions: u64,
    pub actors_spawned: u64,
    pub actors_stopped: u64,
    pub queue_depth_warnings: u64,
}
