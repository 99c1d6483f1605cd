//! Actor-Isolation Runtime
//!
//! Cooperative concurrency runtime where every piece of asynchronous work is
//! bound to an *isolation domain*: the single main domain, one domain per
//! actor instance, or the global background domain. Each domain is served by
//! an executor; serial executors run one continuation at a time, so state
//! owned by a domain needs no locks between suspension points.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐     ┌──────────────────────────────┐
//! │     Domain Registry      │     │          Executors           │
//! │                          │     │                              │
//! │  Isolation::Main ────────┼─────┼─► SerialExecutor (1 thread)  │
//! │  Isolation::Actor(id) ───┼─────┼─► SerialExecutor (pooled)    │
//! │  NonIsolated/Unspecified ┼─────┼─► GlobalExecutor (pooled)    │
//! └──────────────────────────┘     └──────────────┬───────────────┘
//!                                                 │
//!                                  ┌──────────────▼───────────────┐
//!                                  │   tokio worker pool + timers  │
//!                                  └──────────────────────────────┘
//! ```
//!
//! A task's future is polled by its domain's executor. Every `.await` that
//! returns `Pending` is a suspension point; when the task is woken it is
//! re-submitted to the *same* domain, never to the waker's.
//!
//! # Guarantees
//!
//! - Continuations of one serial domain never overlap and run in FIFO order
//! - Main-domain work always runs on the runtime's main thread
//! - Isolation is decided where an operation is declared, not by its caller
//! - Cancellation is cooperative; a cancelled task never yields a value
//!
//! # Examples
//!
//! ```rust,no_run
//! use isolation_runtime::{ActorBehavior, Runtime, SingleFlight};
//!
//! struct Counter;
//!
//! impl ActorBehavior for Counter {
//!     type State = u64;
//! }
//!
//! # async fn demo() -> isolation_runtime::Result<()> {
//! let runtime = Runtime::builder().worker_threads(4).build()?;
//!
//! let counter = runtime.spawn_actor(Counter, 0)?;
//! let value = counter
//!     .isolated(|cx| async move { cx.with(|count| { *count += 1; *count }) })
//!     .await?;
//! assert_eq!(value, 1);
//!
//! let images: SingleFlight<String, Vec<u8>> = SingleFlight::new(&runtime, "images")?;
//! let bytes = images
//!     .get("logo.png".to_string(), || async { Ok(vec![0u8; 16]) })
//!     .await?;
//! assert_eq!(bytes.len(), 16);
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod error;
pub mod executor;
pub mod isolation;
pub mod metrics;
pub mod registry;
pub mod runtime;
pub mod single_flight;
pub mod task;

pub use actor::{ActorBehavior, ActorContext, ActorRef, NonIsolated};
pub use error::{Result, RuntimeError};
pub use executor::{current_domain, current_domain_id, Executor, ExecutorSettings};
pub use isolation::{IsolatedType, Isolation, IsolationSource, Operation};
pub use metrics::{RuntimeMetrics, RuntimeStats};
pub use registry::{ActorId, Domain, DomainId, DomainRegistry};
pub use runtime::{Runtime, RuntimeBuilder};
pub use single_flight::{FlightStats, SingleFlight};
pub use task::{
    check_cancellation, current_task_id, is_cancelled, spawn, timeout, yield_now, SpawnMode,
    Task, TaskId, TaskOptions, TaskPriority, TaskState,
};
