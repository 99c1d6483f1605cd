//! Runtime
//!
//! Owns the worker pool, the thread bound to the main domain, the global
//! executor and the [`DomainRegistry`] tying them together. A process-wide
//! instance lives behind [`Runtime::global`]; independent runtimes can be
//! built with [`Runtime::builder`].

use crate::actor::{ActorBehavior, ActorRef};
use crate::executor::{spawn_bound_thread, Executor, ExecutorSettings, GlobalExecutor, SerialExecutor};
use crate::isolation::{IsolatedType, Isolation, Operation};
use crate::metrics::{RuntimeMetrics, RuntimeStats};
use crate::registry::{Domain, DomainId, DomainRegistry};
use crate::task::Task;
use crate::{Result, RuntimeError};

use once_cell::sync::OnceCell;
use runtime_config::RuntimeSettings;
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

static GLOBAL_RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Builder for [`Runtime`]
#[derive(Debug, Clone)]
pub struct RuntimeBuilder {
    worker_threads: Option<usize>,
    main_thread_name: String,
    pool_thread_name: String,
    executor: ExecutorSettings,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::from_settings(&RuntimeSettings::default())
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self {
            worker_threads: settings.worker_threads(),
            main_thread_name: settings.main_thread_name.clone(),
            pool_thread_name: settings.pool_thread_name.clone(),
            executor: ExecutorSettings {
                drain_budget: settings.drain_budget,
                queue_warn_depth: settings.queue_warn_depth,
            },
        }
    }

    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = Some(count);
        self
    }

    pub fn main_thread_name(mut self, name: impl Into<String>) -> Self {
        self.main_thread_name = name.into();
        self
    }

    pub fn pool_thread_name(mut self, name: impl Into<String>) -> Self {
        self.pool_thread_name = name.into();
        self
    }

    pub fn drain_budget(mut self, budget: usize) -> Self {
        self.executor.drain_budget = budget;
        self
    }

    pub fn queue_warn_depth(mut self, depth: usize) -> Self {
        self.executor.queue_warn_depth = depth;
        self
    }

    /// Start the worker pool and the main-domain thread
    pub fn build(self) -> Result<Runtime> {
        if self.worker_threads == Some(0) {
            return Err(RuntimeError::configuration(
                "worker pool needs at least one thread",
                Some("worker_threads"),
            ));
        }
        if self.executor.drain_budget == 0 {
            return Err(RuntimeError::configuration(
                "drain budget must be at least 1",
                Some("drain_budget"),
            ));
        }

        let mut pool = tokio::runtime::Builder::new_multi_thread();
        pool.enable_all().thread_name(self.pool_thread_name.clone());
        if let Some(count) = self.worker_threads {
            pool.worker_threads(count);
        }
        let pool = pool.build().map_err(|e| {
            RuntimeError::executor("pool", format!("failed to start worker pool: {}", e))
        })?;
        let handle = pool.handle().clone();

        let metrics = Arc::new(RuntimeMetrics::default());
        let main = SerialExecutor::thread_bound(DomainId::Main, self.executor, Arc::clone(&metrics));
        let main_thread = spawn_bound_thread(&main, &self.main_thread_name, handle.clone())
            .map_err(|e| {
                RuntimeError::executor(
                    DomainId::Main.to_string(),
                    format!("failed to start main thread: {}", e),
                )
            })?;
        let main_thread_id = main_thread.thread().id();

        let global = GlobalExecutor::new(handle.clone(), Arc::clone(&metrics));
        let registry = DomainRegistry::new(
            Domain::new(main as Arc<dyn Executor>),
            Domain::new(global as Arc<dyn Executor>),
            handle,
            self.executor,
            Arc::clone(&metrics),
        );

        info!(
            worker_threads = ?self.worker_threads,
            main_thread = %self.main_thread_name,
            drain_budget = self.executor.drain_budget,
            "Isolation runtime started"
        );

        Ok(Runtime {
            registry,
            metrics,
            main_thread: Some(main_thread),
            main_thread_id,
            pool: Some(pool),
        })
    }
}

/// The isolation runtime
pub struct Runtime {
    registry: DomainRegistry,
    metrics: Arc<RuntimeMetrics>,
    main_thread: Option<JoinHandle<()>>,
    main_thread_id: ThreadId,
    pool: Option<tokio::runtime::Runtime>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Runtime with default settings
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn from_settings(settings: &RuntimeSettings) -> Result<Self> {
        RuntimeBuilder::from_settings(settings).build()
    }

    /// Process-wide runtime, built on first use from `ISOLATION_*` settings
    pub fn global() -> Result<&'static Runtime> {
        GLOBAL_RUNTIME.get_or_try_init(|| {
            let settings = RuntimeSettings::load(None)
                .map_err(|e| RuntimeError::configuration(format!("{:#}", e), None))?;
            Self::from_settings(&settings)
        })
    }

    pub fn registry(&self) -> &DomainRegistry {
        &self.registry
    }

    pub fn main_domain(&self) -> &Domain {
        self.registry.main()
    }

    pub fn global_domain(&self) -> &Domain {
        self.registry.global()
    }

    /// The OS thread every main-domain continuation runs on
    pub fn main_thread_id(&self) -> ThreadId {
        self.main_thread_id
    }

    /// Handle to the worker pool, for work outside any isolation domain
    pub fn handle(&self) -> Option<&Handle> {
        self.pool.as_ref().map(|pool| pool.handle())
    }

    pub fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.metrics
    }

    pub fn stats(&self) -> RuntimeStats {
        self.metrics.snapshot()
    }

    /// Declare an operation with an explicit isolation annotation
    pub fn declare(
        &self,
        name: impl Into<Cow<'static, str>>,
        isolation: Isolation,
    ) -> Result<Operation> {
        Operation::explicit(&self.registry, name, isolation)
    }

    /// Declare an operation inheriting `T`'s isolation
    pub fn declare_member<T: IsolatedType + ?Sized>(
        &self,
        name: impl Into<Cow<'static, str>>,
    ) -> Result<Operation> {
        Operation::member_of::<T>(&self.registry, name)
    }

    /// Register a fresh actor domain and start the actor on it
    pub fn spawn_actor<A: ActorBehavior>(&self, behavior: A, state: A::State) -> Result<ActorRef<A>> {
        ActorRef::start(&self.registry, &self.metrics, behavior, state)
    }

    /// Spawn a structured task on the domain `isolation` resolves to
    pub fn spawn<T, F>(&self, isolation: Isolation, future: F) -> Result<Task<T>>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Ok(self.registry.resolve(&isolation)?.spawn(future))
    }

    /// Spawn a detached task on the domain `isolation` resolves to
    pub fn spawn_detached<T, F>(&self, isolation: Isolation, future: F) -> Result<Task<T>>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Ok(self.registry.resolve(&isolation)?.spawn_detached(future))
    }

    /// Stop every executor
    ///
    /// Queued continuations are dropped; tasks submitted afterwards complete
    /// with an executor error.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let stats = self.metrics.snapshot();
        self.registry.shutdown();

        if let Some(main_thread) = self.main_thread.take() {
            if thread::current().id() == self.main_thread_id {
                warn!("Runtime dropped on its own main thread; not joining it");
            } else if main_thread.join().is_err() {
                warn!("Main domain thread panicked during shutdown");
            }
        }

        // Safe to call from async contexts, unlike dropping the pool
        if let Some(pool) = self.pool.take() {
            pool.shutdown_background();
        }

        debug!(?stats, "Isolation runtime stopped");
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("registry", &self.registry)
            .field("main_thread_id", &self.main_thread_id)
            .finish()
    }
}
