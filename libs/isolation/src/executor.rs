//! Serialized Executors
//!
//! A [`SerialExecutor`] is a FIFO run-queue that executes submitted
//! continuations strictly one at a time. It is either bound to one OS thread
//! for its whole lifetime (the main domain) or borrows a worker from the shared
//! pool for each drain (actor domains). The [`GlobalExecutor`] backs the
//! unspecified/non-isolated domain and runs continuations concurrently.
//!
//! # Exclusivity
//!
//! A drain exists only while `scheduled` is set, and `scheduled` is only ever
//! flipped from `false` to `true` by a single `swap`, so at most one drain of a
//! serial executor runs at any instant, on any thread.
//!
//! # Failure semantics
//!
//! A panicking continuation is caught and logged; the executor keeps servicing
//! its queue. Continuations dropped without running (shutdown) are dropped, and
//! task continuations complete their task with an executor error on drop.

use crate::error::panic_message;
use crate::metrics::RuntimeMetrics;
use crate::registry::{Domain, DomainId};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, Thread};
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// A unit of work submitted to an executor
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Executor contract shared by serial and global executors
pub trait Executor: Send + Sync + 'static {
    /// Identity of the domain this executor serves
    fn domain_id(&self) -> &DomainId;

    /// Append a continuation; it will eventually run
    fn submit(&self, job: Job);

    /// Continuations waiting to run
    fn queue_depth(&self) -> usize;

    /// Whether continuations of this executor never overlap
    fn is_serial(&self) -> bool;

    /// Stop accepting work and drop everything still queued
    fn shutdown(&self);

    fn metrics(&self) -> &Arc<RuntimeMetrics>;
}

/// Tunables for serial executors
#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    /// Continuations a pooled drain runs before handing its worker back
    pub drain_budget: usize,
    /// Queue length that triggers a backpressure warning (0 disables)
    pub queue_warn_depth: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            drain_budget: 64,
            queue_warn_depth: 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Current domain
// ---------------------------------------------------------------------------

thread_local! {
    static CURRENT_DOMAIN: RefCell<Option<Domain>> = const { RefCell::new(None) };
}

/// Restores the previously running domain on drop
pub(crate) struct DomainGuard {
    previous: Option<Domain>,
}

pub(crate) fn enter_domain(domain: Domain) -> DomainGuard {
    let previous = CURRENT_DOMAIN.with(|current| current.borrow_mut().replace(domain));
    DomainGuard { previous }
}

impl Drop for DomainGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_DOMAIN.with(|current| *current.borrow_mut() = previous);
    }
}

/// Domain whose continuation is running on this thread, if any
pub fn current_domain() -> Option<Domain> {
    CURRENT_DOMAIN.with(|current| current.borrow().clone())
}

/// Identity of the running domain, if any
pub fn current_domain_id() -> Option<DomainId> {
    CURRENT_DOMAIN.with(|current| current.borrow().as_ref().map(|d| d.id().clone()))
}

fn run_continuation(domain: &DomainId, job: Job, metrics: &RuntimeMetrics) {
    let started = Instant::now();
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        metrics.record_panic();
        error!(
            domain = %domain,
            panic = %panic_message(payload.as_ref()),
            "Continuation panicked; executor continues with its queue"
        );
    }
    metrics.record_continuation(started.elapsed());
}

// ---------------------------------------------------------------------------
// SerialExecutor
// ---------------------------------------------------------------------------

enum Binding {
    /// Pinned to one OS thread for the executor's whole lifetime
    Thread(OnceCell<Thread>),
    /// Borrows a pool worker for each drain
    Pool(Handle),
}

/// FIFO executor running one continuation at a time
pub struct SerialExecutor {
    me: Weak<SerialExecutor>,
    id: DomainId,
    queue: Mutex<VecDeque<Job>>,
    scheduled: AtomicBool,
    shutdown: AtomicBool,
    depth_warned: AtomicBool,
    binding: Binding,
    settings: ExecutorSettings,
    metrics: Arc<RuntimeMetrics>,
}

impl SerialExecutor {
    /// Executor whose drains run on the shared pool
    pub fn pooled(
        id: DomainId,
        pool: Handle,
        settings: ExecutorSettings,
        metrics: Arc<RuntimeMetrics>,
    ) -> Arc<Self> {
        Self::with_binding(id, Binding::Pool(pool), settings, metrics)
    }

    /// Executor that only ever runs on the thread later passed to
    /// [`SerialExecutor::bind_thread`]
    pub(crate) fn thread_bound(
        id: DomainId,
        settings: ExecutorSettings,
        metrics: Arc<RuntimeMetrics>,
    ) -> Arc<Self> {
        Self::with_binding(id, Binding::Thread(OnceCell::new()), settings, metrics)
    }

    fn with_binding(
        id: DomainId,
        binding: Binding,
        settings: ExecutorSettings,
        metrics: Arc<RuntimeMetrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id,
            queue: Mutex::new(VecDeque::new()),
            scheduled: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            depth_warned: AtomicBool::new(false),
            binding,
            settings,
            metrics,
        })
    }

    pub(crate) fn bind_thread(&self, thread: Thread) {
        if let Binding::Thread(cell) = &self.binding {
            if cell.set(thread).is_err() {
                warn!(domain = %self.id, "Executor thread already bound");
                return;
            }
            // Work submitted before the binding existed could not unpark anyone
            if self.scheduled.load(Ordering::SeqCst) {
                if let Some(thread) = cell.get() {
                    thread.unpark();
                }
            }
        }
    }

    /// Loop run by the bound thread until shutdown
    pub(crate) fn run_bound_loop(self: &Arc<Self>) {
        info!(
            domain = %self.id,
            thread = ?thread::current().name(),
            "Bound executor thread started"
        );

        while !self.shutdown.load(Ordering::SeqCst) {
            if self.scheduled.load(Ordering::SeqCst) {
                self.drain();
            } else {
                thread::park();
            }
        }

        self.clear_queue();
        info!(domain = %self.id, "Bound executor thread stopped");
    }

    fn schedule(&self) {
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        match &self.binding {
            Binding::Thread(cell) => {
                if let Some(thread) = cell.get() {
                    thread.unpark();
                }
            }
            Binding::Pool(pool) => self.spawn_drain(pool),
        }
    }

    fn spawn_drain(&self, pool: &Handle) {
        if let Some(me) = self.me.upgrade() {
            pool.spawn(async move {
                me.drain();
            });
        }
    }

    fn drain(self: &Arc<Self>) {
        let _domain = enter_domain(Domain::new(Arc::clone(self) as Arc<dyn Executor>));
        let budget = match &self.binding {
            Binding::Thread(_) => usize::MAX,
            Binding::Pool(_) => self.settings.drain_budget.max(1),
        };

        let mut ran = 0usize;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                self.clear_queue();
                return;
            }

            if ran >= budget {
                // Hand the worker back but stay scheduled so no second drain starts
                if let Binding::Pool(pool) = &self.binding {
                    debug!(domain = %self.id, ran, "Drain budget exhausted, rescheduling");
                    self.spawn_drain(pool);
                }
                return;
            }

            let next = self.queue.lock().pop_front();
            match next {
                Some(job) => {
                    run_continuation(&self.id, job, &self.metrics);
                    ran += 1;
                }
                None => {
                    self.depth_warned.store(false, Ordering::Relaxed);
                    self.scheduled.store(false, Ordering::SeqCst);
                    // A submit may have landed between the pop and the store
                    if self.queue.lock().is_empty() || self.scheduled.swap(true, Ordering::SeqCst) {
                        return;
                    }
                }
            }
        }
    }

    fn clear_queue(&self) {
        let pending: Vec<Job> = self.queue.lock().drain(..).collect();
        if !pending.is_empty() {
            debug!(domain = %self.id, dropped = pending.len(), "Dropping queued continuations");
        }
        drop(pending);
    }

    fn check_depth(&self, depth: usize) {
        let limit = self.settings.queue_warn_depth;
        if limit > 0 && depth >= limit && !self.depth_warned.swap(true, Ordering::Relaxed) {
            self.metrics.record_queue_depth_warning();
            warn!(
                domain = %self.id,
                depth,
                limit,
                "Executor queue depth exceeded warning threshold"
            );
        }
    }
}

impl Executor for SerialExecutor {
    fn domain_id(&self) -> &DomainId {
        &self.id
    }

    fn submit(&self, job: Job) {
        if self.shutdown.load(Ordering::SeqCst) {
            debug!(domain = %self.id, "Continuation submitted after shutdown dropped");
            drop(job);
            return;
        }

        let depth = {
            let mut queue = self.queue.lock();
            queue.push_back(job);
            queue.len()
        };
        self.check_depth(depth);
        self.schedule();
    }

    fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    fn is_serial(&self) -> bool {
        true
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Binding::Thread(cell) = &self.binding {
            if let Some(thread) = cell.get() {
                thread.unpark();
            }
        }
        self.clear_queue();
    }

    fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.metrics
    }
}

/// Start the OS thread a thread-bound executor runs on
pub(crate) fn spawn_bound_thread(
    executor: &Arc<SerialExecutor>,
    name: &str,
    pool: Handle,
) -> std::io::Result<JoinHandle<()>> {
    let worker = Arc::clone(executor);
    let join = thread::Builder::new().name(name.to_string()).spawn(move || {
        // Timers and IO awaited from this domain register with the pool's reactor
        let _reactor = pool.enter();
        worker.run_bound_loop();
    })?;
    executor.bind_thread(join.thread().clone());
    Ok(join)
}

// ---------------------------------------------------------------------------
// GlobalExecutor
// ---------------------------------------------------------------------------

/// Executor for the global domain: every continuation goes straight to the pool
pub struct GlobalExecutor {
    me: Weak<GlobalExecutor>,
    id: DomainId,
    pool: Handle,
    shutdown: AtomicBool,
    metrics: Arc<RuntimeMetrics>,
}

impl GlobalExecutor {
    pub fn new(pool: Handle, metrics: Arc<RuntimeMetrics>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id: DomainId::Global,
            pool,
            shutdown: AtomicBool::new(false),
            metrics,
        })
    }
}

impl Executor for GlobalExecutor {
    fn domain_id(&self) -> &DomainId {
        &self.id
    }

    fn submit(&self, job: Job) {
        if self.shutdown.load(Ordering::SeqCst) {
            drop(job);
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };

        self.pool.spawn(async move {
            let _domain = enter_domain(Domain::new(Arc::clone(&me) as Arc<dyn Executor>));
            run_continuation(&me.id, job, &me.metrics);
        });
    }

    fn queue_depth(&self) -> usize {
        0
    }

    fn is_serial(&self) -> bool {
        false
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.metrics
    }
}
