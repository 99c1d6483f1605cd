//! Actors
//!
//! An actor is an isolation domain paired with mutable state. The state lives
//! behind the actor's serial executor: it is reachable only through an
//! [`ActorContext`], which is handed to isolated operations and refuses to
//! touch the state from any other domain.
//!
//! # Reentrancy
//!
//! Mutual exclusion holds only *between suspension points*. While an isolated
//! operation is suspended the actor keeps running other queued work,
//! including fresh calls into itself, so a value read before an `.await` may
//! be stale after it:
//!
//! ```ignore
//! let counter = runtime.spawn_actor(Counter, 0u64)?;
//!
//! // Lost update: both calls read 0 before either writes
//! counter.isolated(|cx| async move {
//!     let seen = cx.with(|count| *count)?;
//!     tokio::time::sleep(Duration::from_millis(10)).await;
//!     cx.with(|count| *count = seen + 1)
//! });
//!
//! // Read and write on the same side of the suspension point
//! counter.isolated(|cx| async move {
//!     cx.with(|count| *count += 1)?;
//!     tokio::time::sleep(Duration::from_millis(10)).await;
//!     Ok(())
//! });
//! ```
//!
//! `ActorContext::with` takes a synchronous closure, so a borrow of the state
//! can never be held across a suspension point.

use crate::metrics::RuntimeMetrics;
use crate::registry::{ActorId, Domain, DomainRegistry};
use crate::task::{Task, TaskOptions};
use crate::{Result, RuntimeError};

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

/// Immutable half of an actor, shared by every domain
///
/// The behavior is readable from anywhere; the associated `State` is only
/// reachable from the actor's own domain.
pub trait ActorBehavior: Send + Sync + 'static {
    type State: Send + 'static;

    /// Name used in logs and task labels
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// First continuation the actor runs, before any isolated operation
    fn on_start(&self, _state: &mut Self::State) {}

    /// Runs once the last reference to the actor is gone
    ///
    /// This is the one place state is touched off the actor's domain: it runs
    /// on whichever thread drops the last reference, which then owns the state
    /// exclusively, so no isolated operation can still observe it.
    fn on_stop(&self, _state: &mut Self::State) {}
}

struct ActorInner<A: ActorBehavior> {
    id: ActorId,
    behavior: A,
    state: Mutex<A::State>,
    domain: Domain,
    registry: DomainRegistry,
    metrics: Arc<RuntimeMetrics>,
}

impl<A: ActorBehavior> Drop for ActorInner<A> {
    fn drop(&mut self) {
        self.behavior.on_stop(self.state.get_mut());
        // Already gone when the whole registry was shut down
        let _ = self.registry.unregister_actor(&self.id);
        self.metrics.actors_stopped.fetch_add(1, Ordering::Relaxed);
        info!(actor_id = %self.id, actor = self.behavior.name(), "Actor stopped");
    }
}

/// Handle to a live actor
///
/// The actor's domain stays registered while any handle, context or pending
/// isolated operation refers to it.
pub struct ActorRef<A: ActorBehavior> {
    inner: Arc<ActorInner<A>>,
}

impl<A: ActorBehavior> Clone for ActorRef<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: ActorBehavior> ActorRef<A> {
    pub(crate) fn start(
        registry: &DomainRegistry,
        metrics: &Arc<RuntimeMetrics>,
        behavior: A,
        state: A::State,
    ) -> Result<Self> {
        let id = ActorId::new();
        let domain = registry.register_actor(id)?;

        let actor = Self {
            inner: Arc::new(ActorInner {
                id,
                behavior,
                state: Mutex::new(state),
                domain,
                registry: registry.clone(),
                metrics: Arc::clone(metrics),
            }),
        };
        metrics.actors_spawned.fetch_add(1, Ordering::Relaxed);
        info!(actor_id = %id, actor = actor.behavior().name(), "Actor spawned");

        // FIFO: nothing isolated can run before this continuation
        actor.isolated_detached(|cx| async move {
            cx.with_behavior(|behavior, state| behavior.on_start(state))
        });

        Ok(actor)
    }

    pub fn id(&self) -> ActorId {
        self.inner.id
    }

    /// The actor's serial domain
    pub fn domain(&self) -> &Domain {
        &self.inner.domain
    }

    /// Non-isolated data, readable from any domain
    pub fn behavior(&self) -> &A {
        &self.inner.behavior
    }

    fn context(&self) -> ActorContext<A> {
        ActorContext {
            inner: Arc::clone(&self.inner),
        }
    }

    fn label(&self) -> String {
        format!("{}::isolated", self.inner.behavior.name())
    }

    /// Run an isolated operation on the actor's executor
    ///
    /// The closure itself is invoked on the actor's domain, and every
    /// continuation of the future it returns runs there too. The operation is
    /// a structured child of the calling task.
    pub fn isolated<T, F, Fut>(&self, op: F) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce(ActorContext<A>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let cx = self.context();
        self.inner
            .domain
            .spawn_with(TaskOptions::structured().label(self.label()), async move {
                op(cx).await
            })
    }

    /// Like [`ActorRef::isolated`], with no relationship to the calling task
    pub fn isolated_detached<T, F, Fut>(&self, op: F) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce(ActorContext<A>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let cx = self.context();
        self.inner
            .domain
            .spawn_with(TaskOptions::detached().label(self.label()), async move {
                op(cx).await
            })
    }

    /// Run an operation that may not touch the actor's state
    ///
    /// It runs on the global domain and only sees the immutable behavior.
    pub fn nonisolated<T, F, Fut>(&self, op: F) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce(NonIsolated<A>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let view = NonIsolated {
            inner: Arc::clone(&self.inner),
        };
        self.inner.registry.global().spawn_with(
            TaskOptions::structured().label(format!("{}::nonisolated", self.inner.behavior.name())),
            async move { op(view).await },
        )
    }
}

impl<A: ActorBehavior> fmt::Debug for ActorRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef")
            .field("id", &self.inner.id)
            .field("name", &self.inner.behavior.name())
            .finish()
    }
}

/// Access to an actor's state from inside one of its isolated operations
pub struct ActorContext<A: ActorBehavior> {
    inner: Arc<ActorInner<A>>,
}

impl<A: ActorBehavior> Clone for ActorContext<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: ActorBehavior> ActorContext<A> {
    /// Synchronous access to the state
    ///
    /// Fails with an isolation violation when called from any domain but the
    /// actor's own, or from inside another `with` on the same actor.
    pub fn with<R>(&self, f: impl FnOnce(&mut A::State) -> R) -> Result<R> {
        self.with_behavior(|_, state| f(state))
    }

    /// Like [`ActorContext::with`], also lending the behavior
    pub fn with_behavior<R>(&self, f: impl FnOnce(&A, &mut A::State) -> R) -> Result<R> {
        self.inner
            .domain
            .check_current(&format!("state of {}", self.inner.behavior.name()))?;

        let Some(mut state) = self.inner.state.try_lock() else {
            debug!(actor_id = %self.inner.id, "Nested state access refused");
            return Err(RuntimeError::isolation_violation(
                format!("nested state access on {}", self.inner.behavior.name()),
                *self.inner.domain.id(),
                Some(*self.inner.domain.id()),
            ));
        };
        Ok(f(&self.inner.behavior, &mut state))
    }

    pub fn behavior(&self) -> &A {
        &self.inner.behavior
    }

    pub fn id(&self) -> ActorId {
        self.inner.id
    }

    pub fn domain(&self) -> &Domain {
        &self.inner.domain
    }

    /// Handle to the actor, for calls back into itself
    pub fn actor(&self) -> ActorRef<A> {
        ActorRef {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// View of an actor that exposes only its non-isolated half
pub struct NonIsolated<A: ActorBehavior> {
    inner: Arc<ActorInner<A>>,
}

impl<A: ActorBehavior> NonIsolated<A> {
    pub fn behavior(&self) -> &A {
        &self.inner.behavior
    }

    pub fn id(&self) -> ActorId {
        self.inner.id
    }
}
