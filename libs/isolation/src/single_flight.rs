//! Single-Flight Coordinator
//!
//! A keyed cache that guarantees at most one in-flight load per key. The
//! coordinator is itself an actor, so its bookkeeping is serialized, but the
//! actor is reentrant: while one caller waits for a load, other callers run
//! their lookups. The in-flight marker is what keeps those interleavings from
//! starting duplicate loads, and it is recorded before the first suspension
//! point of the caller that starts the load.
//!
//! Loaders run as detached tasks on the coordinator's domain. Cancelling one
//! caller never cancels the shared load. Failed loads are not cached; their
//! failure reaches every caller that joined them.

use crate::actor::{ActorBehavior, ActorContext, ActorRef};
use crate::runtime::Runtime;
use crate::error::panic_message;
use crate::task::{current_task_id, Task, TaskId, TaskOptions};
use crate::{Result, RuntimeError};

use futures::FutureExt;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Cache entry for one key
pub enum FlightEntry<V> {
    /// A load is running; later callers join it
    InProgress(Task<V>),
    /// A completed load
    Ready(V),
}

enum Lookup<V> {
    Hit(V),
    Join(Task<V>),
    Miss,
}

/// Counters kept on the coordinator's non-isolated half
#[derive(Debug, Default)]
struct FlightCounters {
    hits: AtomicU64,
    joins: AtomicU64,
    loads: AtomicU64,
    failures: AtomicU64,
}

/// Snapshot of a coordinator's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlightStats {
    /// Served from the cache
    pub hits: u64,
    /// Joined a load another caller started
    pub joins: u64,
    /// Loads started
    pub loads: u64,
    /// Loads that failed
    pub failures: u64,
}

/// Actor behavior backing a [`SingleFlight`]
pub struct FlightCache<K, V> {
    name: String,
    counters: FlightCounters,
    _entries: PhantomData<fn() -> (K, V)>,
}

impl<K, V> ActorBehavior for FlightCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type State = HashMap<K, FlightEntry<V>>;

    fn name(&self) -> &str {
        &self.name
    }

    fn on_stop(&self, state: &mut Self::State) {
        let pending = state
            .values()
            .filter(|entry| matches!(entry, FlightEntry::InProgress(_)))
            .count();
        if pending > 0 {
            debug!(cache = %self.name, pending, "Single-flight cache stopped with loads in flight");
        }
    }
}

/// Deduplicating async cache
pub struct SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    actor: ActorRef<FlightCache<K, V>>,
}

impl<K, V> Clone for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            actor: self.actor.clone(),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Spawn a coordinator actor on `runtime`
    pub fn new(runtime: &Runtime, name: impl Into<String>) -> Result<Self> {
        let behavior = FlightCache {
            name: name.into(),
            counters: FlightCounters::default(),
            _entries: PhantomData,
        };
        let actor = runtime.spawn_actor(behavior, HashMap::new())?;
        Ok(Self { actor })
    }

    pub fn name(&self) -> &str {
        &self.actor.behavior().name
    }

    /// The coordinator's actor
    pub fn actor(&self) -> &ActorRef<FlightCache<K, V>> {
        &self.actor
    }

    /// Value for `key`, loading it at most once no matter how many callers ask
    ///
    /// 1. a cached value is returned immediately;
    /// 2. a load already in flight is joined;
    /// 3. otherwise `loader` starts as a detached task and is recorded as the
    ///    key's in-flight load before this caller first suspends.
    pub fn get<F, Fut>(&self, key: K, loader: F) -> impl Future<Output = Result<V>> + Send + '_
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        async move {
        self.actor
            .isolated(move |cx| async move {
                let lookup = cx.with(|entries| match entries.get(&key) {
                    Some(FlightEntry::Ready(value)) => Lookup::Hit(value.clone()),
                    Some(FlightEntry::InProgress(task))
                        if !task.is_cancelled() && !task.is_finished() =>
                    {
                        Lookup::Join(task.clone())
                    }
                    // Absent, or a load that was cancelled or died without
                    // clearing its marker
                    _ => Lookup::Miss,
                })?;

                let counters = &cx.behavior().counters;
                match lookup {
                    Lookup::Hit(value) => {
                        counters.hits.fetch_add(1, Ordering::Relaxed);
                        trace!(cache = %cx.behavior().name, key = ?key, "Single-flight hit");
                        Ok(value)
                    }
                    Lookup::Join(task) => {
                        counters.joins.fetch_add(1, Ordering::Relaxed);
                        trace!(
                            cache = %cx.behavior().name,
                            key = ?key,
                            task_id = %task.id(),
                            "Joining in-flight load"
                        );
                        task.await
                    }
                    Lookup::Miss => {
                        counters.loads.fetch_add(1, Ordering::Relaxed);
                        let task = start_load(&cx, key.clone(), loader);
                        // Recorded in the same continuation that started the
                        // load: no other lookup can run in between
                        cx.with(|entries| {
                            entries.insert(key, FlightEntry::InProgress(task.clone()))
                        })?;
                        task.await
                    }
                }
            })
            .await
        }
    }

    /// Cached value for `key`, without loading
    pub async fn cached(&self, key: K) -> Result<Option<V>> {
        self.actor
            .isolated(move |cx| async move {
                cx.with(|entries| match entries.get(&key) {
                    Some(FlightEntry::Ready(value)) => Some(value.clone()),
                    _ => None,
                })
            })
            .await
    }

    /// Forget `key`; a load in flight keeps running but its result is dropped
    pub async fn invalidate(&self, key: K) -> Result<bool> {
        self.actor
            .isolated(move |cx| async move { cx.with(|entries| entries.remove(&key).is_some()) })
            .await
    }

    /// Cancel the load in flight for `key`, if any
    ///
    /// Callers already waiting on it observe the cancellation; the next
    /// request for the key starts a fresh load.
    pub async fn cancel(&self, key: K) -> Result<bool> {
        self.actor
            .isolated(move |cx| async move {
                cx.with(|entries| match entries.remove(&key) {
                    Some(FlightEntry::InProgress(task)) => {
                        task.cancel();
                        true
                    }
                    Some(ready) => {
                        entries.insert(key, ready);
                        false
                    }
                    None => false,
                })
            })
            .await
    }

    /// Drop every cached value and in-flight marker
    pub async fn clear(&self) -> Result<usize> {
        self.actor
            .isolated(|cx| async move {
                cx.with(|entries| {
                    let removed = entries.len();
                    entries.clear();
                    removed
                })
            })
            .await
    }

    /// Number of loads in flight
    pub async fn in_flight(&self) -> Result<usize> {
        self.actor
            .isolated(|cx| async move {
                cx.with(|entries| {
                    entries
                        .values()
                        .filter(|entry| matches!(entry, FlightEntry::InProgress(_)))
                        .count()
                })
            })
            .await
    }

    /// Number of cached values
    pub async fn len(&self) -> Result<usize> {
        self.actor
            .isolated(|cx| async move {
                cx.with(|entries| {
                    entries
                        .values()
                        .filter(|entry| matches!(entry, FlightEntry::Ready(_)))
                        .count()
                })
            })
            .await
    }

    pub fn stats(&self) -> FlightStats {
        let counters = &self.actor.behavior().counters;
        FlightStats {
            hits: counters.hits.load(Ordering::Relaxed),
            joins: counters.joins.load(Ordering::Relaxed),
            loads: counters.loads.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
        }
    }
}

/// Start the loader as a detached task on the coordinator's domain
fn start_load<K, V, F, Fut>(cx: &ActorContext<FlightCache<K, V>>, key: K, loader: F) -> Task<V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<V>> + Send + 'static,
{
    let owner = cx.clone();
    let options = TaskOptions::detached().label(format!("{}::load", cx.behavior().name));

    cx.domain().spawn_with(options, async move {
        // A panicking loader still has to give up its marker
        let result = match AssertUnwindSafe(async move { loader().await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => Err(RuntimeError::panicked(panic_message(payload.as_ref()))),
        };

        // Back on the coordinator: settle our own marker only
        let me: Option<TaskId> = current_task_id();
        owner.with(|entries| {
            let ours = matches!(
                entries.get(&key),
                Some(FlightEntry::InProgress(task)) if Some(task.id()) == me
            );
            if !ours {
                return;
            }
            match &result {
                Ok(value) => {
                    entries.insert(key.clone(), FlightEntry::Ready(value.clone()));
                }
                Err(_) => {
                    entries.remove(&key);
                }
            }
        })?;

        if let Err(e) = &result {
            owner.behavior().counters.failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                cache = %owner.behavior().name,
                key = ?key,
                error = %e,
                error_category = e.category(),
                "Single-flight load failed"
            );
        } else {
            debug!(cache = %owner.behavior().name, key = ?key, "Single-flight load completed");
        }
        result
    })
}

impl<K, V> fmt::Debug for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlight")
            .field("name", &self.actor.behavior().name)
            .field("actor", &self.actor.id())
            .finish()
    }
}
