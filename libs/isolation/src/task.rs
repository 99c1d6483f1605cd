//! Tasks
//!
//! A [`Task`] is a handle to asynchronous work bound to one domain. The work is
//! a future polled by the domain's executor: each poll is one continuation,
//! each `Pending` is a suspension point, and each wake re-submits the task to
//! the *same* domain.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──► Enqueued ──► Running ──┬──► Completed
//!                            ▲       ├──► Cancelled
//!                            │       ▼
//!                         Resumed ◄─ Suspended
//! ```
//!
//! # Cancellation
//!
//! Cancellation is cooperative. [`Task::cancel`] sets a monotonic flag and
//! never preempts a running continuation. The flag is observed at the task's
//! next resumption, where the pending future is dropped and the task completes
//! as cancelled, or explicitly through [`is_cancelled`] and
//! [`check_cancellation`]. A task whose flag was set before it finished never
//! hands a value to its awaiters. Structured children are cancelled with their
//! parent; detached tasks are not.

use crate::error::panic_message;
use crate::executor::current_domain;
use crate::registry::Domain;
use crate::{Result, RuntimeError};

use futures::future::BoxFuture;
use futures::task::{waker_ref, ArcWake};
use futures::FutureExt;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tracing::{debug, error, trace};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Observable task state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Created = 0,
    Enqueued = 1,
    Running = 2,
    Suspended = 3,
    Resumed = 4,
    Completed = 5,
    Cancelled = 6,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Created,
            1 => TaskState::Enqueued,
            2 => TaskState::Running,
            3 => TaskState::Suspended,
            4 => TaskState::Resumed,
            5 => TaskState::Completed,
            _ => TaskState::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled)
    }
}

/// Scheduling hint, propagated best-effort to structured children
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Relationship between a new task and the task creating it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    /// Child of the current task: shares its cancellation scope
    Structured,
    /// No relationship to the creator
    Detached,
}

/// Options for spawning a task on a domain
#[derive(Debug, Clone)]
pub struct TaskOptions {
    mode: SpawnMode,
    label: Cow<'static, str>,
    priority: Option<TaskPriority>,
}

impl TaskOptions {
    pub fn structured() -> Self {
        Self {
            mode: SpawnMode::Structured,
            label: Cow::Borrowed("task"),
            priority: None,
        }
    }

    pub fn detached() -> Self {
        Self {
            mode: SpawnMode::Detached,
            ..Self::structured()
        }
    }

    pub fn label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = label.into();
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }
}

// Scheduling states, separate from the observable TaskState
const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
const NOTIFIED: u8 = 3;
const DONE: u8 = 4;

/// Type-erased view of a task used for structured cancellation
pub(crate) trait TaskControl: Send + Sync {
    fn id(&self) -> TaskId;
    fn priority(&self) -> TaskPriority;
    fn is_cancelled(&self) -> bool;
    fn cancel(&self);
    fn adopt(&self, child: Weak<dyn TaskControl>);
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<dyn TaskControl>>> = const { RefCell::new(None) };
}

struct TaskGuard {
    previous: Option<Arc<dyn TaskControl>>,
}

fn enter_task(task: Arc<dyn TaskControl>) -> TaskGuard {
    let previous = CURRENT_TASK.with(|current| current.borrow_mut().replace(task));
    TaskGuard { previous }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_TASK.with(|current| *current.borrow_mut() = previous);
    }
}

fn current_task() -> Option<Arc<dyn TaskControl>> {
    CURRENT_TASK.with(|current| current.borrow().clone())
}

struct Slot<T> {
    result: Option<Result<T>>,
    waiters: Vec<Waker>,
}

struct TaskCell<T> {
    me: Weak<TaskCell<T>>,
    id: TaskId,
    label: Cow<'static, str>,
    domain: Domain,
    mode: SpawnMode,
    priority: TaskPriority,
    future: Mutex<Option<BoxFuture<'static, Result<T>>>>,
    sched: AtomicU8,
    state: AtomicU8,
    cancelled: AtomicBool,
    children: Mutex<Vec<Weak<dyn TaskControl>>>,
    slot: Mutex<Slot<T>>,
}

impl<T: Send + 'static> TaskCell<T> {
    fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn schedule(&self) {
        let mut current = self.sched.load(Ordering::SeqCst);
        loop {
            let next = match current {
                IDLE => SCHEDULED,
                RUNNING => NOTIFIED,
                _ => return,
            };
            match self
                .sched
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) if next == SCHEDULED => {
                    self.submit();
                    return;
                }
                // The running continuation re-submits once it suspends
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn submit(&self) {
        let Some(cell) = self.me.upgrade() else {
            return;
        };
        let next = if self.state() == TaskState::Created {
            TaskState::Enqueued
        } else {
            TaskState::Resumed
        };
        self.set_state(next);

        let run = TaskRun { cell: Some(cell) };
        self.domain.executor().submit(Box::new(move || run.run()));
    }

    /// One continuation: poll until the next suspension point or completion
    fn run_once(self: &Arc<Self>) {
        if self
            .sched
            .compare_exchange(SCHEDULED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.set_state(TaskState::Running);
        let _task = enter_task(Arc::clone(self) as Arc<dyn TaskControl>);

        let outcome = if self.cancelled.load(Ordering::SeqCst) {
            Some(Err(RuntimeError::Cancelled))
        } else {
            let waker = waker_ref(self);
            let mut cx = Context::from_waker(&waker);
            let mut future = self.future.lock();
            match future.as_mut() {
                Some(fut) => {
                    match panic::catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx))) {
                        Ok(Poll::Ready(result)) => Some(result),
                        Ok(Poll::Pending) => None,
                        Err(payload) => {
                            let message = panic_message(payload.as_ref());
                            error!(
                                task_id = %self.id,
                                label = %self.label,
                                domain = %self.domain.id(),
                                panic = %message,
                                "Task panicked"
                            );
                            Some(Err(RuntimeError::panicked(message)))
                        }
                    }
                }
                None => Some(Err(RuntimeError::Cancelled)),
            }
        };

        match outcome {
            Some(result) => self.complete(result),
            None => self.suspend(),
        }
    }

    fn suspend(&self) {
        self.set_state(TaskState::Suspended);
        self.domain.metrics().record_suspension();

        if self
            .sched
            .compare_exchange(RUNNING, IDLE, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Woken while running: go around again on the same domain
            self.sched.store(SCHEDULED, Ordering::SeqCst);
            self.submit();
        }
    }

    fn complete(&self, result: Result<T>) {
        let result = match result {
            Ok(_) if self.cancelled.load(Ordering::SeqCst) => Err(RuntimeError::Cancelled),
            other => other,
        };
        self.sched.store(DONE, Ordering::SeqCst);

        // Destructors of the future run outside the lock
        let future = self.future.lock().take();
        drop(future);

        self.finish(result);
    }

    /// The executor dropped the continuation without running it
    fn abandon(&self) {
        if self
            .sched
            .compare_exchange(SCHEDULED, DONE, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let future = self.future.lock().take();
        drop(future);

        self.finish(Err(RuntimeError::executor(
            self.domain.id().to_string(),
            "executor shut down before the task could run",
        )));
    }

    fn finish(&self, result: Result<T>) {
        let metrics = self.domain.metrics();
        metrics.record_outcome(&result);
        let terminal = match &result {
            Ok(_) => TaskState::Completed,
            Err(e) if e.is_cancelled() => TaskState::Cancelled,
            Err(e) => {
                debug!(
                    task_id = %self.id,
                    label = %self.label,
                    error = %e,
                    error_category = e.category(),
                    "Task finished with failure"
                );
                TaskState::Completed
            }
        };

        // Waiters that see the result must also see the terminal state
        self.set_state(terminal);
        let waiters = {
            let mut slot = self.slot.lock();
            slot.result = Some(result);
            std::mem::take(&mut slot.waiters)
        };

        for waker in waiters {
            waker.wake();
        }
    }
}

impl<T: Send + 'static> ArcWake for TaskCell<T> {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.schedule();
    }
}

impl<T: Send + 'static> TaskControl for TaskCell<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn priority(&self) -> TaskPriority {
        self.priority
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(task_id = %self.id, label = %self.label, "Task cancellation requested");

        let children = std::mem::take(&mut *self.children.lock());
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }

        // A suspended task is re-enqueued so it observes the flag promptly
        self.schedule();
    }

    fn adopt(&self, child: Weak<dyn TaskControl>) {
        let mut children = self.children.lock();
        children.retain(|c| c.strong_count() > 0);
        children.push(child);
    }
}

/// Runs one continuation; abandons the task if dropped unrun
struct TaskRun<T: Send + 'static> {
    cell: Option<Arc<TaskCell<T>>>,
}

impl<T: Send + 'static> TaskRun<T> {
    fn run(mut self) {
        if let Some(cell) = self.cell.take() {
            cell.run_once();
        }
    }
}

impl<T: Send + 'static> Drop for TaskRun<T> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            cell.abandon();
        }
    }
}

/// Handle to asynchronous work bound to one domain
///
/// Awaiting a task suspends the caller until the task completes or is
/// cancelled; the caller resumes on its own domain. Any number of handles may
/// await the same task. Dropping a handle does not cancel the task.
pub struct Task<T> {
    cell: Arc<TaskCell<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Send + 'static> Task<T> {
    pub fn id(&self) -> TaskId {
        self.cell.id
    }

    pub fn label(&self) -> &str {
        &self.cell.label
    }

    pub fn state(&self) -> TaskState {
        self.cell.state()
    }

    /// Domain the task was bound to at creation
    pub fn domain(&self) -> &Domain {
        &self.cell.domain
    }

    pub fn is_detached(&self) -> bool {
        self.cell.mode == SpawnMode::Detached
    }

    pub fn priority(&self) -> TaskPriority {
        self.cell.priority
    }

    /// Request cooperative cancellation
    pub fn cancel(&self) {
        TaskControl::cancel(self.cell.as_ref());
    }

    pub fn is_cancelled(&self) -> bool {
        self.cell.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the result slot has been written
    pub fn is_finished(&self) -> bool {
        self.cell.slot.lock().result.is_some()
    }
}

impl<T: Clone + Send + 'static> Task<T> {
    /// Await the task's result
    pub async fn value(&self) -> Result<T> {
        self.clone().await
    }

    /// The result, if the task already finished
    pub fn try_value(&self) -> Option<Result<T>> {
        self.cell.slot.lock().result.clone()
    }
}

impl<T: Clone + Send + 'static> Future for Task<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.cell.slot.lock();
        if let Some(result) = slot.result.as_ref() {
            return Poll::Ready(result.clone());
        }
        if !slot.waiters.iter().any(|w| w.will_wake(cx.waker())) {
            slot.waiters.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T: Send + 'static> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.cell.id)
            .field("label", &self.cell.label)
            .field("domain", self.cell.domain.id())
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

pub(crate) fn spawn_on<T, F>(domain: &Domain, options: TaskOptions, future: F) -> Task<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let parent = match options.mode {
        SpawnMode::Structured => current_task(),
        SpawnMode::Detached => None,
    };
    let priority = options
        .priority
        .or_else(|| parent.as_ref().map(|p| p.priority()))
        .unwrap_or_default();

    let cell = Arc::new_cyclic(|me| TaskCell {
        me: me.clone(),
        id: TaskId::next(),
        label: options.label,
        domain: domain.clone(),
        mode: options.mode,
        priority,
        future: Mutex::new(Some(future.boxed())),
        sched: AtomicU8::new(IDLE),
        state: AtomicU8::new(TaskState::Created as u8),
        cancelled: AtomicBool::new(false),
        children: Mutex::new(Vec::new()),
        slot: Mutex::new(Slot {
            result: None,
            waiters: Vec::new(),
        }),
    });

    if let Some(parent) = &parent {
        let control: Arc<dyn TaskControl> = cell.clone();
        parent.adopt(Arc::downgrade(&control));
        // The parent may have been cancelled before it adopted us
        if parent.is_cancelled() {
            cell.cancelled.store(true, Ordering::SeqCst);
        }
    }

    domain.metrics().record_spawn();
    trace!(
        task_id = %cell.id,
        label = %cell.label,
        domain = %domain.id(),
        mode = ?cell.mode,
        parent = ?parent.as_ref().map(|p| p.id()),
        "Spawned task"
    );

    cell.schedule();
    Task { cell }
}

impl Domain {
    /// Spawn a structured task bound to this domain
    pub fn spawn<T, F>(&self, future: F) -> Task<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        spawn_on(self, TaskOptions::structured(), future)
    }

    /// Spawn a task with no relationship to the current task
    pub fn spawn_detached<T, F>(&self, future: F) -> Task<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        spawn_on(self, TaskOptions::detached(), future)
    }

    pub fn spawn_with<T, F>(&self, options: TaskOptions, future: F) -> Task<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        spawn_on(self, options, future)
    }

    /// Submit a batch of synchronous work as a single continuation
    pub fn run<T, F>(&self, body: F) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        spawn_on(
            self,
            TaskOptions::structured().label("batch"),
            async move { Ok(body()) },
        )
    }
}

/// Spawn a structured task on the current domain
///
/// Fails when called from outside every isolation domain.
pub fn spawn<T, F>(future: F) -> Result<Task<T>>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let domain = current_domain()
        .ok_or_else(|| RuntimeError::domain("task::spawn called outside any isolation domain"))?;
    Ok(domain.spawn(future))
}

/// Identity of the task running on this thread
pub fn current_task_id() -> Option<TaskId> {
    current_task().map(|task| task.id())
}

/// Whether the running task has been asked to cancel
pub fn is_cancelled() -> bool {
    current_task().map_or(false, |task| task.is_cancelled())
}

/// `Err(Cancelled)` once the running task has been asked to cancel
pub fn check_cancellation() -> Result<()> {
    if is_cancelled() {
        Err(RuntimeError::Cancelled)
    } else {
        Ok(())
    }
}

/// Explicit suspension point: lets the domain run other queued work first
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Race a task against a timer; on timeout the task is cancelled
pub async fn timeout<T>(duration: Duration, task: Task<T>) -> Result<T>
where
    T: Clone + Send + 'static,
{
    match tokio::time::timeout(duration, task.clone()).await {
        Ok(result) => result,
        Err(_) => {
            task.cancel();
            debug!(
                task_id = %task.id(),
                label = %task.label(),
                timeout_ms = duration.as_millis() as u64,
                "Task timed out and was cancelled"
            );
            Err(RuntimeError::timeout(
                task.label().to_string(),
                duration.as_millis() as u64,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Runtime;
    use std::sync::atomic::AtomicUsize;

    fn runtime() -> Runtime {
        Runtime::builder().worker_threads(2).build().unwrap()
    }

    #[tokio::test]
    async fn test_task_completes_with_value() {
        let rt = runtime();
        let task = rt.global_domain().spawn(async { Ok(21 * 2) });

        assert_eq!(task.value().await.unwrap(), 42);
        assert_eq!(task.state(), TaskState::Completed);
        assert!(task.is_finished());
        assert_eq!(task.try_value().unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_multiple_waiters_observe_same_result() {
        let rt = runtime();
        let task = rt.global_domain().spawn(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(String::from("shared"))
        });

        let (a, b, c) = tokio::join!(task.value(), task.value(), task.clone());
        assert_eq!(a.unwrap(), "shared");
        assert_eq!(b.unwrap(), "shared");
        assert_eq!(c.unwrap(), "shared");
    }

    #[tokio::test]
    async fn test_task_state_reports_suspension() {
        let rt = runtime();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = rt.global_domain().spawn(async move {
            rx.await.map_err(|e| RuntimeError::operation_with_source("signal", e))?;
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(task.state(), TaskState::Suspended);

        tx.send(()).unwrap();
        task.value().await.unwrap();
        assert_eq!(task.state(), TaskState::Completed);
    }

    #[tokio::test]
    async fn test_panic_becomes_task_failure() {
        let rt = runtime();
        let task: Task<()> = rt.global_domain().spawn(async { panic!("bad continuation") });

        let err = task.value().await.unwrap_err();
        assert_eq!(err.category(), "panicked");

        // The domain keeps working afterwards
        let next = rt.main_domain().spawn(async { Ok(1) });
        assert_eq!(next.value().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_explicit_cancellation_check() {
        let rt = runtime();
        let observed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&observed);

        // Never suspends, so only an explicit check can observe the flag
        let task = rt.global_domain().spawn(async move {
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            while !is_cancelled() && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            if is_cancelled() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            check_cancellation()?;
            Ok("finished without cancellation")
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        task.cancel();

        let err = task.value().await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(task.state(), TaskState::Cancelled);
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_spawn_outside_domain_fails() {
        let err = spawn(async { Ok(()) }).unwrap_err();
        assert_eq!(err.category(), "domain");
        assert!(current_task_id().is_none());
        assert!(!is_cancelled());
    }

    #[tokio::test]
    async fn test_timeout_cancels_loser() {
        let rt = runtime();
        let slow = rt.global_domain().spawn_with(
            TaskOptions::detached().label("slow-fetch"),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1)
            },
        );

        let err = timeout(Duration::from_millis(50), slow.clone()).await.unwrap_err();
        assert_eq!(err.category(), "timeout");
        assert!(err.to_string().contains("slow-fetch"));
        assert!(slow.is_cancelled());
        assert!(slow.value().await.unwrap_err().is_cancelled());

        let fast = rt.global_domain().spawn(async { Ok(7) });
        assert_eq!(timeout(Duration::from_secs(1), fast).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_priority_propagates_to_structured_children_only() {
        let rt = runtime();
        let global = rt.global_domain().clone();

        let parent = rt.main_domain().spawn_with(
            TaskOptions::structured().priority(TaskPriority::High),
            async move {
                let child = spawn(async { Ok(()) })?;
                let detached = global.spawn_detached(async { Ok(()) });
                Ok((child.priority(), detached.priority()))
            },
        );

        let (child, detached) = parent.value().await.unwrap();
        assert_eq!(child, TaskPriority::High);
        assert_eq!(detached, TaskPriority::Normal);
    }
}
