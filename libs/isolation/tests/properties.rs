//! Runtime property tests
//!
//! Mutual exclusion per actor, main-domain identity, reentrancy,
//! cancellation and declaration-site isolation, checked end to end.

use isolation_runtime::{
    current_domain_id, spawn, yield_now, ActorBehavior, DomainId, Isolation, Runtime,
    RuntimeError, TaskState,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;

struct Counter;

impl ActorBehavior for Counter {
    type State = u64;

    fn name(&self) -> &str {
        "counter"
    }
}

struct Journal;

impl ActorBehavior for Journal {
    type State = Vec<usize>;
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("isolation_runtime=debug")
        .with_test_writer()
        .try_init();
}

fn runtime() -> Runtime {
    init_tracing();
    Runtime::builder()
        .worker_threads(4)
        .drain_budget(4)
        .build()
        .expect("runtime should start")
}

#[tokio::test]
async fn actor_continuations_never_overlap() {
    let rt = runtime();
    let actor = rt.spawn_actor(Counter, 0).unwrap();
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    // Callers on the global domain, all hammering the same actor
    let mut callers = Vec::new();
    for _ in 0..8 {
        let actor = actor.clone();
        let inside = Arc::clone(&inside);
        let max_inside = Arc::clone(&max_inside);
        callers.push(rt.global_domain().spawn(async move {
            for _ in 0..5 {
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                actor
                    .isolated(move |cx| async move {
                        for _ in 0..3 {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_inside.fetch_max(now, Ordering::SeqCst);
                            cx.with(|count| *count += 1)?;
                            thread::sleep(Duration::from_micros(200));
                            inside.fetch_sub(1, Ordering::SeqCst);
                            // Suspension point between critical sections
                            yield_now().await;
                        }
                        Ok(())
                    })
                    .await?;
            }
            Ok(())
        }));
    }
    for caller in callers {
        caller.await.unwrap();
    }

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    let total = actor
        .isolated(|cx| async move { cx.with(|count| *count) })
        .await
        .unwrap();
    assert_eq!(total, 8 * 5 * 3);
}

#[tokio::test]
async fn busy_actor_does_not_monopolize_the_pool() {
    init_tracing();
    let rt = Runtime::builder()
        .worker_threads(1)
        .drain_budget(8)
        .build()
        .expect("runtime should start");
    let actor = rt.spawn_actor(Counter, 0).unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    // Keeps its own queue non-empty until told to stop
    let spinner = {
        let stop = Arc::clone(&stop);
        actor.isolated(move |cx| async move {
            while !stop.load(Ordering::SeqCst) {
                cx.with(|count| *count += 1)?;
                yield_now().await;
            }
            Ok(())
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let global = rt.global_domain().spawn(async { Ok(5) });
    let result = tokio::time::timeout(Duration::from_secs(5), global).await;
    stop.store(true, Ordering::SeqCst);

    assert_eq!(result.expect("global work starved by a busy actor").unwrap(), 5);
    spinner.await.unwrap();
    let spins = actor
        .isolated(|cx| async move { cx.with(|count| *count) })
        .await
        .unwrap();
    assert!(spins > 8, "actor only ran {} continuations", spins);
}

#[tokio::test]
async fn actor_runs_submissions_in_fifo_order() {
    let rt = runtime();
    let journal = rt.spawn_actor(Journal, Vec::new()).unwrap();

    let tasks: Vec<_> = (0..50)
        .map(|i| journal.isolated(move |cx| async move { cx.with(|entries| entries.push(i)) }))
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let entries = journal
        .isolated(|cx| async move { cx.with(|entries| entries.clone()) })
        .await
        .unwrap();
    assert_eq!(entries, (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn main_domain_work_stays_on_main_thread() {
    let rt = runtime();
    let main_thread = rt.main_thread_id();
    let main = rt.main_domain().clone();

    let observations = rt
        .main_domain()
        .spawn(async move {
            let mut seen = vec![(current_domain_id(), thread::current().id(), main.is_current())];
            tokio::time::sleep(Duration::from_millis(10)).await;
            seen.push((current_domain_id(), thread::current().id(), main.is_current()));
            yield_now().await;
            seen.push((current_domain_id(), thread::current().id(), main.is_current()));
            Ok(seen)
        })
        .await
        .unwrap();

    assert_eq!(observations.len(), 3);
    for (domain, thread_id, is_current) in observations {
        assert_eq!(domain, Some(DomainId::Main));
        assert_eq!(thread_id, main_thread);
        assert!(is_current);
    }
}

#[tokio::test]
async fn awaiting_resumes_on_the_callers_domain() {
    let rt = runtime();
    let actor = rt.spawn_actor(Counter, 0).unwrap();
    let main_thread = rt.main_thread_id();

    let (inner, after) = rt
        .main_domain()
        .spawn(async move {
            let inner = actor
                .isolated(|_| async { Ok(current_domain_id()) })
                .await?;
            Ok((inner, (current_domain_id(), thread::current().id())))
        })
        .await
        .unwrap();

    assert!(matches!(inner, Some(DomainId::Actor(_))));
    assert_eq!(after, (Some(DomainId::Main), main_thread));
}

#[tokio::test]
async fn reentrant_calls_can_lose_updates() {
    let rt = runtime();
    let counter = rt.spawn_actor(Counter, 0).unwrap();

    // Read, suspend, write: the second call runs while the first is suspended
    let racy = || {
        counter.isolated(|cx| async move {
            let seen = cx.with(|count| *count)?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            cx.with(|count| *count = seen + 1)
        })
    };
    let (a, b) = (racy(), racy());
    a.await.unwrap();
    b.await.unwrap();

    let racy_total = counter
        .isolated(|cx| async move { cx.with(|count| *count) })
        .await
        .unwrap();
    assert_eq!(racy_total, 1);

    // Read and write on the same side of the suspension point
    let fixed = rt.spawn_actor(Counter, 0).unwrap();
    let safe = || {
        fixed.isolated(|cx| async move {
            cx.with(|count| *count += 1)?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        })
    };
    let (a, b) = (safe(), safe());
    a.await.unwrap();
    b.await.unwrap();

    let fixed_total = fixed
        .isolated(|cx| async move { cx.with(|count| *count) })
        .await
        .unwrap();
    assert_eq!(fixed_total, 2);
}

#[tokio::test]
async fn cancelled_task_never_yields_its_value() {
    let rt = runtime();
    let (tx, rx) = oneshot::channel::<u32>();

    let task = rt.global_domain().spawn(async move {
        rx.await
            .map_err(|e| RuntimeError::operation_with_source("dependency dropped", e))
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(task.state(), TaskState::Suspended);

    task.cancel();
    // The dependency completes after the cancellation request
    let _ = tx.send(7);

    let err = task.value().await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(task.state(), TaskState::Cancelled);
    assert!(task.try_value().unwrap().is_err());
    assert_eq!(rt.stats().tasks_cancelled, 1);
}

#[tokio::test]
async fn cancellation_reaches_structured_children_only() {
    let rt = runtime();
    let global = rt.global_domain().clone();
    let (children_tx, children_rx) = oneshot::channel();

    let parent = rt.main_domain().spawn(async move {
        let child = spawn(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })?;
        let detached = global.spawn_detached(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        });
        let _ = children_tx.send((child.clone(), detached));
        child.await
    });

    let (child, detached) = children_rx.await.unwrap();
    parent.cancel();

    assert!(parent.value().await.unwrap_err().is_cancelled());
    assert!(child.value().await.unwrap_err().is_cancelled());
    assert!(!detached.is_cancelled());
    detached.value().await.unwrap();
    assert_eq!(detached.state(), TaskState::Completed);
}

#[tokio::test]
async fn detached_work_runs_on_its_declared_domain() {
    let rt = runtime();
    let actor = rt.spawn_actor(Counter, 0).unwrap();
    let background = rt.declare("prefetch", Isolation::Unspecified).unwrap();
    let bump = rt.declare("bump", Isolation::Actor(actor.id())).unwrap();
    let actor_domain = DomainId::Actor(actor.id());

    let (unspecified, isolated) = rt
        .main_domain()
        .spawn(async move {
            let unspecified = background
                .spawn_detached(async { Ok(current_domain_id()) })
                .await?;
            let isolated = bump.spawn_detached(async { Ok(current_domain_id()) }).await?;
            Ok((unspecified, isolated))
        })
        .await
        .unwrap();

    assert_eq!(unspecified, Some(DomainId::Global));
    assert_eq!(isolated, Some(actor_domain));
}

#[tokio::test]
async fn inherited_spawn_stays_on_current_domain() {
    let rt = runtime();
    let actor = rt.spawn_actor(Counter, 0).unwrap();
    let expected = DomainId::Actor(actor.id());

    let domain = actor
        .isolated(|_| async {
            let child = spawn(async { Ok(current_domain_id()) })?;
            child.await
        })
        .await
        .unwrap();
    assert_eq!(domain, Some(expected));
}
