//! Single-flight integration tests

use isolation_runtime::{Runtime, RuntimeError, SingleFlight};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

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
        .build()
        .expect("runtime should start")
}

async fn fetch(executions: Arc<AtomicUsize>, latency: Duration, key: String) -> Result<String, RuntimeError> {
    executions.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(latency).await;
    Ok(format!("image:{}", key))
}

#[tokio::test]
async fn concurrent_callers_share_one_load() {
    let rt = runtime();
    let cache: SingleFlight<String, String> = SingleFlight::new(&rt, "images").unwrap();
    let executions = Arc::new(AtomicUsize::new(0));

    let started = Instant::now();
    let callers: Vec<_> = (0..5)
        .map(|_| {
            let cache = cache.clone();
            let executions = Arc::clone(&executions);
            rt.global_domain().spawn(async move {
                cache
                    .get("avatar".to_string(), move || {
                        fetch(executions, Duration::from_secs(1), "avatar".to_string())
                    })
                    .await
            })
        })
        .collect();

    let mut results = Vec::new();
    for caller in callers {
        results.push(caller.await.unwrap());
    }
    let elapsed = started.elapsed();

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| r == "image:avatar"));
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_millis(1900), "took {:?}", elapsed);

    let stats = cache.stats();
    assert_eq!(stats.loads, 1);
    assert_eq!(stats.joins, 4);
    assert_eq!(cache.in_flight().await.unwrap(), 0);
}

#[tokio::test]
async fn failure_reaches_every_waiter_and_is_not_cached() {
    let rt = runtime();
    let cache: SingleFlight<&'static str, u32> = SingleFlight::new(&rt, "flaky").unwrap();
    let executions = Arc::new(AtomicUsize::new(0));

    let callers: Vec<_> = (0..3)
        .map(|_| {
            let cache = cache.clone();
            let executions = Arc::clone(&executions);
            rt.global_domain().spawn(async move {
                cache
                    .get("k", move || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Err(RuntimeError::operation("upstream unavailable"))
                    })
                    .await
            })
        })
        .collect();

    for caller in callers {
        let err = caller.await.unwrap_err();
        assert_eq!(err.category(), "operation");
        assert!(err.is_retryable());
    }
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(cache.cached("k").await.unwrap(), None);
    assert_eq!(cache.stats().failures, 1);

    // The next request retries
    let retry = Arc::clone(&executions);
    let value = cache
        .get("k", move || async move {
            retry.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        })
        .await
        .unwrap();
    assert_eq!(value, 42);
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cancelling_one_caller_keeps_the_shared_load() {
    let rt = runtime();
    let cache: SingleFlight<u64, String> = SingleFlight::new(&rt, "thumbnails").unwrap();
    let executions = Arc::new(AtomicUsize::new(0));

    let spawn_caller = |cache: SingleFlight<u64, String>, executions: Arc<AtomicUsize>| {
        rt.global_domain().spawn(async move {
            cache
                .get(9, move || fetch(executions, Duration::from_millis(200), "9".to_string()))
                .await
        })
    };

    let impatient = spawn_caller(cache.clone(), Arc::clone(&executions));
    let patient = spawn_caller(cache.clone(), Arc::clone(&executions));

    tokio::time::sleep(Duration::from_millis(50)).await;
    impatient.cancel();

    assert!(impatient.value().await.unwrap_err().is_cancelled());
    assert_eq!(patient.value().await.unwrap(), "image:9");
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(cache.cached(9).await.unwrap().as_deref(), Some("image:9"));
}
