//! Integration tests for the worker pool.
//!
//! These run real bodies on the blocking thread pool, so they use short
//! dispatch ticks and generous timing margins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use compute_forge::config::PoolConfig;
use compute_forge::error::EngineError;
use compute_forge::scheduler::{
    Job, JobHandle, JobId, JobKind, JobRegistry, Priority, WorkerPool,
};
use serde_json::{json, Value};

const TICK: Duration = Duration::from_millis(2);

fn fast_config(workers: usize) -> PoolConfig {
    PoolConfig::fixed(workers).with_dispatch_tick(TICK)
}

fn job(id: u64, payload: Value) -> Job {
    Job::new(JobId(id), JobKind::MonteCarlo, payload)
}

fn sleep_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

/// Registry whose body records `payload.tag` at start and sleeps `payload.sleep_ms`.
fn recording_registry(log: Arc<Mutex<Vec<String>>>) -> JobRegistry {
    JobRegistry::new().with(JobKind::MonteCarlo, move |ctx| {
        let payload = ctx.payload();
        if let Some(tag) = payload["tag"].as_str() {
            log.lock().expect("log lock").push(tag.to_string());
        }
        sleep_ms(payload["sleep_ms"].as_u64().unwrap_or(0));
        Ok(json!(null))
    })
}

async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    condition()
}

fn is_running(pool: &WorkerPool, id: JobId) -> bool {
    pool.worker_stats()
        .iter()
        .any(|w| w.current_job == Some(id))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispatch_order_is_priority_then_fifo() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let pool = WorkerPool::new(fast_config(1), recording_registry(Arc::clone(&log)))
        .expect("valid pool");

    // Occupy the only worker so the whole batch queues up behind it.
    let blocker = pool.submit(job(0, json!({"tag": "blocker", "sleep_ms": 80})));
    assert!(wait_until(Duration::from_secs(1), || is_running(&pool, JobId(0))).await);

    let submissions = [
        Priority::Low,
        Priority::High,
        Priority::Medium,
        Priority::Critical,
        Priority::Low,
        Priority::High,
        Priority::Critical,
        Priority::Medium,
        Priority::Low,
        Priority::High,
    ];
    let mut handles = Vec::new();
    let mut tags = Vec::new();
    for (i, priority) in submissions.iter().enumerate() {
        let tag = format!("{}-{}", priority, i);
        let payload = json!({"tag": tag});
        handles.push(pool.submit(job(i as u64 + 1, payload).with_priority(*priority)));
        tags.push((*priority, tag));
    }

    blocker.await.expect("blocker succeeds");
    for handle in handles {
        handle.await.expect("job succeeds");
    }

    // Stable sort keeps submission order inside each class.
    tags.sort_by(|a, b| b.0.cmp(&a.0));
    let mut expected = vec!["blocker".to_string()];
    expected.extend(tags.into_iter().map(|(_, tag)| tag));

    assert_eq!(*log.lock().expect("log lock"), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_runs_one_job_at_a_time() {
    let intervals: Arc<Mutex<HashMap<JobId, (Instant, Instant)>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let recorded = Arc::clone(&intervals);
    let registry = JobRegistry::new().with(JobKind::MonteCarlo, move |ctx| {
        let start = Instant::now();
        sleep_ms(15);
        recorded
            .lock()
            .expect("interval lock")
            .insert(ctx.job_id(), (start, Instant::now()));
        Ok(json!(null))
    });
    let pool = WorkerPool::new(fast_config(3), registry).expect("valid pool");

    let handles = pool.submit_batch((0..12).map(|i| job(i, json!({}))));
    let mut by_worker: HashMap<usize, Vec<(Instant, Instant)>> = HashMap::new();
    for handle in handles {
        let output = handle.await.expect("job succeeds");
        let interval = intervals.lock().expect("interval lock")[&output.job_id];
        by_worker.entry(output.worker_id).or_default().push(interval);
    }

    assert!(by_worker.len() <= 3);
    for (worker_id, mut runs) in by_worker {
        runs.sort_by_key(|(start, _)| *start);
        for pair in runs.windows(2) {
            assert!(
                pair[0].1 <= pair[1].0,
                "worker {} ran two jobs at once",
                worker_id
            );
        }
    }

    for snapshot in pool.worker_stats() {
        assert!(snapshot.available);
        assert!(snapshot.current_job.is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_exhaustion_runs_one_plus_retries() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let registry = JobRegistry::new().with(JobKind::MonteCarlo, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err("always fails".to_string())
    });
    let pool = WorkerPool::new(fast_config(1), registry).expect("valid pool");

    let failure = pool
        .submit(job(1, json!({})).with_retries(2))
        .await
        .expect_err("must fail terminally");

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(failure.attempts, 3);
    assert_eq!(
        failure.error,
        EngineError::Execution("always fails".to_string())
    );

    let stats = pool.stats();
    assert_eq!(stats.completed_jobs, 3);
    assert_eq!(stats.error_count, 3);
    assert_eq!(stats.retried_jobs, 2);
    assert_eq!(stats.failed_jobs, 1);
    assert_eq!(stats.succeeded_jobs, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_reports_peak_memory_across_attempts() {
    let registry = JobRegistry::new().with(JobKind::MonteCarlo, |ctx| {
        // Second attempt allocates the most.
        let bytes = if ctx.attempt() == 2 { 8192 } else { 1024 };
        ctx.record_memory(bytes);
        Err("out of budget".to_string())
    });
    let pool = WorkerPool::new(fast_config(1), registry).expect("valid pool");

    let failure = pool
        .submit(job(1, json!({})).with_retries(2))
        .await
        .expect_err("must fail terminally");

    assert_eq!(failure.attempts, 3);
    assert_eq!(failure.memory_used, 8192);
    assert_eq!(pool.worker_stats()[0].stats.peak_memory, 8192);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_goes_to_tail_of_its_priority_class() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&log);
    let registry = JobRegistry::new().with(JobKind::MonteCarlo, move |ctx| {
        let tag = ctx.payload()["tag"].as_str().unwrap_or("?").to_string();
        recorded
            .lock()
            .expect("log lock")
            .push(format!("{}{}", tag, ctx.attempt()));
        if tag == "a" && ctx.attempt() == 1 {
            sleep_ms(60);
            return Err("first attempt fails".to_string());
        }
        Ok(json!(null))
    });
    let pool = WorkerPool::new(fast_config(1), registry).expect("valid pool");

    let a = pool.submit(job(1, json!({"tag": "a"})).with_retries(1));
    assert!(wait_until(Duration::from_secs(1), || is_running(&pool, JobId(1))).await);

    // Same class, submitted after A's first dispatch but before its retry.
    let b = pool.submit(job(2, json!({"tag": "b"})));
    let c = pool.submit(job(3, json!({"tag": "c"})));

    let output = a.await.expect("retry succeeds");
    assert_eq!(output.attempts, 2);
    b.await.expect("b succeeds");
    c.await.expect("c succeeds");

    assert_eq!(*log.lock().expect("log lock"), vec!["a1", "b1", "c1", "a2"]);
}

#[tokio::test]
async fn test_scale_to_is_clamped() {
    let config = PoolConfig::new()
        .with_min_workers(2)
        .with_max_workers(8)
        .with_auto_scale(false);
    let pool = WorkerPool::new(config, JobRegistry::new()).expect("valid pool");

    assert_eq!(pool.scale_to(0), 2);
    assert_eq!(pool.scale_to(10_000), 8);
    assert_eq!(pool.stats().total_workers, 8);
    assert_eq!(pool.scale_to(0), 2);
    assert_eq!(pool.stats().total_workers, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shrink_waits_for_busy_workers() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let config = fast_config(1).with_max_workers(4);
    let pool = WorkerPool::new(config, recording_registry(log)).expect("valid pool");

    assert_eq!(pool.scale_to(4), 4);
    let handles = pool.submit_batch((0..4).map(|i| job(i, json!({"sleep_ms": 150}))));
    assert!(wait_until(Duration::from_secs(1), || pool.stats().busy_workers == 4).await);

    // Nobody is idle, so nothing can be removed yet.
    assert_eq!(pool.scale_to(1), 4);
    assert_eq!(pool.stats().total_workers, 4);

    for handle in handles {
        handle.await.expect("job succeeds");
    }
    assert!(wait_until(Duration::from_secs(1), || pool.stats().total_workers == 1).await);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let pool = WorkerPool::new(fast_config(3), JobRegistry::new()).expect("valid pool");

    pool.shutdown();
    assert_eq!(pool.stats().total_workers, 0);
    assert!(pool.worker_stats().is_empty());

    pool.shutdown();
    assert_eq!(pool.stats().total_workers, 0);
    assert!(!pool.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_abandons_queued_and_running_jobs() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let pool = WorkerPool::new(fast_config(1), recording_registry(log)).expect("valid pool");

    let running = pool.submit(job(0, json!({"sleep_ms": 100})));
    assert!(wait_until(Duration::from_secs(1), || is_running(&pool, JobId(0))).await);
    let queued: Vec<JobHandle> = pool.submit_batch((1..4).map(|i| job(i, json!({}))));

    pool.shutdown();

    for handle in std::iter::once(running).chain(queued) {
        let failure = handle.await.expect_err("abandoned");
        assert_eq!(
            failure.error,
            EngineError::Rejected("job abandoned by pool shutdown".to_string())
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_releases_worker_and_discards_late_result() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let pool =
        WorkerPool::new(fast_config(1), recording_registry(Arc::clone(&log))).expect("valid pool");
    let started = Instant::now();

    let failure = pool
        .submit(
            job(1, json!({"tag": "slow", "sleep_ms": 100}))
                .with_deadline(Duration::from_millis(10)),
        )
        .await
        .expect_err("must time out");

    assert!(started.elapsed() < Duration::from_millis(80));
    assert_eq!(failure.error, EngineError::Timeout(Duration::from_millis(10)));
    assert_eq!(failure.attempts, 1);
    assert_eq!(pool.stats().available_workers, 1);

    // The released worker takes new work while the abandoned body still runs.
    pool.submit(job(2, json!({"tag": "quick"})))
        .await
        .expect("quick job succeeds");
    assert!(started.elapsed() < Duration::from_millis(95));

    tokio::time::sleep(Duration::from_millis(150)).await;
    let stats = pool.stats();
    assert_eq!(stats.completed_jobs, 2);
    assert_eq!(stats.succeeded_jobs, 1);
    assert_eq!(stats.failed_jobs, 1);
    assert_eq!(pool.worker_stats()[0].stats.jobs_completed, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_counts_as_retryable_failure() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let registry = JobRegistry::new().with(JobKind::MonteCarlo, move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            sleep_ms(80);
        }
        Ok(json!("ok"))
    });
    let pool = WorkerPool::new(fast_config(2), registry).expect("valid pool");

    let output = pool
        .submit(
            job(1, json!({}))
                .with_deadline(Duration::from_millis(20))
                .with_retries(1),
        )
        .await
        .expect("second attempt succeeds");

    assert_eq!(output.attempts, 2);
    assert_eq!(output.data, json!("ok"));
    assert!(output.execution_time >= Duration::from_millis(20));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_and_panicking_bodies_do_not_break_the_pool() {
    let registry = JobRegistry::new()
        .with(JobKind::MonteCarlo, |ctx| match ctx.payload()["mode"].as_str() {
            Some("panic") => panic!("kernel bug"),
            Some("fail") => Err("diverged".to_string()),
            _ => Ok(json!("fine")),
        });
    let pool = WorkerPool::new(fast_config(2), registry).expect("valid pool");

    let panicked = pool.submit(job(1, json!({"mode": "panic"})));
    let failed = pool.submit(job(2, json!({"mode": "fail"})));
    let fine = pool.submit(job(3, json!({})));

    assert!(matches!(
        panicked.await.expect_err("panic surfaces").error,
        EngineError::Execution(_)
    ));
    assert_eq!(
        failed.await.expect_err("failure surfaces").error,
        EngineError::Execution("diverged".to_string())
    );
    assert_eq!(fine.await.expect("pool still works").data, json!("fine"));
    assert_eq!(pool.stats().total_workers, 2);
}

#[tokio::test]
async fn test_unknown_kind_is_never_queued() {
    let pool = WorkerPool::new(fast_config(1), JobRegistry::new()).expect("valid pool");

    let failure = pool
        .submit(Job::new(JobId(9), JobKind::Diagonalization, json!({})).with_retries(5))
        .await
        .expect_err("unknown kind");

    assert_eq!(failure.error, EngineError::UnknownKind(JobKind::Diagonalization));
    assert_eq!(failure.attempts, 0);
    assert_eq!(pool.stats().queued_jobs, 0);
    assert_eq!(pool.stats().completed_jobs, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_updates_stats_and_metrics() {
    let registry = JobRegistry::new().with(JobKind::MonteCarlo, |ctx| {
        ctx.record_memory(1024 * (ctx.job_id().0 + 1));
        Ok(json!(null))
    });
    let pool = WorkerPool::new(fast_config(2), registry).expect("valid pool");

    let handles = pool.submit_batch(
        (0..6).map(|i| job(i, json!({})).with_priority(Priority::ALL[i as usize % 4])),
    );
    for handle in handles {
        handle.await.expect("job succeeds");
    }

    let stats = pool.stats();
    assert_eq!(stats.completed_jobs, 6);
    assert_eq!(stats.succeeded_jobs, 6);
    assert_eq!(stats.error_rate, 0.0);
    assert_eq!(stats.queue.total(), 0);

    let peak = pool
        .worker_stats()
        .iter()
        .map(|w| w.stats.peak_memory)
        .max()
        .unwrap_or(0);
    assert_eq!(peak, 6 * 1024);
    let jobs: u64 = pool
        .worker_stats()
        .iter()
        .map(|w| w.stats.jobs_completed)
        .sum();
    assert_eq!(jobs, 6);

    let text = pool.metrics().export();
    assert!(
        text.contains("compute_forge_attempts_total{kind=\"monte_carlo\",status=\"completed\"} 6")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_auto_scaling_grows_under_pressure_and_shrinks_when_idle() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let config = PoolConfig::new()
        .with_min_workers(1)
        .with_max_workers(3)
        .with_auto_scale(true)
        .with_dispatch_tick(TICK)
        .with_scale_tick(Duration::from_millis(20));
    let pool = WorkerPool::new(config, recording_registry(log)).expect("valid pool");

    let handles = pool.submit_batch((0..12).map(|i| job(i, json!({"sleep_ms": 40}))));

    let mut peak = 0;
    let grew = wait_until(Duration::from_secs(2), || {
        let total = pool.stats().total_workers;
        peak = peak.max(total);
        total == 3
    })
    .await;
    assert!(grew, "pool never reached max_workers");

    for handle in handles {
        handle.await.expect("job succeeds");
    }
    assert!(peak <= 3);

    assert!(wait_until(Duration::from_secs(2), || pool.stats().total_workers == 1).await);
}
