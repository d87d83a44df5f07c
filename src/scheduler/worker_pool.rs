//! Worker pool that schedules prioritized jobs onto a dynamic set of workers.
//!
//! The pool owns the priority queue and the worker set. Every mutation of
//! either goes through a single `Mutex<PoolState>`, which is never held across
//! an `.await`. One control task drives the pool:
//!
//! - **dispatch tick** (default 10ms): retire surplus idle workers, then hand
//!   the highest-priority pending job to each available worker
//! - **scale tick** (default 5s, when enabled): grow or shrink by one worker
//!   based on queue pressure
//! - **worker events**: record finished attempts, requeue retries at the tail
//!   of their priority bucket, or resolve the caller's handle
//!
//! Job bodies run on Tokio's blocking pool, so a slow job never delays
//! dispatch to other workers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, PoolConfig};
use crate::error::{EngineError, JobFailure};
use crate::metrics::PoolMetrics;

use super::job::{Job, JobId, JobKind, JobOutput};
use super::lock;
use super::queue::{PriorityQueue, QueueStats};
use super::registry::{JobBody, JobRegistry};
use super::scaling::{ScalingContext, ScalingDecision, ScalingPolicy};
use super::worker::{Worker, WorkerEvent, WorkerSnapshot};

/// Errors that can occur when creating a worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The configuration was rejected.
    #[error("Invalid pool configuration: {0}")]
    Config(#[from] ConfigError),

    /// Metric registration failed.
    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub total_workers: usize,
    /// Workers idle and eligible for dispatch.
    pub available_workers: usize,
    /// Workers currently running a job.
    pub busy_workers: usize,
    /// Jobs waiting for a worker.
    pub queued_jobs: usize,
    /// Queue depth per priority class.
    pub queue: QueueStats,
    /// Attempts finished, successful or not.
    pub completed_jobs: u64,
    /// Attempts that failed (including timeouts).
    pub error_count: u64,
    /// Jobs that resolved successfully.
    pub succeeded_jobs: u64,
    /// Jobs that resolved with a terminal failure after running.
    pub failed_jobs: u64,
    /// Retries scheduled.
    pub retried_jobs: u64,
    /// Submissions refused without running.
    pub rejected_jobs: u64,
    /// Execution time summed over every attempt.
    pub total_execution_time: Duration,
    /// Mean execution time per attempt.
    pub average_job_time: Duration,
    /// Failed attempts divided by finished attempts.
    pub error_rate: f64,
}

/// Shared state for tracking pool statistics.
///
/// Lives outside the worker set so that counts survive worker removal.
#[derive(Default)]
struct SharedPoolStats {
    attempts_finished: AtomicU64,
    attempts_failed: AtomicU64,
    total_execution_nanos: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_rejected: AtomicU64,
}

impl SharedPoolStats {
    fn record_attempt(&self, duration: Duration, failed: bool) {
        self.attempts_finished.fetch_add(1, Ordering::SeqCst);
        self.total_execution_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
        if failed {
            self.attempts_failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn to_pool_stats(&self) -> PoolStats {
        let completed = self.attempts_finished.load(Ordering::SeqCst);
        let errors = self.attempts_failed.load(Ordering::SeqCst);
        let total_nanos = self.total_execution_nanos.load(Ordering::SeqCst);

        let (average_job_time, error_rate) = if completed > 0 {
            (
                Duration::from_nanos(total_nanos / completed),
                errors as f64 / completed as f64,
            )
        } else {
            (Duration::ZERO, 0.0)
        };

        PoolStats {
            completed_jobs: completed,
            error_count: errors,
            succeeded_jobs: self.jobs_succeeded.load(Ordering::SeqCst),
            failed_jobs: self.jobs_failed.load(Ordering::SeqCst),
            retried_jobs: self.jobs_retried.load(Ordering::SeqCst),
            rejected_jobs: self.jobs_rejected.load(Ordering::SeqCst),
            total_execution_time: Duration::from_nanos(total_nanos),
            average_job_time,
            error_rate,
            ..PoolStats::default()
        }
    }
}

type Responder = oneshot::Sender<Result<JobOutput, JobFailure>>;

/// A job waiting in the queue, with everything needed to run and resolve it.
struct QueuedJob {
    job: Job,
    body: JobBody,
    responder: Responder,
    /// Attempts already run.
    attempts: u32,
    /// Execution time already spent on earlier attempts.
    elapsed: Duration,
    /// Highest memory reported by earlier attempts.
    peak_memory: u64,
}

/// Bookkeeping for a job that is running on a worker.
struct InFlight {
    kind: JobKind,
    body: JobBody,
    responder: Responder,
    attempts: u32,
    elapsed: Duration,
    peak_memory: u64,
}

/// Everything guarded by the pool's single mutation lock.
struct PoolState {
    queue: PriorityQueue<QueuedJob>,
    workers: Vec<Worker>,
    in_flight: HashMap<JobId, InFlight>,
    /// Desired worker count; idle workers above it are retired on each tick.
    target_workers: usize,
    next_worker_id: usize,
    shut_down: bool,
}

impl PoolState {
    fn available_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.is_available()).count()
    }

    fn is_live(&self, job_id: JobId) -> bool {
        self.in_flight.contains_key(&job_id) || self.queue.contains(|q| q.job.id == job_id)
    }
}

struct PoolInner {
    config: PoolConfig,
    policy: ScalingPolicy,
    registry: JobRegistry,
    state: Mutex<PoolState>,
    stats: SharedPoolStats,
    metrics: PoolMetrics,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    shutdown_tx: broadcast::Sender<()>,
    is_running: AtomicBool,
}

impl PoolInner {
    fn spawn_worker(&self, state: &mut PoolState) {
        let id = state.next_worker_id;
        state.next_worker_id += 1;
        state.workers.push(Worker::new(id, self.events_tx.clone()));
        debug!(worker_id = id, "Worker created");
    }

    /// Removes idle workers while the pool is above its target size.
    /// Busy workers are never interrupted; they are retired once idle.
    fn retire_idle(&self, state: &mut PoolState) {
        while state.workers.len() > state.target_workers {
            let Some(index) = state.workers.iter().rposition(|w| w.is_available()) else {
                break;
            };
            let worker = state.workers.remove(index);
            worker.terminate();
            debug!(worker_id = worker.id(), "Worker retired");
        }
    }

    fn scale_to(&self, target: usize) -> usize {
        let target = self.config.clamp_workers(target);
        let mut state = lock(&self.state);
        if state.shut_down {
            return 0;
        }

        let before = state.workers.len();
        state.target_workers = target;
        while state.workers.len() < target {
            self.spawn_worker(&mut state);
        }
        self.retire_idle(&mut state);

        let after = state.workers.len();
        if after != before || after != target {
            info!(
                previous = before,
                target = target,
                current = after,
                "Scaled worker pool"
            );
        }
        self.publish(&state);
        after
    }

    fn dispatch(&self) {
        let mut state = lock(&self.state);
        if state.shut_down {
            return;
        }
        self.retire_idle(&mut state);

        let PoolState {
            queue,
            workers,
            in_flight,
            ..
        } = &mut *state;

        for worker in workers.iter() {
            if queue.is_empty() {
                break;
            }
            if !worker.is_available() {
                continue;
            }
            let Some(queued) = queue.dequeue_next() else {
                break;
            };

            let QueuedJob {
                job,
                body,
                responder,
                attempts,
                elapsed,
                peak_memory,
            } = queued;
            let job_id = job.id;
            let attempt = attempts + 1;

            debug!(
                worker_id = worker.id(),
                job_id = %job_id,
                priority = %job.priority,
                attempt = attempt,
                queued_for_ms = job.age().num_milliseconds(),
                "Dispatching job"
            );

            in_flight.insert(
                job_id,
                InFlight {
                    kind: job.kind,
                    body: Arc::clone(&body),
                    responder,
                    attempts: attempt,
                    elapsed,
                    peak_memory,
                },
            );

            if let Err(e) = worker.execute(job, body, attempt) {
                // Availability was checked under the pool lock, so this is a bug.
                error!(
                    worker_id = worker.id(),
                    job_id = %job_id,
                    error = %e,
                    "Dispatch to busy worker"
                );
                if let Some(flight) = in_flight.remove(&job_id) {
                    self.stats.jobs_rejected.fetch_add(1, Ordering::SeqCst);
                    let _ = flight.responder.send(Err(JobFailure {
                        job_id,
                        error: e,
                        execution_time: flight.elapsed,
                        memory_used: flight.peak_memory,
                        attempts,
                    }));
                }
            }
        }

        self.publish(&state);
    }

    fn handle_event(&self, event: WorkerEvent) {
        let WorkerEvent {
            worker_id,
            mut job,
            result,
        } = event;
        let job_id = job.id;

        let mut state = lock(&self.state);
        let Some(flight) = state.in_flight.remove(&job_id) else {
            debug!(
                worker_id = worker_id,
                job_id = %job_id,
                "No caller waiting for result, dropping"
            );
            return;
        };

        let status = result.status();
        self.stats
            .record_attempt(result.execution_time, !result.is_success());
        self.metrics
            .record_attempt(flight.kind, status, result.execution_time);
        let elapsed = flight.elapsed + result.execution_time;
        let peak_memory = flight.peak_memory.max(result.memory_used);

        match result.outcome {
            Ok(data) => {
                self.stats.jobs_succeeded.fetch_add(1, Ordering::SeqCst);
                info!(
                    worker_id = worker_id,
                    job_id = %job_id,
                    kind = %flight.kind,
                    attempts = flight.attempts,
                    duration_ms = result.execution_time.as_millis() as u64,
                    "Job completed successfully"
                );
                let _ = flight.responder.send(Ok(JobOutput {
                    job_id,
                    worker_id,
                    data,
                    execution_time: elapsed,
                    memory_used: result.memory_used,
                    attempts: flight.attempts,
                }));
            }
            Err(error) if error.is_retryable() && job.consume_retry() => {
                warn!(
                    worker_id = worker_id,
                    job_id = %job_id,
                    error = %error,
                    remaining_retries = job.retries_remaining,
                    "Job failed, requeueing for retry"
                );
                self.stats.jobs_retried.fetch_add(1, Ordering::SeqCst);
                self.metrics.record_retry();
                let priority = job.priority;
                state.queue.enqueue(
                    priority,
                    QueuedJob {
                        job,
                        body: flight.body,
                        responder: flight.responder,
                        attempts: flight.attempts,
                        elapsed,
                        peak_memory,
                    },
                );
            }
            Err(error) => {
                self.stats.jobs_failed.fetch_add(1, Ordering::SeqCst);
                error!(
                    worker_id = worker_id,
                    job_id = %job_id,
                    kind = %flight.kind,
                    attempts = flight.attempts,
                    error = %error,
                    "Job failed"
                );
                let _ = flight.responder.send(Err(JobFailure {
                    job_id,
                    error,
                    execution_time: elapsed,
                    memory_used: peak_memory,
                    attempts: flight.attempts,
                }));
            }
        }

        self.publish(&state);
    }

    fn auto_scale(&self) {
        let ctx = {
            let state = lock(&self.state);
            if state.shut_down {
                return;
            }
            ScalingContext {
                queued_jobs: state.queue.len(),
                total_workers: state.workers.len(),
                available_workers: state.available_workers(),
                min_workers: self.config.min_workers,
                max_workers: self.config.max_workers,
            }
        };

        let decision = self.policy.evaluate(&ctx);
        match &decision {
            ScalingDecision::Hold => return,
            ScalingDecision::ScaleUp { reason, .. } | ScalingDecision::ScaleDown { reason, .. } => {
                info!(reason = %reason, "Auto-scaling");
            }
        }
        if let Some(target) = decision.target() {
            self.scale_to(target);
        }
    }

    fn reject(&self, job_id: JobId, responder: Responder, error: EngineError) {
        self.stats.jobs_rejected.fetch_add(1, Ordering::SeqCst);
        let _ = responder.send(Err(JobFailure::before_dispatch(job_id, error)));
    }

    fn publish(&self, state: &PoolState) {
        let total = state.workers.len();
        let busy = total - state.available_workers();
        self.metrics.set_pool_state(state.queue.len(), total, busy);
    }
}

/// Completion handle for a submitted job.
///
/// Await it (or call [`wait`](Self::wait)) to receive the job's terminal
/// outcome. Awaiting suspends only the caller, never the pool.
#[derive(Debug)]
pub struct JobHandle {
    job_id: JobId,
    rx: oneshot::Receiver<Result<JobOutput, JobFailure>>,
}

impl JobHandle {
    /// The job this handle resolves for.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Waits for the terminal outcome.
    pub async fn wait(self) -> Result<JobOutput, JobFailure> {
        self.await
    }
}

impl Future for JobHandle {
    type Output = Result<JobOutput, JobFailure>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let job_id = self.job_id;
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(JobFailure::before_dispatch(
                    job_id,
                    EngineError::Rejected("job abandoned by pool shutdown".to_string()),
                ))
            })
        })
    }
}

/// Worker pool that matches prioritized jobs to an elastic set of workers.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    control: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates a pool with `min_workers` idle workers and starts its control loop.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` if the configuration is invalid or metrics cannot
    /// be registered.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(config: PoolConfig, registry: JobRegistry) -> Result<Self, PoolError> {
        config.validate()?;
        let metrics = PoolMetrics::new()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let state = PoolState {
            queue: PriorityQueue::new(),
            workers: Vec::with_capacity(config.max_workers),
            in_flight: HashMap::new(),
            target_workers: config.min_workers,
            next_worker_id: 0,
            shut_down: false,
        };

        let inner = Arc::new(PoolInner {
            policy: ScalingPolicy::new(config.scale_up_queue_factor),
            config,
            registry,
            state: Mutex::new(state),
            stats: SharedPoolStats::default(),
            metrics,
            events_tx,
            shutdown_tx,
            is_running: AtomicBool::new(true),
        });

        {
            let mut state = lock(&inner.state);
            for _ in 0..inner.config.min_workers {
                inner.spawn_worker(&mut state);
            }
            inner.publish(&state);
        }

        let control = tokio::spawn(control_loop(Arc::clone(&inner), events_rx, shutdown_rx));

        info!(
            min_workers = inner.config.min_workers,
            max_workers = inner.config.max_workers,
            auto_scale = inner.config.auto_scale,
            kinds = ?inner.registry.kinds(),
            "Worker pool started"
        );

        Ok(Self {
            inner,
            control: Mutex::new(Some(control)),
        })
    }

    /// Enqueues a job and returns a handle to its eventual outcome.
    ///
    /// Never blocks. Submissions that cannot run resolve their handle
    /// immediately: `UnknownKind` when no body is registered for the kind,
    /// `Rejected` when the pool is shut down or the id is already live.
    pub fn submit(&self, job: Job) -> JobHandle {
        let (tx, rx) = oneshot::channel();
        let handle = JobHandle { job_id: job.id, rx };

        let Some(body) = self.inner.registry.get(job.kind) else {
            warn!(job_id = %job.id, kind = %job.kind, "Rejecting job of unknown kind");
            self.inner
                .reject(job.id, tx, EngineError::UnknownKind(job.kind));
            return handle;
        };

        let mut state = lock(&self.inner.state);
        if state.shut_down {
            drop(state);
            debug!(job_id = %job.id, "Rejecting job submitted after shutdown");
            self.inner.reject(
                job.id,
                tx,
                EngineError::Rejected("pool is shut down".to_string()),
            );
            return handle;
        }
        if state.is_live(job.id) {
            drop(state);
            warn!(job_id = %job.id, "Rejecting duplicate job id");
            self.inner.reject(
                job.id,
                tx,
                EngineError::Rejected(format!("{} is already queued or running", job.id)),
            );
            return handle;
        }

        debug!(
            job_id = %job.id,
            kind = %job.kind,
            priority = %job.priority,
            retries = job.retries_remaining,
            "Job queued"
        );
        let priority = job.priority;
        state.queue.enqueue(
            priority,
            QueuedJob {
                job,
                body,
                responder: tx,
                attempts: 0,
                elapsed: Duration::ZERO,
                peak_memory: 0,
            },
        );
        self.inner.publish(&state);

        handle
    }

    /// Submits many jobs, each with its own priority.
    pub fn submit_batch<I>(&self, jobs: I) -> Vec<JobHandle>
    where
        I: IntoIterator<Item = Job>,
    {
        jobs.into_iter().map(|job| self.submit(job)).collect()
    }

    /// Returns a point-in-time snapshot of pool statistics.
    pub fn stats(&self) -> PoolStats {
        let mut stats = self.inner.stats.to_pool_stats();
        let state = lock(&self.inner.state);
        stats.total_workers = state.workers.len();
        stats.available_workers = state.available_workers();
        stats.busy_workers = stats.total_workers - stats.available_workers;
        stats.queue = state.queue.stats();
        stats.queued_jobs = stats.queue.total();
        stats
    }

    /// Returns a snapshot of every live worker.
    pub fn worker_stats(&self) -> Vec<WorkerSnapshot> {
        lock(&self.inner.state)
            .workers
            .iter()
            .map(Worker::snapshot)
            .collect()
    }

    /// Resizes the pool toward `target`, clamped to `[min_workers, max_workers]`.
    ///
    /// Growth is immediate. Shrinking removes only idle workers; the rest of
    /// the reduction happens as busy workers finish. Returns the worker count
    /// right after the call.
    pub fn scale_to(&self, target: usize) -> usize {
        self.inner.scale_to(target)
    }

    /// Terminates every worker and abandons queued and in-flight jobs.
    ///
    /// Their handles resolve with `Rejected`. Later submissions are
    /// rejected. Calling this more than once is harmless.
    pub fn shutdown(&self) {
        let was_running = self.inner.is_running.swap(false, Ordering::SeqCst);

        let (queued, in_flight) = {
            let mut state = lock(&self.inner.state);
            state.shut_down = true;
            state.target_workers = 0;
            for worker in state.workers.drain(..) {
                worker.terminate();
            }
            let queued = state.queue.drain();
            let in_flight: Vec<(JobId, InFlight)> = state.in_flight.drain().collect();
            self.inner.publish(&state);
            (queued, in_flight)
        };

        let abandoned = queued.len() + in_flight.len();
        let rejection = || EngineError::Rejected("job abandoned by pool shutdown".to_string());
        for queued in queued {
            let _ = queued.responder.send(Err(JobFailure {
                job_id: queued.job.id,
                error: rejection(),
                execution_time: queued.elapsed,
                memory_used: queued.peak_memory,
                attempts: queued.attempts,
            }));
        }
        for (job_id, flight) in in_flight {
            let _ = flight.responder.send(Err(JobFailure {
                job_id,
                error: rejection(),
                execution_time: flight.elapsed,
                memory_used: flight.peak_memory,
                attempts: flight.attempts,
            }));
        }

        if was_running {
            // Ignore send error - the control loop may have already stopped
            let _ = self.inner.shutdown_tx.send(());
            if let Some(control) = lock(&self.control).take() {
                control.abort();
            }
            info!(abandoned_jobs = abandoned, "Worker pool shutdown complete");
        }
    }

    /// Returns whether the pool still accepts work.
    pub fn is_running(&self) -> bool {
        self.inner.is_running.load(Ordering::SeqCst)
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Returns the kind registry this pool dispatches through.
    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    /// Returns the pool's metrics.
    pub fn metrics(&self) -> &PoolMetrics {
        &self.inner.metrics
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Drives dispatch, auto-scaling and completion handling until shutdown.
async fn control_loop(
    inner: Arc<PoolInner>,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let auto_scale = inner.config.auto_scale;

    let mut dispatch_tick = tokio::time::interval(inner.config.dispatch_tick());
    dispatch_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut scale_tick = tokio::time::interval(inner.config.scale_tick());
    scale_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it so scaling waits a full period.
    scale_tick.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            Some(event) = events.recv() => inner.handle_event(event),
            _ = dispatch_tick.tick() => inner.dispatch(),
            _ = scale_tick.tick(), if auto_scale => inner.auto_scale(),
        }
    }

    debug!("Pool control loop stopped");
}
