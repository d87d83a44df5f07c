//! A single execution unit of the pool.
//!
//! A worker runs at most one job at a time. The job body executes on Tokio's
//! blocking thread pool while a lightweight async task waits for it (or for
//! the deadline), records timing and memory, and reports the attempt back to
//! the pool over a channel.
//!
//! Timeouts abandon, they do not kill: when the deadline fires the worker is
//! released immediately and the body keeps running in the background. Its
//! eventual result is dropped because the worker no longer owns that job id.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, warn};

use crate::error::EngineError;

use super::job::{Job, JobId, JobResult};
use super::lock;
use super::registry::{JobBody, JobContext};

/// Lifetime statistics of one worker. Written only by that worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    /// Attempts finished, successful or not.
    pub jobs_completed: u64,
    pub total_execution_time: Duration,
    pub average_execution_time: Duration,
    /// Largest memory figure reported by any body run on this worker.
    pub peak_memory: u64,
    pub error_count: u64,
}

impl WorkerStats {
    /// Folds one finished attempt into the statistics.
    pub fn record(&mut self, execution_time: Duration, memory_used: u64, failed: bool) {
        self.jobs_completed += 1;
        self.total_execution_time += execution_time;
        self.average_execution_time = Duration::from_nanos(
            (self.total_execution_time.as_nanos() / u128::from(self.jobs_completed)) as u64,
        );
        self.peak_memory = self.peak_memory.max(memory_used);
        if failed {
            self.error_count += 1;
        }
    }
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub available: bool,
    pub current_job: Option<JobId>,
    pub stats: WorkerStats,
}

/// Sent to the pool when an attempt finishes on a worker.
#[derive(Debug)]
pub struct WorkerEvent {
    pub worker_id: usize,
    /// The descriptor, handed back so the pool can retry it.
    pub job: Job,
    pub result: JobResult,
}

/// A single worker that runs one job at a time.
pub struct Worker {
    /// Stable identifier for the lifetime of the pool.
    id: usize,
    /// Job currently owned by this worker.
    current_job: Arc<Mutex<Option<JobId>>>,
    /// Statistics, written only on this worker's completion path.
    stats: Arc<Mutex<WorkerStats>>,
    /// Where finished attempts are reported.
    events: mpsc::UnboundedSender<WorkerEvent>,
    /// The task waiting on the current attempt.
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Creates an idle worker that reports to `events`.
    pub fn new(id: usize, events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self {
            id,
            current_job: Arc::new(Mutex::new(None)),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
            events,
            task: Mutex::new(None),
        }
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> usize {
        self.id
    }

    /// True iff no job is currently assigned.
    pub fn is_available(&self) -> bool {
        lock(&self.current_job).is_none()
    }

    /// The job currently assigned, if any.
    pub fn current_job(&self) -> Option<JobId> {
        *lock(&self.current_job)
    }

    /// Copy of the lifetime statistics.
    pub fn stats(&self) -> WorkerStats {
        lock(&self.stats).clone()
    }

    /// Point-in-time view of this worker.
    pub fn snapshot(&self) -> WorkerSnapshot {
        let current_job = self.current_job();
        WorkerSnapshot {
            id: self.id,
            available: current_job.is_none(),
            current_job,
            stats: self.stats(),
        }
    }

    /// Starts `job` on this worker and returns without waiting for it.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Rejected` if the worker is already running a
    /// job. This is a caller bug, never a retryable condition.
    pub fn execute(&self, job: Job, body: JobBody, attempt: u32) -> Result<(), EngineError> {
        {
            let mut current = lock(&self.current_job);
            if let Some(busy_with) = *current {
                return Err(EngineError::Rejected(format!(
                    "worker-{} is already running {}",
                    self.id, busy_with
                )));
            }
            *current = Some(job.id);
        }

        debug!(
            worker_id = self.id,
            job_id = %job.id,
            kind = %job.kind,
            attempt = attempt,
            "Starting job"
        );

        let attempt_task = run_attempt(
            self.id,
            job,
            body,
            attempt,
            Arc::clone(&self.current_job),
            Arc::clone(&self.stats),
            self.events.clone(),
        );
        *lock(&self.task) = Some(tokio::spawn(attempt_task));

        Ok(())
    }

    /// Releases the worker, abandoning any in-flight attempt.
    ///
    /// Safe to call whether or not a job is running. A result that arrives
    /// afterwards is discarded.
    pub fn terminate(&self) {
        if let Some(job_id) = lock(&self.current_job).take() {
            debug!(worker_id = self.id, job_id = %job_id, "Abandoning in-flight job");
        }
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

/// Waits for one attempt, then records it and reports it to the pool.
async fn run_attempt(
    worker_id: usize,
    job: Job,
    body: JobBody,
    attempt: u32,
    current_job: Arc<Mutex<Option<JobId>>>,
    stats: Arc<Mutex<WorkerStats>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let job_id = job.id;
    let ctx = JobContext::new(job_id, attempt, Arc::clone(&job.payload), job.progress.clone());
    let memory = ctx.memory_counter();
    let start = Instant::now();

    let blocking = tokio::task::spawn_blocking(move || body(&ctx));
    let outcome = match job.deadline {
        Some(deadline) => match tokio::time::timeout(deadline, blocking).await {
            Ok(joined) => flatten(joined),
            Err(_) => {
                warn!(
                    worker_id = worker_id,
                    job_id = %job_id,
                    deadline_ms = deadline.as_millis() as u64,
                    "Job exceeded its deadline, abandoning"
                );
                Err(EngineError::Timeout(deadline))
            }
        },
        None => flatten(blocking.await),
    };

    let execution_time = start.elapsed();
    let memory_used = memory.load(Ordering::Relaxed);

    {
        let mut current = lock(&current_job);
        if *current != Some(job_id) {
            debug!(worker_id = worker_id, job_id = %job_id, "Discarding result of released job");
            return;
        }
        *current = None;
    }

    lock(&stats).record(execution_time, memory_used, outcome.is_err());

    let result = match outcome {
        Ok(data) => JobResult::success(job_id, worker_id, data, execution_time, memory_used),
        Err(error) => JobResult::failure(job_id, worker_id, error, execution_time, memory_used),
    };

    if events.send(WorkerEvent { worker_id, job, result }).is_err() {
        debug!(worker_id = worker_id, job_id = %job_id, "Pool gone, dropping result");
    }
}

fn flatten(joined: Result<Result<Value, String>, JoinError>) -> Result<Value, EngineError> {
    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(message)) => Err(EngineError::Execution(message)),
        Err(e) if e.is_panic() => Err(EngineError::Execution(format!("job body panicked: {}", e))),
        Err(e) => Err(EngineError::Execution(format!("job body was cancelled: {}", e))),
    }
}
