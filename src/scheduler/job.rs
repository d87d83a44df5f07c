//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `Job`: The descriptor of one unit of work
//! - `Priority`: Queue placement class
//! - `JobKind`: Closed tag selecting the body that runs the job
//! - `JobResult`: Outcome of one attempt, reported by a worker
//! - `JobOutput`: Successful terminal value delivered to the caller

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::EngineError;

/// Identifier correlating a job with its completion handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Priority class of a job. Higher classes are always dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// All classes, highest first.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// Numeric rank used for queue placement (critical=4 .. low=1).
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 4,
            Priority::High => 3,
            Priority::Medium => 2,
            Priority::Low => 1,
        }
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// The closed set of job kinds the engine knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Leading eigenpairs of a symmetric matrix.
    Diagonalization,
    /// Metropolis simulation of a 2D Ising lattice.
    MonteCarlo,
    /// Tight-binding band structure along a k-path.
    BandStructure,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Diagonalization => write!(f, "diagonalization"),
            JobKind::MonteCarlo => write!(f, "monte_carlo"),
            JobKind::BandStructure => write!(f, "band_structure"),
        }
    }
}

/// Progress notification emitted by a running job body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobProgress {
    pub job_id: JobId,
    /// 1-based attempt number that produced this update.
    pub attempt: u32,
    /// Completed fraction in `[0, 1]`.
    pub fraction: f64,
}

/// Where a job body sends its progress updates.
pub type ProgressSink = mpsc::UnboundedSender<JobProgress>;

/// Descriptor of a single unit of work.
///
/// Everything except `retries_remaining` is fixed at creation; the pool
/// decrements the retry budget on failed attempts.
#[derive(Debug, Clone)]
pub struct Job {
    /// Identifier used to correlate completion.
    pub id: JobId,
    /// Which registered body runs this job.
    pub kind: JobKind,
    /// Opaque input, shared read-only with the body while in flight.
    pub payload: Arc<serde_json::Value>,
    /// Queue placement class.
    pub priority: Priority,
    /// Abandon the attempt if it runs longer than this.
    pub deadline: Option<Duration>,
    /// Additional attempts permitted after a failure.
    pub retries_remaining: u32,
    /// Optional progress channel handed to the body.
    pub progress: Option<ProgressSink>,
    /// When this descriptor was created.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Creates a medium priority job with no deadline and no retries.
    pub fn new(id: JobId, kind: JobKind, payload: serde_json::Value) -> Self {
        Self {
            id,
            kind,
            payload: Arc::new(payload),
            priority: Priority::default(),
            deadline: None,
            retries_remaining: 0,
            progress: None,
            created_at: Utc::now(),
        }
    }

    /// Sets the priority class.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the per-attempt deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the retry budget.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_remaining = retries;
        self
    }

    /// Attaches a progress sink.
    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Spends one retry if any remain. Returns whether a retry was granted.
    pub fn consume_retry(&mut self) -> bool {
        if self.retries_remaining == 0 {
            return false;
        }
        self.retries_remaining -= 1;
        true
    }

    /// Returns how long ago the job was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Status of one finished attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// The body returned a value.
    Completed,
    /// The body returned an error or panicked.
    Failed,
    /// The deadline elapsed first.
    Timeout,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Result of one attempt, as reported by the worker that ran it.
#[derive(Debug, Clone)]
pub struct JobResult {
    /// ID of the job that was executed.
    pub job_id: JobId,
    /// ID of the worker that ran the attempt.
    pub worker_id: usize,
    /// Value on success, classified error otherwise.
    pub outcome: Result<serde_json::Value, EngineError>,
    /// Wall time of the attempt (until completion or timeout).
    pub execution_time: Duration,
    /// Bytes reported by the body.
    pub memory_used: u64,
    /// When the attempt finished.
    pub completed_at: DateTime<Utc>,
}

impl JobResult {
    /// Creates a successful attempt result.
    pub fn success(
        job_id: JobId,
        worker_id: usize,
        data: serde_json::Value,
        execution_time: Duration,
        memory_used: u64,
    ) -> Self {
        Self {
            job_id,
            worker_id,
            outcome: Ok(data),
            execution_time,
            memory_used,
            completed_at: Utc::now(),
        }
    }

    /// Creates a failed attempt result.
    pub fn failure(
        job_id: JobId,
        worker_id: usize,
        error: EngineError,
        execution_time: Duration,
        memory_used: u64,
    ) -> Self {
        Self {
            job_id,
            worker_id,
            outcome: Err(error),
            execution_time,
            memory_used,
            completed_at: Utc::now(),
        }
    }

    /// Final status of the attempt.
    pub fn status(&self) -> JobStatus {
        match &self.outcome {
            Ok(_) => JobStatus::Completed,
            Err(EngineError::Timeout(_)) => JobStatus::Timeout,
            Err(_) => JobStatus::Failed,
        }
    }

    /// Returns whether the attempt succeeded.
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Successful terminal value of a job, delivered through its handle.
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub job_id: JobId,
    /// Worker that ran the successful attempt.
    pub worker_id: usize,
    pub data: serde_json::Value,
    /// Execution time summed across every attempt.
    pub execution_time: Duration,
    /// Bytes reported by the successful attempt.
    pub memory_used: u64,
    /// Number of attempts run, including the successful one.
    pub attempts: u32,
}
