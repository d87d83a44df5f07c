//! Error types for compute-forge operations.
//!
//! Defines the error taxonomy shared by every layer of the engine:
//! - `EngineError`: classification of a single job failure (rejection,
//!   execution, timeout, unknown kind)
//! - `JobFailure`: the terminal failure delivered through a job handle
//! - `ComputeError`: what the engine facade hands back to domain callers

use std::time::Duration;

use thiserror::Error;

use crate::scheduler::{JobId, JobKind};

/// Classification of why a job (or one attempt of it) did not succeed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Submitted to a pool that is shut down, duplicated an id that is still
    /// live, or handed to a worker that was already busy.
    #[error("Job rejected: {0}")]
    Rejected(String),

    /// The job body returned an error or panicked.
    #[error("Job execution failed: {0}")]
    Execution(String),

    /// The deadline elapsed before the body signalled completion.
    #[error("Job timed out after {0:?}")]
    Timeout(Duration),

    /// No body is registered for this kind.
    #[error("No job body registered for kind '{0}'")]
    UnknownKind(JobKind),
}

impl EngineError {
    /// Whether the pool may spend a retry on this failure.
    ///
    /// Rejections are caller contract violations and unknown kinds would
    /// fail identically on every attempt, so only execution failures and
    /// timeouts are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Execution(_) | EngineError::Timeout(_))
    }
}

/// Terminal failure of a submitted job, after any retries were spent.
#[derive(Debug, Clone, Error)]
#[error("{job_id} failed after {attempts} attempt(s): {error}")]
pub struct JobFailure {
    /// The job that failed.
    pub job_id: JobId,
    /// Classification of the final failure.
    #[source]
    pub error: EngineError,
    /// Execution time summed across every attempt.
    pub execution_time: Duration,
    /// Highest memory reported by any attempt, in bytes.
    pub memory_used: u64,
    /// Number of attempts that were actually run (0 if never dispatched).
    pub attempts: u32,
}

impl JobFailure {
    /// A failure for a job that never reached a worker.
    pub fn before_dispatch(job_id: JobId, error: EngineError) -> Self {
        Self {
            job_id,
            error,
            execution_time: Duration::ZERO,
            memory_used: 0,
            attempts: 0,
        }
    }
}

/// Errors returned by the [`ComputeEngine`](crate::engine::ComputeEngine) facade.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("Invalid {kind} input: {reason}")]
    InvalidInput { kind: JobKind, reason: String },

    #[error("{kind} {job_id} failed after {attempts} attempt(s) in {execution_time:?}: {source}")]
    Failed {
        kind: JobKind,
        job_id: JobId,
        attempts: u32,
        execution_time: Duration,
        memory_used: u64,
        #[source]
        source: EngineError,
    },

    #[error("Failed to decode {kind} result: {source}")]
    Decode {
        kind: JobKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode {kind} payload: {source}")]
    Encode {
        kind: JobKind,
        #[source]
        source: serde_json::Error,
    },
}

impl ComputeError {
    /// Wraps a terminal job failure with the kind of job that produced it.
    pub fn from_failure(kind: JobKind, failure: JobFailure) -> Self {
        ComputeError::Failed {
            kind,
            job_id: failure.job_id,
            attempts: failure.attempts,
            execution_time: failure.execution_time,
            memory_used: failure.memory_used,
            source: failure.error,
        }
    }

    /// Execution time spent before the failure, if any job ran.
    pub fn execution_time(&self) -> Option<Duration> {
        match self {
            ComputeError::Failed { execution_time, .. } => Some(*execution_time),
            _ => None,
        }
    }

    /// Peak memory reported by the failed job's attempts.
    pub fn memory_used(&self) -> Option<u64> {
        match self {
            ComputeError::Failed { memory_used, .. } => Some(*memory_used),
            _ => None,
        }
    }
}
