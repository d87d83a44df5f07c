//! In-process scheduling of compute jobs onto an elastic worker pool.
//!
//! This module provides the execution core of the engine:
//!
//! - **PriorityQueue**: four-class priority queue, FIFO within a class
//! - **Worker**: runs one job at a time on the blocking thread pool
//! - **WorkerPool**: owns queue and workers, dispatches, retries and scales
//! - **JobRegistry**: routes each [`JobKind`] to the body that runs it
//!
//! # Architecture
//!
//! ```text
//!      submit(job) ──► ┌────────────────────────────┐
//!                      │       PriorityQueue        │
//!                      │ critical │ high │ med │ low │
//!                      └─────────────┬──────────────┘
//!                                    │ dispatch tick
//!         ┌──────────────────────────┼──────────────────────────┐
//!         ▼                          ▼                          ▼
//!    ┌─────────┐                ┌─────────┐                ┌─────────┐
//!    │ Worker 0│                │ Worker 1│                │ Worker N│
//!    └────┬────┘                └────┬────┘                └────┬────┘
//!         └──────── WorkerEvent ─────┴──► retry / resolve handle ┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use compute_forge::config::PoolConfig;
//! use compute_forge::scheduler::{Job, JobId, JobKind, JobRegistry, Priority, WorkerPool};
//! use serde_json::json;
//!
//! let registry = JobRegistry::new().with(JobKind::MonteCarlo, |ctx| Ok(ctx.payload().clone()));
//! let pool = WorkerPool::new(PoolConfig::default(), registry)?;
//!
//! let job = Job::new(JobId(1), JobKind::MonteCarlo, json!({"steps": 10}))
//!     .with_priority(Priority::High)
//!     .with_retries(2);
//! let output = pool.submit(job).await?;
//! println!("{} finished in {:?}", output.job_id, output.execution_time);
//!
//! pool.shutdown();
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod job;
pub mod queue;
pub mod registry;
pub mod scaling;
pub mod worker;
pub mod worker_pool;

pub use job::{
    Job, JobId, JobKind, JobOutput, JobProgress, JobResult, JobStatus, Priority, ProgressSink,
};
pub use queue::{PriorityQueue, QueueStats};
pub use registry::{JobBody, JobContext, JobRegistry};
pub use scaling::{ScalingContext, ScalingDecision, ScalingPolicy};
pub use worker::{Worker, WorkerEvent, WorkerSnapshot, WorkerStats};
pub use worker_pool::{JobHandle, PoolError, PoolStats, WorkerPool};

/// Locks a mutex, recovering the guard if a previous holder panicked.
///
/// Pool state stays consistent across a poisoned lock because every critical
/// section either completes its update or leaves the data untouched.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
