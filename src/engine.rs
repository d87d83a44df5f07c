//! Domain-level facade over the worker pool.
//!
//! [`ComputeEngine`] turns typed requests into jobs, submits them with a
//! per-operation default priority, awaits the handle, and decodes the result:
//!
//! | operation          | kind              | default priority |
//! |--------------------|-------------------|------------------|
//! | `diagonalize`      | `Diagonalization` | high             |
//! | `run_simulation`   | `MonteCarlo`      | medium           |
//! | `band_structure`   | `BandStructure`   | low              |

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::config::PoolConfig;
use crate::error::ComputeError;
use crate::kernels::{
    builtin_registry, BandStructure, BandStructureParams, DiagonalizationRequest, Eigensystem,
    SimulationParams, SimulationResult,
};
use crate::scheduler::{
    Job, JobId, JobKind, JobRegistry, PoolError, PoolStats, Priority, ProgressSink, WorkerPool,
    WorkerSnapshot,
};

/// Per-call overrides for a facade operation.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Overrides the operation's default priority.
    pub priority: Option<Priority>,
    /// Abandon an attempt that runs longer than this.
    pub deadline: Option<Duration>,
    /// Additional attempts after a failure.
    pub retries: u32,
    /// Receives progress updates from the kernel.
    pub progress: Option<ProgressSink>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to override the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Builder method to set a deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Builder method to set the retry budget.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Builder method to attach a progress sink.
    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }
}

/// A decoded result together with how it was produced.
#[derive(Debug, Clone, Serialize)]
pub struct Computed<T> {
    pub value: T,
    pub job_id: JobId,
    /// Execution time summed across attempts.
    pub execution_time: Duration,
    /// Bytes reported by the successful attempt.
    pub memory_used: u64,
    pub attempts: u32,
}

/// Facade that submits typed compute requests to one worker pool.
pub struct ComputeEngine {
    pool: Arc<WorkerPool>,
    next_id: AtomicU64,
}

impl ComputeEngine {
    /// Creates an engine over a new pool running the built-in kernels.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` if the pool cannot be created.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        Self::with_registry(config, builtin_registry())
    }

    /// Creates an engine over a new pool running the given bodies.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` if the pool cannot be created.
    pub fn with_registry(config: PoolConfig, registry: JobRegistry) -> Result<Self, PoolError> {
        Ok(Self::from_pool(Arc::new(WorkerPool::new(config, registry)?)))
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            next_id: AtomicU64::new(1),
        }
    }

    /// Computes the leading eigenpairs of a symmetric matrix.
    pub async fn diagonalize(
        &self,
        request: DiagonalizationRequest,
        options: SubmitOptions,
    ) -> Result<Computed<Eigensystem>, ComputeError> {
        validated(JobKind::Diagonalization, request.validate())?;
        self.compute(JobKind::Diagonalization, Priority::High, &request, options)
            .await
    }

    /// Runs a 2D Ising Monte Carlo simulation.
    pub async fn run_simulation(
        &self,
        params: SimulationParams,
        options: SubmitOptions,
    ) -> Result<Computed<SimulationResult>, ComputeError> {
        validated(JobKind::MonteCarlo, params.validate())?;
        self.compute(JobKind::MonteCarlo, Priority::Medium, &params, options)
            .await
    }

    /// Computes tight-binding bands along the lattice's high-symmetry path.
    pub async fn band_structure(
        &self,
        params: BandStructureParams,
        options: SubmitOptions,
    ) -> Result<Computed<BandStructure>, ComputeError> {
        validated(JobKind::BandStructure, params.validate())?;
        self.compute(JobKind::BandStructure, Priority::Low, &params, options)
            .await
    }

    async fn compute<P, R>(
        &self,
        kind: JobKind,
        default_priority: Priority,
        params: &P,
        options: SubmitOptions,
    ) -> Result<Computed<R>, ComputeError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_value(params)
            .map_err(|source| ComputeError::Encode { kind, source })?;

        let mut job = Job::new(self.next_job_id(), kind, payload)
            .with_priority(options.priority.unwrap_or(default_priority))
            .with_retries(options.retries);
        if let Some(deadline) = options.deadline {
            job = job.with_deadline(deadline);
        }
        if let Some(sink) = options.progress {
            job = job.with_progress(sink);
        }

        debug!(job_id = %job.id, kind = %kind, priority = %job.priority, "Submitting compute job");

        let output = self
            .pool
            .submit(job)
            .await
            .map_err(|failure| ComputeError::from_failure(kind, failure))?;

        let value = R::deserialize(&output.data)
            .map_err(|source| ComputeError::Decode { kind, source })?;

        Ok(Computed {
            value,
            job_id: output.job_id,
            execution_time: output.execution_time,
            memory_used: output.memory_used,
            attempts: output.attempts,
        })
    }

    fn next_job_id(&self) -> JobId {
        JobId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns a snapshot of pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Returns a snapshot of every live worker.
    pub fn worker_stats(&self) -> Vec<WorkerSnapshot> {
        self.pool.worker_stats()
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Shuts the underlying pool down.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

fn validated(kind: JobKind, check: Result<(), String>) -> Result<(), ComputeError> {
    check.map_err(|reason| ComputeError::InvalidInput { kind, reason })
}
