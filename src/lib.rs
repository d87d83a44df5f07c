//! compute-forge: parallel execution engine for numeric compute jobs.
//!
//! This library schedules prioritized, CPU-heavy jobs onto an elastic pool
//! of workers and hands results back through awaitable handles.
//!
//! - [`scheduler`]: priority queue, workers, and the auto-scaling pool
//! - [`engine`]: typed facade for diagonalization, Monte Carlo and band structure
//! - [`kernels`]: the numeric bodies behind each job kind

// Core modules
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod kernels;
pub mod metrics;
pub mod scheduler;

// Re-export commonly used types
pub use config::{ConfigError, PoolConfig};
pub use engine::{ComputeEngine, Computed, SubmitOptions};
pub use error::{ComputeError, EngineError, JobFailure};
pub use scheduler::{
    Job, JobHandle, JobId, JobKind, JobOutput, JobRegistry, PoolError, PoolStats, Priority,
    WorkerPool,
};
