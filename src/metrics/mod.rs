//! Metrics module for Prometheus-based monitoring.
//!
//! Every [`WorkerPool`](crate::scheduler::WorkerPool) records attempt
//! outcomes, retries, queue depth and worker occupancy into its own
//! [`PoolMetrics`].
//!
//! # Example
//!
//! ```ignore
//! let pool = WorkerPool::new(PoolConfig::default(), kernels::builtin_registry())?;
//! // ... submit work ...
//! println!("{}", pool.metrics().export());
//! ```

pub mod prometheus;

pub use self::prometheus::PoolMetrics;
