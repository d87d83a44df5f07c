//! Dispatch table from job kinds to job bodies.
//!
//! The pool and its workers never look inside a payload. They only route by
//! [`JobKind`] through a [`JobRegistry`] built before the pool starts.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use super::job::{JobId, JobKind, JobProgress, ProgressSink};

/// A job body: a function from payload to result or error message.
pub type JobBody = Arc<dyn Fn(&JobContext) -> Result<Value, String> + Send + Sync>;

/// Everything a body can see while it runs.
pub struct JobContext {
    job_id: JobId,
    attempt: u32,
    payload: Arc<Value>,
    progress: Option<ProgressSink>,
    memory_bytes: Arc<AtomicU64>,
}

impl JobContext {
    pub(crate) fn new(
        job_id: JobId,
        attempt: u32,
        payload: Arc<Value>,
        progress: Option<ProgressSink>,
    ) -> Self {
        Self {
            job_id,
            attempt,
            payload,
            progress,
            memory_bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The job being run.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The opaque input payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Reports completed fraction. Silently dropped if nobody listens.
    pub fn report_progress(&self, fraction: f64) {
        if let Some(sink) = &self.progress {
            let _ = sink.send(JobProgress {
                job_id: self.job_id,
                attempt: self.attempt,
                fraction: fraction.clamp(0.0, 1.0),
            });
        }
    }

    /// Records an allocation made by the body. Keeps the largest value seen.
    pub fn record_memory(&self, bytes: u64) {
        self.memory_bytes.fetch_max(bytes, Ordering::Relaxed);
    }

    /// Shared counter the worker reads back once the body returns.
    pub(crate) fn memory_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.memory_bytes)
    }
}

/// Maps each job kind to the body that executes it.
#[derive(Clone, Default)]
pub struct JobRegistry {
    bodies: HashMap<JobKind, JobBody>,
}

impl JobRegistry {
    /// Creates an empty registry. Every kind is unknown until registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `body` to `kind`, replacing any previous binding.
    pub fn register<F>(&mut self, kind: JobKind, body: F) -> &mut Self
    where
        F: Fn(&JobContext) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.bodies.insert(kind, Arc::new(body));
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<F>(mut self, kind: JobKind, body: F) -> Self
    where
        F: Fn(&JobContext) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.register(kind, body);
        self
    }

    /// Looks up the body for a kind.
    pub fn get(&self, kind: JobKind) -> Option<JobBody> {
        self.bodies.get(&kind).cloned()
    }

    /// Returns whether a body is registered for `kind`.
    pub fn contains(&self, kind: JobKind) -> bool {
        self.bodies.contains_key(&kind)
    }

    /// Registered kinds, in no particular order.
    pub fn kinds(&self) -> Vec<JobKind> {
        self.bodies.keys().copied().collect()
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
