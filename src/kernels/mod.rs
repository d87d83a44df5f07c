//! Built-in numeric job bodies.
//!
//! Each kernel exposes a params type with `validate()`, a pure function that
//! does the math, and a `run` body that adapts it to a [`JobContext`].
//! [`builtin_registry`] binds every [`JobKind`] to its body.

pub mod band_structure;
pub mod eigen;
pub mod monte_carlo;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::scheduler::{JobContext, JobKind, JobRegistry};

pub use band_structure::{BandStructure, BandStructureParams, Lattice};
pub use eigen::{DiagonalizationRequest, Eigensystem};
pub use monte_carlo::{SimulationParams, SimulationResult};

/// A registry with a body for every [`JobKind`].
pub fn builtin_registry() -> JobRegistry {
    JobRegistry::new()
        .with(JobKind::Diagonalization, eigen::run)
        .with(JobKind::MonteCarlo, monte_carlo::run)
        .with(JobKind::BandStructure, band_structure::run)
}

fn decode<T: DeserializeOwned>(ctx: &JobContext) -> Result<T, String> {
    T::deserialize(ctx.payload())
        .map_err(|e| format!("invalid payload for {}: {}", ctx.job_id(), e))
}

fn encode<T: Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| format!("failed to encode result: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::JobId;
    use serde_json::json;
    use std::sync::Arc;

    fn context(payload: Value) -> JobContext {
        JobContext::new(JobId(1), 1, Arc::new(payload), None)
    }

    #[test]
    fn test_builtin_registry_covers_every_kind() {
        let registry = builtin_registry();
        assert!(registry.contains(JobKind::Diagonalization));
        assert!(registry.contains(JobKind::MonteCarlo));
        assert!(registry.contains(JobKind::BandStructure));
    }

    #[test]
    fn test_eigen_body_reports_memory() {
        let ctx = context(json!({"matrix": [[2.0, 0.0], [0.0, 1.0]], "num_eigenvalues": 2}));
        let value = eigen::run(&ctx).expect("valid request");

        let system: Eigensystem = serde_json::from_value(value).expect("decodes");
        assert_eq!(system.eigenvalues.len(), 2);
        assert_eq!(ctx.memory_counter().load(std::sync::atomic::Ordering::Relaxed), 64);
    }

    #[test]
    fn test_body_rejects_malformed_payload() {
        let err =
            monte_carlo::run(&context(json!({"temperature": 2.0}))).expect_err("missing field");
        assert!(err.contains("invalid payload for job-1"));
    }

    #[test]
    fn test_body_rejects_invalid_params() {
        let payload = json!({"lattice": "square", "points_per_segment": 0});
        let err = band_structure::run(&context(payload)).expect_err("invalid density");
        assert!(err.contains("points_per_segment"));
    }
}
