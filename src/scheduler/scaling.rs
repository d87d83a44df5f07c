//! Auto-scaling decisions for the worker pool.
//!
//! The policy is a bang-bang controller evaluated on a slow tick:
//!
//! - scale up by one when the queue holds more than `factor × workers` jobs
//!   and the pool is below `max_workers`
//! - scale down by one when the queue is empty and more than `min_workers`
//!   workers sit idle
//!
//! It moves at most one worker per evaluation. The thresholds are capacity
//! heuristics, not correctness constraints.

use serde::Serialize;

/// Inputs to a scaling decision, sampled from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScalingContext {
    pub queued_jobs: usize,
    pub total_workers: usize,
    pub available_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
}

/// Decision made by the auto-scaling policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ScalingDecision {
    /// No action needed.
    Hold,
    /// Grow the pool to `target` workers.
    ScaleUp { target: usize, reason: String },
    /// Shrink the pool to `target` workers.
    ScaleDown { target: usize, reason: String },
}

impl ScalingDecision {
    /// Target worker count, if the decision changes anything.
    pub fn target(&self) -> Option<usize> {
        match self {
            ScalingDecision::Hold => None,
            ScalingDecision::ScaleUp { target, .. } | ScalingDecision::ScaleDown { target, .. } => {
                Some(*target)
            }
        }
    }
}

/// Queue-pressure scaling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingPolicy {
    /// Scale up once queued jobs exceed this multiple of the worker count.
    pub scale_up_queue_factor: usize,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            scale_up_queue_factor: 2,
        }
    }
}

impl ScalingPolicy {
    /// Creates a policy with the given scale-up factor.
    pub fn new(scale_up_queue_factor: usize) -> Self {
        Self {
            scale_up_queue_factor,
        }
    }

    /// Evaluates the context and returns a scaling decision.
    pub fn evaluate(&self, ctx: &ScalingContext) -> ScalingDecision {
        let threshold = self.scale_up_queue_factor.saturating_mul(ctx.total_workers);

        if ctx.queued_jobs > threshold && ctx.total_workers < ctx.max_workers {
            return ScalingDecision::ScaleUp {
                target: ctx.total_workers + 1,
                reason: format!(
                    "{} queued jobs exceed {} (factor {} x {} workers)",
                    ctx.queued_jobs, threshold, self.scale_up_queue_factor, ctx.total_workers
                ),
            };
        }

        if ctx.queued_jobs == 0
            && ctx.available_workers > ctx.min_workers
            && ctx.total_workers > ctx.min_workers
        {
            return ScalingDecision::ScaleDown {
                target: ctx.total_workers - 1,
                reason: format!(
                    "queue empty with {} idle workers (min {})",
                    ctx.available_workers, ctx.min_workers
                ),
            };
        }

        ScalingDecision::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(queued: usize, total: usize, available: usize) -> ScalingContext {
        ScalingContext {
            queued_jobs: queued,
            total_workers: total,
            available_workers: available,
            min_workers: 2,
            max_workers: 4,
        }
    }

    #[test]
    fn test_scale_up_on_queue_pressure() {
        let decision = ScalingPolicy::default().evaluate(&ctx(5, 2, 0));
        assert!(matches!(decision, ScalingDecision::ScaleUp { target: 3, .. }));
    }

    #[test]
    fn test_no_scale_up_at_threshold() {
        // 4 queued is not more than 2 x 2 workers.
        let decision = ScalingPolicy::default().evaluate(&ctx(4, 2, 0));
        assert_eq!(decision, ScalingDecision::Hold);
    }

    #[test]
    fn test_no_scale_up_at_max() {
        let decision = ScalingPolicy::default().evaluate(&ctx(100, 4, 0));
        assert_eq!(decision, ScalingDecision::Hold);
    }

    #[test]
    fn test_scale_down_when_idle() {
        let decision = ScalingPolicy::default().evaluate(&ctx(0, 4, 3));
        assert!(matches!(decision, ScalingDecision::ScaleDown { target: 3, .. }));
        assert_eq!(decision.target(), Some(3));
    }

    #[test]
    fn test_hold_at_min() {
        assert_eq!(ScalingPolicy::default().evaluate(&ctx(0, 2, 2)), ScalingDecision::Hold);
    }

    #[test]
    fn test_hold_when_queue_not_empty() {
        assert_eq!(ScalingPolicy::default().evaluate(&ctx(1, 4, 3)), ScalingDecision::Hold);
    }

    #[test]
    fn test_custom_factor() {
        let policy = ScalingPolicy::new(1);
        let decision = policy.evaluate(&ctx(3, 2, 0));
        assert!(matches!(decision, ScalingDecision::ScaleUp { target: 3, .. }));
    }
}
