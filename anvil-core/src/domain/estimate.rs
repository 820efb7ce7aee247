//! Cost/Time Estimator
//!
//! Closed-form heuristic: `setup + f(dataset size, backend) + g(epochs, backend)`.
//! The estimate is quoted to the user before submission and bounds how long
//! the reconciler lets a job run.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::domain::routing::{Backend, RoutingDecision};

/// Epoch count assumed when the user leaves it unset
pub const DEFAULT_EPOCHS: u32 = 10;

struct Throughput {
    setup_minutes: f64,
    minutes_per_mb: f64,
    minutes_per_epoch: f64,
}

const CPU: Throughput = Throughput {
    setup_minutes: 6.0,
    minutes_per_mb: 0.04,
    minutes_per_epoch: 0.6,
};

// Driver install makes GPU boot slower; training itself is much faster.
const GPU: Throughput = Throughput {
    setup_minutes: 9.0,
    minutes_per_mb: 0.015,
    minutes_per_epoch: 0.12,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Estimate {
    pub minutes: f64,
    pub cost: f64,
}

/// How generous the reconciler is relative to the estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutPolicy {
    pub multiplier: f64,
    pub min_minutes: f64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            multiplier: 3.0,
            min_minutes: 30.0,
        }
    }
}

/// Estimate runtime and cost for a routed job
pub fn estimate(decision: &RoutingDecision, dataset_mb: f64, epochs: Option<u32>) -> Estimate {
    let throughput = match decision.backend {
        Backend::GeneralPurpose => &CPU,
        Backend::GpuPool => &GPU,
    };
    let epochs = epochs.unwrap_or(DEFAULT_EPOCHS) as f64;
    let minutes = throughput.setup_minutes
        + dataset_mb.max(0.0) * throughput.minutes_per_mb
        + epochs * throughput.minutes_per_epoch;
    let minutes = (minutes * 10.0).round() / 10.0;
    let cost = (minutes / 60.0 * decision.cost_per_hour * 100.0).round() / 100.0;

    Estimate { minutes, cost }
}

/// Maximum age a job may reach before the reconciler declares it timed out
pub fn timeout_bound(estimate: &Estimate, decision: &RoutingDecision, policy: TimeoutPolicy) -> Duration {
    let generous = (estimate.minutes * policy.multiplier).max(policy.min_minutes);
    let ceiling = decision.max_duration_hours * 60.0;
    let minutes = generous.min(ceiling);
    Duration::seconds((minutes * 60.0).round() as i64)
}
