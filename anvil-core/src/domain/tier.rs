//! Subscription tiers and their resource policies

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::job::HyperParameters;

/// Subscription level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Silver,
    Gold,
    Platinum,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Silver => "silver",
            Tier::Gold => "gold",
            Tier::Platinum => "platinum",
        }
    }

    pub fn policy(self) -> &'static ResourcePolicy {
        match self {
            Tier::Free => &FREE,
            Tier::Silver => &SILVER,
            Tier::Gold => &GOLD,
            Tier::Platinum => &PLATINUM,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "silver" => Ok(Tier::Silver),
            "gold" => Ok(Tier::Gold),
            "platinum" => Ok(Tier::Platinum),
            other => Err(format!("unknown tier: {}", other)),
        }
    }
}

/// Static per-tier limits
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePolicy {
    pub tier: Tier,
    /// Machine class for the general-purpose backend
    pub machine_class: &'static str,
    /// Machine class and accelerator for the GPU backend, when permitted
    pub gpu: Option<GpuAllowance>,
    pub max_dataset_mb: f64,
    pub max_epochs: u32,
    pub max_batch_size: u32,
    pub max_trees: u32,
    pub max_parallel_jobs: u32,
    pub max_duration_hours: f64,
    pub max_submissions_per_hour: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuAllowance {
    pub machine_class: &'static str,
    pub accelerator: &'static str,
}

static FREE: ResourcePolicy = ResourcePolicy {
    tier: Tier::Free,
    machine_class: "e2-standard-4",
    gpu: None,
    max_dataset_mb: 100.0,
    max_epochs: 10,
    max_batch_size: 64,
    max_trees: 100,
    max_parallel_jobs: 1,
    max_duration_hours: 1.0,
    max_submissions_per_hour: 5,
};

static SILVER: ResourcePolicy = ResourcePolicy {
    tier: Tier::Silver,
    machine_class: "e2-standard-8",
    gpu: None,
    max_dataset_mb: 500.0,
    max_epochs: 50,
    max_batch_size: 128,
    max_trees: 300,
    max_parallel_jobs: 2,
    max_duration_hours: 2.0,
    max_submissions_per_hour: 20,
};

static GOLD: ResourcePolicy = ResourcePolicy {
    tier: Tier::Gold,
    machine_class: "c2-standard-8",
    gpu: Some(GpuAllowance {
        machine_class: "n1-standard-8",
        accelerator: "nvidia-tesla-t4",
    }),
    max_dataset_mb: 2048.0,
    max_epochs: 100,
    max_batch_size: 256,
    max_trees: 500,
    max_parallel_jobs: 3,
    max_duration_hours: 4.0,
    max_submissions_per_hour: 50,
};

static PLATINUM: ResourcePolicy = ResourcePolicy {
    tier: Tier::Platinum,
    machine_class: "c2-standard-16",
    gpu: Some(GpuAllowance {
        machine_class: "g2-standard-8",
        accelerator: "nvidia-l4",
    }),
    max_dataset_mb: 5120.0,
    max_epochs: 200,
    max_batch_size: 512,
    max_trees: 1000,
    max_parallel_jobs: 5,
    max_duration_hours: 8.0,
    max_submissions_per_hour: 100,
};

/// A request that exceeds its tier's limits
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("dataset is {actual_mb:.1} MB, {tier} tier allows at most {max_mb:.0} MB")]
    DatasetTooLarge { tier: Tier, actual_mb: f64, max_mb: f64 },

    #[error("{field} = {actual} exceeds the {tier} tier limit of {max}")]
    LimitExceeded {
        tier: Tier,
        field: &'static str,
        actual: u32,
        max: u32,
    },

    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },
}

impl ResourcePolicy {
    pub fn allows_gpu(&self) -> bool {
        self.gpu.is_some()
    }

    /// Checks a submission's dataset size and hyperparameters against the limits
    pub fn check(&self, hyperparameters: &HyperParameters, dataset_mb: f64) -> Result<(), PolicyViolation> {
        if dataset_mb > self.max_dataset_mb {
            return Err(PolicyViolation::DatasetTooLarge {
                tier: self.tier,
                actual_mb: dataset_mb,
                max_mb: self.max_dataset_mb,
            });
        }

        let limits = [
            ("epochs", hyperparameters.epochs, self.max_epochs),
            ("batchSize", hyperparameters.batch_size, self.max_batch_size),
            ("trees", hyperparameters.trees, self.max_trees),
        ];
        for (field, value, max) in limits {
            match value {
                Some(0) => return Err(PolicyViolation::NotPositive { field }),
                Some(actual) if actual > max => {
                    return Err(PolicyViolation::LimitExceeded {
                        tier: self.tier,
                        field,
                        actual,
                        max,
                    });
                }
                _ => {}
            }
        }

        if let Some(lr) = hyperparameters.learning_rate {
            if !(lr > 0.0) {
                return Err(PolicyViolation::NotPositive {
                    field: "learningRate",
                });
            }
        }

        Ok(())
    }
}
