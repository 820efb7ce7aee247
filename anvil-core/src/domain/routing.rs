//! Routing Engine
//!
//! Maps (tier, dataset type, task type, GPU preference) to a
//! [`RoutingDecision`]. The function is total and side-effect free: the
//! orchestrator calls it once for the pre-submission quote and again at
//! submission time, and both calls must agree.

use serde::{Deserialize, Serialize};

use crate::domain::tier::Tier;

/// Compute pool a job is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    GeneralPurpose,
    GpuPool,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::GeneralPurpose => "general_purpose",
            Backend::GpuPool => "gpu_pool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "general_purpose" => Some(Backend::GeneralPurpose),
            "gpu_pool" => Some(Backend::GpuPool),
            _ => None,
        }
    }
}

/// Detected dataset shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetType {
    Tabular,
    Image,
    #[default]
    Unknown,
}

/// Resolved backend and machine choice for one submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    pub backend: Backend,
    pub machine_class: String,
    pub gpu_class: Option<String>,
    pub specs: String,
    pub cost_per_hour: f64,
    pub max_duration_hours: f64,
    pub justification: String,
}

/// Task-type fragments that imply a deep-learning workload
const GPU_TASK_FAMILIES: &[&str] = &[
    "cnn",
    "resnet",
    "efficientnet",
    "mobilenet",
    "vgg",
    "transformer",
    "bert",
    "lstm",
    "rnn",
    "gru",
    "deep",
    "neural",
    "vision",
    "image_classification",
    "object_detection",
    "segmentation",
];

struct MachineProfile {
    name: &'static str,
    vcpus: u32,
    memory_gb: u32,
    hourly_usd: f64,
}

struct AcceleratorProfile {
    name: &'static str,
    label: &'static str,
    hourly_usd: f64,
}

const MACHINES: &[MachineProfile] = &[
    MachineProfile { name: "e2-standard-4", vcpus: 4, memory_gb: 16, hourly_usd: 0.134 },
    MachineProfile { name: "e2-standard-8", vcpus: 8, memory_gb: 32, hourly_usd: 0.268 },
    MachineProfile { name: "c2-standard-8", vcpus: 8, memory_gb: 32, hourly_usd: 0.334 },
    MachineProfile { name: "c2-standard-16", vcpus: 16, memory_gb: 64, hourly_usd: 0.668 },
    MachineProfile { name: "n1-standard-8", vcpus: 8, memory_gb: 30, hourly_usd: 0.380 },
    MachineProfile { name: "g2-standard-8", vcpus: 8, memory_gb: 32, hourly_usd: 0.140 },
];

const ACCELERATORS: &[AcceleratorProfile] = &[
    AcceleratorProfile { name: "nvidia-tesla-t4", label: "NVIDIA T4", hourly_usd: 0.350 },
    AcceleratorProfile { name: "nvidia-l4", label: "NVIDIA L4", hourly_usd: 0.710 },
];

fn machine(name: &str) -> Option<&'static MachineProfile> {
    MACHINES.iter().find(|m| m.name == name)
}

fn accelerator(name: &str) -> Option<&'static AcceleratorProfile> {
    ACCELERATORS.iter().find(|a| a.name == name)
}

/// True if the task type belongs to a known GPU-requiring family
pub fn is_gpu_task(task_type: &str) -> bool {
    let task = task_type.to_ascii_lowercase();
    GPU_TASK_FAMILIES.iter().any(|family| task.contains(family))
}

/// Route a submission to a backend
pub fn route(tier: Tier, dataset_type: DatasetType, task_type: &str, prefer_gpu: bool) -> RoutingDecision {
    let policy = tier.policy();

    let trigger = if prefer_gpu {
        Some("GPU requested by user".to_string())
    } else if dataset_type == DatasetType::Image {
        Some("image dataset".to_string())
    } else if is_gpu_task(task_type) {
        Some(format!("task type '{}' needs a GPU", task_type))
    } else {
        None
    };

    match (trigger, policy.gpu) {
        (Some(reason), Some(gpu)) => {
            let (specs, cost) = describe(gpu.machine_class, Some(gpu.accelerator));
            RoutingDecision {
                backend: Backend::GpuPool,
                machine_class: gpu.machine_class.to_string(),
                gpu_class: Some(gpu.accelerator.to_string()),
                specs,
                cost_per_hour: cost,
                max_duration_hours: policy.max_duration_hours,
                justification: format!("{}; {} tier permits GPU", reason, tier),
            }
        }
        (trigger, _) => {
            let (specs, cost) = describe(policy.machine_class, None);
            let justification = match trigger {
                Some(reason) => format!(
                    "{}, but {} tier does not permit GPU; using {}",
                    reason, tier, policy.machine_class
                ),
                None => format!("CPU workload; using {} tier machine {}", tier, policy.machine_class),
            };
            RoutingDecision {
                backend: Backend::GeneralPurpose,
                machine_class: policy.machine_class.to_string(),
                gpu_class: None,
                specs,
                cost_per_hour: cost,
                max_duration_hours: policy.max_duration_hours,
                justification,
            }
        }
    }
}

fn describe(machine_class: &str, gpu: Option<&str>) -> (String, f64) {
    let (mut specs, mut cost) = match machine(machine_class) {
        Some(m) => (format!("{} vCPU, {} GB RAM", m.vcpus, m.memory_gb), m.hourly_usd),
        None => (machine_class.to_string(), 0.0),
    };
    if let Some(profile) = gpu.and_then(accelerator) {
        specs.push_str(&format!(", 1x {}", profile.label));
        cost += profile.hourly_usd;
    }
    (specs, (cost * 1000.0).round() / 1000.0)
}
