//! Compute Engine provider
//!
//! Instances are created and deleted through the Compute Engine v1 REST API.
//! A create call returns as soon as the zone operation is accepted; the
//! instance boots and runs the startup script on its own.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{ComputeProvider, InstanceHandle, InstanceSpec, ProvisionError, naming};
use crate::credentials::Credentials;

pub const DEFAULT_BASE_URL: &str = "https://compute.googleapis.com/compute/v1";

const CPU_IMAGE: &str = "projects/debian-cloud/global/images/family/debian-12";
const GPU_IMAGE: &str =
    "projects/deeplearning-platform-release/global/images/family/common-cu123-debian-11-py310";
const BOOT_DISK_GB: &str = "50";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Compute Engine client bound to one project and zone
#[derive(Debug, Clone)]
pub struct ComputeEngine {
    http: reqwest::Client,
    credentials: Credentials,
    project: String,
    zone: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

impl ComputeEngine {
    pub fn new(
        http: reqwest::Client,
        credentials: Credentials,
        project: impl Into<String>,
        zone: impl Into<String>,
    ) -> Self {
        Self {
            http,
            credentials,
            project: project.into(),
            zone: zone.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn instances_url(&self, zone: &str) -> String {
        format!(
            "{}/projects/{}/zones/{}/instances",
            self.base_url.trim_end_matches('/'),
            self.project,
            zone
        )
    }

    fn console_url(&self, name: &str) -> String {
        format!(
            "https://console.cloud.google.com/compute/instancesDetail/zones/{}/instances/{}?project={}",
            self.zone, name, self.project
        )
    }

    /// Request body for `instances.insert`
    fn instance_body(&self, spec: &InstanceSpec) -> Value {
        let mut metadata = vec![json!({
            "key": "startup-script",
            "value": spec.startup_script,
        })];

        let image = if spec.gpu_class.is_some() { GPU_IMAGE } else { CPU_IMAGE };
        let mut body = json!({
            "name": spec.name,
            "machineType": format!("zones/{}/machineTypes/{}", self.zone, spec.machine_class),
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "initializeParams": {
                    "sourceImage": image,
                    "diskSizeGb": BOOT_DISK_GB,
                },
            }],
            "networkInterfaces": [{
                "network": "global/networks/default",
                "accessConfigs": [{ "type": "ONE_TO_ONE_NAT", "name": "External NAT" }],
            }],
            "serviceAccounts": [{
                "email": "default",
                "scopes": [CLOUD_PLATFORM_SCOPE],
            }],
            "scheduling": { "automaticRestart": false },
            "labels": { "anvil-job": spec.job_id.to_string() },
        });

        if let Some(gpu) = &spec.gpu_class {
            metadata.push(json!({ "key": "install-nvidia-driver", "value": "True" }));
            body["guestAccelerators"] = json!([{
                "acceleratorType": format!("zones/{}/acceleratorTypes/{}", self.zone, gpu),
                "acceleratorCount": 1,
            }]);
            // GPU instances cannot live-migrate
            body["scheduling"] = json!({
                "automaticRestart": false,
                "onHostMaintenance": "TERMINATE",
            });
        }
        body["metadata"] = json!({ "items": metadata });

        body
    }

    async fn rejection(response: reqwest::Response) -> ProvisionError {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&text)
            .map(|e| e.error.message)
            .unwrap_or(text);
        ProvisionError::Rejected { status, message }
    }
}

#[async_trait]
impl ComputeProvider for ComputeEngine {
    async fn create(&self, spec: &InstanceSpec) -> Result<InstanceHandle, ProvisionError> {
        if !naming::is_valid(&spec.name) {
            return Err(ProvisionError::InvalidName(spec.name.clone()));
        }

        let token = self.credentials.token().await?;
        let response = self
            .http
            .post(self.instances_url(&self.zone))
            .bearer_auth(token)
            .json(&self.instance_body(spec))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }

        tracing::info!(
            "Instance {} ({}{}) accepted in {} for job {}",
            spec.name,
            spec.machine_class,
            spec.gpu_class
                .as_deref()
                .map(|g| format!(" + {}", g))
                .unwrap_or_default(),
            self.zone,
            spec.job_id
        );

        Ok(InstanceHandle {
            name: spec.name.clone(),
            zone: self.zone.clone(),
            console_url: self.console_url(&spec.name),
        })
    }

    async fn delete(&self, name: &str, zone: &str) -> Result<(), ProvisionError> {
        let token = self.credentials.token().await?;
        let response = self
            .http
            .delete(format!("{}/{}", self.instances_url(zone), name))
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                tracing::debug!("Instance {} already gone", name);
                Ok(())
            }
            status if status.is_success() => Ok(()),
            _ => Err(Self::rejection(response).await),
        }
    }

    fn zone(&self) -> &str {
        &self.zone
    }
}
