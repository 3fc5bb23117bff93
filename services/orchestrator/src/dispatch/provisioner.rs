//! Infrastructure provider interface and mock implementation.
//!
//! The orchestrator never speaks the provider's protocol. It hands a
//! [`ProvisionRequest`] to a [`Provisioner`] and records the outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use labfleet_id::{DeploymentId, InstanceId};
use rand::distr::{Alphanumeric, SampleString};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::domain::{AccessKind, IssuedAccess, Secret, Target, TemplateRef};
use crate::usage::ResourceUsage;

/// Everything the provider needs to build one instance.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub instance_id: InstanceId,
    pub deployment_id: DeploymentId,
    pub target: Target,
    pub template_ref: TemplateRef,
    pub config: serde_json::Value,
    pub access_types: Vec<AccessKind>,
    pub provider_project_id: Option<String>,
}

/// A successfully provisioned instance.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub provider_ref: String,
    pub network_address: String,
    pub access: Vec<IssuedAccess>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    /// The provider refused the request; the reason is safe to show.
    #[error("provisioning rejected: {reason}")]
    Rejected { reason: String },

    /// Anything else. The detail is logged, never shown.
    #[error("provider error: {0}")]
    Provider(String),
}

impl ProvisionError {
    /// Reason recorded on the instance and in the audit log.
    pub fn public_reason(&self) -> String {
        match self {
            Self::Rejected { reason } => reason.clone(),
            Self::Provider(_) => "provider error".to_string(),
        }
    }
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, request: &ProvisionRequest) -> Result<Provisioned, ProvisionError>;

    /// Current usage of a provider project.
    async fn project_usage(&self, project_id: &str) -> Result<ResourceUsage, ProvisionError>;
}

const MOCK_CORES: u32 = 2;
const MOCK_MEMORY_MB: u64 = 4096;

/// Provider stand-in for tests and local development.
pub struct MockProvisioner {
    counter: AtomicU32,
    failure: Option<String>,
    delay: Duration,
    usage: Mutex<HashMap<String, ResourceUsage>>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
            failure: None,
            delay: Duration::ZERO,
            usage: Mutex::new(HashMap::new()),
        }
    }

    /// A provisioner that rejects every request with `reason`.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of successful provisions so far.
    pub fn provisioned_count(&self) -> u32 {
        self.counter.load(Ordering::SeqCst)
    }

    fn issue(kind: AccessKind, n: u32, instance_id: InstanceId) -> IssuedAccess {
        match kind {
            AccessKind::Ssh => {
                let password = Alphanumeric.sample_string(&mut rand::rng(), 20);
                IssuedAccess::ssh("student", Secret::new(password), 22)
            }
            AccessKind::WebUrl => {
                IssuedAccess::url(kind, format!("https://lab-{n}.labfleet.local/"))
            }
            AccessKind::Guacamole => IssuedAccess::url(
                kind,
                format!("https://guacamole.labfleet.local/#/client/{instance_id}"),
            ),
            AccessKind::Rdp => IssuedAccess::port(kind, 3389),
            AccessKind::Vnc => IssuedAccess::port(kind, 5900),
        }
    }
}

impl Default for MockProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn provision(&self, request: &ProvisionRequest) -> Result<Provisioned, ProvisionError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(reason) = &self.failure {
            return Err(ProvisionError::Rejected {
                reason: reason.clone(),
            });
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            instance_id = %request.instance_id,
            target = %request.target,
            template = %request.template_ref,
            "[MOCK] Provisioning instance"
        );

        if let Some(project_id) = &request.provider_project_id {
            let mut usage = self.usage.lock().await;
            let entry = usage.entry(project_id.clone()).or_default();
            entry.used_instances += 1;
            entry.used_cores += MOCK_CORES;
            entry.used_memory_mb += MOCK_MEMORY_MB;
        }

        Ok(Provisioned {
            provider_ref: format!("mock-vm-{n:06}"),
            network_address: format!("10.20.{}.{}", n / 250, n % 250 + 2),
            access: request
                .access_types
                .iter()
                .map(|kind| Self::issue(*kind, n, request.instance_id))
                .collect(),
        })
    }

    async fn project_usage(&self, project_id: &str) -> Result<ResourceUsage, ProvisionError> {
        Ok(self
            .usage
            .lock()
            .await
            .get(project_id)
            .copied()
            .unwrap_or_default())
    }
}
