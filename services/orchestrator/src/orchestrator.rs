//! Orchestrator facade: the inbound operations of the engine.

use std::sync::Arc;

use chrono::Utc;
use labfleet_events::{AuditDraft, AuditEvent, AuditEventType};
use labfleet_id::{CourseId, DeploymentId, InstanceId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::dispatch::RetryPolicy;
use crate::domain::{
    Deployment, DeploymentStatus, DeploymentSummary, DeploymentView, Instance, TeardownOutcome,
};
use crate::error::{OrchestratorError, ValidationError};
use crate::lifecycle::LifecycleManager;
use crate::resolver::{resolve_targets, CourseDirectory, CreateDeploymentRequest};
use crate::store::{DeploymentFilter, DeploymentStore};
use crate::usage::{UsageCache, UsageCacheEntry};

pub const DEFAULT_PAGE_LIMIT: usize = 20;
pub const MAX_PAGE_LIMIT: usize = 100;

/// Filters and pagination for listing deployments, as raw query values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListDeploymentsQuery {
    pub course_id: Option<String>,
    pub status: Option<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl ListDeploymentsQuery {
    fn filter(&self) -> Result<DeploymentFilter, ValidationError> {
        let course_id = self
            .course_id
            .as_deref()
            .map(|c| c.trim().parse::<CourseId>())
            .transpose()
            .map_err(ValidationError::invalid_id("course_id"))?;
        let status = self
            .status
            .as_deref()
            .map(str::parse::<DeploymentStatus>)
            .transpose()?;
        Ok(DeploymentFilter {
            course_id,
            status,
            offset: self.offset.unwrap_or(0),
            limit: self
                .limit
                .unwrap_or(DEFAULT_PAGE_LIMIT)
                .clamp(1, MAX_PAGE_LIMIT),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentList {
    pub items: Vec<DeploymentSummary>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceTeardown {
    pub instance_id: InstanceId,
    pub outcome: TeardownOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct TeardownReport {
    pub deployment_id: DeploymentId,
    pub status: DeploymentStatus,
    pub instances: Vec<InstanceTeardown>,
}

pub struct Orchestrator {
    store: Arc<dyn DeploymentStore>,
    directory: Arc<dyn CourseDirectory>,
    lifecycle: LifecycleManager,
    usage: UsageCache,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(
        lifecycle: LifecycleManager,
        directory: Arc<dyn CourseDirectory>,
        usage: UsageCache,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store: Arc::clone(lifecycle.store()),
            directory,
            lifecycle,
            usage,
            retry,
        }
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn usage_cache(&self) -> &UsageCache {
        &self.usage
    }

    /// Validates, resolves and persists a deployment, then hands every
    /// instance to the job queue. Never waits for provisioning.
    pub async fn create_deployment(
        &self,
        request: CreateDeploymentRequest,
        correlation_id: Option<String>,
    ) -> Result<DeploymentSummary, OrchestratorError> {
        let spec = request.validate()?;
        let roster = self
            .directory
            .roster(spec.course_id)
            .await
            .map_err(|e| OrchestratorError::Directory(e.to_string()))?
            .ok_or(ValidationError::CourseNotFound(spec.course_id))?;
        let targets = resolve_targets(spec.mode, spec.course_id, &spec.selectors, &roster)?;

        let now = Utc::now();
        let id = DeploymentId::new();
        let instances: Vec<Instance> = targets
            .iter()
            .map(|target| Instance::new(id, *target, now))
            .collect();
        let deployment = Deployment {
            id,
            name: spec.name,
            template_ref: spec.template_ref,
            course_id: spec.course_id,
            mode: spec.mode,
            selectors: spec.selectors,
            access_types: spec.access_types,
            config: spec.config,
            provider_project_id: spec.provider_project_id,
            instances,
            created_at: now,
        };

        let events = vec![
            AuditDraft::new(
                AuditEventType::Started,
                format!("deployment '{}' requested", deployment.name),
            )
            .details(json!({
                "mode": deployment.mode,
                "template_version_ref": deployment.template_ref,
                "access_types": deployment.access_types,
            })),
            AuditDraft::new(
                AuditEventType::TargetResolved,
                format!("resolved {} target(s)", targets.len()),
            )
            .details(json!({ "targets": targets })),
        ]
        .into_iter()
        .map(|d| d.correlation_id(correlation_id.clone()))
        .collect();

        self.store.create(&deployment, events).await?;
        info!(
            deployment_id = %deployment.id,
            course_id = %deployment.course_id,
            mode = %deployment.mode,
            instances = deployment.instances.len(),
            "Deployment created"
        );

        for instance in &deployment.instances {
            self.hand_off(instance.id, deployment.id, correlation_id.clone())
                .await;
        }

        let stored = self
            .store
            .deployment(deployment.id)
            .await?
            .unwrap_or(deployment);
        Ok(stored.summary())
    }

    /// First attempt inline; backoff and further attempts run in the
    /// background so the request never sleeps.
    async fn hand_off(
        &self,
        instance_id: InstanceId,
        deployment_id: DeploymentId,
        correlation_id: Option<String>,
    ) {
        if self
            .lifecycle
            .dispatch(instance_id, deployment_id, correlation_id.clone())
            .await
            .is_ok()
        {
            return;
        }

        let lifecycle = self.lifecycle.clone();
        let policy = self.retry.clone();
        tokio::spawn(async move {
            if let Err(e) = lifecycle
                .resume_dispatch(instance_id, deployment_id, correlation_id, &policy, 1)
                .await
            {
                warn!(%instance_id, error = %e, "Giving up on dispatch");
            }
        });
    }

    pub async fn get_deployment(&self, id: &str) -> Result<DeploymentView, OrchestratorError> {
        let deployment = self.load(id).await?;
        Ok(deployment.view(Utc::now()))
    }

    pub async fn list_deployments(
        &self,
        query: &ListDeploymentsQuery,
    ) -> Result<DeploymentList, OrchestratorError> {
        let filter = query.filter()?;
        let page = self.store.list(&filter).await?;
        Ok(DeploymentList {
            items: page.items.iter().map(Deployment::summary).collect(),
            total: page.total,
            offset: filter.offset,
            limit: filter.limit,
        })
    }

    /// Tears down every instance. Instances still provisioning are deferred.
    pub async fn teardown_deployment(
        &self,
        id: &str,
        correlation_id: Option<String>,
    ) -> Result<TeardownReport, OrchestratorError> {
        let deployment = self.load(id).await?;

        let mut instances = Vec::with_capacity(deployment.instances.len());
        for instance in &deployment.instances {
            let outcome = self
                .lifecycle
                .request_teardown(instance.id, correlation_id.clone())
                .await?;
            instances.push(InstanceTeardown {
                instance_id: instance.id,
                outcome,
            });
        }

        let status = self
            .store
            .deployment(deployment.id)
            .await?
            .map(|d| d.status())
            .unwrap_or(DeploymentStatus::Deleted);
        Ok(TeardownReport {
            deployment_id: deployment.id,
            status,
            instances,
        })
    }

    pub async fn teardown_instance(
        &self,
        id: &str,
        correlation_id: Option<String>,
    ) -> Result<InstanceTeardown, OrchestratorError> {
        let instance_id: InstanceId = id
            .parse()
            .map_err(ValidationError::invalid_id("instance_id"))?;
        if self.store.instance(instance_id).await?.is_none() {
            return Err(OrchestratorError::not_found("instance", instance_id));
        }
        let outcome = self
            .lifecycle
            .request_teardown(instance_id, correlation_id)
            .await?;
        Ok(InstanceTeardown {
            instance_id,
            outcome,
        })
    }

    /// The audit log, ordered by sequence.
    pub async fn deployment_events(&self, id: &str) -> Result<Vec<AuditEvent>, OrchestratorError> {
        let deployment_id = parse_deployment_id(id)?;
        self.store
            .audit_events(deployment_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("deployment", deployment_id))
    }

    /// Last known usage, or `None` when unknown. Never calls the provider.
    pub async fn project_usage(&self, project_id: &str) -> Option<UsageCacheEntry> {
        self.usage.get(project_id).await
    }

    pub async fn cached_projects(&self) -> Vec<String> {
        self.usage.cached_projects().await
    }

    async fn load(&self, id: &str) -> Result<Deployment, OrchestratorError> {
        let deployment_id = parse_deployment_id(id)?;
        self.store
            .deployment(deployment_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("deployment", deployment_id))
    }
}

fn parse_deployment_id(id: &str) -> Result<DeploymentId, ValidationError> {
    id.trim()
        .parse()
        .map_err(ValidationError::invalid_id("deployment_id"))
}
