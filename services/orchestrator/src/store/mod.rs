//! Transactional persistence for deployments, instances and audit logs.
//!
//! Instance writes go through [`DeploymentStore::update_instance`], which
//! hands the caller a mutable instance under the store's per-instance guard.
//! The mutation, the recomputed deployment status and the audit drafts it
//! returns are committed together or not at all.

mod memory;

pub use memory::{InMemoryDirectory, InMemoryStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labfleet_events::{AuditDraft, AuditEvent};
use labfleet_id::{CourseId, DeploymentId, InstanceId};
use thiserror::Error;

use crate::domain::{AccessKind, Deployment, DeploymentStatus, Instance};
use crate::error::LifecycleError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("deployment {0} already exists")]
    Duplicate(DeploymentId),

    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<crate::db::DbError> for StoreError {
    fn from(err: crate::db::DbError) -> Self {
        match err {
            corrupt @ crate::db::DbError::Corrupt { .. } => Self::Corrupt(corrupt.to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

/// Read-only context handed to an instance mutation.
#[derive(Debug, Clone)]
pub struct TransitionContext {
    pub now: DateTime<Utc>,
    /// Access types requested by the owning deployment.
    pub access_types: Vec<AccessKind>,
}

/// A guarded change to one instance. Returns the audit drafts to append; an
/// error aborts the write and leaves the instance untouched.
pub type InstanceMutation = Box<
    dyn FnOnce(&mut Instance, &TransitionContext) -> Result<Vec<AuditDraft>, LifecycleError>
        + Send,
>;

/// Boxes a closure as an [`InstanceMutation`].
pub fn mutation<F>(f: F) -> InstanceMutation
where
    F: FnOnce(&mut Instance, &TransitionContext) -> Result<Vec<AuditDraft>, LifecycleError>
        + Send
        + 'static,
{
    Box::new(f)
}

/// Result of a committed instance mutation.
#[derive(Debug, Clone)]
pub struct InstanceUpdate {
    pub instance: Instance,
    pub deployment_status: DeploymentStatus,
    pub provider_project_id: Option<String>,
    pub events: Vec<AuditEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentFilter {
    pub course_id: Option<CourseId>,
    pub status: Option<DeploymentStatus>,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct DeploymentPage {
    pub items: Vec<Deployment>,
    pub total: usize,
}

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Persists a deployment, all of its instances and the initial audit
    /// events in one atomic write.
    async fn create(
        &self,
        deployment: &Deployment,
        events: Vec<AuditDraft>,
    ) -> Result<Vec<AuditEvent>, StoreError>;

    async fn deployment(&self, id: DeploymentId) -> Result<Option<Deployment>, StoreError>;

    /// Newest first.
    async fn list(&self, filter: &DeploymentFilter) -> Result<DeploymentPage, StoreError>;

    async fn instance(&self, id: InstanceId) -> Result<Option<Instance>, StoreError>;

    async fn update_instance(
        &self,
        id: InstanceId,
        mutation: InstanceMutation,
    ) -> Result<InstanceUpdate, LifecycleError>;

    /// Ordered by sequence. `None` when the deployment does not exist.
    async fn audit_events(&self, id: DeploymentId)
        -> Result<Option<Vec<AuditEvent>>, StoreError>;

    /// `CREATING` instances that need a fresh delivery, oldest first: those
    /// no job was ever accepted for, created before `unqueued_before`, and
    /// those whose hand-off or claim was last touched before `lease_cutoff`.
    async fn stalled_instances(
        &self,
        unqueued_before: DateTime<Utc>,
        lease_cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Instance>, StoreError>;
}
