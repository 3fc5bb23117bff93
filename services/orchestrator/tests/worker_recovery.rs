//! Worker behaviour when store writes fail underneath it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labfleet_events::{AuditDraft, AuditEvent};
use labfleet_id::{DeploymentId, InstanceId};
use labfleet_orchestrator::dispatch::{
    ChannelQueue, JobOutcome, MockProvisioner, ProvisionError, ProvisionRequest, Provisioned,
    Provisioner, ProvisioningJob, ProvisioningWorker, RetryPolicy, RESULT_NOT_RECORDED,
};
use labfleet_orchestrator::domain::{Deployment, InstanceStatus};
use labfleet_orchestrator::error::LifecycleError;
use labfleet_orchestrator::lifecycle::LifecycleManager;
use labfleet_orchestrator::orchestrator::Orchestrator;
use labfleet_orchestrator::resolver::{CourseDirectory, CreateDeploymentRequest};
use labfleet_orchestrator::store::{
    DeploymentFilter, DeploymentPage, DeploymentStore, InMemoryDirectory, InMemoryStore,
    InstanceMutation, InstanceUpdate, StoreError,
};
use labfleet_orchestrator::usage::{ResourceUsage, UsageCache};
use tokio::sync::mpsc;

/// Delegates to the in-memory store, failing the next `n` instance writes.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryStore,
    failures: AtomicU32,
}

impl FlakyStore {
    fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeploymentStore for FlakyStore {
    async fn create(
        &self,
        deployment: &Deployment,
        events: Vec<AuditDraft>,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        self.inner.create(deployment, events).await
    }

    async fn deployment(&self, id: DeploymentId) -> Result<Option<Deployment>, StoreError> {
        self.inner.deployment(id).await
    }

    async fn list(&self, filter: &DeploymentFilter) -> Result<DeploymentPage, StoreError> {
        self.inner.list(filter).await
    }

    async fn instance(
        &self,
        id: InstanceId,
    ) -> Result<Option<labfleet_orchestrator::domain::Instance>, StoreError> {
        self.inner.instance(id).await
    }

    async fn update_instance(
        &self,
        id: InstanceId,
        mutation: InstanceMutation,
    ) -> Result<InstanceUpdate, LifecycleError> {
        let armed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(StoreError::Database("connection reset by peer".into()).into());
        }
        self.inner.update_instance(id, mutation).await
    }

    async fn audit_events(
        &self,
        id: DeploymentId,
    ) -> Result<Option<Vec<AuditEvent>>, StoreError> {
        self.inner.audit_events(id).await
    }

    async fn stalled_instances(
        &self,
        unqueued_before: DateTime<Utc>,
        lease_cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<labfleet_orchestrator::domain::Instance>, StoreError> {
        self.inner
            .stalled_instances(unqueued_before, lease_cutoff, limit)
            .await
    }
}

/// Provisions successfully, then breaks the store for the write that
/// records the result.
struct StoreBreakingProvisioner {
    inner: MockProvisioner,
    store: Arc<FlakyStore>,
    failures: u32,
}

#[async_trait]
impl Provisioner for StoreBreakingProvisioner {
    async fn provision(&self, request: &ProvisionRequest) -> Result<Provisioned, ProvisionError> {
        let provisioned = self.inner.provision(request).await?;
        self.store.fail_next(self.failures);
        Ok(provisioned)
    }

    async fn project_usage(&self, project_id: &str) -> Result<ResourceUsage, ProvisionError> {
        self.inner.project_usage(project_id).await
    }
}

struct Rig {
    orchestrator: Orchestrator,
    store: Arc<FlakyStore>,
    worker: ProvisioningWorker,
    jobs: mpsc::Receiver<ProvisioningJob>,
    directory: Arc<InMemoryDirectory>,
}

impl Rig {
    /// `failures` instance writes fail right after the provider returns.
    fn new(failures: u32) -> Self {
        let store = Arc::new(FlakyStore::default());
        let directory = Arc::new(InMemoryDirectory::new());
        let (queue, jobs) = ChannelQueue::new(16);
        let lifecycle =
            LifecycleManager::new(store.clone() as Arc<dyn DeploymentStore>, Arc::new(queue));
        let provisioner = Arc::new(StoreBreakingProvisioner {
            inner: MockProvisioner::new(),
            store: store.clone(),
            failures,
        });
        let usage = UsageCache::in_memory();
        let worker = ProvisioningWorker::new(lifecycle.clone(), provisioner, usage.clone(), 1)
            .with_retry(RetryPolicy::immediate(3));
        let orchestrator = Orchestrator::new(
            lifecycle,
            directory.clone() as Arc<dyn CourseDirectory>,
            usage,
            RetryPolicy::immediate(3),
        );
        Self {
            orchestrator,
            store,
            worker,
            jobs,
            directory,
        }
    }

    async fn create(&mut self) -> ProvisioningJob {
        let course = self.directory.create_course().await;
        self.orchestrator
            .create_deployment(
                CreateDeploymentRequest {
                    template_version_ref: "acme/intro-lab@v1".into(),
                    course_id: course.to_string(),
                    mode: "PER_COURSE".into(),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        self.jobs.try_recv().expect("job was enqueued")
    }
}

#[tokio::test]
async fn transient_claim_failures_are_retried() {
    let mut rig = Rig::new(0);
    let job = rig.create().await;
    rig.store.fail_next(2);

    assert_eq!(rig.worker.process(job.clone()).await, JobOutcome::Provisioned);
    let instance = rig.store.instance(job.instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
}

#[tokio::test]
async fn transient_completion_failure_is_retried() {
    let mut rig = Rig::new(1);
    let job = rig.create().await;

    assert_eq!(rig.worker.process(job.clone()).await, JobOutcome::Provisioned);
    let instance = rig.store.instance(job.instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
    assert!(instance.provider_ref.is_some());
    assert_eq!(instance.claimed_by, None);
}

#[tokio::test]
async fn unrecordable_result_fails_the_instance() {
    let mut rig = Rig::new(3);
    let job = rig.create().await;

    assert_eq!(rig.worker.process(job.clone()).await, JobOutcome::Failed);
    let instance = rig.store.instance(job.instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.failure_reason.as_deref(), Some(RESULT_NOT_RECORDED));
    assert_eq!(instance.claimed_by, None);
}

#[tokio::test]
async fn persistent_claim_failure_leaves_the_instance_for_redelivery() {
    let mut rig = Rig::new(0);
    let job = rig.create().await;
    rig.store.fail_next(10);

    assert_eq!(rig.worker.process(job.clone()).await, JobOutcome::Discarded);
    rig.store.fail_next(0);
    let instance = rig.store.instance(job.instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Creating);
    assert_eq!(instance.claimed_by, None);
    assert_eq!(instance.job, Some(job.job_id));
}
