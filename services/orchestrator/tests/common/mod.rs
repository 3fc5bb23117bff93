//! In-memory wiring shared by the integration tests.
//!
//! Jobs are not consumed by a background worker; tests pull them off the
//! channel and run them one at a time, so every interleaving is explicit.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use labfleet_id::{CourseId, InstanceId};
use labfleet_orchestrator::dispatch::{
    ChannelQueue, DispatchError, JobHandle, JobOutcome, JobQueue, MockProvisioner,
    ProvisioningJob, ProvisioningWorker, RetryPolicy,
};
use labfleet_orchestrator::domain::{Instance, InstanceStatus};
use labfleet_orchestrator::lifecycle::{LifecycleManager, DEFAULT_DELIVERY_LEASE};
use labfleet_orchestrator::orchestrator::Orchestrator;
use labfleet_orchestrator::resolver::{CourseDirectory, CreateDeploymentRequest};
use labfleet_orchestrator::store::{DeploymentStore, InMemoryDirectory, InMemoryStore};
use labfleet_orchestrator::usage::UsageCache;
use tokio::sync::mpsc;

pub const TEMPLATE: &str = "acme/intro-lab@v1";

pub fn request(course_id: CourseId, mode: &str) -> CreateDeploymentRequest {
    CreateDeploymentRequest {
        template_version_ref: TEMPLATE.to_string(),
        course_id: course_id.to_string(),
        mode: mode.to_string(),
        ..Default::default()
    }
}

/// A queue that refuses every job.
#[derive(Default)]
pub struct DownQueue {
    pub attempts: AtomicU32,
}

impl DownQueue {
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobQueue for DownQueue {
    async fn enqueue(&self, _job: ProvisioningJob) -> Result<JobHandle, DispatchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(DispatchError::Unavailable("connection refused".into()))
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<InMemoryStore>,
    pub directory: Arc<InMemoryDirectory>,
    pub provisioner: Arc<MockProvisioner>,
    pub usage: UsageCache,
    pub worker: ProvisioningWorker,
    jobs: mpsc::Receiver<ProvisioningJob>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_provisioner(MockProvisioner::new())
    }

    pub fn with_provisioner(provisioner: MockProvisioner) -> Self {
        let (queue, jobs) = ChannelQueue::new(64);
        Self::build(Arc::new(queue), jobs, provisioner, DEFAULT_DELIVERY_LEASE)
    }

    /// Harness whose hand-offs go to `queue` instead of the channel.
    pub fn with_queue(queue: Arc<dyn JobQueue>) -> Self {
        let (_unused, jobs) = ChannelQueue::new(1);
        Self::build(queue, jobs, MockProvisioner::new(), DEFAULT_DELIVERY_LEASE)
    }

    /// Harness whose hand-offs and claims lapse after `lease`.
    pub fn with_lease(lease: Duration) -> Self {
        let (queue, jobs) = ChannelQueue::new(64);
        Self::build(Arc::new(queue), jobs, MockProvisioner::new(), lease)
    }

    fn build(
        queue: Arc<dyn JobQueue>,
        jobs: mpsc::Receiver<ProvisioningJob>,
        provisioner: MockProvisioner,
        lease: Duration,
    ) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let provisioner = Arc::new(provisioner);
        let usage = UsageCache::in_memory();

        let lifecycle = LifecycleManager::new(store.clone() as Arc<dyn DeploymentStore>, queue)
            .with_lease(lease);
        let worker = ProvisioningWorker::new(
            lifecycle.clone(),
            provisioner.clone(),
            usage.clone(),
            4,
        );
        let orchestrator = Arc::new(Orchestrator::new(
            lifecycle,
            directory.clone() as Arc<dyn CourseDirectory>,
            usage.clone(),
            RetryPolicy::immediate(3),
        ));

        Self {
            orchestrator,
            store,
            directory,
            provisioner,
            usage,
            worker,
            jobs,
        }
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        self.orchestrator.lifecycle()
    }

    /// Next queued job, if any.
    pub fn next_job(&mut self) -> Option<ProvisioningJob> {
        self.jobs.try_recv().ok()
    }

    /// Runs every queued job in order.
    pub async fn drain(&mut self) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        while let Some(job) = self.next_job() {
            outcomes.push(self.worker.process(job).await);
        }
        outcomes
    }

    pub async fn instance(&self, id: InstanceId) -> Instance {
        self.store
            .instance(id)
            .await
            .unwrap()
            .expect("instance should exist")
    }

    /// Polls until the instance reaches `status`, for work done on spawned
    /// tasks.
    pub async fn wait_for_status(&self, id: InstanceId, status: InstanceStatus) -> Instance {
        for _ in 0..200 {
            let instance = self.instance(id).await;
            if instance.status == status {
                return instance;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("instance {id} never reached {status}");
    }
}
