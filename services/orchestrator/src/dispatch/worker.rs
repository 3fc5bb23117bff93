//! Provisioning worker.
//!
//! Single consumer of the job channel. Each job is claimed before the
//! provider is called, so a duplicate delivery never provisions twice.
//! Store writes that fail transiently are retried; a job whose writes never
//! land is left to the redispatch sweep once its lease lapses.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, instrument, warn, Instrument};

use super::provisioner::{ProvisionRequest, Provisioner};
use super::queue::ProvisioningJob;
use super::retry::RetryPolicy;
use crate::error::LifecycleError;
use crate::lifecycle::LifecycleManager;
use crate::usage::UsageCache;

/// Reason recorded when the provider succeeded but the result could not be
/// stored.
pub const RESULT_NOT_RECORDED: &str = "failed to record provisioning result";

/// What happened to one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Provisioned,
    Failed,
    /// Stale or duplicate delivery; nothing was done.
    Discarded,
}

pub struct ProvisioningWorker {
    lifecycle: LifecycleManager,
    provisioner: Arc<dyn Provisioner>,
    usage: UsageCache,
    concurrency: usize,
    retry: RetryPolicy,
}

impl ProvisioningWorker {
    pub fn new(
        lifecycle: LifecycleManager,
        provisioner: Arc<dyn Provisioner>,
        usage: UsageCache,
        concurrency: usize,
    ) -> Self {
        Self {
            lifecycle,
            provisioner,
            usage,
            concurrency: concurrency.max(1),
            retry: RetryPolicy::default(),
        }
    }

    /// Policy for repeating store writes that failed transiently.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn retrying<T, F, Fut>(&self, write: &'static str, mut op: F) -> Result<T, LifecycleError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LifecycleError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && !self.retry.exhausted(attempt) => {
                    let delay = self.retry.delay(attempt);
                    warn!(write, attempt, error = %e, "Store write failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Consume jobs until the channel closes or shutdown is signaled, then
    /// wait for in-flight jobs.
    #[instrument(skip_all)]
    pub async fn run(
        self: Arc<Self>,
        mut jobs: mpsc::Receiver<ProvisioningJob>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(concurrency = self.concurrency, "Starting provisioning worker");
        let permits = Arc::new(Semaphore::new(self.concurrency));

        loop {
            tokio::select! {
                job = jobs.recv() => {
                    let Some(job) = job else {
                        info!("Job queue closed");
                        break;
                    };
                    let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                        break;
                    };
                    let worker = Arc::clone(&self);
                    let span = tracing::info_span!("job", job_id = %job.job_id, instance_id = %job.instance_id);
                    tokio::spawn(
                        async move {
                            worker.process(job).await;
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Provisioning worker shutting down");
                        break;
                    }
                }
            }
        }

        jobs.close();
        let mut abandoned = 0usize;
        while jobs.try_recv().is_ok() {
            abandoned += 1;
        }
        if abandoned > 0 {
            warn!(abandoned, "Unprocessed jobs dropped; the sweep redelivers them once their lease lapses");
        }

        // Every permit back means every spawned job has finished.
        let _ = permits.acquire_many(self.concurrency as u32).await;
    }

    /// Runs one job to completion.
    pub async fn process(&self, job: ProvisioningJob) -> JobOutcome {
        let correlation_id = job.correlation_id.clone();
        let lifecycle = &self.lifecycle;

        let instance = match self
            .retrying("claim", || {
                lifecycle.claim(job.instance_id, job.job_id, correlation_id.clone())
            })
            .await
        {
            Ok(instance) => instance,
            Err(e) if e.is_stale() => {
                debug!(error = %e, "Discarding stale job");
                return JobOutcome::Discarded;
            }
            Err(e) => {
                error!(error = %e, "Failed to claim instance; leaving it for redelivery");
                return JobOutcome::Discarded;
            }
        };

        let deployment = match lifecycle.store().deployment(job.deployment_id).await {
            Ok(Some(deployment)) => deployment,
            Ok(None) => {
                return self
                    .fail(&job, "deployment record missing", correlation_id)
                    .await
            }
            Err(e) => {
                error!(error = %e, "Failed to load deployment");
                return self.fail(&job, "internal error", correlation_id).await;
            }
        };

        let request = ProvisionRequest {
            instance_id: instance.id,
            deployment_id: deployment.id,
            target: instance.target,
            template_ref: deployment.template_ref.clone(),
            config: deployment.config.clone(),
            access_types: deployment.access_types.clone(),
            provider_project_id: deployment.provider_project_id.clone(),
        };

        let provisioned = match self.provisioner.provision(&request).await {
            Ok(provisioned) => provisioned,
            Err(e) => {
                warn!(error = %e, "Provisioning failed");
                return self.fail(&job, &e.public_reason(), correlation_id).await;
            }
        };

        match self
            .retrying("provisioning result", || {
                lifecycle.on_provisioned(
                    job.instance_id,
                    provisioned.provider_ref.clone(),
                    provisioned.network_address.clone(),
                    provisioned.access.clone(),
                    correlation_id.clone(),
                )
            })
            .await
        {
            Ok(update) => {
                if let Some(project_id) = update.provider_project_id.as_deref() {
                    self.refresh_usage(project_id).await;
                }
                JobOutcome::Provisioned
            }
            Err(e) if e.is_stale() => {
                debug!(error = %e, "Discarding stale completion");
                JobOutcome::Discarded
            }
            Err(LifecycleError::InvalidAccess { reason, .. }) => {
                warn!(reason = %reason, "Provider returned unusable access");
                self.fail(&job, "provider returned invalid access", correlation_id)
                    .await
            }
            Err(e) => {
                error!(
                    provider_ref = %provisioned.provider_ref,
                    error = %e,
                    "Failed to record provisioning result"
                );
                self.fail(&job, RESULT_NOT_RECORDED, correlation_id).await
            }
        }
    }

    async fn fail(
        &self,
        job: &ProvisioningJob,
        reason: &str,
        correlation_id: Option<String>,
    ) -> JobOutcome {
        let lifecycle = &self.lifecycle;
        match self
            .retrying("provisioning failure", || {
                lifecycle.on_provision_failed(job.instance_id, reason, correlation_id.clone())
            })
            .await
        {
            Ok(_) => JobOutcome::Failed,
            Err(e) if e.is_stale() => {
                debug!(error = %e, "Discarding stale failure");
                JobOutcome::Discarded
            }
            Err(e) => {
                error!(error = %e, "Failed to record provisioning failure; leaving it for redelivery");
                JobOutcome::Failed
            }
        }
    }

    /// Opportunistic; a failed refresh leaves the previous entry to expire.
    async fn refresh_usage(&self, project_id: &str) {
        match self.provisioner.project_usage(project_id).await {
            Ok(usage) => {
                self.usage.set(project_id, usage).await;
            }
            Err(e) => {
                warn!(project_id, error = %e, "Failed to refresh project usage");
            }
        }
    }
}
