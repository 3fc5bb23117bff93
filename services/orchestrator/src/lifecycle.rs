//! Instance lifecycle manager.
//!
//! Every transition runs as one guarded store write: the instance state
//! change, the recomputed deployment status and its audit events commit
//! together. Completion handlers check current state first, so late and
//! duplicate callbacks are rejected as stale without touching anything.

use std::sync::Arc;
use std::time::Duration;

use labfleet_events::AuditDraft;
use chrono::{DateTime, Utc};
use labfleet_id::{DeploymentId, InstanceId, JobId};
use tracing::{debug, info, warn};

use crate::dispatch::{DispatchError, JobHandle, JobQueue, ProvisioningJob, RetryPolicy};
use crate::domain::{HandoffCredential, Instance, InstanceStatus, IssuedAccess, TeardownOutcome};
use crate::error::LifecycleError;
use crate::store::{mutation, DeploymentStore, InstanceUpdate};

/// Reason recorded when the queue never accepted a job.
pub const DISPATCH_EXHAUSTED: &str = "dispatch exhausted";

/// How long a hand-off or claim may go without progress.
pub const DEFAULT_DELIVERY_LEASE: Duration = Duration::from_secs(600);

fn correlate(drafts: Vec<AuditDraft>, correlation_id: &Option<String>) -> Vec<AuditDraft> {
    drafts
        .into_iter()
        .map(|d| d.correlation_id(correlation_id.clone()))
        .collect()
}

fn cutoff(now: DateTime<Utc>, lease: chrono::Duration) -> DateTime<Utc> {
    now.checked_sub_signed(lease).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Clone)]
pub struct LifecycleManager {
    store: Arc<dyn DeploymentStore>,
    queue: Arc<dyn JobQueue>,
    lease: chrono::Duration,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn DeploymentStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            store,
            queue,
            lease: chrono::Duration::from_std(DEFAULT_DELIVERY_LEASE).unwrap_or_default(),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        self
    }

    pub fn store(&self) -> &Arc<dyn DeploymentStore> {
        &self.store
    }

    /// Hand-offs and claims last touched before this have lapsed.
    pub fn lease_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        cutoff(now, self.lease)
    }

    /// One hand-off attempt. On queue failure the instance stays `CREATING`
    /// and the attempt is recorded as a `dispatch-retry` event.
    pub async fn dispatch(
        &self,
        instance_id: InstanceId,
        deployment_id: DeploymentId,
        correlation_id: Option<String>,
    ) -> Result<JobHandle, DispatchError> {
        let job = ProvisioningJob::new(instance_id, deployment_id, correlation_id.clone());
        match self.queue.enqueue(job).await {
            Ok(handle) => {
                let job_id = handle.job_id;
                let record = mutation(move |instance, ctx| {
                    Ok(correlate(
                        instance.record_handoff(job_id, ctx.now),
                        &correlation_id,
                    ))
                });
                if let Err(e) = self.store.update_instance(instance_id, record).await {
                    // The job is queued; the claim records the hand-off too.
                    warn!(%instance_id, %job_id, error = %e, "failed to record hand-off");
                }
                debug!(%instance_id, %job_id, "provisioning job enqueued");
                Ok(handle)
            }
            Err(dispatch_err) => {
                let message = dispatch_err.to_string();
                let record = mutation(move |instance, ctx| {
                    Ok(correlate(
                        instance.record_dispatch_failure(&message, ctx.now),
                        &correlation_id,
                    ))
                });
                if let Err(e) = self.store.update_instance(instance_id, record).await {
                    warn!(%instance_id, error = %e, "failed to record dispatch failure");
                }
                Err(dispatch_err)
            }
        }
    }

    /// Dispatches with bounded exponential backoff. When every attempt fails
    /// the instance is marked `FAILED` with reason `"dispatch exhausted"`.
    pub async fn dispatch_with_retry(
        &self,
        instance_id: InstanceId,
        deployment_id: DeploymentId,
        correlation_id: Option<String>,
        policy: &RetryPolicy,
    ) -> Result<JobHandle, DispatchError> {
        self.dispatch_from(instance_id, deployment_id, correlation_id, policy, 1)
            .await
    }

    /// Continues a dispatch after `failed_attempts` unsuccessful tries,
    /// backing off first.
    pub async fn resume_dispatch(
        &self,
        instance_id: InstanceId,
        deployment_id: DeploymentId,
        correlation_id: Option<String>,
        policy: &RetryPolicy,
        failed_attempts: u32,
    ) -> Result<JobHandle, DispatchError> {
        if policy.exhausted(failed_attempts) {
            self.mark_dispatch_exhausted(instance_id, correlation_id).await;
            return Err(DispatchError::Unavailable(DISPATCH_EXHAUSTED.into()));
        }
        tokio::time::sleep(policy.delay(failed_attempts)).await;
        self.dispatch_from(
            instance_id,
            deployment_id,
            correlation_id,
            policy,
            failed_attempts + 1,
        )
        .await
    }

    async fn dispatch_from(
        &self,
        instance_id: InstanceId,
        deployment_id: DeploymentId,
        correlation_id: Option<String>,
        policy: &RetryPolicy,
        mut attempt: u32,
    ) -> Result<JobHandle, DispatchError> {
        loop {
            match self
                .dispatch(instance_id, deployment_id, correlation_id.clone())
                .await
            {
                Ok(handle) => return Ok(handle),
                Err(e) if policy.exhausted(attempt) => {
                    warn!(%instance_id, attempts = attempt, error = %e, "dispatch exhausted");
                    self.mark_dispatch_exhausted(instance_id, correlation_id).await;
                    return Err(e);
                }
                Err(e) => {
                    let delay = policy.delay(attempt);
                    debug!(
                        %instance_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying dispatch"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn mark_dispatch_exhausted(
        &self,
        instance_id: InstanceId,
        correlation_id: Option<String>,
    ) {
        if let Err(e) = self
            .on_provision_failed(instance_id, DISPATCH_EXHAUSTED, correlation_id)
            .await
        {
            warn!(%instance_id, error = %e, "failed to mark instance failed");
        }
    }

    /// Consumer-side guard run before provisioning. Fails if the instance is
    /// not `CREATING`, already has a provider ref, or another delivery holds
    /// a live claim.
    pub async fn claim(
        &self,
        instance_id: InstanceId,
        job_id: JobId,
        correlation_id: Option<String>,
    ) -> Result<Instance, LifecycleError> {
        let lease = self.lease;
        let update = self
            .store
            .update_instance(
                instance_id,
                mutation(move |instance, ctx| {
                    let cutoff = cutoff(ctx.now, lease);
                    Ok(correlate(
                        instance.claim(job_id, ctx.now, cutoff)?,
                        &correlation_id,
                    ))
                }),
            )
            .await?;
        Ok(update.instance)
    }

    /// Releases a lapsed delivery. Returns false when the redelivery budget
    /// is spent and the instance was failed instead.
    pub async fn release_lapsed(
        &self,
        instance_id: InstanceId,
        max_redeliveries: u32,
    ) -> Result<bool, LifecycleError> {
        let lease = self.lease;
        let update = self
            .store
            .update_instance(
                instance_id,
                mutation(move |instance, ctx| {
                    let cutoff = cutoff(ctx.now, lease);
                    instance.redeliver(max_redeliveries, cutoff, ctx.now)
                }),
            )
            .await?;

        if update.instance.status == InstanceStatus::Creating {
            info!(
                %instance_id,
                redelivery = update.instance.redeliveries,
                "lapsed delivery released"
            );
            Ok(true)
        } else {
            warn!(%instance_id, "redeliveries exhausted");
            Ok(false)
        }
    }

    /// `CREATING -> RUNNING`. A pending teardown is applied in the same write.
    pub async fn on_provisioned(
        &self,
        instance_id: InstanceId,
        provider_ref: String,
        network_address: String,
        access: Vec<IssuedAccess>,
        correlation_id: Option<String>,
    ) -> Result<InstanceUpdate, LifecycleError> {
        let update = self
            .store
            .update_instance(
                instance_id,
                mutation(move |instance, ctx| {
                    let drafts = instance.provisioned(
                        provider_ref,
                        network_address,
                        access,
                        &ctx.access_types,
                        ctx.now,
                    )?;
                    Ok(correlate(drafts, &correlation_id))
                }),
            )
            .await?;

        info!(
            %instance_id,
            deployment_id = %update.instance.deployment_id,
            status = %update.instance.status,
            deployment_status = %update.deployment_status,
            "instance provisioned"
        );
        Ok(update)
    }

    /// `CREATING -> FAILED`. No-op if already failed.
    pub async fn on_provision_failed(
        &self,
        instance_id: InstanceId,
        reason: &str,
        correlation_id: Option<String>,
    ) -> Result<InstanceUpdate, LifecycleError> {
        let reason = reason.to_string();
        let update = self
            .store
            .update_instance(
                instance_id,
                mutation(move |instance, ctx| {
                    Ok(correlate(instance.fail(&reason, ctx.now)?, &correlation_id))
                }),
            )
            .await?;

        if !update.events.is_empty() {
            warn!(
                %instance_id,
                deployment_id = %update.instance.deployment_id,
                reason = update.instance.failure_reason.as_deref().unwrap_or_default(),
                "instance provisioning failed"
            );
        }
        Ok(update)
    }

    /// `RUNNING | FAILED -> DELETED`; deferred while `CREATING`.
    pub async fn request_teardown(
        &self,
        instance_id: InstanceId,
        correlation_id: Option<String>,
    ) -> Result<TeardownOutcome, LifecycleError> {
        let update = self
            .store
            .update_instance(
                instance_id,
                mutation(move |instance, ctx| {
                    let (_, drafts) = instance.request_teardown(ctx.now);
                    Ok(correlate(drafts, &correlation_id))
                }),
            )
            .await?;

        let outcome = match update.instance.status {
            InstanceStatus::Deleted if !update.events.is_empty() => TeardownOutcome::Deleted,
            InstanceStatus::Creating if update.instance.pending_teardown => {
                TeardownOutcome::Deferred
            }
            _ => TeardownOutcome::Unchanged,
        };
        info!(%instance_id, ?outcome, "teardown requested");
        Ok(outcome)
    }

    /// Usable credentials including secrets, for the provisioning hand-off
    /// only. Never expose the result through a read path.
    pub async fn handoff_credentials(
        &self,
        instance_id: InstanceId,
    ) -> Result<Vec<HandoffCredential>, LifecycleError> {
        let instance = self
            .store
            .instance(instance_id)
            .await?
            .ok_or(LifecycleError::NotFound(instance_id))?;
        let now = Utc::now();
        Ok(instance
            .access_methods
            .iter()
            .filter_map(|m| m.handoff(now))
            .collect())
    }
}
