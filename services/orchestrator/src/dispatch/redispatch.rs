//! Redispatch sweep.
//!
//! Picks up `CREATING` instances that no job was ever accepted for, e.g.
//! after a crash between the create commit and the enqueue, and instances
//! whose hand-off or claim lapsed because the job was dropped with the
//! channel or its worker died mid-provisioning.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::retry::RetryPolicy;
use crate::lifecycle::LifecycleManager;
use crate::store::StoreError;

const SWEEP_BATCH: usize = 100;

pub const DEFAULT_MAX_REDELIVERIES: u32 = 3;

pub struct RedispatchWorker {
    lifecycle: LifecycleManager,
    policy: RetryPolicy,
    interval: Duration,
    /// Instances younger than this are left to the request path.
    grace: Duration,
    max_redeliveries: u32,
}

impl RedispatchWorker {
    pub fn new(lifecycle: LifecycleManager, policy: RetryPolicy, interval: Duration) -> Self {
        Self {
            lifecycle,
            policy,
            interval,
            grace: interval,
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_max_redeliveries(mut self, max_redeliveries: u32) -> Self {
        self.max_redeliveries = max_redeliveries;
        self
    }

    /// Run the sweep until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting redispatch worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Redispatch sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Redispatch worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass. Returns how many instances were handed off.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.grace).unwrap_or_default();
        let stalled = self
            .lifecycle
            .store()
            .stalled_instances(now - grace, self.lifecycle.lease_cutoff(now), SWEEP_BATCH)
            .await?;

        let mut dispatched = 0;
        for instance in stalled {
            if instance.job.is_some() {
                match self
                    .lifecycle
                    .release_lapsed(instance.id, self.max_redeliveries)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) if e.is_stale() => {
                        debug!(instance_id = %instance.id, error = %e, "Lapsed delivery already moved on");
                        continue;
                    }
                    Err(e) => {
                        warn!(instance_id = %instance.id, error = %e, "Failed to release lapsed delivery");
                        continue;
                    }
                }
            }

            match self
                .lifecycle
                .dispatch_with_retry(instance.id, instance.deployment_id, None, &self.policy)
                .await
            {
                Ok(_) => dispatched += 1,
                Err(e) => warn!(instance_id = %instance.id, error = %e, "Redispatch failed"),
            }
        }

        if dispatched > 0 {
            info!(dispatched, "Redispatched stalled instances");
        }
        Ok(dispatched)
    }
}
