use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labfleet_id::{DeploymentId, InstanceId, JobId};
use thiserror::Error;
use tokio::sync::mpsc;

/// A unit of provisioning work for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningJob {
    pub job_id: JobId,
    pub instance_id: InstanceId,
    pub deployment_id: DeploymentId,
    /// Request id of the call that caused the dispatch.
    pub correlation_id: Option<String>,
}

impl ProvisioningJob {
    pub fn new(
        instance_id: InstanceId,
        deployment_id: DeploymentId,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            job_id: JobId::new(),
            instance_id,
            deployment_id,
            correlation_id,
        }
    }
}

/// Receipt for an accepted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: JobId,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("job queue unavailable: {0}")]
    Unavailable(String),

    #[error("job queue is full")]
    Full,

    #[error("job queue is closed")]
    Closed,
}

/// Hand-off point to the provisioning side. Delivery is at-least-once; the
/// consumer must claim the instance before acting.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: ProvisioningJob) -> Result<JobHandle, DispatchError>;
}

/// In-process queue over a bounded channel.
#[derive(Clone)]
pub struct ChannelQueue {
    tx: mpsc::Sender<ProvisioningJob>,
}

impl ChannelQueue {
    /// Creates the queue and the receiver its single consumer reads from.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProvisioningJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobQueue for ChannelQueue {
    async fn enqueue(&self, job: ProvisioningJob) -> Result<JobHandle, DispatchError> {
        let job_id = job.job_id;
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::Full,
            mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
        })?;
        Ok(JobHandle {
            job_id,
            enqueued_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ProvisioningJob {
        ProvisioningJob::new(InstanceId::new(), DeploymentId::new(), None)
    }

    #[tokio::test]
    async fn enqueue_delivers_to_receiver() {
        let (queue, mut rx) = ChannelQueue::new(4);
        let job = job();
        let handle = queue.enqueue(job.clone()).await.unwrap();
        assert_eq!(handle.job_id, job.job_id);
        assert_eq!(rx.recv().await.unwrap(), job);
    }

    #[tokio::test]
    async fn full_and_closed_queues_are_reported() {
        let (queue, rx) = ChannelQueue::new(1);
        queue.enqueue(job()).await.unwrap();
        assert_eq!(queue.enqueue(job()).await, Err(DispatchError::Full));

        drop(rx);
        assert_eq!(queue.enqueue(job()).await, Err(DispatchError::Closed));
    }
}
