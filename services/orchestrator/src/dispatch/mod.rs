//! Async dispatch boundary: job queue, retry policy, provider interface and
//! the workers that consume jobs.

mod provisioner;
mod queue;
mod redispatch;
mod retry;
mod worker;

pub use provisioner::{MockProvisioner, ProvisionError, ProvisionRequest, Provisioned, Provisioner};
pub use queue::{ChannelQueue, DispatchError, JobHandle, JobQueue, ProvisioningJob};
pub use redispatch::{RedispatchWorker, DEFAULT_MAX_REDELIVERIES};
pub use retry::RetryPolicy;
pub use worker::{JobOutcome, ProvisioningWorker, RESULT_NOT_RECORDED};
