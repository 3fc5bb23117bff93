//! Domain model: deployments, their instances, and access methods.

mod access;
mod deployment;
mod instance;

pub use access::{
    AccessKind, AccessMethod, AccessMethodView, HandoffCredential, IssuedAccess, Secret,
};
pub use deployment::{
    derive_status, derive_name, Deployment, DeploymentMode, DeploymentStatus, DeploymentSummary,
    DeploymentView, Selectors, Target, TemplateRef,
};
pub use instance::{
    Instance, InstanceSnapshot, InstanceStatus, InstanceSummary, TeardownOutcome,
    DELIVERY_EXHAUSTED,
};
