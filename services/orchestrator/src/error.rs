//! Error types for the orchestration core.

use labfleet_id::{CourseId, CourseMemberId, GroupId, IdError, InstanceId, JobId};
use thiserror::Error;

use crate::domain::{DeploymentMode, InstanceStatus};
use crate::store::StoreError;

/// A request was rejected before any record was written.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown deployment mode '{0}'")]
    UnknownMode(String),

    #[error("unknown access type '{0}'")]
    UnknownAccessType(String),

    #[error("unknown status '{0}'")]
    UnknownStatus(String),

    #[error("at least one access type is required")]
    EmptyAccessTypes,

    #[error("{mode} deployments do not accept {field}")]
    SelectorsNotAllowed {
        mode: DeploymentMode,
        field: &'static str,
    },

    #[error("PER_GROUP deployments require at least one group")]
    NoGroupsSelected,

    #[error("course_member_ids was supplied but is empty")]
    EmptyMemberSelection,

    #[error("group {group_id} does not belong to course {course_id}")]
    UnknownGroup {
        group_id: GroupId,
        course_id: CourseId,
    },

    #[error("member {member_id} is not an active member of course {course_id}")]
    NotActiveMember {
        member_id: CourseMemberId,
        course_id: CourseId,
    },

    #[error("course {0} not found")]
    CourseNotFound(CourseId),

    #[error("course {0} has no active members")]
    NoActiveMembers(CourseId),

    #[error("invalid template reference: {0}")]
    InvalidTemplateRef(String),

    #[error("invalid {field}: {source}")]
    InvalidId {
        field: &'static str,
        #[source]
        source: IdError,
    },
}

impl ValidationError {
    pub(crate) fn invalid_id(field: &'static str) -> impl FnOnce(IdError) -> Self {
        move |source| Self::InvalidId { field, source }
    }
}

/// A lifecycle transition was refused or could not be persisted.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("instance {0} not found")]
    NotFound(InstanceId),

    /// The instance is not in a state that accepts this transition. Late or
    /// duplicate callbacks land here.
    #[error("stale {attempted} for instance {instance_id} in state {status}")]
    Stale {
        instance_id: InstanceId,
        status: InstanceStatus,
        attempted: &'static str,
    },

    #[error("instance {instance_id} is already claimed by {claimed_by}")]
    AlreadyClaimed {
        instance_id: InstanceId,
        claimed_by: JobId,
    },

    #[error("invalid access for instance {instance_id}: {reason}")]
    InvalidAccess {
        instance_id: InstanceId,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LifecycleError {
    /// Stale and duplicate callbacks are expected under at-least-once
    /// delivery and are discarded rather than surfaced.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. } | Self::AlreadyClaimed { .. })
    }

    /// The write failed below the state machine and may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(StoreError::Database(_)))
    }
}

/// Errors surfaced by the orchestrator facade.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("course directory unavailable: {0}")]
    Directory(String),
}

impl OrchestratorError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}
