//! Audit event levels, types, and records.

use chrono::{DateTime, Utc};
use labfleet_id::{AuditSeq, DeploymentId, InstanceId};
use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Level
// =============================================================================

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl AuditLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditLevel {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(EventError::UnknownLevel(other.to_string())),
        }
    }
}

// =============================================================================
// Event type
// =============================================================================

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditEventType {
    /// The deployment record was created.
    Started,
    /// The request was expanded into its concrete targets.
    TargetResolved,
    /// An instance was handed to the dispatch queue.
    InstanceProvisioning,
    /// A dispatch attempt failed and will be retried.
    DispatchRetry,
    /// An instance finished provisioning and is reachable.
    InstanceReady,
    /// Teardown was requested for an instance still being created.
    TeardownRequested,
    /// An instance was torn down and its access revoked.
    InstanceDeleted,
    /// An instance failed to provision.
    Failed,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::TargetResolved => "target-resolved",
            Self::InstanceProvisioning => "instance-provisioning",
            Self::DispatchRetry => "dispatch-retry",
            Self::InstanceReady => "instance-ready",
            Self::TeardownRequested => "teardown-requested",
            Self::InstanceDeleted => "instance-deleted",
            Self::Failed => "failed",
        }
    }

    /// Default level for this event type.
    pub fn default_level(&self) -> AuditLevel {
        match self {
            Self::Failed => AuditLevel::Error,
            Self::DispatchRetry => AuditLevel::Warning,
            Self::InstanceProvisioning => AuditLevel::Debug,
            _ => AuditLevel::Info,
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditEventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "started" => Self::Started,
            "target-resolved" => Self::TargetResolved,
            "instance-provisioning" => Self::InstanceProvisioning,
            "dispatch-retry" => Self::DispatchRetry,
            "instance-ready" => Self::InstanceReady,
            "teardown-requested" => Self::TeardownRequested,
            "instance-deleted" => Self::InstanceDeleted,
            "failed" => Self::Failed,
            other => return Err(EventError::UnknownEventType(other.to_string())),
        })
    }
}

// =============================================================================
// Records
// =============================================================================

/// A sealed, persisted audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub deployment_id: DeploymentId,

    /// Position in the deployment's log.
    pub seq: AuditSeq,

    pub level: AuditLevel,

    pub event_type: AuditEventType,

    /// Human readable explanation, safe to show to course staff.
    pub message: String,

    pub occurred_at: DateTime<Utc>,

    /// Request id of the call that caused this event, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// An audit event that has not been assigned a sequence number yet.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditDraft {
    pub event_type: AuditEventType,
    pub level: AuditLevel,
    pub message: String,
    pub instance_id: Option<InstanceId>,
    pub correlation_id: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl AuditDraft {
    /// Starts a draft at the event type's default level.
    pub fn new(event_type: AuditEventType, message: impl Into<String>) -> Self {
        Self {
            event_type,
            level: event_type.default_level(),
            message: message.into(),
            instance_id: None,
            correlation_id: None,
            details: None,
        }
    }

    pub fn level(mut self, level: AuditLevel) -> Self {
        self.level = level;
        self
    }

    pub fn instance(mut self, instance_id: InstanceId) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub fn correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Seals the draft at the given position.
    pub fn seal(
        self,
        deployment_id: DeploymentId,
        seq: AuditSeq,
        occurred_at: DateTime<Utc>,
    ) -> AuditEvent {
        AuditEvent {
            deployment_id,
            seq,
            level: self.level,
            event_type: self.event_type,
            message: self.message,
            occurred_at,
            correlation_id: self.correlation_id,
            instance_id: self.instance_id,
            details: self.details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_string_forms_roundtrip() {
        let all = [
            AuditEventType::Started,
            AuditEventType::TargetResolved,
            AuditEventType::InstanceProvisioning,
            AuditEventType::DispatchRetry,
            AuditEventType::InstanceReady,
            AuditEventType::TeardownRequested,
            AuditEventType::InstanceDeleted,
            AuditEventType::Failed,
        ];
        for ty in all {
            let parsed: AuditEventType = ty.as_str().parse().unwrap();
            assert_eq!(parsed, ty);
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{}\"", ty.as_str()));
        }
    }

    #[test]
    fn unknown_strings_are_rejected() {
        assert!("vm_ready".parse::<AuditEventType>().is_err());
        assert_eq!(
            "fatal".parse::<AuditLevel>(),
            Err(EventError::UnknownLevel("fatal".into()))
        );
    }

    #[test]
    fn failures_default_to_error_level() {
        let draft = AuditDraft::new(AuditEventType::Failed, "quota exceeded");
        assert_eq!(draft.level, AuditLevel::Error);
        let draft = draft.level(AuditLevel::Warning);
        assert_eq!(draft.level, AuditLevel::Warning);
    }
}
