//! Instances and their provisioning state machine.
//!
//! ```text
//! CREATING ──provisioned──▶ RUNNING ──teardown──▶ DELETED
//!     │                                              ▲
//!     └──────failed──────▶ FAILED ─────teardown──────┘
//! ```
//!
//! A teardown requested while `CREATING` is recorded as a pending-cancel
//! intent and applied as soon as the instance settles in `RUNNING` or
//! `FAILED`. Every method here mutates in place and returns the audit drafts
//! describing what changed; the caller persists both in one write.
//!
//! Hand-offs and claims hold a delivery lease measured from `updated_at`.
//! Once it lapses without progress the instance may be redelivered, a
//! bounded number of times.

use chrono::{DateTime, Utc};
use labfleet_events::{AuditDraft, AuditEventType, AuditLevel};
use labfleet_id::{DeploymentId, InstanceId, JobId};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::access::{AccessKind, AccessMethod, AccessMethodView, IssuedAccess};
use super::deployment::Target;
use crate::error::LifecycleError;

/// Failure reason once every redelivery of a lapsed job has been used up.
pub const DELIVERY_EXHAUSTED: &str = "delivery exhausted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Creating,
    Running,
    Failed,
    Deleted,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "CREATING",
            Self::Running => "RUNNING",
            Self::Failed => "FAILED",
            Self::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATING" => Ok(Self::Creating),
            "RUNNING" => Ok(Self::Running),
            "FAILED" => Ok(Self::Failed),
            "DELETED" => Ok(Self::Deleted),
            other => Err(format!("unknown instance status '{other}'")),
        }
    }
}

/// The slice of an instance the status fold looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceSnapshot {
    pub status: InstanceStatus,
    /// Whether a provisioning job has ever been accepted for the instance.
    pub dispatched: bool,
}

/// Result of a teardown request against one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownOutcome {
    Deleted,
    /// The instance is still provisioning; teardown applies once it settles.
    Deferred,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub deployment_id: DeploymentId,
    pub target: Target,
    pub status: InstanceStatus,
    pub provider_ref: Option<String>,
    pub network_address: Option<String>,
    pub access_methods: Vec<AccessMethod>,
    pub dispatch_attempts: u32,
    /// Last job accepted by the queue for this instance.
    pub job: Option<JobId>,
    /// Job currently executing the provisioning.
    pub claimed_by: Option<JobId>,
    /// Deliveries re-issued after a lapsed lease.
    pub redeliveries: u32,
    pub pending_teardown: bool,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(deployment_id: DeploymentId, target: Target, now: DateTime<Utc>) -> Self {
        Self {
            id: InstanceId::new(),
            deployment_id,
            target,
            status: InstanceStatus::Creating,
            provider_ref: None,
            network_address: None,
            access_methods: Vec::new(),
            dispatch_attempts: 0,
            job: None,
            claimed_by: None,
            redeliveries: 0,
            pending_teardown: false,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            status: self.status,
            dispatched: self.job.is_some(),
        }
    }

    pub fn has_usable_access(&self, now: DateTime<Utc>) -> bool {
        self.access_methods.iter().any(|m| m.is_usable(now))
    }

    pub fn summary(&self, now: DateTime<Utc>) -> InstanceSummary {
        InstanceSummary {
            id: self.id,
            target: self.target,
            status: self.status,
            provider_ref: self.provider_ref.clone(),
            network_address: self.network_address.clone(),
            access_methods: self.access_methods.iter().map(|m| m.view(now)).collect(),
            failure_reason: self.failure_reason.clone(),
            pending_teardown: self.pending_teardown,
            dispatch_attempts: self.dispatch_attempts,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn draft(&self, event_type: AuditEventType, message: String) -> AuditDraft {
        AuditDraft::new(event_type, message).instance(self.id)
    }

    fn stale(&self, attempted: &'static str) -> LifecycleError {
        LifecycleError::Stale {
            instance_id: self.id,
            status: self.status,
            attempted,
        }
    }

    /// Records that the queue accepted `job` for this instance.
    pub(crate) fn record_handoff(&mut self, job: JobId, now: DateTime<Utc>) -> Vec<AuditDraft> {
        self.dispatch_attempts += 1;
        self.updated_at = now;
        if self.job == Some(job) {
            // The consumer claimed before we got here and already logged it.
            return Vec::new();
        }
        self.job = Some(job);
        vec![self
            .draft(
                AuditEventType::InstanceProvisioning,
                format!("provisioning {} handed off", self.target),
            )
            .details(json!({ "job_id": job, "attempt": self.dispatch_attempts }))]
    }

    /// Records a hand-off attempt the queue refused.
    pub(crate) fn record_dispatch_failure(
        &mut self,
        error: &str,
        now: DateTime<Utc>,
    ) -> Vec<AuditDraft> {
        self.dispatch_attempts += 1;
        self.updated_at = now;
        vec![self
            .draft(
                AuditEventType::DispatchRetry,
                format!("dispatch of {} failed: {error}", self.target),
            )
            .details(json!({ "attempt": self.dispatch_attempts }))]
    }

    /// Whether the current hand-off or claim went quiet before `cutoff`.
    pub fn lease_lapsed(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == InstanceStatus::Creating && self.job.is_some() && self.updated_at < cutoff
    }

    /// Consumer-side guard: one job at a time may provision an instance. A
    /// claim older than `lease_cutoff` is abandoned and can be taken over.
    pub(crate) fn claim(
        &mut self,
        job: JobId,
        now: DateTime<Utc>,
        lease_cutoff: DateTime<Utc>,
    ) -> Result<Vec<AuditDraft>, LifecycleError> {
        if self.status != InstanceStatus::Creating || self.provider_ref.is_some() {
            return Err(self.stale("claim"));
        }
        let abandoned = match self.claimed_by {
            Some(claimed_by) if self.updated_at >= lease_cutoff => {
                return Err(LifecycleError::AlreadyClaimed {
                    instance_id: self.id,
                    claimed_by,
                });
            }
            other => other,
        };

        self.claimed_by = Some(job);
        self.updated_at = now;
        if let Some(previous) = abandoned {
            self.job = Some(job);
            return Ok(vec![self
                .draft(
                    AuditEventType::InstanceProvisioning,
                    format!("provisioning {} taken over from a lapsed claim", self.target),
                )
                .level(AuditLevel::Warning)
                .details(json!({ "job_id": job, "previous_job_id": previous }))]);
        }
        if self.job == Some(job) {
            return Ok(Vec::new());
        }
        self.job = Some(job);
        Ok(vec![self
            .draft(
                AuditEventType::InstanceProvisioning,
                format!("provisioning {} started", self.target),
            )
            .details(json!({ "job_id": job }))])
    }

    /// Releases a lapsed hand-off or claim so a fresh job can be sent. After
    /// `max_redeliveries` the instance fails with [`DELIVERY_EXHAUSTED`].
    pub(crate) fn redeliver(
        &mut self,
        max_redeliveries: u32,
        lease_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<AuditDraft>, LifecycleError> {
        if self.provider_ref.is_some() || !self.lease_lapsed(lease_cutoff) {
            return Err(self.stale("redelivery"));
        }
        if self.redeliveries >= max_redeliveries {
            return self.fail(DELIVERY_EXHAUSTED, now);
        }

        let lapsed = self.claimed_by.or(self.job);
        self.redeliveries += 1;
        self.claimed_by = None;
        self.updated_at = now;
        Ok(vec![self
            .draft(
                AuditEventType::DispatchRetry,
                format!("delivery of {} lapsed; redelivering", self.target),
            )
            .details(json!({ "job_id": lapsed, "redelivery": self.redeliveries }))])
    }

    /// `CREATING -> RUNNING`, attaching provider ref, address and access in
    /// one step.
    pub(crate) fn provisioned(
        &mut self,
        provider_ref: String,
        network_address: String,
        access: Vec<IssuedAccess>,
        allowed: &[AccessKind],
        now: DateTime<Utc>,
    ) -> Result<Vec<AuditDraft>, LifecycleError> {
        if self.status != InstanceStatus::Creating || self.provider_ref.is_some() {
            return Err(self.stale("provisioned callback"));
        }

        let invalid = |reason: String| LifecycleError::InvalidAccess {
            instance_id: self.id,
            reason,
        };
        if provider_ref.trim().is_empty() {
            return Err(invalid("provider reference is empty".into()));
        }
        if network_address.trim().is_empty() {
            return Err(invalid("network address is empty".into()));
        }
        if access.is_empty() {
            return Err(invalid("no access methods issued".into()));
        }
        for issued in &access {
            if !allowed.contains(&issued.kind) {
                return Err(invalid(format!(
                    "{} access was not requested for this deployment",
                    issued.kind
                )));
            }
            issued.validate().map_err(invalid)?;
        }

        let methods: Vec<AccessMethod> = access.into_iter().map(|a| a.attach(now)).collect();
        if !methods.iter().any(|m| m.is_usable(now)) {
            return Err(invalid("every issued access method is already expired".into()));
        }

        let kinds: Vec<&str> = methods.iter().map(|m| m.kind.as_str()).collect();
        self.provider_ref = Some(provider_ref);
        self.network_address = Some(network_address);
        self.access_methods = methods;
        self.status = InstanceStatus::Running;
        self.claimed_by = None;
        self.updated_at = now;

        let mut drafts = vec![self
            .draft(
                AuditEventType::InstanceReady,
                format!("{} is running", self.target),
            )
            .details(json!({ "access_types": kinds }))];
        if self.pending_teardown {
            drafts.extend(self.delete(now));
        }
        Ok(drafts)
    }

    /// `CREATING -> FAILED`. Repeated failure reports are a no-op.
    pub(crate) fn fail(
        &mut self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<AuditDraft>, LifecycleError> {
        match self.status {
            InstanceStatus::Failed => return Ok(Vec::new()),
            InstanceStatus::Running | InstanceStatus::Deleted => {
                return Err(self.stale("failure callback"))
            }
            InstanceStatus::Creating => {}
        }

        self.status = InstanceStatus::Failed;
        self.failure_reason = Some(reason.to_string());
        self.claimed_by = None;
        self.updated_at = now;

        let mut drafts = vec![self
            .draft(
                AuditEventType::Failed,
                format!("provisioning {} failed: {reason}", self.target),
            )
            .details(json!({ "reason": reason }))];
        if self.pending_teardown {
            drafts.extend(self.delete(now));
        }
        Ok(drafts)
    }

    /// Handles an explicit teardown request.
    pub(crate) fn request_teardown(
        &mut self,
        now: DateTime<Utc>,
    ) -> (TeardownOutcome, Vec<AuditDraft>) {
        match self.status {
            InstanceStatus::Deleted => (TeardownOutcome::Unchanged, Vec::new()),
            InstanceStatus::Creating if self.pending_teardown => {
                (TeardownOutcome::Deferred, Vec::new())
            }
            InstanceStatus::Creating => {
                self.pending_teardown = true;
                self.updated_at = now;
                let draft = self.draft(
                    AuditEventType::TeardownRequested,
                    format!(
                        "teardown of {} requested while provisioning; deferred",
                        self.target
                    ),
                );
                (TeardownOutcome::Deferred, vec![draft])
            }
            InstanceStatus::Running | InstanceStatus::Failed => {
                (TeardownOutcome::Deleted, self.delete(now))
            }
        }
    }

    /// `RUNNING | FAILED -> DELETED`, deactivating every access method.
    fn delete(&mut self, now: DateTime<Utc>) -> Vec<AuditDraft> {
        let from = self.status;
        for method in &mut self.access_methods {
            method.active = false;
        }
        self.status = InstanceStatus::Deleted;
        self.pending_teardown = false;
        self.updated_at = now;
        vec![self
            .draft(
                AuditEventType::InstanceDeleted,
                format!("{} deleted", self.target),
            )
            .details(json!({ "from": from }))]
    }
}

/// Secret-free instance view for read paths.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub target: Target,
    pub status: InstanceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_address: Option<String>,
    pub access_methods: Vec<AccessMethodView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub pending_teardown: bool,
    pub dispatch_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Secret;
    use labfleet_id::CourseId;

    fn creating() -> Instance {
        Instance::new(
            DeploymentId::new(),
            Target::Course(CourseId::new()),
            Utc::now(),
        )
    }

    fn ssh() -> Vec<IssuedAccess> {
        vec![IssuedAccess::ssh("student", Secret::new("pw"), 22)]
    }

    #[test]
    fn provisioned_moves_to_running_with_access() {
        let mut instance = creating();
        let drafts = instance
            .provisioned(
                "vm-1".into(),
                "10.0.0.5".into(),
                ssh(),
                &[AccessKind::Ssh],
                Utc::now(),
            )
            .unwrap();

        assert_eq!(instance.status, InstanceStatus::Running);
        assert!(instance.has_usable_access(Utc::now()));
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].event_type, AuditEventType::InstanceReady);
    }

    #[test]
    fn second_provisioned_callback_is_stale() {
        let mut instance = creating();
        let now = Utc::now();
        instance
            .provisioned("vm-1".into(), "10.0.0.5".into(), ssh(), &[AccessKind::Ssh], now)
            .unwrap();

        let err = instance
            .provisioned("vm-2".into(), "10.0.0.6".into(), ssh(), &[AccessKind::Ssh], now)
            .unwrap_err();
        assert!(err.is_stale());
        assert_eq!(instance.provider_ref.as_deref(), Some("vm-1"));
    }

    #[test]
    fn rejects_access_outside_requested_types() {
        let mut instance = creating();
        let err = instance
            .provisioned(
                "vm-1".into(),
                "10.0.0.5".into(),
                vec![IssuedAccess::port(AccessKind::Vnc, 5900)],
                &[AccessKind::Ssh],
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidAccess { .. }));
        assert_eq!(instance.status, InstanceStatus::Creating);
    }

    #[test]
    fn rejects_empty_access() {
        let mut instance = creating();
        let err = instance
            .provisioned("vm-1".into(), "10.0.0.5".into(), vec![], &[AccessKind::Ssh], Utc::now())
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidAccess { .. }));
    }

    #[test]
    fn failure_is_idempotent_and_stale_after_running() {
        let mut instance = creating();
        let now = Utc::now();
        assert_eq!(instance.fail("boom", now).unwrap().len(), 1);
        assert!(instance.fail("boom again", now).unwrap().is_empty());
        assert_eq!(instance.failure_reason.as_deref(), Some("boom"));

        let mut running = creating();
        running
            .provisioned("vm".into(), "10.0.0.1".into(), ssh(), &[AccessKind::Ssh], now)
            .unwrap();
        assert!(running.fail("late", now).unwrap_err().is_stale());
    }

    #[test]
    fn teardown_deactivates_access() {
        let mut instance = creating();
        let now = Utc::now();
        instance
            .provisioned("vm".into(), "10.0.0.1".into(), ssh(), &[AccessKind::Ssh], now)
            .unwrap();

        let (outcome, drafts) = instance.request_teardown(now);
        assert_eq!(outcome, TeardownOutcome::Deleted);
        assert_eq!(drafts.len(), 1);
        assert_eq!(instance.status, InstanceStatus::Deleted);
        assert!(instance.access_methods.iter().all(|m| !m.active));
        assert!(!instance.has_usable_access(now));

        let (again, drafts) = instance.request_teardown(now);
        assert_eq!(again, TeardownOutcome::Unchanged);
        assert!(drafts.is_empty());
    }

    #[test]
    fn teardown_while_creating_is_applied_on_settle() {
        let mut instance = creating();
        let now = Utc::now();

        let (outcome, drafts) = instance.request_teardown(now);
        assert_eq!(outcome, TeardownOutcome::Deferred);
        assert_eq!(drafts[0].event_type, AuditEventType::TeardownRequested);
        assert_eq!(instance.status, InstanceStatus::Creating);

        let (repeat, drafts) = instance.request_teardown(now);
        assert_eq!(repeat, TeardownOutcome::Deferred);
        assert!(drafts.is_empty());

        let drafts = instance
            .provisioned("vm".into(), "10.0.0.1".into(), ssh(), &[AccessKind::Ssh], now)
            .unwrap();
        let types: Vec<_> = drafts.iter().map(|d| d.event_type).collect();
        assert_eq!(
            types,
            vec![AuditEventType::InstanceReady, AuditEventType::InstanceDeleted]
        );
        assert_eq!(instance.status, InstanceStatus::Deleted);
        assert!(!instance.pending_teardown);
    }

    #[test]
    fn claim_admits_exactly_one_job() {
        let mut instance = creating();
        let now = Utc::now();
        let lease = now - chrono::Duration::minutes(10);
        let first = JobId::new();
        let second = JobId::new();

        assert_eq!(instance.claim(first, now, lease).unwrap().len(), 1);
        assert!(matches!(
            instance.claim(second, now, lease),
            Err(LifecycleError::AlreadyClaimed { .. })
        ));
        assert!(matches!(
            instance.claim(first, now, lease),
            Err(LifecycleError::AlreadyClaimed { .. })
        ));

        // The hand-off record that races behind the claim adds no event.
        assert!(instance.record_handoff(first, now).is_empty());
        assert_eq!(instance.dispatch_attempts, 1);
    }

    #[test]
    fn lapsed_claim_can_be_taken_over() {
        let mut instance = creating();
        let start = Utc::now() - chrono::Duration::minutes(30);
        let first = JobId::new();
        instance.claim(first, start, start).unwrap();

        let now = Utc::now();
        let second = JobId::new();
        let drafts = instance
            .claim(second, now, now - chrono::Duration::minutes(10))
            .unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].level, AuditLevel::Warning);
        assert_eq!(instance.claimed_by, Some(second));
        assert_eq!(instance.job, Some(second));
    }

    #[test]
    fn redelivery_requires_a_lapsed_lease() {
        let mut instance = creating();
        let now = Utc::now();
        let cutoff = now - chrono::Duration::minutes(10);

        // Never handed off: the dispatch path owns it, not redelivery.
        assert!(instance.redeliver(3, cutoff, now).unwrap_err().is_stale());

        instance.record_handoff(JobId::new(), now);
        assert!(instance.redeliver(3, cutoff, now).unwrap_err().is_stale());

        let later = now + chrono::Duration::minutes(11);
        let drafts = instance
            .redeliver(3, later - chrono::Duration::minutes(10), later)
            .unwrap();
        assert_eq!(drafts[0].event_type, AuditEventType::DispatchRetry);
        assert_eq!(instance.redeliveries, 1);
        assert_eq!(instance.claimed_by, None);
        assert_eq!(instance.status, InstanceStatus::Creating);
    }

    #[test]
    fn redelivery_is_bounded() {
        let mut instance = creating();
        let start = Utc::now() - chrono::Duration::hours(1);
        instance.record_handoff(JobId::new(), start);
        instance.redeliveries = 2;

        let now = Utc::now();
        let drafts = instance.redeliver(2, now, now).unwrap();
        assert_eq!(drafts[0].event_type, AuditEventType::Failed);
        assert_eq!(instance.status, InstanceStatus::Failed);
        assert_eq!(instance.failure_reason.as_deref(), Some(DELIVERY_EXHAUSTED));
    }
}
