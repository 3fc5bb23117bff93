//! Id definitions for orchestration records and course scope.

use crate::define_id;

// =============================================================================
// Orchestration
// =============================================================================

define_id!(
    /// One orchestration request (the root aggregate).
    DeploymentId,
    "dep"
);
define_id!(
    /// One provisioned unit owned by a deployment.
    InstanceId,
    "inst"
);
define_id!(
    /// One credentialed way to reach a running instance.
    AccessMethodId,
    "acc"
);
define_id!(
    /// A provisioning job handed to the dispatch queue.
    JobId,
    "job"
);

// =============================================================================
// Course scope
// =============================================================================

define_id!(CourseId, "crs");
define_id!(GroupId, "grp");
define_id!(CourseMemberId, "cmem");

// =============================================================================
// Requests
// =============================================================================

define_id!(RequestId, "req");

// =============================================================================
// Audit sequence
// =============================================================================

/// Position of an audit event within its deployment's log.
///
/// Sequence numbers start at 1 and increase by one per appended event. They
/// order the log; `occurred_at` timestamps do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AuditSeq(i64);

impl AuditSeq {
    /// The first sequence number of a fresh deployment log.
    pub const FIRST: Self = Self(1);

    #[must_use]
    pub const fn new(seq: i64) -> Self {
        Self(seq)
    }

    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }

    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Default for AuditSeq {
    fn default() -> Self {
        Self::FIRST
    }
}

impl std::fmt::Display for AuditSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for AuditSeq {
    fn from(seq: i64) -> Self {
        Self(seq)
    }
}

impl From<AuditSeq> for i64 {
    fn from(seq: AuditSeq) -> Self {
        seq.0
    }
}

impl serde::Serialize for AuditSeq {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for AuditSeq {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        i64::deserialize(deserializer).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn deployment_id_roundtrip() {
        let id = DeploymentId::new();
        let parsed: DeploymentId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("dep_"));
    }

    #[test]
    fn rejects_foreign_prefix() {
        let group = GroupId::new().to_string();
        let err = CourseMemberId::parse(&group).unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(InstanceId::parse(""), Err(IdError::Empty));
        assert_eq!(
            InstanceId::parse("inst01HV4Z2WQXKJNM8GPQY6VBKC3D"),
            Err(IdError::MissingSeparator)
        );
        assert!(matches!(
            InstanceId::parse("inst_not-a-ulid"),
            Err(IdError::InvalidUlid(_))
        ));
    }

    #[test]
    fn serde_uses_string_form() {
        let id = CourseId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: CourseId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        let wrong = format!("\"{}\"", GroupId::new());
        assert!(serde_json::from_str::<CourseId>(&wrong).is_err());
    }

    #[test]
    fn ids_sort_by_creation_time() {
        let first = InstanceId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = InstanceId::new();
        assert!(first < second);
    }

    #[test]
    fn audit_seq_advances_by_one() {
        assert_eq!(AuditSeq::FIRST.value(), 1);
        assert_eq!(AuditSeq::FIRST.next().value(), 2);
        assert_eq!(AuditSeq::default(), AuditSeq::FIRST);
    }

    #[test]
    fn prefixes_are_unique() {
        let prefixes = [
            DeploymentId::PREFIX,
            InstanceId::PREFIX,
            AccessMethodId::PREFIX,
            JobId::PREFIX,
            CourseId::PREFIX,
            GroupId::PREFIX,
            CourseMemberId::PREFIX,
            RequestId::PREFIX,
        ];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len());
    }

    proptest! {
        #[test]
        fn any_ulid_roundtrips(raw in any::<u128>()) {
            let id = GroupId::from_ulid(crate::Ulid::from(raw));
            let parsed = GroupId::parse(&id.to_string()).unwrap();
            prop_assert_eq!(parsed, id);
        }
    }
}
