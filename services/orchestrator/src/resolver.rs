//! Request validation and target resolution.
//!
//! [`CreateDeploymentRequest::validate`] checks everything that does not need
//! the course roster. [`resolve_targets`] then expands the validated request
//! against a roster snapshot. Both are pure; roster lookup goes through the
//! injected [`CourseDirectory`].

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labfleet_id::{CourseId, CourseMemberId, GroupId};
use serde::Deserialize;

use crate::domain::{
    derive_name, AccessKind, DeploymentMode, Selectors, Target, TemplateRef,
};
use crate::error::ValidationError;

// =============================================================================
// Roster
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterMember {
    pub id: CourseMemberId,
    pub left_at: Option<DateTime<Utc>>,
}

impl RosterMember {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

/// Snapshot of a course's groups and members, in roster order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseRoster {
    pub course_id: CourseId,
    pub groups: Vec<GroupId>,
    pub members: Vec<RosterMember>,
}

impl CourseRoster {
    pub fn active_members(&self) -> impl Iterator<Item = CourseMemberId> + '_ {
        self.members.iter().filter(|m| m.is_active()).map(|m| m.id)
    }

    fn is_active_member(&self, id: CourseMemberId) -> bool {
        self.members.iter().any(|m| m.id == id && m.is_active())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("course directory error: {0}")]
pub struct DirectoryError(pub String);

/// Source of course rosters.
#[async_trait]
pub trait CourseDirectory: Send + Sync {
    /// Returns `None` when the course does not exist.
    async fn roster(&self, course_id: CourseId) -> Result<Option<CourseRoster>, DirectoryError>;
}

// =============================================================================
// Request
// =============================================================================

/// Inbound request to create a deployment. All fields arrive as raw strings
/// and are parsed by [`validate`](Self::validate).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateDeploymentRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub template_version_ref: String,
    pub course_id: String,
    pub mode: String,
    #[serde(default)]
    pub group_ids: Option<Vec<String>>,
    #[serde(default)]
    pub course_member_ids: Option<Vec<String>>,
    #[serde(default)]
    pub access_types: Option<Vec<String>>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub provider_project_id: Option<String>,
}

/// A request that passed roster-independent validation.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentSpec {
    pub name: String,
    pub template_ref: TemplateRef,
    pub course_id: CourseId,
    pub mode: DeploymentMode,
    pub selectors: Selectors,
    pub access_types: Vec<AccessKind>,
    pub config: serde_json::Value,
    pub provider_project_id: Option<String>,
}

impl CreateDeploymentRequest {
    pub fn validate(&self) -> Result<DeploymentSpec, ValidationError> {
        let template_ref = TemplateRef::parse(&self.template_version_ref)?;
        let course_id: CourseId = self
            .course_id
            .trim()
            .parse()
            .map_err(ValidationError::invalid_id("course_id"))?;
        let mode: DeploymentMode = self.mode.parse()?;
        let selectors = self.selectors(mode)?;
        let access_types = parse_access_types(self.access_types.as_deref())?;

        let name = match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => derive_name(&template_ref),
        };
        let provider_project_id = self
            .provider_project_id
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        Ok(DeploymentSpec {
            name,
            template_ref,
            course_id,
            mode,
            selectors,
            access_types,
            config: self.config.clone().unwrap_or_else(|| serde_json::json!({})),
            provider_project_id,
        })
    }

    fn selectors(&self, mode: DeploymentMode) -> Result<Selectors, ValidationError> {
        let groups = self.group_ids.as_deref();
        let members = self.course_member_ids.as_deref();
        let not_allowed = |field| ValidationError::SelectorsNotAllowed { mode, field };

        match mode {
            DeploymentMode::PerCourse => {
                if groups.is_some_and(|g| !g.is_empty()) {
                    return Err(not_allowed("group_ids"));
                }
                if members.is_some_and(|m| !m.is_empty()) {
                    return Err(not_allowed("course_member_ids"));
                }
                Ok(Selectors::None)
            }
            DeploymentMode::PerGroup => {
                if members.is_some_and(|m| !m.is_empty()) {
                    return Err(not_allowed("course_member_ids"));
                }
                let groups = groups.unwrap_or_default();
                if groups.is_empty() {
                    return Err(ValidationError::NoGroupsSelected);
                }
                let ids = parse_ids::<GroupId>(groups, "group_ids")?;
                Ok(Selectors::Groups(dedup(ids)))
            }
            DeploymentMode::PerStudent => {
                if groups.is_some_and(|g| !g.is_empty()) {
                    return Err(not_allowed("group_ids"));
                }
                match members {
                    None => Ok(Selectors::AllMembers),
                    Some([]) => Err(ValidationError::EmptyMemberSelection),
                    Some(raw) => {
                        let ids = parse_ids::<CourseMemberId>(raw, "course_member_ids")?;
                        Ok(Selectors::Members(dedup(ids)))
                    }
                }
            }
        }
    }
}

fn parse_ids<T>(raw: &[String], field: &'static str) -> Result<Vec<T>, ValidationError>
where
    T: std::str::FromStr<Err = labfleet_id::IdError>,
{
    raw.iter()
        .map(|s| s.trim().parse().map_err(ValidationError::invalid_id(field)))
        .collect()
}

/// Parses requested access types. Omitted means `[ssh]`; duplicates collapse
/// keeping first-occurrence order.
pub fn parse_access_types(raw: Option<&[String]>) -> Result<Vec<AccessKind>, ValidationError> {
    let Some(raw) = raw else {
        return Ok(vec![AccessKind::Ssh]);
    };
    if raw.is_empty() {
        return Err(ValidationError::EmptyAccessTypes);
    }
    let kinds = raw
        .iter()
        .map(|s| s.parse())
        .collect::<Result<Vec<AccessKind>, _>>()?;
    Ok(dedup(kinds))
}

fn dedup<T: Copy + Eq + std::hash::Hash>(items: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::with_capacity(items.len());
    items.into_iter().filter(|item| seen.insert(*item)).collect()
}

// =============================================================================
// Resolution
// =============================================================================

/// Expands validated selectors into the ordered, deduplicated target list.
///
/// The result is never empty.
pub fn resolve_targets(
    mode: DeploymentMode,
    course_id: CourseId,
    selectors: &Selectors,
    roster: &CourseRoster,
) -> Result<Vec<Target>, ValidationError> {
    if roster.course_id != course_id {
        return Err(ValidationError::CourseNotFound(course_id));
    }

    let targets = match (mode, selectors) {
        (DeploymentMode::PerCourse, Selectors::None) => vec![Target::Course(course_id)],

        (DeploymentMode::PerGroup, Selectors::Groups(groups)) => {
            if groups.is_empty() {
                return Err(ValidationError::NoGroupsSelected);
            }
            for group_id in groups {
                if !roster.groups.contains(group_id) {
                    return Err(ValidationError::UnknownGroup {
                        group_id: *group_id,
                        course_id,
                    });
                }
            }
            dedup(groups.clone()).into_iter().map(Target::Group).collect()
        }

        (DeploymentMode::PerStudent, Selectors::AllMembers) => {
            let members: Vec<Target> = dedup(roster.active_members().collect())
                .into_iter()
                .map(Target::Member)
                .collect();
            if members.is_empty() {
                return Err(ValidationError::NoActiveMembers(course_id));
            }
            members
        }

        (DeploymentMode::PerStudent, Selectors::Members(members)) => {
            if members.is_empty() {
                return Err(ValidationError::EmptyMemberSelection);
            }
            for member_id in members {
                if !roster.is_active_member(*member_id) {
                    return Err(ValidationError::NotActiveMember {
                        member_id: *member_id,
                        course_id,
                    });
                }
            }
            dedup(members.clone()).into_iter().map(Target::Member).collect()
        }

        (mode, Selectors::Groups(_)) => {
            return Err(ValidationError::SelectorsNotAllowed {
                mode,
                field: "group_ids",
            })
        }
        (mode, Selectors::Members(_) | Selectors::AllMembers) => {
            return Err(ValidationError::SelectorsNotAllowed {
                mode,
                field: "course_member_ids",
            })
        }
        (DeploymentMode::PerGroup, Selectors::None) => {
            return Err(ValidationError::NoGroupsSelected)
        }
        (DeploymentMode::PerStudent, Selectors::None) => Vec::new(),
    };

    if targets.is_empty() {
        return Err(ValidationError::NoActiveMembers(course_id));
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn roster(groups: usize, members: usize) -> CourseRoster {
        CourseRoster {
            course_id: CourseId::new(),
            groups: (0..groups).map(|_| GroupId::new()).collect(),
            members: (0..members)
                .map(|_| RosterMember {
                    id: CourseMemberId::new(),
                    left_at: None,
                })
                .collect(),
        }
    }

    fn request(mode: &str) -> CreateDeploymentRequest {
        CreateDeploymentRequest {
            template_version_ref: "acme/linux-lab@v1".into(),
            course_id: CourseId::new().to_string(),
            mode: mode.into(),
            ..Default::default()
        }
    }

    #[test]
    fn per_course_yields_single_target() {
        let roster = roster(2, 3);
        let targets = resolve_targets(
            DeploymentMode::PerCourse,
            roster.course_id,
            &Selectors::None,
            &roster,
        )
        .unwrap();
        assert_eq!(targets, vec![Target::Course(roster.course_id)]);
    }

    #[test]
    fn per_group_collapses_duplicates_in_first_seen_order() {
        let roster = roster(3, 0);
        let (a, b) = (roster.groups[0], roster.groups[1]);
        let targets = resolve_targets(
            DeploymentMode::PerGroup,
            roster.course_id,
            &Selectors::Groups(vec![b, a, b]),
            &roster,
        )
        .unwrap();
        assert_eq!(targets, vec![Target::Group(b), Target::Group(a)]);
    }

    #[test]
    fn per_group_rejects_foreign_group() {
        let roster = roster(1, 0);
        let foreign = GroupId::new();
        let err = resolve_targets(
            DeploymentMode::PerGroup,
            roster.course_id,
            &Selectors::Groups(vec![roster.groups[0], foreign]),
            &roster,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownGroup {
                group_id: foreign,
                course_id: roster.course_id
            }
        );
    }

    #[test]
    fn all_members_skips_members_who_left() {
        let mut roster = roster(0, 3);
        roster.members[1].left_at = Some(Utc::now());
        let targets = resolve_targets(
            DeploymentMode::PerStudent,
            roster.course_id,
            &Selectors::AllMembers,
            &roster,
        )
        .unwrap();
        assert_eq!(
            targets,
            vec![
                Target::Member(roster.members[0].id),
                Target::Member(roster.members[2].id)
            ]
        );
    }

    #[test]
    fn explicit_members_must_be_active() {
        let mut roster = roster(0, 2);
        roster.members[1].left_at = Some(Utc::now());
        let err = resolve_targets(
            DeploymentMode::PerStudent,
            roster.course_id,
            &Selectors::Members(vec![roster.members[0].id, roster.members[1].id]),
            &roster,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::NotActiveMember { .. }));
    }

    #[test]
    fn course_without_active_members_is_rejected() {
        let roster = roster(0, 0);
        let err = resolve_targets(
            DeploymentMode::PerStudent,
            roster.course_id,
            &Selectors::AllMembers,
            &roster,
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::NoActiveMembers(roster.course_id));
    }

    #[test]
    fn validate_defaults_access_and_name() {
        let spec = request("PER_COURSE").validate().unwrap();
        assert_eq!(spec.access_types, vec![AccessKind::Ssh]);
        assert_eq!(spec.name, "linux-lab-deployment");
        assert_eq!(spec.selectors, Selectors::None);
        assert_eq!(spec.config, serde_json::json!({}));
    }

    #[test]
    fn validate_collapses_duplicate_access_types() {
        let mut req = request("PER_COURSE");
        req.access_types = Some(vec!["ssh".into(), "vnc".into(), "ssh".into()]);
        let spec = req.validate().unwrap();
        assert_eq!(spec.access_types, vec![AccessKind::Ssh, AccessKind::Vnc]);
    }

    #[rstest]
    #[case::empty_access(|r: &mut CreateDeploymentRequest| r.access_types = Some(vec![]))]
    #[case::unknown_access(|r: &mut CreateDeploymentRequest| r.access_types = Some(vec!["telnet".into()]))]
    #[case::bad_mode(|r: &mut CreateDeploymentRequest| r.mode = "PER_TEAM".into())]
    #[case::bad_course(|r: &mut CreateDeploymentRequest| r.course_id = "grp_01ARZ3NDEKTSV4RRFFQ69G5FAV".into())]
    #[case::bad_template(|r: &mut CreateDeploymentRequest| r.template_version_ref = "not a ref".into())]
    #[case::course_with_groups(|r: &mut CreateDeploymentRequest| r.group_ids = Some(vec![GroupId::new().to_string()]))]
    fn validate_rejects(#[case] mutate: fn(&mut CreateDeploymentRequest)) {
        let mut req = request("PER_COURSE");
        mutate(&mut req);
        assert!(req.validate().is_err());
    }

    #[test]
    fn per_group_requires_groups() {
        assert_eq!(
            request("PER_GROUP").validate().unwrap_err(),
            ValidationError::NoGroupsSelected
        );
    }

    #[test]
    fn per_student_distinguishes_omitted_and_empty_members() {
        let spec = request("PER_STUDENT").validate().unwrap();
        assert_eq!(spec.selectors, Selectors::AllMembers);

        let mut explicit_empty = request("PER_STUDENT");
        explicit_empty.course_member_ids = Some(vec![]);
        assert_eq!(
            explicit_empty.validate().unwrap_err(),
            ValidationError::EmptyMemberSelection
        );
    }
}
