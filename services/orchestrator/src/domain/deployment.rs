//! The deployment aggregate and its derived status.

use chrono::{DateTime, Utc};
use labfleet_id::{CourseId, CourseMemberId, DeploymentId, GroupId};
use serde::{Deserialize, Serialize};

use super::access::AccessKind;
use super::instance::{Instance, InstanceSnapshot, InstanceStatus, InstanceSummary};
use crate::error::ValidationError;

// =============================================================================
// Mode
// =============================================================================

/// How a deployment fans out over its course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentMode {
    PerCourse,
    PerGroup,
    PerStudent,
}

impl DeploymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerCourse => "PER_COURSE",
            Self::PerGroup => "PER_GROUP",
            Self::PerStudent => "PER_STUDENT",
        }
    }
}

impl std::fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "PER_COURSE" => Ok(Self::PerCourse),
            "PER_GROUP" => Ok(Self::PerGroup),
            "PER_STUDENT" => Ok(Self::PerStudent),
            _ => Err(ValidationError::UnknownMode(s.to_string())),
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Aggregate status of a deployment, always derived from its instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Queued,
    Creating,
    Running,
    Failed,
    Deleted,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Creating => "CREATING",
            Self::Running => "RUNNING",
            Self::Failed => "FAILED",
            Self::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(Self::Queued),
            "CREATING" => Ok(Self::Creating),
            "RUNNING" => Ok(Self::Running),
            "FAILED" => Ok(Self::Failed),
            "DELETED" => Ok(Self::Deleted),
            _ => Err(ValidationError::UnknownStatus(s.to_string())),
        }
    }
}

/// Folds instance snapshots into the deployment status.
///
/// Precedence, first match wins:
/// 1. no instances: `QUEUED`
/// 2. every instance `DELETED`: `DELETED`
/// 3. any `CREATING`: `QUEUED` until some instance has been handed off, then
///    `CREATING`
/// 4. any `FAILED`: `FAILED`
/// 5. otherwise `RUNNING`
pub fn derive_status<I>(instances: I) -> DeploymentStatus
where
    I: IntoIterator<Item = InstanceSnapshot>,
{
    let mut total = 0usize;
    let mut deleted = 0usize;
    let mut creating = false;
    let mut failed = false;
    let mut dispatched = false;

    for snapshot in instances {
        total += 1;
        dispatched |= snapshot.dispatched;
        match snapshot.status {
            InstanceStatus::Deleted => deleted += 1,
            InstanceStatus::Creating => creating = true,
            InstanceStatus::Failed => failed = true,
            InstanceStatus::Running => {}
        }
    }

    if total == 0 {
        DeploymentStatus::Queued
    } else if deleted == total {
        DeploymentStatus::Deleted
    } else if creating {
        if dispatched {
            DeploymentStatus::Creating
        } else {
            DeploymentStatus::Queued
        }
    } else if failed {
        DeploymentStatus::Failed
    } else {
        DeploymentStatus::Running
    }
}

// =============================================================================
// Targets and selectors
// =============================================================================

/// What one instance is provisioned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    Course(CourseId),
    Group(GroupId),
    Member(CourseMemberId),
}

impl Target {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Course(_) => "course",
            Self::Group(_) => "group",
            Self::Member(_) => "member",
        }
    }

    pub fn id(&self) -> String {
        match self {
            Self::Course(id) => id.to_string(),
            Self::Group(id) => id.to_string(),
            Self::Member(id) => id.to_string(),
        }
    }

    /// Rebuilds a target from its persisted `(kind, id)` columns.
    pub fn from_parts(kind: &str, id: &str) -> Result<Self, String> {
        let target = match kind {
            "course" => Self::Course(id.parse().map_err(|e| format!("{e}"))?),
            "group" => Self::Group(id.parse().map_err(|e| format!("{e}"))?),
            "member" => Self::Member(id.parse().map_err(|e| format!("{e}"))?),
            other => return Err(format!("unknown target kind '{other}'")),
        };
        Ok(target)
    }

    pub fn matches_mode(&self, mode: DeploymentMode) -> bool {
        matches!(
            (self, mode),
            (Self::Course(_), DeploymentMode::PerCourse)
                | (Self::Group(_), DeploymentMode::PerGroup)
                | (Self::Member(_), DeploymentMode::PerStudent)
        )
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind(), self.id())
    }
}

/// Validated, mode-dependent scope selectors as recorded on the deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ids", rename_all = "snake_case")]
pub enum Selectors {
    /// `PER_COURSE`: no selectors.
    None,
    Groups(Vec<GroupId>),
    Members(Vec<CourseMemberId>),
    /// `PER_STUDENT` with selectors omitted: every active member at
    /// resolution time.
    AllMembers,
}

// =============================================================================
// Template reference
// =============================================================================

/// Immutable reference to the exact template snapshot a deployment uses.
///
/// Accepted forms are a git URL (`https://`, `http://`, `git@`) or an
/// `owner/repo` identifier, either optionally pinned with `@<revision>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateRef(String);

impl TemplateRef {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ValidationError::InvalidTemplateRef(
                "template reference cannot be empty".into(),
            ));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(ValidationError::InvalidTemplateRef(format!(
                "'{raw}' contains whitespace"
            )));
        }

        let is_url = ["https://", "http://", "git@"]
            .iter()
            .any(|scheme| raw.starts_with(scheme) && raw.len() > scheme.len());
        if is_url || Self::is_repo_slug(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(ValidationError::InvalidTemplateRef(format!(
                "'{raw}' is neither a git URL nor an owner/repo identifier"
            )))
        }
    }

    fn is_repo_slug(raw: &str) -> bool {
        let (path, revision) = match raw.split_once('@') {
            Some((path, rev)) => (path, Some(rev)),
            None => (raw, None),
        };
        if revision.is_some_and(str::is_empty) {
            return false;
        }
        let valid_segment = |s: &str| {
            !s.is_empty()
                && s
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        match path.split_once('/') {
            Some((owner, repo)) => valid_segment(owner) && valid_segment(repo),
            None => false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Display name used when a request does not supply one.
pub fn derive_name(template: &TemplateRef) -> String {
    let raw = template.as_str();
    // Drop a trailing `@revision` unless the `@` is the `git@` user part.
    let without_rev = match raw.rsplit_once('@') {
        Some((head, _)) if !raw.starts_with("git@") || head.contains(':') => head,
        _ => raw,
    };
    let last = without_rev
        .trim_end_matches('/')
        .rsplit(|c| c == '/' || c == ':')
        .next()
        .unwrap_or(without_rev);
    let stem = last.strip_suffix(".git").unwrap_or(last);

    let slug: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "template-deployment".to_string()
    } else {
        format!("{slug}-deployment")
    }
}

// =============================================================================
// Aggregate
// =============================================================================

/// One orchestration request and the instances it fanned out into.
#[derive(Debug, Clone, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub name: String,
    pub template_ref: TemplateRef,
    pub course_id: CourseId,
    pub mode: DeploymentMode,
    pub selectors: Selectors,
    pub access_types: Vec<AccessKind>,
    pub config: serde_json::Value,
    pub provider_project_id: Option<String>,
    pub instances: Vec<Instance>,
    pub created_at: DateTime<Utc>,
}

impl Deployment {
    pub fn status(&self) -> DeploymentStatus {
        derive_status(self.instances.iter().map(Instance::snapshot))
    }

    pub fn instance(&self, id: labfleet_id::InstanceId) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn summary(&self) -> DeploymentSummary {
        DeploymentSummary {
            id: self.id,
            name: self.name.clone(),
            template_version_ref: self.template_ref.clone(),
            course_id: self.course_id,
            mode: self.mode,
            status: self.status(),
            access_types: self.access_types.clone(),
            provider_project_id: self.provider_project_id.clone(),
            instance_count: self.instances.len(),
            created_at: self.created_at,
        }
    }

    /// Detailed, secret-free view including instance summaries.
    pub fn view(&self, now: DateTime<Utc>) -> DeploymentView {
        DeploymentView {
            summary: self.summary(),
            selectors: self.selectors.clone(),
            config: self.config.clone(),
            instances: self.instances.iter().map(|i| i.summary(now)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct DeploymentSummary {
    pub id: DeploymentId,
    pub name: String,
    pub template_version_ref: TemplateRef,
    pub course_id: CourseId,
    pub mode: DeploymentMode,
    pub status: DeploymentStatus,
    pub access_types: Vec<AccessKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_project_id: Option<String>,
    pub instance_count: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentView {
    #[serde(flatten)]
    pub summary: DeploymentSummary,
    pub selectors: Selectors,
    pub config: serde_json::Value,
    pub instances: Vec<InstanceSummary>,
}
