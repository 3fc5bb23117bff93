//! In-process store and course directory.
//!
//! Used by tests and by the binary when no `DATABASE_URL` is configured. A
//! single mutex serializes every write, which gives the same per-instance and
//! per-deployment guarantees as the row locks of the Postgres store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labfleet_events::{AuditDraft, AuditEvent, AuditLog};
use labfleet_id::{CourseId, CourseMemberId, DeploymentId, GroupId, InstanceId};
use tokio::sync::{Mutex, RwLock};

use super::{
    DeploymentFilter, DeploymentPage, DeploymentStore, InstanceMutation, InstanceUpdate,
    StoreError, TransitionContext,
};
use crate::domain::{Deployment, Instance, InstanceStatus};
use crate::error::LifecycleError;
use crate::resolver::{CourseDirectory, CourseRoster, DirectoryError, RosterMember};

#[derive(Default)]
struct Inner {
    deployments: HashMap<DeploymentId, Deployment>,
    /// Creation order, oldest first.
    order: Vec<DeploymentId>,
    instances: HashMap<InstanceId, DeploymentId>,
    logs: HashMap<DeploymentId, AuditLog>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn append(log: &mut AuditLog, drafts: Vec<AuditDraft>, now: DateTime<Utc>) -> Vec<AuditEvent> {
    drafts
        .into_iter()
        .map(|draft| log.append(draft, now).clone())
        .collect()
}

#[async_trait]
impl DeploymentStore for InMemoryStore {
    async fn create(
        &self,
        deployment: &Deployment,
        events: Vec<AuditDraft>,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.deployments.contains_key(&deployment.id) {
            return Err(StoreError::Duplicate(deployment.id));
        }

        for instance in &deployment.instances {
            inner.instances.insert(instance.id, deployment.id);
        }
        let mut log = AuditLog::new(deployment.id);
        let sealed = append(&mut log, events, deployment.created_at);
        inner.logs.insert(deployment.id, log);
        inner.order.push(deployment.id);
        inner.deployments.insert(deployment.id, deployment.clone());
        Ok(sealed)
    }

    async fn deployment(&self, id: DeploymentId) -> Result<Option<Deployment>, StoreError> {
        Ok(self.inner.lock().await.deployments.get(&id).cloned())
    }

    async fn list(&self, filter: &DeploymentFilter) -> Result<DeploymentPage, StoreError> {
        let inner = self.inner.lock().await;
        let matching: Vec<&Deployment> = inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.deployments.get(id))
            .filter(|d| filter.course_id.is_none_or(|c| d.course_id == c))
            .filter(|d| filter.status.is_none_or(|s| d.status() == s))
            .collect();

        Ok(DeploymentPage {
            total: matching.len(),
            items: matching
                .into_iter()
                .skip(filter.offset)
                .take(filter.limit)
                .cloned()
                .collect(),
        })
    }

    async fn instance(&self, id: InstanceId) -> Result<Option<Instance>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .instances
            .get(&id)
            .and_then(|dep| inner.deployments.get(dep))
            .and_then(|d| d.instance(id))
            .cloned())
    }

    async fn update_instance(
        &self,
        id: InstanceId,
        mutation: InstanceMutation,
    ) -> Result<InstanceUpdate, LifecycleError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let deployment_id = *inner
            .instances
            .get(&id)
            .ok_or(LifecycleError::NotFound(id))?;
        let deployment = inner
            .deployments
            .get_mut(&deployment_id)
            .ok_or_else(|| StoreError::Corrupt(format!("instance {id} has no deployment")))?;
        let slot = deployment
            .instances
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| StoreError::Corrupt(format!("instance {id} missing from {deployment_id}")))?;

        let ctx = TransitionContext {
            now: Utc::now(),
            access_types: deployment.access_types.clone(),
        };
        // Mutate a copy so a rejected transition leaves the stored one as is.
        let mut candidate = deployment.instances[slot].clone();
        let drafts = mutation(&mut candidate, &ctx)?;
        deployment.instances[slot] = candidate.clone();

        let deployment_status = deployment.status();
        let provider_project_id = deployment.provider_project_id.clone();
        let log = inner
            .logs
            .entry(deployment_id)
            .or_insert_with(|| AuditLog::new(deployment_id));
        let events = append(log, drafts, ctx.now);

        Ok(InstanceUpdate {
            instance: candidate,
            deployment_status,
            provider_project_id,
            events,
        })
    }

    async fn audit_events(
        &self,
        id: DeploymentId,
    ) -> Result<Option<Vec<AuditEvent>>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.logs.get(&id).map(|log| log.events().to_vec()))
    }

    async fn stalled_instances(
        &self,
        unqueued_before: DateTime<Utc>,
        lease_cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Instance>, StoreError> {
        let inner = self.inner.lock().await;
        let mut stalled: Vec<Instance> = inner
            .deployments
            .values()
            .flat_map(|d| d.instances.iter())
            .filter(|i| match i.job {
                None => i.status == InstanceStatus::Creating && i.created_at < unqueued_before,
                Some(_) => i.lease_lapsed(lease_cutoff),
            })
            .cloned()
            .collect();
        stalled.sort_by_key(|i| (i.created_at, i.id));
        stalled.truncate(limit);
        Ok(stalled)
    }
}

/// Course rosters held in memory.
#[derive(Default)]
pub struct InMemoryDirectory {
    courses: RwLock<HashMap<CourseId, CourseRoster>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an empty course and returns its id.
    pub async fn create_course(&self) -> CourseId {
        let course_id = CourseId::new();
        self.courses.write().await.insert(
            course_id,
            CourseRoster {
                course_id,
                groups: Vec::new(),
                members: Vec::new(),
            },
        );
        course_id
    }

    pub async fn add_group(&self, course_id: CourseId) -> Option<GroupId> {
        let mut courses = self.courses.write().await;
        let roster = courses.get_mut(&course_id)?;
        let group_id = GroupId::new();
        roster.groups.push(group_id);
        Some(group_id)
    }

    pub async fn add_member(&self, course_id: CourseId) -> Option<CourseMemberId> {
        let mut courses = self.courses.write().await;
        let roster = courses.get_mut(&course_id)?;
        let member_id = CourseMemberId::new();
        roster.members.push(RosterMember {
            id: member_id,
            left_at: None,
        });
        Some(member_id)
    }

    /// Registers a course with `groups` groups and `members` active members.
    pub async fn seed_course(&self, groups: usize, members: usize) -> CourseId {
        let course_id = self.create_course().await;
        let mut courses = self.courses.write().await;
        if let Some(roster) = courses.get_mut(&course_id) {
            roster.groups.extend((0..groups).map(|_| GroupId::new()));
            roster.members.extend((0..members).map(|_| RosterMember {
                id: CourseMemberId::new(),
                left_at: None,
            }));
        }
        course_id
    }

    /// Marks a member as having left the course. Returns false if unknown.
    pub async fn remove_member(&self, course_id: CourseId, member_id: CourseMemberId) -> bool {
        let mut courses = self.courses.write().await;
        let Some(member) = courses
            .get_mut(&course_id)
            .and_then(|r| r.members.iter_mut().find(|m| m.id == member_id))
        else {
            return false;
        };
        member.left_at.get_or_insert_with(Utc::now);
        true
    }
}

#[async_trait]
impl CourseDirectory for InMemoryDirectory {
    async fn roster(&self, course_id: CourseId) -> Result<Option<CourseRoster>, DirectoryError> {
        Ok(self.courses.read().await.get(&course_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccessKind, DeploymentMode, Selectors, Target, TemplateRef};
    use labfleet_events::AuditEventType;

    fn deployment(instances: usize) -> Deployment {
        let id = DeploymentId::new();
        let course_id = CourseId::new();
        let now = Utc::now();
        Deployment {
            id,
            name: "lab".into(),
            template_ref: TemplateRef::parse("acme/lab").unwrap(),
            course_id,
            mode: DeploymentMode::PerStudent,
            selectors: Selectors::AllMembers,
            access_types: vec![AccessKind::Ssh],
            config: serde_json::json!({}),
            provider_project_id: None,
            instances: (0..instances)
                .map(|_| Instance::new(id, Target::Member(CourseMemberId::new()), now))
                .collect(),
            created_at: now,
        }
    }

    #[tokio::test]
    async fn rejected_mutation_leaves_instance_untouched() {
        let store = InMemoryStore::new();
        let dep = deployment(1);
        let instance_id = dep.instances[0].id;
        store.create(&dep, vec![]).await.unwrap();

        let result = store
            .update_instance(
                instance_id,
                crate::store::mutation(|instance, _| {
                    instance.network_address = Some("10.0.0.1".into());
                    Err(LifecycleError::NotFound(instance.id))
                }),
            )
            .await;
        assert!(result.is_err());

        let stored = store.instance(instance_id).await.unwrap().unwrap();
        assert_eq!(stored.network_address, None);
        assert!(store.audit_events(dep.id).await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_appends_events_in_sequence() {
        let store = InMemoryStore::new();
        let dep = deployment(2);
        store
            .create(
                &dep,
                vec![AuditDraft::new(AuditEventType::Started, "started")],
            )
            .await
            .unwrap();

        let update = store
            .update_instance(
                dep.instances[1].id,
                crate::store::mutation(|instance, ctx| Ok(instance.fail("boom", ctx.now)?)),
            )
            .await
            .unwrap();
        assert_eq!(update.events.len(), 1);
        assert_eq!(update.events[0].seq.value(), 2);

        let events = store.audit_events(dep.id).await.unwrap().unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq.value()).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn list_filters_and_paginates_newest_first() {
        let store = InMemoryStore::new();
        let first = deployment(1);
        let second = deployment(1);
        store.create(&first, vec![]).await.unwrap();
        store.create(&second, vec![]).await.unwrap();

        let page = store
            .list(&DeploymentFilter {
                limit: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].id, second.id);

        let by_course = store
            .list(&DeploymentFilter {
                course_id: Some(first.course_id),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_course.total, 1);
        assert_eq!(by_course.items[0].id, first.id);
    }

    #[tokio::test]
    async fn directory_tracks_members_leaving() {
        let directory = InMemoryDirectory::new();
        let course = directory.create_course().await;
        let member = directory.add_member(course).await.unwrap();
        assert!(directory.remove_member(course, member).await);

        let roster = directory.roster(course).await.unwrap().unwrap();
        assert_eq!(roster.active_members().count(), 0);
        assert!(directory.roster(CourseId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn seeded_course_has_groups_and_active_members() {
        let directory = InMemoryDirectory::new();
        let course = directory.seed_course(2, 3).await;

        let roster = directory.roster(course).await.unwrap().unwrap();
        assert_eq!(roster.groups.len(), 2);
        assert_eq!(roster.active_members().count(), 3);
    }

    #[tokio::test]
    async fn stalled_instances_cover_unqueued_and_lapsed_deliveries() {
        let store = InMemoryStore::new();
        let mut dep = deployment(3);
        let long_ago = Utc::now() - chrono::Duration::hours(1);
        for instance in &mut dep.instances {
            instance.created_at = long_ago;
            instance.updated_at = long_ago;
        }
        // Handed off an hour ago and never heard from again.
        dep.instances[1].job = Some(labfleet_id::JobId::new());
        // Handed off just now.
        dep.instances[2].job = Some(labfleet_id::JobId::new());
        dep.instances[2].updated_at = Utc::now();
        store.create(&dep, vec![]).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(10);
        let stalled = store.stalled_instances(cutoff, cutoff, 10).await.unwrap();
        let ids: Vec<InstanceId> = stalled.iter().map(|i| i.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&dep.instances[0].id));
        assert!(ids.contains(&dep.instances[1].id));
    }
}
