//! Postgres-backed deployment store.
//!
//! Instance writes lock the parent deployment row first and the instance row
//! second, so concurrent transitions on sibling instances serialize on the
//! deployment and the recomputed status is never lost.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labfleet_events::{AuditDraft, AuditEvent, AuditEventType, AuditLevel};
use labfleet_id::{AccessMethodId, AuditSeq, CourseId, DeploymentId, InstanceId, JobId};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{PgConnection, Row};
use tracing::{debug, instrument};

use super::DbError;
use crate::domain::{
    derive_status, AccessKind, AccessMethod, Deployment, DeploymentMode, DeploymentStatus,
    Instance, InstanceSnapshot, InstanceStatus, Secret, Target, TemplateRef,
};
use crate::error::LifecycleError;
use crate::store::{
    DeploymentFilter, DeploymentPage, DeploymentStore, InstanceMutation, InstanceUpdate,
    StoreError, TransitionContext,
};

const DEPLOYMENT_COLUMNS: &str = "id, name, template_version_ref, course_id, mode, selectors, \
     access_types, config, provider_project_id, created_at";

const INSTANCE_COLUMNS: &str = "id, deployment_id, target_kind, target_id, status, provider_ref, \
     network_address, dispatch_attempts, job_id, claimed_by, redeliveries, pending_teardown, \
     failure_reason, created_at, updated_at";

const ACCESS_COLUMNS: &str =
    "id, instance_id, kind, url, username, secret, port, active, expires_at, created_at";

fn query_err(err: sqlx::Error) -> StoreError {
    DbError::Query(err).into()
}

fn corrupt(table: &'static str) -> impl Fn(String) -> StoreError {
    let make = DbError::corrupt(table);
    move |reason| make(reason).into()
}

// =============================================================================
// Rows
// =============================================================================

struct DeploymentRow {
    id: String,
    name: String,
    template_version_ref: String,
    course_id: String,
    mode: String,
    selectors: serde_json::Value,
    access_types: Vec<String>,
    config: serde_json::Value,
    provider_project_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeploymentRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            template_version_ref: row.try_get("template_version_ref")?,
            course_id: row.try_get("course_id")?,
            mode: row.try_get("mode")?,
            selectors: row.try_get("selectors")?,
            access_types: row.try_get("access_types")?,
            config: row.try_get("config")?,
            provider_project_id: row.try_get("provider_project_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl DeploymentRow {
    fn into_deployment(self, instances: Vec<Instance>) -> Result<Deployment, StoreError> {
        let bad = corrupt("deployments");
        let access_types = self
            .access_types
            .iter()
            .map(|kind| kind.parse::<AccessKind>().map_err(|e| bad(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        let mode = self
            .mode
            .parse::<DeploymentMode>()
            .map_err(|e| bad(format!("{e}")))?;
        if let Some(stray) = instances.iter().find(|i| !i.target.matches_mode(mode)) {
            return Err(bad(format!(
                "instance {} targets {} under {mode}",
                stray.id, stray.target
            )));
        }

        Ok(Deployment {
            id: self
                .id
                .parse::<DeploymentId>()
                .map_err(|e| bad(format!("id: {e}")))?,
            name: self.name,
            template_ref: TemplateRef::parse(&self.template_version_ref)
                .map_err(|e| bad(e.to_string()))?,
            course_id: self
                .course_id
                .parse::<CourseId>()
                .map_err(|e| bad(format!("course_id: {e}")))?,
            mode,
            selectors: serde_json::from_value(self.selectors)
                .map_err(|e| bad(format!("selectors: {e}")))?,
            access_types,
            config: self.config,
            provider_project_id: self.provider_project_id,
            instances,
            created_at: self.created_at,
        })
    }
}

struct InstanceRow {
    id: String,
    deployment_id: String,
    target_kind: String,
    target_id: String,
    status: String,
    provider_ref: Option<String>,
    network_address: Option<String>,
    dispatch_attempts: i32,
    job_id: Option<String>,
    claimed_by: Option<String>,
    redeliveries: i32,
    pending_teardown: bool,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for InstanceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            deployment_id: row.try_get("deployment_id")?,
            target_kind: row.try_get("target_kind")?,
            target_id: row.try_get("target_id")?,
            status: row.try_get("status")?,
            provider_ref: row.try_get("provider_ref")?,
            network_address: row.try_get("network_address")?,
            dispatch_attempts: row.try_get("dispatch_attempts")?,
            job_id: row.try_get("job_id")?,
            claimed_by: row.try_get("claimed_by")?,
            redeliveries: row.try_get("redeliveries")?,
            pending_teardown: row.try_get("pending_teardown")?,
            failure_reason: row.try_get("failure_reason")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl InstanceRow {
    fn into_instance(self, access_methods: Vec<AccessMethod>) -> Result<Instance, StoreError> {
        let bad = corrupt("deployment_instances");
        let job = |raw: Option<String>| {
            raw.map(|id| id.parse::<JobId>().map_err(|e| bad(format!("job id: {e}"))))
                .transpose()
        };

        Ok(Instance {
            id: self
                .id
                .parse::<InstanceId>()
                .map_err(|e| bad(format!("id: {e}")))?,
            deployment_id: self
                .deployment_id
                .parse::<DeploymentId>()
                .map_err(|e| bad(format!("deployment_id: {e}")))?,
            target: Target::from_parts(&self.target_kind, &self.target_id).map_err(&bad)?,
            status: self.status.parse::<InstanceStatus>().map_err(&bad)?,
            provider_ref: self.provider_ref,
            network_address: self.network_address,
            access_methods,
            dispatch_attempts: u32::try_from(self.dispatch_attempts)
                .map_err(|e| bad(format!("dispatch_attempts: {e}")))?,
            job: job(self.job_id)?,
            claimed_by: job(self.claimed_by)?,
            redeliveries: u32::try_from(self.redeliveries)
                .map_err(|e| bad(format!("redeliveries: {e}")))?,
            pending_teardown: self.pending_teardown,
            failure_reason: self.failure_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct AccessMethodRow {
    id: String,
    instance_id: String,
    kind: String,
    url: Option<String>,
    username: Option<String>,
    secret: Option<String>,
    port: Option<i32>,
    active: bool,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for AccessMethodRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            kind: row.try_get("kind")?,
            url: row.try_get("url")?,
            username: row.try_get("username")?,
            secret: row.try_get("secret")?,
            port: row.try_get("port")?,
            active: row.try_get("active")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl AccessMethodRow {
    fn into_access_method(self) -> Result<AccessMethod, StoreError> {
        let bad = corrupt("instance_access_methods");
        Ok(AccessMethod {
            id: self
                .id
                .parse::<AccessMethodId>()
                .map_err(|e| bad(format!("id: {e}")))?,
            kind: self.kind.parse::<AccessKind>().map_err(|e| bad(format!("{e}")))?,
            url: self.url,
            username: self.username,
            secret: self.secret.map(Secret::new),
            port: self
                .port
                .map(u16::try_from)
                .transpose()
                .map_err(|e| bad(format!("port: {e}")))?,
            active: self.active,
            expires_at: self.expires_at,
            created_at: self.created_at,
        })
    }
}

struct AuditEventRow {
    deployment_id: String,
    seq: i64,
    level: String,
    event_type: String,
    message: String,
    occurred_at: DateTime<Utc>,
    correlation_id: Option<String>,
    instance_id: Option<String>,
    details: Option<serde_json::Value>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for AuditEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            deployment_id: row.try_get("deployment_id")?,
            seq: row.try_get("seq")?,
            level: row.try_get("level")?,
            event_type: row.try_get("event_type")?,
            message: row.try_get("message")?,
            occurred_at: row.try_get("occurred_at")?,
            correlation_id: row.try_get("correlation_id")?,
            instance_id: row.try_get("instance_id")?,
            details: row.try_get("details")?,
        })
    }
}

impl AuditEventRow {
    fn into_event(self) -> Result<AuditEvent, StoreError> {
        let bad = corrupt("deployment_audit_events");
        Ok(AuditEvent {
            deployment_id: self
                .deployment_id
                .parse::<DeploymentId>()
                .map_err(|e| bad(format!("deployment_id: {e}")))?,
            seq: AuditSeq::new(self.seq),
            level: self.level.parse::<AuditLevel>().map_err(|e| bad(format!("{e}")))?,
            event_type: self
                .event_type
                .parse::<AuditEventType>()
                .map_err(|e| bad(format!("{e}")))?,
            message: self.message,
            occurred_at: self.occurred_at,
            correlation_id: self.correlation_id,
            instance_id: self
                .instance_id
                .map(|id| id.parse::<InstanceId>())
                .transpose()
                .map_err(|e| bad(format!("instance_id: {e}")))?,
            details: self.details,
        })
    }
}

// =============================================================================
// Store
// =============================================================================

/// Deployment store over the `deployments`, `deployment_instances`,
/// `instance_access_methods` and `deployment_audit_events` tables.
#[derive(Clone)]
pub struct PgDeploymentStore {
    pool: PgPool,
}

impl PgDeploymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Loads access methods for the given instances, grouped by instance id.
async fn load_access_methods(
    conn: &mut PgConnection,
    instance_ids: &[String],
) -> Result<HashMap<String, Vec<AccessMethod>>, StoreError> {
    if instance_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<AccessMethodRow> = sqlx::query_as(&format!(
        "SELECT {ACCESS_COLUMNS} FROM instance_access_methods \
         WHERE instance_id = ANY($1) ORDER BY created_at, id"
    ))
    .bind(instance_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(query_err)?;

    let mut grouped: HashMap<String, Vec<AccessMethod>> = HashMap::new();
    for row in rows {
        let instance_id = row.instance_id.clone();
        grouped
            .entry(instance_id)
            .or_default()
            .push(row.into_access_method()?);
    }
    Ok(grouped)
}

/// Hydrates instance rows with their access methods, keeping row order.
async fn hydrate_instances(
    conn: &mut PgConnection,
    rows: Vec<InstanceRow>,
) -> Result<Vec<Instance>, StoreError> {
    let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
    let mut access = load_access_methods(conn, &ids).await?;
    rows.into_iter()
        .map(|row| {
            let methods = access.remove(&row.id).unwrap_or_default();
            row.into_instance(methods)
        })
        .collect()
}

/// Loads instances for a set of deployments, grouped by deployment id in
/// creation order.
async fn load_instances(
    conn: &mut PgConnection,
    deployment_ids: &[String],
) -> Result<HashMap<DeploymentId, Vec<Instance>>, StoreError> {
    if deployment_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<InstanceRow> = sqlx::query_as(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM deployment_instances \
         WHERE deployment_id = ANY($1) ORDER BY deployment_id, position"
    ))
    .bind(deployment_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(query_err)?;

    let mut grouped: HashMap<DeploymentId, Vec<Instance>> = HashMap::new();
    for instance in hydrate_instances(conn, rows).await? {
        grouped
            .entry(instance.deployment_id)
            .or_default()
            .push(instance);
    }
    Ok(grouped)
}

async fn load_deployments(
    conn: &mut PgConnection,
    rows: Vec<DeploymentRow>,
) -> Result<Vec<Deployment>, StoreError> {
    let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
    let mut instances = load_instances(conn, &ids).await?;
    rows.into_iter()
        .map(|row| {
            let owned = row
                .id
                .parse::<DeploymentId>()
                .ok()
                .and_then(|id| instances.remove(&id))
                .unwrap_or_default();
            row.into_deployment(owned)
        })
        .collect()
}

/// Seals drafts after the deployment's current last sequence number and
/// inserts them.
async fn append_events(
    conn: &mut PgConnection,
    deployment_id: DeploymentId,
    drafts: Vec<AuditDraft>,
    now: DateTime<Utc>,
) -> Result<Vec<AuditEvent>, StoreError> {
    if drafts.is_empty() {
        return Ok(Vec::new());
    }
    let last: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(seq), 0) FROM deployment_audit_events WHERE deployment_id = $1",
    )
    .bind(deployment_id.to_string())
    .fetch_one(&mut *conn)
    .await
    .map_err(query_err)?;

    let mut seq = AuditSeq::new(last).next();
    let mut sealed = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let event = draft.seal(deployment_id, seq, now);
        sqlx::query(
            r#"
            INSERT INTO deployment_audit_events (
                deployment_id, seq, level, event_type, message,
                occurred_at, correlation_id, instance_id, details
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.deployment_id.to_string())
        .bind(event.seq.value())
        .bind(event.level.as_str())
        .bind(event.event_type.as_str())
        .bind(&event.message)
        .bind(event.occurred_at)
        .bind(&event.correlation_id)
        .bind(event.instance_id.map(|id| id.to_string()))
        .bind(&event.details)
        .execute(&mut *conn)
        .await
        .map_err(query_err)?;
        seq = seq.next();
        sealed.push(event);
    }
    Ok(sealed)
}

async fn insert_instance(
    conn: &mut PgConnection,
    instance: &Instance,
    position: i32,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO deployment_instances (
            id, deployment_id, position, target_kind, target_id, status,
            provider_ref, network_address, dispatch_attempts, job_id, claimed_by,
            redeliveries, pending_teardown, failure_reason, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(instance.id.to_string())
    .bind(instance.deployment_id.to_string())
    .bind(position)
    .bind(instance.target.kind())
    .bind(instance.target.id())
    .bind(instance.status.as_str())
    .bind(&instance.provider_ref)
    .bind(&instance.network_address)
    .bind(attempts(instance.dispatch_attempts))
    .bind(instance.job.map(|id| id.to_string()))
    .bind(instance.claimed_by.map(|id| id.to_string()))
    .bind(attempts(instance.redeliveries))
    .bind(instance.pending_teardown)
    .bind(&instance.failure_reason)
    .bind(instance.created_at)
    .bind(instance.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(query_err)?;
    Ok(())
}

fn attempts(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Writes every mutable instance column and upserts its access methods.
async fn save_instance(conn: &mut PgConnection, instance: &Instance) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE deployment_instances SET
            status = $2,
            provider_ref = $3,
            network_address = $4,
            dispatch_attempts = $5,
            job_id = $6,
            claimed_by = $7,
            redeliveries = $8,
            pending_teardown = $9,
            failure_reason = $10,
            updated_at = $11
        WHERE id = $1
        "#,
    )
    .bind(instance.id.to_string())
    .bind(instance.status.as_str())
    .bind(&instance.provider_ref)
    .bind(&instance.network_address)
    .bind(attempts(instance.dispatch_attempts))
    .bind(instance.job.map(|id| id.to_string()))
    .bind(instance.claimed_by.map(|id| id.to_string()))
    .bind(attempts(instance.redeliveries))
    .bind(instance.pending_teardown)
    .bind(&instance.failure_reason)
    .bind(instance.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(query_err)?;

    for method in &instance.access_methods {
        sqlx::query(
            r#"
            INSERT INTO instance_access_methods (
                id, instance_id, kind, url, username, secret, port, active,
                expires_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                active = EXCLUDED.active,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(method.id.to_string())
        .bind(instance.id.to_string())
        .bind(method.kind.as_str())
        .bind(&method.url)
        .bind(&method.username)
        .bind(method.secret.as_ref().map(|s| s.expose().to_string()))
        .bind(method.port.map(i32::from))
        .bind(method.active)
        .bind(method.expires_at)
        .bind(method.created_at)
        .execute(&mut *conn)
        .await
        .map_err(query_err)?;
    }
    Ok(())
}

/// Recomputes the deployment status from its instance rows and stores it.
async fn refresh_status(
    conn: &mut PgConnection,
    deployment_id: DeploymentId,
) -> Result<DeploymentStatus, StoreError> {
    let rows = sqlx::query(
        "SELECT status, job_id IS NOT NULL AS dispatched \
         FROM deployment_instances WHERE deployment_id = $1",
    )
    .bind(deployment_id.to_string())
    .fetch_all(&mut *conn)
    .await
    .map_err(query_err)?;

    let bad = corrupt("deployment_instances");
    let snapshots = rows
        .iter()
        .map(|row| {
            let status: String = row.try_get("status").map_err(query_err)?;
            Ok(InstanceSnapshot {
                status: status.parse::<InstanceStatus>().map_err(&bad)?,
                dispatched: row.try_get("dispatched").map_err(query_err)?,
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;
    let status = derive_status(snapshots);

    sqlx::query("UPDATE deployments SET status = $2 WHERE id = $1")
        .bind(deployment_id.to_string())
        .bind(status.as_str())
        .execute(&mut *conn)
        .await
        .map_err(query_err)?;
    Ok(status)
}

#[async_trait]
impl DeploymentStore for PgDeploymentStore {
    #[instrument(skip(self, deployment, events), fields(deployment_id = %deployment.id))]
    async fn create(
        &self,
        deployment: &Deployment,
        events: Vec<AuditDraft>,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        let selectors = serde_json::to_value(&deployment.selectors).map_err(DbError::from)?;
        let access_types: Vec<&str> = deployment.access_types.iter().map(|k| k.as_str()).collect();
        sqlx::query(
            r#"
            INSERT INTO deployments (
                id, name, template_version_ref, course_id, mode, selectors,
                access_types, config, provider_project_id, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(deployment.id.to_string())
        .bind(&deployment.name)
        .bind(deployment.template_ref.as_str())
        .bind(deployment.course_id.to_string())
        .bind(deployment.mode.as_str())
        .bind(selectors)
        .bind(&access_types)
        .bind(&deployment.config)
        .bind(&deployment.provider_project_id)
        .bind(deployment.status().as_str())
        .bind(deployment.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if DbError::is_unique_violation(&e) {
                StoreError::Duplicate(deployment.id)
            } else {
                query_err(e)
            }
        })?;

        for (position, instance) in deployment.instances.iter().enumerate() {
            let position = i32::try_from(position)
                .map_err(|_| StoreError::Corrupt("too many instances".into()))?;
            insert_instance(&mut *tx, instance, position).await?;
        }

        let sealed = append_events(&mut *tx, deployment.id, events, deployment.created_at).await?;
        tx.commit().await.map_err(query_err)?;

        debug!(instances = deployment.instances.len(), "deployment persisted");
        Ok(sealed)
    }

    async fn deployment(&self, id: DeploymentId) -> Result<Option<Deployment>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(query_err)?;
        let row: Option<DeploymentRow> = sqlx::query_as(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(load_deployments(&mut *conn, vec![row]).await?.pop())
    }

    async fn list(&self, filter: &DeploymentFilter) -> Result<DeploymentPage, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(query_err)?;
        let course_id = filter.course_id.map(|c| c.to_string());
        let status = filter.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deployments \
             WHERE ($1::text IS NULL OR course_id = $1) AND ($2::text IS NULL OR status = $2)",
        )
        .bind(&course_id)
        .bind(status)
        .fetch_one(&mut *conn)
        .await
        .map_err(query_err)?;

        let rows: Vec<DeploymentRow> = sqlx::query_as(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments \
             WHERE ($1::text IS NULL OR course_id = $1) AND ($2::text IS NULL OR status = $2) \
             ORDER BY created_at DESC, id DESC LIMIT $3 OFFSET $4"
        ))
        .bind(&course_id)
        .bind(status)
        .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(filter.offset).unwrap_or(i64::MAX))
        .fetch_all(&mut *conn)
        .await
        .map_err(query_err)?;

        Ok(DeploymentPage {
            items: load_deployments(&mut *conn, rows).await?,
            total: usize::try_from(total).unwrap_or_default(),
        })
    }

    async fn instance(&self, id: InstanceId) -> Result<Option<Instance>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(query_err)?;
        let row: Option<InstanceRow> = sqlx::query_as(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM deployment_instances WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => Ok(hydrate_instances(&mut *conn, vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, mutation), fields(instance_id = %id))]
    async fn update_instance(
        &self,
        id: InstanceId,
        mutation: InstanceMutation,
    ) -> Result<InstanceUpdate, LifecycleError> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        let parent = sqlx::query(
            "SELECT d.id, d.access_types, d.provider_project_id \
             FROM deployments d JOIN deployment_instances i ON i.deployment_id = d.id \
             WHERE i.id = $1 FOR UPDATE OF d",
        )
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_err)?
        .ok_or(LifecycleError::NotFound(id))?;

        let bad = corrupt("deployments");
        let deployment_id: DeploymentId = parent
            .try_get::<String, _>("id")
            .map_err(query_err)?
            .parse::<DeploymentId>()
            .map_err(|e| bad(format!("id: {e}")))?;
        let access_types = parent
            .try_get::<Vec<String>, _>("access_types")
            .map_err(query_err)?
            .iter()
            .map(|kind| kind.parse::<AccessKind>().map_err(|e| bad(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        let provider_project_id: Option<String> =
            parent.try_get("provider_project_id").map_err(query_err)?;

        let row: InstanceRow = sqlx::query_as(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM deployment_instances WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(query_err)?;
        let mut candidate = hydrate_instances(&mut *tx, vec![row])
            .await?
            .pop()
            .ok_or(LifecycleError::NotFound(id))?;

        let ctx = TransitionContext {
            now: Utc::now(),
            access_types,
        };
        // Dropping the transaction on a rejected mutation rolls it back.
        let drafts = mutation(&mut candidate, &ctx)?;

        save_instance(&mut *tx, &candidate).await?;
        let deployment_status = refresh_status(&mut *tx, deployment_id).await?;
        let events = append_events(&mut *tx, deployment_id, drafts, ctx.now).await?;
        tx.commit().await.map_err(query_err)?;

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
        let mut conn = self.pool.acquire().await.map_err(query_err)?;
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM deployments WHERE id = $1)")
                .bind(id.to_string())
                .fetch_one(&mut *conn)
                .await
                .map_err(query_err)?;
        if !exists {
            return Ok(None);
        }

        let rows: Vec<AuditEventRow> = sqlx::query_as(
            r#"
            SELECT deployment_id, seq, level, event_type, message, occurred_at,
                   correlation_id, instance_id, details
            FROM deployment_audit_events
            WHERE deployment_id = $1
            ORDER BY seq
            "#,
        )
        .bind(id.to_string())
        .fetch_all(&mut *conn)
        .await
        .map_err(query_err)?;

        rows.into_iter()
            .map(AuditEventRow::into_event)
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    async fn stalled_instances(
        &self,
        unqueued_before: DateTime<Utc>,
        lease_cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Instance>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(query_err)?;
        let rows: Vec<InstanceRow> = sqlx::query_as(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM deployment_instances \
             WHERE status = 'CREATING' \
               AND ((job_id IS NULL AND created_at < $1) \
                 OR (job_id IS NOT NULL AND updated_at < $2)) \
             ORDER BY created_at, id LIMIT $3"
        ))
        .bind(unqueued_before)
        .bind(lease_cutoff)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *conn)
        .await
        .map_err(query_err)?;

        hydrate_instances(&mut *conn, rows).await
    }
}
