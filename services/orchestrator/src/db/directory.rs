//! Course directory over the roster tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labfleet_id::{CourseId, CourseMemberId, GroupId};
use sqlx::postgres::PgPool;
use sqlx::Row;

use super::DbError;
use crate::resolver::{CourseDirectory, CourseRoster, DirectoryError, RosterMember};

#[derive(Clone)]
pub struct PgCourseDirectory {
    pool: PgPool,
}

impl PgCourseDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert_course(&self, name: &str) -> Result<CourseId, DbError> {
        let course_id = CourseId::new();
        sqlx::query("INSERT INTO courses (id, name) VALUES ($1, $2)")
            .bind(course_id.to_string())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(course_id)
    }

    pub async fn insert_group(&self, course_id: CourseId, name: &str) -> Result<GroupId, DbError> {
        let group_id = GroupId::new();
        sqlx::query("INSERT INTO course_groups (id, course_id, name) VALUES ($1, $2, $3)")
            .bind(group_id.to_string())
            .bind(course_id.to_string())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(group_id)
    }

    pub async fn insert_member(&self, course_id: CourseId) -> Result<CourseMemberId, DbError> {
        let member_id = CourseMemberId::new();
        sqlx::query("INSERT INTO course_members (id, course_id) VALUES ($1, $2)")
            .bind(member_id.to_string())
            .bind(course_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(member_id)
    }

    /// Records that a member left the course. Returns false when no active
    /// member matched.
    pub async fn mark_member_left(
        &self,
        course_id: CourseId,
        member_id: CourseMemberId,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE course_members SET left_at = now() \
             WHERE id = $1 AND course_id = $2 AND left_at IS NULL",
        )
        .bind(member_id.to_string())
        .bind(course_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_roster(&self, course_id: CourseId) -> Result<Option<CourseRoster>, DbError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM courses WHERE id = $1)")
            .bind(course_id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::Query)?;
        if !exists {
            return Ok(None);
        }

        let bad = DbError::corrupt("course_groups");
        let groups = sqlx::query(
            "SELECT id FROM course_groups WHERE course_id = $1 ORDER BY created_at, id",
        )
        .bind(course_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?
        .iter()
        .map(|row| {
            let id: String = row.try_get("id").map_err(DbError::Query)?;
            id.parse::<GroupId>().map_err(|e| bad(e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

        let bad = DbError::corrupt("course_members");
        let members = sqlx::query(
            "SELECT id, left_at FROM course_members WHERE course_id = $1 ORDER BY joined_at, id",
        )
        .bind(course_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?
        .iter()
        .map(|row| {
            let id: String = row.try_get("id").map_err(DbError::Query)?;
            let left_at: Option<DateTime<Utc>> = row.try_get("left_at").map_err(DbError::Query)?;
            Ok(RosterMember {
                id: id.parse::<CourseMemberId>().map_err(|e| bad(e.to_string()))?,
                left_at,
            })
        })
        .collect::<Result<Vec<_>, DbError>>()?;

        Ok(Some(CourseRoster {
            course_id,
            groups,
            members,
        }))
    }
}

#[async_trait]
impl CourseDirectory for PgCourseDirectory {
    async fn roster(&self, course_id: CourseId) -> Result<Option<CourseRoster>, DirectoryError> {
        self.load_roster(course_id)
            .await
            .map_err(|e| DirectoryError(e.to_string()))
    }
}
