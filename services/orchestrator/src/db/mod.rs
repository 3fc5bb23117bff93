//! Postgres backend: pool, migrations, the deployment store and the roster
//! directory. Queries are plain runtime SQL.

mod deployments;
mod directory;
mod error;

pub use deployments::PgDeploymentStore;
pub use directory::PgCourseDirectory;
pub use error::DbError;

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

/// Connection settings for the Postgres pool.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Idle connections kept open.
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/labfleet".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(10 * 60),
            max_lifetime: Duration::from_secs(30 * 60),
        }
    }
}

impl DbConfig {
    fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections.min(self.max_connections))
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(Some(self.idle_timeout))
            .max_lifetime(Some(self.max_lifetime))
    }
}

/// Where `run_migrations` looks, in order: the working directory (repo root
/// or crate dir), then the crate manifest.
fn migration_dirs() -> [PathBuf; 3] {
    [
        PathBuf::from("migrations"),
        PathBuf::from("services/orchestrator/migrations"),
        Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations"),
    ]
}

/// Shared pool handle. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        let pool = config
            .pool_options()
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;
        info!(
            max_connections = config.max_connections,
            "Connected to Postgres"
        );
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        let _: i32 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let dirs = migration_dirs();
        let mut last_error = None;

        for dir in &dirs {
            let migrator = match Migrator::new(dir.clone()).await {
                Ok(migrator) => migrator,
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "No migrations here");
                    last_error = Some(e);
                    continue;
                }
            };
            migrator.run(&self.pool).await.map_err(DbError::Migration)?;
            info!(dir = %dir.display(), "Migrations applied");
            return Ok(());
        }

        Err(DbError::MigrationDirNotFound {
            tried: dirs
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            last_error: last_error.map_or_else(|| "none".to_string(), |e| e.to_string()),
        })
    }

    pub fn deployment_store(&self) -> PgDeploymentStore {
        PgDeploymentStore::new(self.pool.clone())
    }

    pub fn course_directory(&self) -> PgCourseDirectory {
        PgCourseDirectory::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_local_labfleet() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert!(config.database_url.ends_with("/labfleet"));
    }

    #[test]
    fn migration_dirs_end_with_the_manifest_dir() {
        let dirs = migration_dirs();
        assert!(dirs[2].ends_with("migrations"));
        assert!(dirs[2].is_absolute());
    }
}
