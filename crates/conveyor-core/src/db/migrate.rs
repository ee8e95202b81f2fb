//! Database migration system
//!
//! Runs schema migrations on startup and tracks applied versions in a
//! `_migrations` table.

use sqlx::{PgPool, Row};
use tracing::{error, info};

use crate::{Error, Result};

/// Migration record tracking applied migrations
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub applied_at: chrono::DateTime<chrono::Utc>,
}

/// Database migration manager
pub struct Migrator {
    pool: PgPool,
}

impl Migrator {
    /// Create a new migrator instance
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Initialize migration tracking table
    async fn init_migration_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    /// Get list of applied migrations
    async fn get_applied_migrations(&self) -> Result<Vec<Migration>> {
        let rows = sqlx::query(r#"SELECT version, name, applied_at FROM _migrations ORDER BY version"#)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let migrations = rows
            .into_iter()
            .map(|row| Migration {
                version: row.get("version"),
                name: row.get("name"),
                applied_at: row.get("applied_at"),
            })
            .collect();

        Ok(migrations)
    }

    /// Record a migration as applied
    async fn record_migration(&self, version: i64, name: &str) -> Result<()> {
        sqlx::query(r#"INSERT INTO _migrations (version, name) VALUES ($1, $2) ON CONFLICT DO NOTHING"#)
            .bind(version)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(())
    }

    /// Run all pending migrations
    pub async fn migrate(&self) -> Result<()> {
        self.init_migration_table().await?;

        let applied = self.get_applied_migrations().await?;

        let migrations = vec![
            (1, "jobs", include_str!("../../migrations/001_jobs.sql")),
            (
                2,
                "dead_letters",
                include_str!("../../migrations/002_dead_letters.sql"),
            ),
        ];

        for (version, name, sql) in migrations {
            if applied.iter().any(|m| m.version == version) {
                continue;
            }

            info!(version, name, "Applying migration");

            // Execute each migration as a single batch; the files contain
            // DO blocks that cannot be split on semicolons.
            sqlx::raw_sql(sql).execute(&self.pool).await.map_err(|e| {
                error!(version, error = %e, "Migration failed");
                Error::Database(e)
            })?;

            self.record_migration(version, name).await?;
        }

        info!("Migrations up to date");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::create_pool;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let config = DatabaseConfig::default();

        // Requires a local Postgres; skipped silently when unavailable
        if let Ok(pool) = create_pool(&config).await {
            let migrator = Migrator::new(pool);
            migrator.migrate().await.unwrap();
            // Second run must be a no-op
            migrator.migrate().await.unwrap();
        }
    }
}
