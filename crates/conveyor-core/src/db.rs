//! Database access utilities

pub mod migrate;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::DatabaseConfig;
use crate::Result;

/// Create a PostgreSQL connection pool from configuration
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .acquire_timeout(config.connect_timeout())
        .connect(&config.url)
        .await?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_pool() {
        let config = DatabaseConfig::default();

        // Requires a local Postgres; skipped silently when unavailable
        if let Ok(pool) = create_pool(&config).await {
            let one: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await.unwrap();
            assert_eq!(one.0, 1);
        }
    }
}
