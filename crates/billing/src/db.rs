//! Database pool and migrations

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::{BillingError, BillingResult};

/// Create the shared connection pool.
pub async fn create_pool(database_url: &str) -> BillingResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!("Database pool created");
    Ok(pool)
}

/// Run embedded migrations.
pub async fn run_migrations(pool: &PgPool) -> BillingResult<()> {
    sqlx::migrate!()
        .run(pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

    tracing::info!("Database migrations applied");
    Ok(())
}
