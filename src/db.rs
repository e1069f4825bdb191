use anyhow::Context;
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::AppConfig;

pub async fn connect(config: &AppConfig) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("connect to database")
}

/// Applies pending migrations; a failure is logged and startup continues.
pub async fn migrate(pool: &PgPool) {
    if let Err(e) = sqlx::migrate!("./migrations").run(pool).await {
        tracing::warn!(error = %e, "migration failed; continuing");
    }
}
