use anyhow::Context;
use sqlx::{migrate::Migrator, PgPool};

static SCHEMA: Migrator = sqlx::migrate!("./src/db/migrations");

/// Bring the users, documents, event log and version tables up to date.
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    SCHEMA.run(pool).await.context("relay schema migration failed")
}
