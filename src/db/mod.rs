//! PostgreSQL pool and schema migrations

pub mod queries;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const MAX_CONNECTIONS: u32 = 10;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    info!("Connected to PostgreSQL");

    Ok(pool)
}

/// Apply pending migrations.
///
/// Stored checksums that differ from the embedded ones (the same file checked
/// out with other line endings) are rewritten first, so `run` does not refuse
/// an already applied migration.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("Running database migrations...");

    let stored = applied_checksums(pool).await?;
    for version in stale_checksums(&MIGRATOR, &stored) {
        if let Some(migration) = MIGRATOR.iter().find(|m| m.version == version) {
            warn!(
                "Migration {} ({}) checksum mismatch, updating stored checksum",
                migration.version, migration.description
            );
            sqlx::query("UPDATE _sqlx_migrations SET checksum = $1 WHERE version = $2")
                .bind(&*migration.checksum)
                .bind(migration.version)
                .execute(pool)
                .await?;
        }
    }

    MIGRATOR.run(pool).await.context("Failed to apply migrations")?;

    info!("Database migrations complete");
    Ok(())
}

/// Checksums of applied migrations, empty on a fresh database
async fn applied_checksums(pool: &PgPool) -> Result<HashMap<i64, Vec<u8>>> {
    let table_exists: bool = sqlx::query_scalar("SELECT to_regclass('_sqlx_migrations') IS NOT NULL")
        .fetch_one(pool)
        .await?;
    if !table_exists {
        return Ok(HashMap::new());
    }

    let rows: Vec<(i64, Vec<u8>)> = sqlx::query_as("SELECT version, checksum FROM _sqlx_migrations")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().collect())
}

/// Applied up-migrations whose stored checksum no longer matches the binary
fn stale_checksums(migrator: &Migrator, stored: &HashMap<i64, Vec<u8>>) -> Vec<i64> {
    migrator
        .iter()
        .filter(|m| !m.migration_type.is_down_migration())
        .filter(|m| matches!(stored.get(&m.version), Some(checksum) if checksum.as_slice() != &*m.checksum))
        .map(|m| m.version)
        .collect()
}
