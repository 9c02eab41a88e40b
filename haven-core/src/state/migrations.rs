//! Database migrations.

use crate::error::{HavenError, Result};
use sqlx::SqlitePool;
use tracing::{info, instrument};

const SCHEMA_VERSION: i64 = 3;

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| HavenError::MigrationFailed { reason: e.to_string() })?;

    let current_version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(pool)
            .await
            .map_err(|e| HavenError::MigrationFailed { reason: e.to_string() })?;

    let current_version = current_version.unwrap_or(0);

    if current_version >= SCHEMA_VERSION {
        info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    info!("Migrating database from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        migrate_to_v1(pool).await?;
    }

    if current_version < 2 {
        migrate_to_v2(pool).await?;
    }

    if current_version < 3 {
        migrate_to_v3(pool).await?;
    }

    Ok(())
}

/// Current schema version recorded in the database.
pub async fn current_version(pool: &SqlitePool) -> Result<i64> {
    let version: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
        .fetch_optional(pool)
        .await
        .map_err(|e| HavenError::MigrationFailed { reason: e.to_string() })?;
    Ok(version.unwrap_or(0))
}

#[instrument(skip(pool))]
async fn migrate_to_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 1");

    // Stacks table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stacks (
            id TEXT PRIMARY KEY,
            context TEXT NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            parent_id TEXT,
            status TEXT NOT NULL,
            applied_hash TEXT,
            address_plan TEXT,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| HavenError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_stacks_context ON stacks(context)")
        .execute(pool)
        .await
        .map_err(|e| HavenError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_stacks_parent ON stacks(parent_id)")
        .execute(pool)
        .await
        .map_err(|e| HavenError::MigrationFailed { reason: e.to_string() })?;

    // Provisioner output cache
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stack_outputs (
            stack_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (stack_id, key),
            FOREIGN KEY (stack_id) REFERENCES stacks(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| HavenError::MigrationFailed { reason: e.to_string() })?;

    // Encrypted secrets
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS secrets (
            stack_id TEXT NOT NULL,
            name TEXT NOT NULL,
            nonce TEXT NOT NULL,
            ciphertext TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (stack_id, name)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| HavenError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("DELETE FROM schema_version")
        .execute(pool)
        .await
        .map_err(|e| HavenError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(1i64)
        .execute(pool)
        .await
        .map_err(|e| HavenError::MigrationFailed { reason: e.to_string() })?;

    info!("Migration to schema version 1 complete");
    Ok(())
}

#[instrument(skip(pool))]
async fn migrate_to_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 2");

    // Per-stack advisory leases
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stack_leases (
            stack_id TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| HavenError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("DELETE FROM schema_version")
        .execute(pool)
        .await
        .map_err(|e| HavenError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(2i64)
        .execute(pool)
        .await
        .map_err(|e| HavenError::MigrationFailed { reason: e.to_string() })?;

    info!("Migration to schema version 2 complete");
    Ok(())
}

#[instrument(skip(pool))]
async fn migrate_to_v3(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 3");

    // Shared holds, taken on a hub by leaf applies
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stack_holds (
            stack_id TEXT NOT NULL,
            holder TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            PRIMARY KEY (stack_id, holder)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| HavenError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("DELETE FROM schema_version")
        .execute(pool)
        .await
        .map_err(|e| HavenError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(3i64)
        .execute(pool)
        .await
        .map_err(|e| HavenError::MigrationFailed { reason: e.to_string() })?;

    info!("Migration to schema version 3 complete");
    Ok(())
}
