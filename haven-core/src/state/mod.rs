//! State management with SQLite persistence.
//!
//! The StateManager handles all local state for Haven:
//! - Stack records, statuses and last-applied hashes
//! - Provisioner output cache
//! - Encrypted secret bags
//! - Per-stack advisory leases

use crate::error::{HavenError, Result};
use crate::network::AddressPlan;
use crate::types::{StackId, StackKind, StackRecord, StackStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, instrument};

pub mod migrations;


/// Encrypted secret as stored in the `secrets` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSecret {
    pub name: String,
    /// Base64 nonce
    pub nonce: String,
    /// Base64 ciphertext with authentication tag
    pub ciphertext: String,
}

/// State manager for persistent storage.
#[derive(Clone)]
pub struct StateManager {
    pool: SqlitePool,
}

impl StateManager {
    /// Create a new StateManager with an in-memory database (for tests).
    pub async fn new_in_memory() -> Result<Self> {
        Self::new(":memory:").await
    }

    /// Get a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a new StateManager with a database at the specified path.
    #[instrument(skip(db_path))]
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        let in_memory = db_path == Path::new(":memory:");
        info!("Initializing state manager at {:?}", db_path);

        if !in_memory {
            if let Some(parent) = db_path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| HavenError::InvalidConfig {
                    reason: format!("Failed to create directory {}: {}", parent.display(), e),
                })?;
            }
        }

        let mut options = SqliteConnectOptions::from_str(db_path.to_str().ok_or_else(|| {
            HavenError::InvalidConfig { reason: "Invalid database path".to_string() }
        })?)
        .map_err(|e| HavenError::DatabaseError(e.to_string()))?;

        options = options
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .log_statements(tracing::log::LevelFilter::Debug);

        // A shared in-memory database lives only as long as one connection
        // stays open, so tests get a single pinned connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options = options.journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| HavenError::DatabaseError(e.to_string()))?;

        let manager = Self { pool };
        manager.run_migrations().await?;

        info!("State manager initialized successfully");
        Ok(manager)
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        migrations::run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    // ========================
    // Stack Operations
    // ========================

    /// Insert a stack record, or overwrite every mutable column of an existing one.
    #[instrument(skip(self, record), fields(stack_id = %record.id))]
    pub async fn upsert_stack(&self, record: &StackRecord) -> Result<()> {
        let address_plan = record.address_plan.as_ref().map(serialize_plan).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO stacks (id, context, name, kind, parent_id, status, applied_hash, address_plan, last_error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                applied_hash = excluded.applied_hash,
                address_plan = excluded.address_plan,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.id.as_str())
        .bind(&record.context)
        .bind(&record.name)
        .bind(record.kind.label())
        .bind(record.kind.parent().map(|p| p.as_str().to_string()))
        .bind(record.status.to_string())
        .bind(&record.applied_hash)
        .bind(address_plan)
        .bind(&record.last_error)
        .bind(to_secs(record.created_at))
        .bind(to_secs(record.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("upsert_stack", e))?;

        Ok(())
    }

    /// Get a stack record, if one was ever written.
    #[instrument(skip(self), fields(stack_id = %id))]
    pub async fn get_stack(&self, id: &StackId) -> Result<Option<StackRecord>> {
        let row = sqlx::query("SELECT * FROM stacks WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("get_stack", e))?;

        row.map(row_to_stack).transpose()
    }

    /// List every stack of a context, hub first.
    #[instrument(skip(self))]
    pub async fn list_stacks(&self, context: &str) -> Result<Vec<StackRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM stacks WHERE context = ? ORDER BY CASE kind WHEN 'hub' THEN 0 ELSE 1 END, name",
        )
        .bind(context)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list_stacks", e))?;

        rows.into_iter().map(row_to_stack).collect()
    }

    /// List the leaf stacks attached to a hub.
    #[instrument(skip(self), fields(hub_id = %hub_id))]
    pub async fn list_leaves(&self, hub_id: &StackId) -> Result<Vec<StackRecord>> {
        let rows = sqlx::query("SELECT * FROM stacks WHERE parent_id = ? ORDER BY name")
            .bind(hub_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("list_leaves", e))?;

        rows.into_iter().map(row_to_stack).collect()
    }

    /// Durably record a successful apply: status, hash, address plan and
    /// provisioner outputs change together.
    #[instrument(skip(self, plan, outputs), fields(stack_id = %id, outputs = outputs.len()))]
    pub async fn record_apply_success(
        &self,
        id: &StackId,
        applied_hash: &str,
        plan: &AddressPlan,
        outputs: &BTreeMap<String, String>,
    ) -> Result<()> {
        let plan_json = serialize_plan(plan)?;
        let mut tx = self.pool.begin().await.map_err(|e| db_error("record_apply_success", e))?;

        sqlx::query(
            r#"
            UPDATE stacks
            SET status = ?, applied_hash = ?, address_plan = ?, last_error = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(StackStatus::Applied.to_string())
        .bind(applied_hash)
        .bind(plan_json)
        .bind(to_secs(SystemTime::now()))
        .bind(id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("record_apply_success", e))?;

        sqlx::query("DELETE FROM stack_outputs WHERE stack_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("record_apply_success", e))?;

        for (key, value) in outputs {
            sqlx::query("INSERT INTO stack_outputs (stack_id, key, value) VALUES (?, ?, ?)")
                .bind(id.as_str())
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("record_apply_success", e))?;
        }

        tx.commit().await.map_err(|e| db_error("record_apply_success", e))?;
        debug!("Recorded successful apply");
        Ok(())
    }

    /// Mark a stack destroyed and drop its cached outputs.
    #[instrument(skip(self), fields(stack_id = %id))]
    pub async fn record_destroyed(&self, id: &StackId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| db_error("record_destroyed", e))?;

        sqlx::query(
            "UPDATE stacks SET status = ?, applied_hash = NULL, last_error = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(StackStatus::Destroyed.to_string())
        .bind(to_secs(SystemTime::now()))
        .bind(id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("record_destroyed", e))?;

        sqlx::query("DELETE FROM stack_outputs WHERE stack_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("record_destroyed", e))?;

        tx.commit().await.map_err(|e| db_error("record_destroyed", e))?;
        Ok(())
    }

    /// Cached outputs of the last successful apply.
    #[instrument(skip(self), fields(stack_id = %id))]
    pub async fn get_outputs(&self, id: &StackId) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM stack_outputs WHERE stack_id = ?")
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("get_outputs", e))?;

        Ok(rows.into_iter().map(|row| (row.get("key"), row.get("value"))).collect())
    }

    // ========================
    // Secret Operations
    // ========================

    /// Fetch one encrypted secret.
    #[instrument(skip(self), fields(stack_id = %stack_id))]
    pub async fn get_secret(&self, stack_id: &StackId, name: &str) -> Result<Option<StoredSecret>> {
        let row = sqlx::query("SELECT name, nonce, ciphertext FROM secrets WHERE stack_id = ? AND name = ?")
            .bind(stack_id.as_str())
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("get_secret", e))?;

        Ok(row.map(|row| StoredSecret {
            name: row.get("name"),
            nonce: row.get("nonce"),
            ciphertext: row.get("ciphertext"),
        }))
    }

    /// Insert secrets that do not exist yet. Existing values always win.
    ///
    /// Returns the number of rows actually written.
    #[instrument(skip(self, secrets), fields(stack_id = %stack_id, count = secrets.len()))]
    pub async fn insert_secrets(&self, stack_id: &StackId, secrets: &[StoredSecret]) -> Result<u64> {
        let now = to_secs(SystemTime::now());
        let mut tx = self.pool.begin().await.map_err(|e| db_error("insert_secrets", e))?;
        let mut written = 0;

        for secret in secrets {
            let result = sqlx::query(
                r#"
                INSERT INTO secrets (stack_id, name, nonce, ciphertext, created_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(stack_id, name) DO NOTHING
                "#,
            )
            .bind(stack_id.as_str())
            .bind(&secret.name)
            .bind(&secret.nonce)
            .bind(&secret.ciphertext)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("insert_secrets", e))?;
            written += result.rows_affected();
        }

        tx.commit().await.map_err(|e| db_error("insert_secrets", e))?;
        Ok(written)
    }

    /// Insert or replace one secret (rotation).
    #[instrument(skip(self, secret), fields(stack_id = %stack_id, name = %secret.name))]
    pub async fn replace_secret(&self, stack_id: &StackId, secret: &StoredSecret) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO secrets (stack_id, name, nonce, ciphertext, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(stack_id, name) DO UPDATE SET
                nonce = excluded.nonce,
                ciphertext = excluded.ciphertext,
                created_at = excluded.created_at
            "#,
        )
        .bind(stack_id.as_str())
        .bind(&secret.name)
        .bind(&secret.nonce)
        .bind(&secret.ciphertext)
        .bind(to_secs(SystemTime::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("replace_secret", e))?;

        Ok(())
    }

    /// Names of every secret held for a stack.
    #[instrument(skip(self), fields(stack_id = %stack_id))]
    pub async fn list_secret_names(&self, stack_id: &StackId) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT name FROM secrets WHERE stack_id = ? ORDER BY name")
            .bind(stack_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("list_secret_names", e))
    }

    // ========================
    // Lease Operations
    // ========================

    /// Try to take the exclusive advisory lease on a stack.
    ///
    /// Succeeds if no unexpired lease and no unexpired shared hold exist.
    /// Returns `false` without waiting otherwise.
    #[instrument(skip(self), fields(stack_id = %stack_id))]
    pub async fn try_acquire_lease(&self, stack_id: &StackId, holder: &str, ttl: Duration) -> Result<bool> {
        let now = to_secs(SystemTime::now());
        let expires_at = now.saturating_add(ttl.as_secs() as i64);

        let result = sqlx::query(
            r#"
            INSERT INTO stack_leases (stack_id, holder, acquired_at, expires_at)
            SELECT ?, ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM stack_holds WHERE stack_id = ? AND expires_at > ?
            )
            ON CONFLICT(stack_id) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE stack_leases.expires_at <= excluded.acquired_at
            "#,
        )
        .bind(stack_id.as_str())
        .bind(holder)
        .bind(now)
        .bind(expires_at)
        .bind(stack_id.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("try_acquire_lease", e))?;

        Ok(result.rows_affected() == 1)
    }

    /// Try to take a shared hold on a stack.
    ///
    /// Any number of holds may coexist. A hold is refused while an unexpired
    /// exclusive lease exists, and blocks new exclusive leases until released.
    #[instrument(skip(self), fields(stack_id = %stack_id))]
    pub async fn try_acquire_hold(&self, stack_id: &StackId, holder: &str, ttl: Duration) -> Result<bool> {
        let now = to_secs(SystemTime::now());
        let expires_at = now.saturating_add(ttl.as_secs() as i64);

        sqlx::query("DELETE FROM stack_holds WHERE stack_id = ? AND expires_at <= ?")
            .bind(stack_id.as_str())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("try_acquire_hold", e))?;

        let result = sqlx::query(
            r#"
            INSERT INTO stack_holds (stack_id, holder, acquired_at, expires_at)
            SELECT ?, ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM stack_leases WHERE stack_id = ? AND expires_at > ?
            )
            "#,
        )
        .bind(stack_id.as_str())
        .bind(holder)
        .bind(now)
        .bind(expires_at)
        .bind(stack_id.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("try_acquire_hold", e))?;

        Ok(result.rows_affected() == 1)
    }

    /// Release a shared hold.
    #[instrument(skip(self), fields(stack_id = %stack_id))]
    pub async fn release_hold(&self, stack_id: &StackId, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM stack_holds WHERE stack_id = ? AND holder = ?")
            .bind(stack_id.as_str())
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("release_hold", e))?;

        Ok(())
    }

    /// Release a lease if it is still held by `holder`.
    #[instrument(skip(self), fields(stack_id = %stack_id))]
    pub async fn release_lease(&self, stack_id: &StackId, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM stack_leases WHERE stack_id = ? AND holder = ?")
            .bind(stack_id.as_str())
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("release_lease", e))?;

        Ok(())
    }
}

fn db_error(operation: &'static str, e: sqlx::Error) -> HavenError {
    metrics::counter!("haven_db_errors_total", "operation" => operation).increment(1);
    HavenError::DatabaseError(format!("{}: {}", operation, e))
}

fn serialize_plan(plan: &AddressPlan) -> Result<String> {
    serde_json::to_string(plan)
        .map_err(|e| HavenError::DatabaseError(format!("Failed to serialize address plan: {}", e)))
}

fn to_secs(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn from_secs(secs: i64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

fn row_to_stack(row: sqlx::sqlite::SqliteRow) -> Result<StackRecord> {
    let id: String = row.get("id");

    let kind_str: String = row.get("kind");
    let parent_id: Option<String> = row.get("parent_id");
    let kind = match (kind_str.as_str(), parent_id) {
        ("hub", _) => StackKind::Hub,
        ("leaf", Some(parent)) => StackKind::Leaf(StackId::new(parent)),
        (other, _) => {
            return Err(HavenError::DatabaseError(format!(
                "Stack {} has unknown kind '{}' or no parent",
                id, other
            )))
        }
    };

    let status_str: String = row.get("status");
    let status = StackStatus::from_str(&status_str).map_err(HavenError::DatabaseError)?;

    let address_plan: Option<String> = row.get("address_plan");
    let address_plan = address_plan
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| HavenError::DatabaseError(format!("Failed to deserialize address plan: {}", e)))?;

    Ok(StackRecord {
        id: StackId::new(id),
        context: row.get("context"),
        name: row.get("name"),
        kind,
        status,
        applied_hash: row.get("applied_hash"),
        address_plan,
        last_error: row.get("last_error"),
        created_at: from_secs(row.get("created_at")),
        updated_at: from_secs(row.get("updated_at")),
    })
}
