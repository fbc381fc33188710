//! Persisted registry of log targets.
//!
//! One row per target in the `log_targets` table. Every write is
//! validated first; a row that fails validation is never stored.

use crate::error::StoreError;
use crate::settings::{legacy_targets, SettingsReader};
use crate::target::{validate, TargetConfig};
use chrono::Utc;
use sqlx::sqlite::{Sqlite, SqlitePool, SqliteRow};
use sqlx::{Executor, Row, Transaction};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS log_targets (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL UNIQUE,
    type            TEXT NOT NULL,
    enabled         INTEGER NOT NULL DEFAULT 1,
    protocol        TEXT,
    host            TEXT,
    port            INTEGER,
    tag             TEXT,
    format          TEXT,
    tls_enabled     INTEGER NOT NULL DEFAULT 0,
    tls_cert        TEXT,
    tls_key         TEXT,
    tls_ca          TEXT,
    tls_skip_verify INTEGER NOT NULL DEFAULT 0,
    url             TEXT,
    auth_token      TEXT,
    batch_size      INTEGER,
    flush_interval  INTEGER,
    filter_level    TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
)
"#;

const COLUMNS: &str = "id, name, type, enabled, protocol, host, port, tag, format, \
    tls_enabled, tls_cert, tls_key, tls_ca, tls_skip_verify, url, auth_token, \
    batch_size, flush_interval, filter_level, created_at, updated_at";

/// CRUD access to [`TargetConfig`] rows.
#[derive(Clone, Debug)]
pub struct TargetStore {
    pool: SqlitePool,
}

impl TargetStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `log_targets` table if it does not exist yet.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<TargetConfig>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {} FROM log_targets ORDER BY name", COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_config).collect()
    }

    pub async fn list_enabled(&self) -> Result<Vec<TargetConfig>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM log_targets WHERE enabled = 1 ORDER BY name",
            COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_config).collect()
    }

    pub async fn get(&self, id: &str) -> Result<TargetConfig, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM log_targets WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        row_to_config(&row)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM log_targets")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Validate and insert a new target. Generates an id when none is set
    /// and stamps both timestamps. Returns the stored row.
    pub async fn create(&self, cfg: &TargetConfig) -> Result<TargetConfig, StoreError> {
        let cfg = prepare_new(cfg)?;
        insert_row(&self.pool, &cfg).await?;
        Ok(cfg)
    }

    /// Validate and overwrite an existing target. `createdAt` is kept,
    /// `updatedAt` is refreshed. Returns the stored row.
    pub async fn update(&self, cfg: &TargetConfig) -> Result<TargetConfig, StoreError> {
        validate(cfg)?;

        let mut cfg = cfg.clone();
        cfg.updated_at = Utc::now().timestamp();

        let result = sqlx::query(
            "UPDATE log_targets SET name = ?, type = ?, enabled = ?, protocol = ?, host = ?, port = ?, \
             tag = ?, format = ?, tls_enabled = ?, tls_cert = ?, tls_key = ?, tls_ca = ?, \
             tls_skip_verify = ?, url = ?, auth_token = ?, batch_size = ?, flush_interval = ?, \
             filter_level = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&cfg.name)
        .bind(&cfg.target_type)
        .bind(cfg.enabled)
        .bind(&cfg.protocol)
        .bind(&cfg.host)
        .bind(i64::from(cfg.port))
        .bind(&cfg.tag)
        .bind(&cfg.format)
        .bind(cfg.tls_enabled)
        .bind(&cfg.tls_cert)
        .bind(&cfg.tls_key)
        .bind(&cfg.tls_ca)
        .bind(cfg.tls_skip_verify)
        .bind(&cfg.url)
        .bind(&cfg.auth_token)
        .bind(i64::from(cfg.batch_size))
        .bind(i64::from(cfg.flush_interval_seconds))
        .bind(&cfg.filter_level)
        .bind(cfg.updated_at)
        .bind(&cfg.id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &cfg.name))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(cfg.id));
        }
        self.get(&cfg.id).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM log_targets WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Copy enabled legacy single-target settings into new rows: at most
    /// one syslog and one http target. Not idempotent; running it twice
    /// fails on the duplicate names. See [`TargetStore::migrate_if_empty`].
    pub async fn migrate_from_legacy_settings(
        &self,
        settings: &dyn SettingsReader,
    ) -> Result<Vec<TargetConfig>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let migrated = migrate_legacy(&mut tx, settings).await?;
        tx.commit().await?;
        Ok(migrated)
    }

    /// Run the legacy migration only when the table has no rows. The
    /// emptiness check and the inserts share one transaction.
    pub async fn migrate_if_empty(
        &self,
        settings: &dyn SettingsReader,
    ) -> Result<Vec<TargetConfig>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM log_targets")
            .fetch_one(&mut *tx)
            .await?;
        if count > 0 {
            return Ok(Vec::new());
        }
        let migrated = migrate_legacy(&mut tx, settings).await?;
        tx.commit().await?;
        Ok(migrated)
    }
}

/// Insert every legacy target inside `tx`. Either all rows land or, once
/// the transaction is dropped uncommitted, none do.
async fn migrate_legacy(
    tx: &mut Transaction<'_, Sqlite>,
    settings: &dyn SettingsReader,
) -> Result<Vec<TargetConfig>, StoreError> {
    let mut migrated = Vec::new();
    for mut cfg in legacy_targets(settings) {
        cfg.id.clear();
        let cfg = prepare_new(&cfg)?;
        insert_row(&mut **tx, &cfg).await?;
        migrated.push(cfg);
    }
    Ok(migrated)
}

/// Validate and stamp a config for insertion; assigns an id when missing.
fn prepare_new(cfg: &TargetConfig) -> Result<TargetConfig, StoreError> {
    validate(cfg)?;

    let mut cfg = cfg.clone();
    if cfg.id.trim().is_empty() {
        cfg.id = uuid::Uuid::new_v4().to_string();
    }
    let now = Utc::now().timestamp();
    cfg.created_at = now;
    cfg.updated_at = now;
    Ok(cfg)
}

async fn insert_row<'e, E>(executor: E, cfg: &TargetConfig) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "INSERT INTO log_targets ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        COLUMNS
    );
    sqlx::query(&sql)
        .bind(&cfg.id)
        .bind(&cfg.name)
        .bind(&cfg.target_type)
        .bind(cfg.enabled)
        .bind(&cfg.protocol)
        .bind(&cfg.host)
        .bind(i64::from(cfg.port))
        .bind(&cfg.tag)
        .bind(&cfg.format)
        .bind(cfg.tls_enabled)
        .bind(&cfg.tls_cert)
        .bind(&cfg.tls_key)
        .bind(&cfg.tls_ca)
        .bind(cfg.tls_skip_verify)
        .bind(&cfg.url)
        .bind(&cfg.auth_token)
        .bind(i64::from(cfg.batch_size))
        .bind(i64::from(cfg.flush_interval_seconds))
        .bind(&cfg.filter_level)
        .bind(cfg.created_at)
        .bind(cfg.updated_at)
        .execute(executor)
        .await
        .map_err(|e| map_unique_violation(e, &cfg.name))?;
    Ok(())
}

fn map_unique_violation(err: sqlx::Error, name: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::DuplicateName(name.to_string()),
        _ => StoreError::Database(err),
    }
}

fn opt_text(row: &SqliteRow, column: &str) -> Result<String, StoreError> {
    Ok(row.try_get::<Option<String>, _>(column)?.unwrap_or_default())
}

fn opt_u32(row: &SqliteRow, column: &str) -> Result<u32, StoreError> {
    let value = row.try_get::<Option<i64>, _>(column)?.unwrap_or(0);
    Ok(u32::try_from(value).unwrap_or(0))
}

fn row_to_config(row: &SqliteRow) -> Result<TargetConfig, StoreError> {
    Ok(TargetConfig {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        target_type: row.try_get("type")?,
        enabled: row.try_get("enabled")?,
        protocol: opt_text(row, "protocol")?,
        host: opt_text(row, "host")?,
        port: opt_u32(row, "port")?,
        tag: opt_text(row, "tag")?,
        format: opt_text(row, "format")?,
        tls_enabled: row.try_get("tls_enabled")?,
        tls_cert: opt_text(row, "tls_cert")?,
        tls_key: opt_text(row, "tls_key")?,
        tls_ca: opt_text(row, "tls_ca")?,
        tls_skip_verify: row.try_get("tls_skip_verify")?,
        url: opt_text(row, "url")?,
        auth_token: opt_text(row, "auth_token")?,
        batch_size: opt_u32(row, "batch_size")?,
        flush_interval_seconds: opt_u32(row, "flush_interval")?,
        filter_level: row.try_get("filter_level")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
