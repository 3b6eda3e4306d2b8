use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use gateway::SideEffectApplier;
use serde_json::{Map, Value};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite, SqliteConnection,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::domain::{
    is_switch_value, DeviceId, HistoryEntry, NUMERIC_FIELDS, SWITCH_FIELDS, SYSTEM_TARGET,
};

pub const HISTORY_PAGE_SIZE: u32 = 15;
const INITIAL_NUMERIC_VALUE: i64 = 5;

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to `sqlite::memory:` opens its own empty database.
        let max_connections = if is_in_memory(database_url) { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Registers a device identity with every service switched off. Returns
    /// false if the identity already existed.
    pub async fn register_device(&self, device_id: &DeviceId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO devices (device_id) VALUES (?) ON CONFLICT(device_id) DO NOTHING",
        )
        .bind(device_id.as_str())
        .execute(&mut *tx)
        .await
        .context("failed to insert device")?
        .rows_affected()
            > 0;

        if inserted {
            let now = Utc::now();
            for field in SWITCH_FIELDS {
                upsert_field(&mut *tx, device_id, field, "off", now).await?;
            }
            for field in NUMERIC_FIELDS {
                let initial = INITIAL_NUMERIC_VALUE.to_string();
                upsert_field(&mut *tx, device_id, field, &initial, now).await?;
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn device_exists(&self, device_id: &DeviceId) -> Result<bool> {
        let found: Option<String> =
            sqlx::query_scalar("SELECT device_id FROM devices WHERE device_id = ?")
                .bind(device_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    /// Current service fields for a device; numeric fields come back as JSON
    /// numbers, everything else as strings.
    pub async fn services_status(
        &self,
        device_id: &DeviceId,
    ) -> Result<Option<Map<String, Value>>> {
        if !self.device_exists(device_id).await? {
            return Ok(None);
        }

        let rows = sqlx::query(
            "SELECT field, value FROM service_status WHERE device_id = ? ORDER BY field",
        )
        .bind(device_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut status = Map::new();
        for row in rows {
            let field: String = row.get("field");
            let value: String = row.get("value");
            let value = match value.parse::<i64>() {
                Ok(number) if NUMERIC_FIELDS.contains(&field.as_str()) => Value::from(number),
                _ => Value::from(value),
            };
            status.insert(field, value);
        }
        Ok(Some(status))
    }

    /// Persists an acknowledged command and its history entry atomically.
    ///
    /// `system` flips every service switch. For other targets a non-switch
    /// value sent to the air conditioner or headlight is a setpoint and lands
    /// in the matching numeric field.
    pub async fn apply_command(
        &self,
        device_id: &DeviceId,
        target: &str,
        value: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        if target == SYSTEM_TARGET {
            set_all_switches(&mut *tx, device_id, value == "on", now).await?;
            append_history(&mut *tx, device_id, SYSTEM_TARGET, value, now).await?;
        } else {
            let field = written_field(target, value);
            if NUMERIC_FIELDS.contains(&field) && value.parse::<i64>().is_err() {
                bail!("value '{value}' for '{field}' is not an integer");
            }
            upsert_field(&mut *tx, device_id, field, value, now).await?;
            append_history(&mut *tx, device_id, field, value, now).await?;
        }

        tx.commit().await.context("failed to commit command result")?;
        debug!(%device_id, target, value, "command result persisted");
        Ok(())
    }

    /// Switches every service off and records it, in one transaction.
    pub async fn record_offline(&self, device_id: &DeviceId) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        set_all_switches(&mut *tx, device_id, false, now).await?;
        append_history(&mut *tx, device_id, SYSTEM_TARGET, "off", now).await?;
        tx.commit().await.context("failed to commit disconnect")?;
        Ok(())
    }

    /// Most recent history entries, newest first.
    pub async fn list_action_history(
        &self,
        device_id: &DeviceId,
        limit: u32,
    ) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            "SELECT service_type, description, created_at FROM action_history
             WHERE device_id = ?
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(device_id.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<HistoryEntry> {
                let created_at: DateTime<Utc> = row.try_get("created_at")?;
                Ok(HistoryEntry {
                    service_type: row.try_get("service_type")?,
                    description: row.try_get("description")?,
                    timestamp: created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                })
            })
            .collect()
    }
}

#[async_trait]
impl SideEffectApplier for Storage {
    async fn apply(&self, device_id: &DeviceId, target: &str, value: &str) -> Result<()> {
        self.apply_command(device_id, target, value).await
    }

    async fn mark_offline(&self, device_id: &DeviceId) -> Result<()> {
        self.record_offline(device_id).await
    }
}

fn written_field<'a>(target: &'a str, value: &str) -> &'a str {
    if is_switch_value(value) {
        return target;
    }
    match target {
        "air_cond_service" => "air_cond_temp",
        "headlight_service" => "headlight_brightness",
        _ => target,
    }
}

async fn set_all_switches(
    conn: &mut SqliteConnection,
    device_id: &DeviceId,
    on: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    let state = if on { "on" } else { "off" };
    for field in SWITCH_FIELDS {
        upsert_field(conn, device_id, field, state, now).await?;
    }
    Ok(())
}

async fn upsert_field(
    conn: &mut SqliteConnection,
    device_id: &DeviceId,
    field: &str,
    value: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO service_status (device_id, field, value, updated_at) VALUES (?, ?, ?, ?)
         ON CONFLICT(device_id, field) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(device_id.as_str())
    .bind(field)
    .bind(value)
    .bind(now)
    .execute(conn)
    .await
    .with_context(|| format!("failed to update '{field}' for device '{device_id}'"))?;
    Ok(())
}

async fn append_history(
    conn: &mut SqliteConnection,
    device_id: &DeviceId,
    service_type: &str,
    value: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO action_history (device_id, service_type, description, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(device_id.as_str())
    .bind(service_type)
    .bind(format!("{service_type} set to {value}"))
    .bind(now)
    .execute(conn)
    .await
    .with_context(|| format!("failed to append history for device '{device_id}'"))?;
    Ok(())
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_in_memory(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
