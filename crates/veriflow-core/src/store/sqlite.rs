//! SQLite-backed state store.
//!
//! Durable backend for single-host deployments. Change notifications are
//! served by an in-process channel; every writer in the process shares one
//! [`SqliteStore`], so subscribers see all transitions.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::broadcast;

use crate::error::StoreError;

use super::{StateStore, VersionedValue};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const CHANNEL_CAPACITY: usize = 256;

/// SQLite [`StateStore`] backend.
pub struct SqliteStore {
    pool: SqlitePool,
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl SqliteStore {
    /// Wrap an existing pool. Migrations must already have run.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Create and initialize a store from a database file path.
    ///
    /// Creates parent directories and the database file if needed, then
    /// runs migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("failed to create {parent:?}: {e}"))
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("connect {path:?}: {e}")))?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migrate: {e}")))?;

        Ok(Self::new(pool))
    }

    /// Drop expired rows. Called periodically by the supervisor.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?")
                .bind(Utc::now())
                .execute(&self.pool)
                .await
                .map_err(unavailable)?;
        Ok(result.rows_affected())
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        let mut channels = self.channels.lock().expect("channel map poisoned");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn expiry(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    ttl.and_then(|ttl| {
        chrono::TimeDelta::from_std(ttl)
            .ok()
            .map(|delta| Utc::now() + delta)
    })
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StoreError> {
        let row: Option<(i64, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT version, value FROM kv
            WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(key)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(row.map(|(version, value)| VersionedValue {
            version: version as u64,
            value,
        }))
    }

    async fn put(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let expires_at = expiry(ttl);
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let current: Option<(i64, Option<DateTime<Utc>>)> =
            sqlx::query_as("SELECT version, expires_at FROM kv WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(unavailable)?;

        let live_version = current.and_then(|(version, exp)| match exp {
            Some(exp) if exp <= now => None,
            _ => Some(version as u64),
        });
        let version = live_version.map(|v| v + 1).unwrap_or(1);

        sqlx::query(
            r#"
            INSERT INTO kv (key, version, value, expires_at) VALUES (?, ?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                version = excluded.version,
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(version as i64)
        .bind(value)
        .bind(expires_at)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;
        Ok(version)
    }

    async fn cas(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let expires_at = expiry(ttl);
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let current: Option<(i64, Option<DateTime<Utc>>)> =
            sqlx::query_as("SELECT version, expires_at FROM kv WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(unavailable)?;

        let live_version = current.and_then(|(version, exp)| match exp {
            Some(exp) if exp <= now => None,
            _ => Some(version as u64),
        });

        let matches = match (expected, live_version) {
            (None, None) => true,
            (Some(e), Some(v)) => e == v,
            _ => false,
        };
        if !matches {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
            });
        }

        let version = live_version.map(|v| v + 1).unwrap_or(1);
        sqlx::query(
            r#"
            INSERT INTO kv (key, version, value, expires_at) VALUES (?, ?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                version = excluded.version,
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(version as i64)
        .bind(value)
        .bind(expires_at)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;
        Ok(version)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedValue)>, StoreError> {
        // escape LIKE metacharacters in the prefix
        let pattern = format!(
            "{}%",
            prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
        );
        let rows: Vec<(String, i64, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT key, version, value FROM kv
            WHERE key LIKE ? ESCAPE '\'
              AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY key
            "#,
        )
        .bind(pattern)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(rows
            .into_iter()
            .map(|(key, version, value)| {
                (
                    key,
                    VersionedValue {
                        version: version as u64,
                        value,
                    },
                )
            })
            .collect())
    }

    async fn publish(&self, channel: &str, message: &[u8]) -> Result<(), StoreError> {
        let _ = self.sender(channel).send(message.to_vec());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Vec<u8>>, StoreError> {
        Ok(self.sender(channel).subscribe())
    }
}
