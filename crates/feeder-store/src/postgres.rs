//! Postgres backend.
//!
//! Rows live in a single `kv_entries` table keyed by the encoded tuple key,
//! queue messages in `queue_messages`. Atomic writes run inside one sqlx
//! transaction; dequeue uses `FOR UPDATE SKIP LOCKED` so multiple workers
//! never double-lease a message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feeder_core::config::DatabaseConfig;
use feeder_core::{Error, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

use crate::backend::{AtomicWrite, KvBackend, KvOp, QueueMessage, VersionedValue};
use crate::key::KvKey;
use crate::migration;

pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    /// Connect per the database configuration, running migrations when asked.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_max)
            .acquire_timeout(config.connect_timeout())
            .connect(&config.url)
            .await
            .map_err(|e| Error::storage_with_source("Failed to connect to database", e))?;

        if config.run_migrations {
            migration::migrate(&pool).await?;
        }

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn storage_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::storage_with_source(context, e)
}

#[async_trait]
impl KvBackend for PgBackend {
    async fn get(&self, key: &KvKey) -> Result<Option<VersionedValue>> {
        let row = sqlx::query("SELECT value, version FROM kv_entries WHERE key = $1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err("Failed to read key"))?;

        Ok(row.map(|r| VersionedValue {
            value: r.get("value"),
            version: r.get("version"),
        }))
    }

    async fn list_prefix(&self, prefix: &KvKey) -> Result<Vec<(String, VersionedValue)>> {
        // Keys never contain U+FFFF, so this half-open range covers exactly
        // the keys extending the prefix.
        let lower = prefix.as_str().to_string();
        let upper = format!("{lower}\u{ffff}");

        let rows = sqlx::query(
            "SELECT key, value, version FROM kv_entries WHERE key >= $1 AND key < $2 ORDER BY key",
        )
        .bind(&lower)
        .bind(&upper)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("Failed to scan prefix"))?;

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.get::<String, _>("key"),
                    VersionedValue {
                        value: r.get("value"),
                        version: r.get("version"),
                    },
                )
            })
            .collect())
    }

    async fn commit(&self, write: AtomicWrite) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(storage_err("Failed to open transaction"))?;

        for op in &write.ops {
            match op {
                KvOp::Create { key, value } => {
                    let result = sqlx::query(
                        "INSERT INTO kv_entries (key, value) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                    )
                    .bind(key.as_str())
                    .bind(value)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err("Failed to insert key"))?;

                    if result.rows_affected() == 0 {
                        return Err(Error::duplicate("kv_entry", key.to_string()));
                    }
                }
                KvOp::Put { key, value } => {
                    sqlx::query(
                        r#"
                        INSERT INTO kv_entries (key, value) VALUES ($1, $2)
                        ON CONFLICT (key) DO UPDATE
                        SET value = EXCLUDED.value,
                            version = kv_entries.version + 1,
                            updated_at = NOW()
                        "#,
                    )
                    .bind(key.as_str())
                    .bind(value)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err("Failed to upsert key"))?;
                }
                KvOp::Update {
                    key,
                    value,
                    expected_version,
                } => {
                    let result = sqlx::query(
                        r#"
                        UPDATE kv_entries
                        SET value = $2, version = version + 1, updated_at = NOW()
                        WHERE key = $1 AND version = $3
                        "#,
                    )
                    .bind(key.as_str())
                    .bind(value)
                    .bind(expected_version)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err("Failed to update key"))?;

                    if result.rows_affected() == 0 {
                        return Err(Error::conflict(key.to_string()));
                    }
                }
                KvOp::Delete { key } => {
                    sqlx::query("DELETE FROM kv_entries WHERE key = $1")
                        .bind(key.as_str())
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_err("Failed to delete key"))?;
                }
                KvOp::Check {
                    key,
                    expected_version,
                } => {
                    let row = sqlx::query("SELECT version FROM kv_entries WHERE key = $1")
                        .bind(key.as_str())
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(storage_err("Failed to check key"))?;

                    let actual: Option<i64> = row.map(|r| r.get("version"));
                    if actual != *expected_version {
                        return Err(Error::conflict(key.to_string()));
                    }
                }
            }
        }

        for enqueue in &write.enqueues {
            let payload = serde_json::to_value(&enqueue.message)?;
            let backoff: Vec<i64> = enqueue
                .message
                .backoff_schedule()
                .iter()
                .map(|s| *s as i64)
                .collect();

            // The partial unique index on dedup_key makes a second poll for
            // a feed with one already pending or in flight a no-op.
            sqlx::query(
                r#"
                INSERT INTO queue_messages
                    (id, payload, tag, dedup_key, max_attempts, backoff_secs, available_at)
                VALUES ($1, $2, $3, $4, $5, $6, NOW() + make_interval(secs => $7))
                ON CONFLICT (dedup_key)
                    WHERE status IN ('pending', 'reserved') AND dedup_key IS NOT NULL
                DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&payload)
            .bind(enqueue.message.tag())
            .bind(enqueue.message.dedup_key())
            .bind(enqueue.attempt_budget() as i32)
            .bind(&backoff)
            .bind(enqueue.delay.as_secs_f64())
            .execute(&mut *tx)
            .await
            .map_err(storage_err("Failed to enqueue message"))?;
        }

        tx.commit()
            .await
            .map_err(storage_err("Failed to commit transaction"))?;
        Ok(())
    }

    async fn queue_dequeue(&self) -> Result<Option<QueueMessage>> {
        let row = sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'reserved', reserved_at = NOW(), attempts = attempts + 1
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE status = 'pending' AND available_at <= NOW()
                ORDER BY available_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, payload, attempts, max_attempts, backoff_secs, created_at
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err("Failed to dequeue message"))?;

        let Some(row) = row else { return Ok(None) };

        let payload: serde_json::Value = row.get("payload");
        let payload = serde_json::from_value(payload)?;
        let backoff: Vec<i64> = row.get("backoff_secs");

        Ok(Some(QueueMessage {
            id: row.get("id"),
            payload,
            attempts: row.get::<i32, _>("attempts") as u32,
            max_attempts: row.get::<i32, _>("max_attempts") as u32,
            backoff_secs: backoff.into_iter().map(|s| s.max(0) as u64).collect(),
            enqueued_at: row.get::<DateTime<Utc>, _>("created_at"),
        }))
    }

    async fn queue_complete(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE queue_messages SET status = 'completed', reserved_at = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_err("Failed to complete message"))?;
        Ok(())
    }

    async fn queue_release(&self, id: Uuid, delay: Duration, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'pending', reserved_at = NULL, last_error = $2,
                available_at = NOW() + make_interval(secs => $3)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(storage_err("Failed to release message"))?;
        Ok(())
    }

    async fn queue_bury(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE queue_messages SET status = 'dead', reserved_at = NULL, last_error = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(storage_err("Failed to bury message"))?;
        Ok(())
    }

    async fn queue_release_stale(&self, visibility: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'pending', reserved_at = NULL
            WHERE status = 'reserved'
              AND reserved_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(visibility.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(storage_err("Failed to release stale messages"))?;

        if result.rows_affected() > 0 {
            tracing::info!(count = result.rows_affected(), "Released stale queue leases");
        }
        Ok(result.rows_affected())
    }

    async fn queue_pending_len(&self) -> Result<u64> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM queue_messages WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(storage_err("Failed to count pending messages"))?;
        Ok(row.get::<i64, _>("n") as u64)
    }
}
