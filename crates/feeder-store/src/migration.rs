//! Schema migration for the Postgres backend.
//!
//! The schema is two tables: the tuple-keyed row store and the durable
//! queue. Statements are idempotent so startup can always run them.

use feeder_core::{Error, Result};
use sqlx::PgPool;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS kv_entries (
        key        TEXT PRIMARY KEY,
        value      JSONB NOT NULL,
        version    BIGINT NOT NULL DEFAULT 1,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queue_messages (
        id           UUID PRIMARY KEY,
        payload      JSONB NOT NULL,
        tag          TEXT NOT NULL,
        dedup_key    TEXT,
        status       TEXT NOT NULL DEFAULT 'pending',
        attempts     INT NOT NULL DEFAULT 0,
        max_attempts INT NOT NULL DEFAULT 3,
        backoff_secs BIGINT[] NOT NULL DEFAULT '{}',
        last_error   TEXT,
        available_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        reserved_at  TIMESTAMPTZ,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS queue_messages_dispatch_idx
        ON queue_messages (status, available_at)
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS queue_messages_dedup_idx
        ON queue_messages (dedup_key)
        WHERE status IN ('pending', 'reserved') AND dedup_key IS NOT NULL
    "#,
];

/// Apply the schema.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| Error::storage_with_source("Migration failed", e))?;
    }
    tracing::info!("Database schema up to date");
    Ok(())
}
