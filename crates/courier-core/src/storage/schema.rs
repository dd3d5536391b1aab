//! Idempotent schema setup for the broker tables.
//!
//! Run once by the service binary at startup. Concurrent starts serialize on
//! a session advisory lock so two processes never race on DDL.
//!
//! History tables (`messages`, `deliveries`, `delivery_attempts`) carry no
//! foreign keys to `topics` or `subscriptions`: deleting configuration must
//! never delete history.

use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::Result;

/// Advisory lock key held while the schema is applied.
pub const SCHEMA_LOCK_ID: i64 = 42;

const STATEMENTS: &[(&str, &str)] = &[
    (
        "topics",
        r"
        CREATE TABLE IF NOT EXISTS topics (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL CHECK (name <> ''),
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        ",
    ),
    (
        "subscriptions",
        r"
        CREATE TABLE IF NOT EXISTS subscriptions (
            id UUID PRIMARY KEY,
            topic_id UUID NOT NULL REFERENCES topics(id) ON DELETE CASCADE,
            name TEXT NOT NULL CHECK (name <> ''),
            url TEXT NOT NULL,
            secret_token TEXT NOT NULL,
            max_delivery_attempts INTEGER NOT NULL CHECK (max_delivery_attempts >= 1),
            delivery_attempt_delay_ms BIGINT NOT NULL
                CHECK (delivery_attempt_delay_ms BETWEEN 1 AND 86400000),
            delivery_attempt_timeout_ms BIGINT NOT NULL
                CHECK (delivery_attempt_timeout_ms BETWEEN 1 AND 86400000),
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        ",
    ),
    (
        "subscriptions topic index",
        "CREATE INDEX IF NOT EXISTS idx_subscriptions_topic \
         ON subscriptions (topic_id, created_at)",
    ),
    (
        "messages",
        r"
        CREATE TABLE IF NOT EXISTS messages (
            id UUID PRIMARY KEY,
            topic_id UUID NOT NULL,
            content_type TEXT NOT NULL,
            payload BYTEA NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        ",
    ),
    (
        "messages topic index",
        "CREATE INDEX IF NOT EXISTS idx_messages_topic ON messages (topic_id, created_at)",
    ),
    (
        "deliveries",
        r"
        CREATE TABLE IF NOT EXISTS deliveries (
            id UUID PRIMARY KEY,
            message_id UUID NOT NULL,
            subscription_id UUID NOT NULL,
            url TEXT NOT NULL,
            secret_token TEXT NOT NULL,
            max_delivery_attempts INTEGER NOT NULL CHECK (max_delivery_attempts >= 1),
            delivery_attempt_delay_ms BIGINT NOT NULL
                CHECK (delivery_attempt_delay_ms BETWEEN 1 AND 86400000),
            delivery_attempt_timeout_ms BIGINT NOT NULL
                CHECK (delivery_attempt_timeout_ms BETWEEN 1 AND 86400000),
            status TEXT NOT NULL CHECK (status IN ('pending', 'success', 'failed')),
            attempt_count INTEGER NOT NULL DEFAULT 0,
            next_attempt_at TIMESTAMPTZ NOT NULL,
            claimed_by TEXT,
            claim_token UUID,
            claim_expires_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            UNIQUE (message_id, subscription_id),
            CHECK (attempt_count >= 0 AND attempt_count <= max_delivery_attempts)
        )
        ",
    ),
    (
        "deliveries due index",
        r"
        CREATE INDEX IF NOT EXISTS idx_deliveries_due
        ON deliveries (next_attempt_at, id)
        WHERE status = 'pending'
        ",
    ),
    (
        "deliveries subscription index",
        "CREATE INDEX IF NOT EXISTS idx_deliveries_subscription ON deliveries (subscription_id)",
    ),
    (
        "delivery_attempts",
        r"
        CREATE TABLE IF NOT EXISTS delivery_attempts (
            id UUID PRIMARY KEY,
            delivery_id UUID NOT NULL REFERENCES deliveries(id),
            attempt_number INTEGER NOT NULL CHECK (attempt_number >= 1),
            request TEXT NOT NULL,
            response TEXT NOT NULL,
            response_status_code INTEGER,
            execution_duration_ms BIGINT NOT NULL,
            success BOOLEAN NOT NULL,
            error TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            UNIQUE (delivery_id, attempt_number)
        )
        ",
    ),
];

/// Creates all tables and indexes that do not exist yet.
///
/// # Errors
///
/// Returns `CoreError::Database` if the lock cannot be taken or a statement
/// fails. A failed run can simply be retried.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    let mut conn = pool.acquire().await?;

    sqlx::query("SELECT pg_advisory_lock($1)").bind(SCHEMA_LOCK_ID).execute(&mut *conn).await?;

    let mut outcome: Result<()> = Ok(());
    for (name, statement) in STATEMENTS {
        debug!(object = name, "applying schema statement");
        if let Err(e) = sqlx::query(statement).execute(&mut *conn).await {
            outcome = Err(e.into());
            break;
        }
    }

    sqlx::query("SELECT pg_advisory_unlock($1)").bind(SCHEMA_LOCK_ID).execute(&mut *conn).await?;

    if outcome.is_ok() {
        info!(statements = STATEMENTS.len(), "database schema is up to date");
    }
    outcome
}
