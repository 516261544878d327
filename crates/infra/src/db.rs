//! Postgres connection pools and schema.

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tracing::info;

/// Authoritative store + event log.
const WRITE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS products (
    id              UUID PRIMARY KEY,
    name            TEXT NOT NULL UNIQUE,
    description     TEXT NOT NULL DEFAULT '',
    price           BIGINT NOT NULL CHECK (price >= 0),
    stock_quantity  BIGINT NOT NULL CHECK (stock_quantity >= 0),
    version         BIGINT NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    event_id        UUID PRIMARY KEY,
    aggregate_id    UUID NOT NULL,
    aggregate_type  TEXT NOT NULL,
    version         BIGINT NOT NULL CHECK (version > 0),
    event_type      TEXT NOT NULL,
    payload         JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL,
    CONSTRAINT events_stream_version_key UNIQUE (aggregate_id, version)
);

CREATE INDEX IF NOT EXISTS events_replay_order_idx
    ON events (created_at, aggregate_id, version);
"#;

/// Read model + projection checkpoints.
const READ_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS product_reads (
    product_id      UUID PRIMARY KEY,
    name            TEXT NOT NULL,
    description     TEXT NOT NULL DEFAULT '',
    price           BIGINT NOT NULL,
    stock_quantity  BIGINT NOT NULL,
    version         BIGINT NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS projection_checkpoints (
    aggregate_id    UUID PRIMARY KEY,
    version         BIGINT NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

/// Open a pool. `statement_timeout` bounds every statement server-side,
/// including the commit, which the command processor does not time itself.
pub async fn connect(
    url: &str,
    max_connections: u32,
    statement_timeout: Duration,
) -> Result<PgPool, sqlx::Error> {
    let options = PgConnectOptions::from_str(url)?.options([(
        "statement_timeout",
        statement_timeout.as_millis().to_string(),
    )]);

    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(statement_timeout)
        .connect_with(options)
        .await
}

pub async fn migrate_write(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(WRITE_SCHEMA).execute(pool).await?;
    info!("write schema ready");
    Ok(())
}

pub async fn migrate_read(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(READ_SCHEMA).execute(pool).await?;
    info!("read schema ready");
    Ok(())
}

/// SQLSTATE 23505.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

/// Errors that describe undecodable data rather than an unreachable server.
pub(crate) fn is_decode_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_)
    )
}
