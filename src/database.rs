// Database connection, schema and transaction plumbing
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, Transaction};
use std::str::FromStr;
use tracing::info;

use crate::config::{Config, DatabaseConfig};
use crate::error::Result;

/// Base delay for retrying a transaction that lost a lock race
pub const BASE_RETRY_DELAY_MS: u64 = 10;

/// Run one operation as a single transaction.
///
/// Sets per-transaction statement/lock timeouts, bounds the whole body by the
/// configured wall-clock budget, commits on `Ok` and rolls back on `Err`.
/// Only `Conflict` errors are retried: an aborted attempt left no writes behind.
/// The body must be a single expression evaluating to `Result<T, EngineError>`.
macro_rules! with_locked_tx {
    ($pool:expr, $config:expr, $tx_var:ident, $body:block) => {{
        let mut attempt: u32 = 1;
        loop {
            let mut $tx_var = $pool.begin().await?;
            $crate::database::apply_tx_timeouts(&mut $tx_var, $config).await?;

            let result: $crate::error::Result<_> =
                match tokio::time::timeout($config.transaction_timeout(), async { $body }).await {
                    Ok(result) => result,
                    Err(_) => Err($crate::error::EngineError::Internal(
                        "transaction timed out".to_string(),
                    )),
                };

            match result {
                Ok(value) => {
                    $tx_var.commit().await?;
                    break Ok(value);
                }
                Err(e) => {
                    $tx_var.rollback().await.ok();

                    let is_conflict = matches!(e, $crate::error::EngineError::Conflict(_));
                    if is_conflict && attempt < $config.market.max_retry_attempts {
                        // Exponential backoff with jitter
                        let jitter = rand::Rng::gen_range(&mut rand::thread_rng(), 0..10u64);
                        let delay_ms = $crate::database::BASE_RETRY_DELAY_MS * (1u64 << (attempt - 1)) + jitter;
                        tracing::warn!(attempt, delay_ms, error = %e, "retrying conflicted transaction");
                        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                        attempt += 1;
                        continue;
                    }
                    break Err(e);
                }
            }
        }
    }};
}

/// Schema, applied in order; every statement is idempotent.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id SERIAL PRIMARY KEY,
        username VARCHAR(20) UNIQUE NOT NULL,
        is_admin BOOLEAN NOT NULL DEFAULT FALSE,
        balance_cents BIGINT NOT NULL DEFAULT 0,
        last_allowance_ym INTEGER,
        last_allowance_cents BIGINT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT users_balance_non_negative CHECK (balance_cents >= 0)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS markets (
        id SERIAL PRIMARY KEY,
        title VARCHAR(120) NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        rules TEXT NOT NULL,
        closes_at TIMESTAMPTZ NOT NULL,
        resolves_at TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL DEFAULT 'OPEN' CHECK (status IN ('OPEN', 'CLOSED', 'RESOLVED')),
        outcome TEXT CHECK (outcome IN ('YES', 'NO')),
        b DOUBLE PRECISION NOT NULL CHECK (b > 0),
        q_yes DOUBLE PRECISION NOT NULL DEFAULT 0,
        q_no DOUBLE PRECISION NOT NULL DEFAULT 0,
        volume_cents BIGINT NOT NULL DEFAULT 0 CHECK (volume_cents >= 0),
        created_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        resolved_at TIMESTAMPTZ,
        CONSTRAINT markets_close_before_resolve CHECK (closes_at < resolves_at),
        CONSTRAINT markets_resolved_iff_outcome CHECK ((status = 'RESOLVED') = (outcome IS NOT NULL))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS market_involved_users (
        market_id INTEGER NOT NULL REFERENCES markets(id) ON DELETE CASCADE,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        ban TEXT NOT NULL DEFAULT 'NONE' CHECK (ban IN ('NONE', 'YES', 'NO', 'ALL')),
        PRIMARY KEY (market_id, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS positions (
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        market_id INTEGER NOT NULL REFERENCES markets(id) ON DELETE CASCADE,
        shares_yes DOUBLE PRECISION NOT NULL DEFAULT 0 CHECK (shares_yes >= 0),
        shares_no DOUBLE PRECISION NOT NULL DEFAULT 0 CHECK (shares_no >= 0),
        cost_cents_yes BIGINT NOT NULL DEFAULT 0,
        cost_cents_no BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (user_id, market_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trades (
        id BIGSERIAL PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        market_id INTEGER NOT NULL REFERENCES markets(id) ON DELETE CASCADE,
        side TEXT NOT NULL CHECK (side IN ('YES', 'NO')),
        delta_shares DOUBLE PRECISION NOT NULL,
        cost_cents BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger_entries (
        id BIGSERIAL PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        market_id INTEGER REFERENCES markets(id) ON DELETE SET NULL,
        type TEXT NOT NULL CHECK (type IN ('TRADE', 'PAYOUT', 'ALLOWANCE')),
        amount_cents BIGINT NOT NULL,
        ref_trade_id BIGINT REFERENCES trades(id) ON DELETE SET NULL,
        note TEXT NOT NULL DEFAULT '',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS suggestions (
        id SERIAL PRIMARY KEY,
        title VARCHAR(120) NOT NULL,
        details TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'PENDING' CHECK (status IN ('PENDING', 'USED', 'REJECTED')),
        created_by INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        market_id INTEGER REFERENCES markets(id) ON DELETE SET NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        used_at TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS positions_market_idx ON positions (market_id)",
    "CREATE INDEX IF NOT EXISTS trades_market_idx ON trades (market_id, created_at)",
    "CREATE INDEX IF NOT EXISTS ledger_user_idx ON ledger_entries (user_id, created_at)",
];

// Create a bounded connection pool; acquiring fails fast instead of queuing forever
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    info!(max_connections = config.max_connections, "connecting to PostgreSQL");
    let options = PgConnectOptions::from_str(&config.url)?;
    connect_with(config, options).await
}

pub async fn connect_with(config: &DatabaseConfig, options: PgConnectOptions) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout())
        .connect_with(options)
        .await?;

    info!("connected to database");
    Ok(pool)
}

/// Create tables and indexes if they do not exist yet.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = SCHEMA.len(), "schema ready");
    Ok(())
}

/// Bound statements and lock waits inside the current transaction.
pub async fn apply_tx_timeouts(tx: &mut Transaction<'_, Postgres>, config: &Config) -> Result<()> {
    let ms = config.database.transaction_timeout_ms;
    // SET cannot take bind parameters; `ms` is an integer from our own config
    sqlx::query(&format!("SET LOCAL statement_timeout = {}", ms))
        .execute(&mut **tx)
        .await?;
    sqlx::query(&format!("SET LOCAL lock_timeout = {}", ms))
        .execute(&mut **tx)
        .await?;
    Ok(())
}
