//! Relational counter store backed by SQLite through sqlx.
//!
//! Every replica pointed at the same database shares one row per key. A hit
//! is a single `INSERT ... ON CONFLICT DO UPDATE ... RETURNING` statement, so
//! the restart-or-increment decision is made by the database inside one
//! statement and concurrent writers can never lose an increment.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info, trace};

use super::backend::{CounterBackend, Tier};
use super::counter::{WindowCounter, WindowLimit};
use crate::config::RelationalConfig;
use crate::error::{Result, WindowguardError};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS rate_limits (
    key TEXT PRIMARY KEY NOT NULL,
    count INTEGER NOT NULL,
    reset_at INTEGER NOT NULL
)";

// Binds: key, new reset_at, now, now, new reset_at.
// SET expressions see the pre-update row, so both CASEs branch on the same
// old reset_at.
const UPSERT_HIT: &str = "INSERT INTO rate_limits (key, count, reset_at) VALUES (?, 1, ?)
ON CONFLICT(key) DO UPDATE SET
    count = CASE WHEN rate_limits.reset_at <= ? THEN 1 ELSE rate_limits.count + 1 END,
    reset_at = CASE WHEN rate_limits.reset_at <= ? THEN ? ELSE rate_limits.reset_at END
RETURNING count, reset_at";

const SELECT_ONE: &str = "SELECT count, reset_at FROM rate_limits WHERE key = ?";

const DELETE_EXPIRED: &str = "DELETE FROM rate_limits WHERE reset_at <= ?";

/// Shared-database window counters.
#[derive(Debug, Clone)]
pub struct RelationalBackend {
    pool: SqlitePool,
}

impl RelationalBackend {
    /// Wrap an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Build a pool from configuration without connecting.
    ///
    /// Connections are opened on first use, so an unreachable database shows
    /// up as a per-call failure instead of a startup failure.
    pub fn connect_lazy(config: &RelationalConfig, url: &str) -> Result<Self> {
        let options = connect_options(url, config)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.busy_timeout_ms))
            .connect_lazy_with(options);
        Ok(Self::new(pool))
    }

    /// Build a pool from configuration and open a first connection.
    pub async fn connect(config: &RelationalConfig, url: &str) -> Result<Self> {
        let options = connect_options(url, config)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.busy_timeout_ms))
            .connect_with(options)
            .await
            .map_err(|e| WindowguardError::unavailable(Tier::Relational, e))?;
        Ok(Self::new(pool))
    }

    /// Create the counter table if it does not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| WindowguardError::unavailable(Tier::Relational, e))?;
        info!("Relational rate limit table ready");
        Ok(())
    }

    /// Read the stored row for `key` without applying a hit.
    pub async fn get(&self, key: &str) -> Result<Option<WindowCounter>> {
        let row: Option<(i64, i64)> = sqlx::query_as(SELECT_ONE)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| WindowguardError::unavailable(Tier::Relational, e))?;

        Ok(row.map(|(count, reset_at)| to_counter(key, count, reset_at)))
    }

    /// Delete rows whose window ended at or before `now_ms`.
    pub async fn purge_expired(&self, now_ms: i64) -> Result<u64> {
        let result = sqlx::query(DELETE_EXPIRED)
            .bind(now_ms)
            .execute(&self.pool)
            .await
            .map_err(|e| WindowguardError::unavailable(Tier::Relational, e))?;

        let purged = result.rows_affected();
        debug!(purged, "Purged expired relational counters");
        Ok(purged)
    }
}

fn connect_options(url: &str, config: &RelationalConfig) -> Result<SqliteConnectOptions> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(|e| WindowguardError::Config(format!("invalid relational url: {}", e)))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms));
    Ok(options)
}

fn to_counter(key: &str, count: i64, reset_at: i64) -> WindowCounter {
    WindowCounter {
        key: key.to_string(),
        count: count.max(0) as u64,
        reset_at_ms: reset_at,
    }
}

#[async_trait]
impl CounterBackend for RelationalBackend {
    fn tier(&self) -> Tier {
        Tier::Relational
    }

    async fn hit(&self, key: &str, limit: &WindowLimit, now_ms: i64) -> Result<WindowCounter> {
        let reset_at = WindowCounter::start(key, now_ms, limit).reset_at_ms;

        trace!(key = %key, now_ms, "Checking relational counter");

        let (count, stored_reset_at): (i64, i64) = sqlx::query_as(UPSERT_HIT)
            .bind(key)
            .bind(reset_at)
            .bind(now_ms)
            .bind(now_ms)
            .bind(reset_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| WindowguardError::unavailable(Tier::Relational, e))?;

        Ok(to_counter(key, count, stored_reset_at))
    }
}
