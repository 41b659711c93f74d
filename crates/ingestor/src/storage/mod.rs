//! Storage gateway over the relational store.
//!
//! Built on the sqlx `Any` driver so the same statements run against
//! PostgreSQL (production) and SQLite (tests, small deployments). All
//! statements use `$n` placeholders, which both backends accept. The one
//! behavioral difference between backends, the `version` column not
//! round-tripping through the non-Postgres insert path, is isolated
//! behind [`Dialect`].

use anyhow::{Context, Result};
use sqlx::any::{AnyPoolOptions, AnyQueryResult};
use sqlx::{Any, AnyPool, Transaction};
use std::path::Path;
use tracing::{debug, info};

pub mod blocks;
pub mod tether;

/// Store backend family, derived from the connection URL at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// PostgreSQL.
    Postgres,
    /// SQLite (and any other non-Postgres backend).
    Sqlite,
}

impl Dialect {
    /// Derive the dialect from a database URL.
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Dialect::Postgres
        } else {
            Dialect::Sqlite
        }
    }

    /// Whether the plain insert path persists the `version` column.
    /// When false, explicit `UPDATE ... SET version` passes are required
    /// after inserting blocks and transactions.
    pub fn insert_preserves_version(self) -> bool {
        matches!(self, Dialect::Postgres)
    }
}

/// Pooled handle on the relational store.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: AnyPool,
    dialect: Dialect,
}

/// Row counts and tip positions, for the status command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    /// Number of stored blocks.
    pub block_count: i64,
    /// Number of stored transactions.
    pub transaction_count: i64,
    /// Number of stored overlay transactions.
    pub omni_transaction_count: i64,
    /// Number of overlay address aggregates.
    pub tether_address_count: i64,
    /// Height of the stored tip, if any block is stored.
    pub tip_height: Option<i64>,
    /// Highest overlay transaction height, if any is stored.
    pub max_omni_height: Option<i64>,
}

impl Storage {
    /// Connect to the store at `url`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let dialect = Dialect::from_url(url);
        info!(%url, ?dialect, "connecting to store");

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .context("Failed to connect to database")?;

        Ok(Self { pool, dialect })
    }

    /// Connect to a SQLite store at a filesystem path, creating it if
    /// missing. Used by tests and small deployments.
    pub async fn connect_with_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        Self::connect(&url, 1).await
    }

    /// Create the schema if it does not exist yet. Idempotent.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("running store migrations");

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("migration statement failed: {}", statement))?;
        }

        debug!("store migrations complete");
        Ok(())
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Backend dialect of this store.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Open a store transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Any>> {
        self.pool
            .begin()
            .await
            .context("Failed to open store transaction")
    }

    /// Check that the store is responsive.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Store health check failed")?;
        Ok(())
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Row counts and tip positions.
    pub async fn stats(&self) -> Result<StorageStats> {
        let block_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM btc_block")
            .fetch_one(&self.pool)
            .await?;
        let transaction_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM btc_transaction")
            .fetch_one(&self.pool)
            .await?;
        let omni_transaction_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM btc_omni_transaction")
                .fetch_one(&self.pool)
                .await?;
        let tether_address_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM btc_tether_address")
                .fetch_one(&self.pool)
                .await?;
        let tip_height: Option<i64> = sqlx::query_scalar("SELECT MAX(height) FROM btc_block")
            .fetch_one(&self.pool)
            .await?;
        let max_omni_height: Option<i64> =
            sqlx::query_scalar("SELECT MAX(block_height) FROM btc_omni_transaction")
                .fetch_one(&self.pool)
                .await?;

        Ok(StorageStats {
            block_count,
            transaction_count,
            omni_transaction_count,
            tether_address_count,
            tip_height,
            max_omni_height,
        })
    }
}

/// Log the affected-row count of a write at debug level.
pub(crate) fn log_affected(what: &str, height: i64, result: &AnyQueryResult) {
    debug!(height, rows = result.rows_affected(), "{}", what);
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS btc_block (
        height BIGINT PRIMARY KEY,
        hash TEXT NOT NULL,
        previous_hash TEXT NOT NULL DEFAULT '',
        timestamp BIGINT NOT NULL DEFAULT 0,
        version BIGINT NOT NULL DEFAULT 0,
        miner TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS btc_transaction (
        tx_hash TEXT NOT NULL,
        block_height BIGINT NOT NULL,
        version BIGINT NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_btc_transaction_height ON btc_transaction (block_height)",
    r#"
    CREATE TABLE IF NOT EXISTS btc_vin (
        tx_hash TEXT NOT NULL,
        block_height BIGINT NOT NULL,
        prev_tx_hash TEXT NOT NULL DEFAULT '',
        prev_index BIGINT NOT NULL DEFAULT -1,
        address TEXT NOT NULL DEFAULT '',
        value BIGINT NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_btc_vin_height ON btc_vin (block_height)",
    "CREATE INDEX IF NOT EXISTS idx_btc_vin_prev ON btc_vin (prev_tx_hash, prev_index)",
    r#"
    CREATE TABLE IF NOT EXISTS btc_vout (
        tx_hash TEXT NOT NULL,
        idx BIGINT NOT NULL,
        block_height BIGINT NOT NULL,
        address TEXT NOT NULL DEFAULT '',
        value BIGINT NOT NULL DEFAULT 0,
        is_used BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (tx_hash, idx)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_btc_vout_height ON btc_vout (block_height)",
    r#"
    CREATE TABLE IF NOT EXISTS btc_address (
        address TEXT PRIMARY KEY,
        value BIGINT NOT NULL DEFAULT 0,
        coinbase_times BIGINT NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS btc_omni_transaction (
        tx_hash TEXT NOT NULL,
        block_height BIGINT NOT NULL,
        timestamp BIGINT NOT NULL DEFAULT 0,
        sending_address TEXT NOT NULL DEFAULT '',
        reference_address TEXT NOT NULL DEFAULT '',
        property_id BIGINT NOT NULL DEFAULT 0,
        amount TEXT NOT NULL DEFAULT '0',
        tx_type TEXT NOT NULL DEFAULT '',
        valid BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_btc_omni_height ON btc_omni_transaction (block_height)",
    r#"
    CREATE TABLE IF NOT EXISTS btc_tether_address (
        address TEXT PRIMARY KEY,
        birth_timestamp BIGINT NOT NULL DEFAULT 0,
        latest_tx_timestamp BIGINT NOT NULL DEFAULT 0,
        value TEXT NOT NULL DEFAULT '0'
    )
    "#,
];
