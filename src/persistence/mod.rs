//! Persistence Layer
//!
//! SQLite ledger storage for trades, positions, balances and account
//! snapshots, with async access via sqlx.
//!
//! # Database Schema
//!
//! ## Trades Table
//! - id: autoincrement
//! - symbol, quantity (unsigned), side: "buy" or "sell"
//! - requested_price, executed_price (NULL until filled)
//! - order_type: "market" or "limit", execution_style: "plain" or "pegged"
//! - status: "open", "filled", "cancelled", "stale"
//! - broker, broker_order_id (NULL until acknowledged), strategy
//! - timestamp, profit_loss, success
//! - replaces_trade_id, reprice_count: pegged repricing lineage
//!
//! ## Positions Table
//! - one row per (broker, strategy, symbol), quantity never negative
//! - latest_price, last_updated, underlying_symbol/price/volatility
//!
//! ## Balances Table
//! - append-only (broker, strategy, balance_type, amount, timestamp)
//!
//! ## Account Snapshots Table
//! - one current row per broker

pub mod models;
pub mod repository;

pub use repository::{LedgerStore, LedgerTx};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    /// A stored row no longer maps onto a domain value
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
}

/// Initialize the database connection pool with default settings
///
/// # Arguments
/// - `database_url`: SQLite URL (e.g., "sqlite://data/tradeledger.db" or "sqlite::memory:")
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    let config = DatabaseConfig {
        url: database_url.to_string(),
        ..DatabaseConfig::default()
    };
    init_database_with(&config).await
}

/// Initialize the database connection pool and run migrations
///
/// # Errors
/// Returns error if database connection fails or migrations fail
pub async fn init_database_with(config: &DatabaseConfig) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", config.url);

    let in_memory = config.url.contains(":memory:");

    if let Some(db_path) = config.url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
            })?;
        }
    }

    let mut options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .foreign_keys(true);
    options = if config.log_queries {
        options.log_statements(tracing::log::LevelFilter::Debug)
    } else {
        options.disable_statement_logging()
    };
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    // Every connection to "sqlite::memory:" opens its own database, so the
    // pool must hold exactly one connection for the lifetime of the process.
    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
    };

    let pool = pool_options.connect_with(options).await?;

    run_migrations(&pool).await?;

    info!("✓ Database initialized successfully");

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            symbol TEXT NOT NULL,
            quantity REAL NOT NULL CHECK(quantity > 0),
            side TEXT NOT NULL CHECK(side IN ('buy', 'sell')),
            requested_price REAL NOT NULL,
            executed_price REAL,
            order_type TEXT NOT NULL CHECK(order_type IN ('market', 'limit')),
            execution_style TEXT NOT NULL DEFAULT 'plain'
                CHECK(execution_style IN ('plain', 'pegged')),
            status TEXT NOT NULL CHECK(status IN ('open', 'filled', 'cancelled', 'stale')),
            broker TEXT NOT NULL,
            broker_order_id TEXT,
            strategy TEXT NOT NULL,
            timestamp DATETIME NOT NULL,
            profit_loss REAL,
            success BOOLEAN,
            replaces_trade_id INTEGER REFERENCES trades(id),
            reprice_count INTEGER NOT NULL DEFAULT 0,
            CHECK((status = 'filled') = (executed_price IS NOT NULL))
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create trades table: {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            broker TEXT NOT NULL,
            strategy TEXT NOT NULL,
            symbol TEXT NOT NULL,
            quantity REAL NOT NULL CHECK(quantity >= 0),
            latest_price REAL NOT NULL DEFAULT 0.0,
            last_updated DATETIME NOT NULL,
            underlying_symbol TEXT,
            underlying_latest_price REAL,
            underlying_volatility REAL,
            UNIQUE(broker, strategy, symbol)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!("Failed to create positions table: {}", e))
    })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS balances (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            broker TEXT NOT NULL,
            strategy TEXT NOT NULL,
            balance_type TEXT NOT NULL CHECK(balance_type IN ('cash', 'positions', 'total')),
            amount REAL NOT NULL,
            timestamp DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!("Failed to create balances table: {}", e))
    })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS account_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            broker TEXT NOT NULL UNIQUE,
            buying_power REAL NOT NULL,
            cash REAL NOT NULL,
            total_value REAL NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!("Failed to create account_snapshots table: {}", e))
    })?;

    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_trades_broker_status ON trades(broker, status)",
        "CREATE INDEX IF NOT EXISTS idx_trades_strategy_symbol ON trades(broker, strategy, symbol)",
        "CREATE INDEX IF NOT EXISTS idx_positions_broker ON positions(broker)",
        "CREATE INDEX IF NOT EXISTS idx_balances_lookup ON balances(broker, strategy, balance_type)",
    ] {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;
    }

    info!("✓ Database migrations completed successfully");

    Ok(())
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://data/tradeledger.db")
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Enable query logging
    pub log_queries: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/tradeledger.db".to_string(),
            max_connections: 5,
            log_queries: cfg!(debug_assertions),
        }
    }
}

impl DatabaseConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://data/tradeledger.db".to_string());

        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let log_queries = std::env::var("DATABASE_LOG_QUERIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(cfg!(debug_assertions));

        Self {
            url,
            max_connections,
            log_queries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_init() {
        let pool = init_database("sqlite::memory:").await;
        assert!(pool.is_ok());
    }

    #[tokio::test]
    async fn test_migrations() {
        let pool = init_database("sqlite::memory:").await.unwrap();

        let result: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('trades', 'positions', 'balances', 'account_snapshots')"
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(result.0, 4);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        assert!(run_migrations(&pool).await.is_ok());
    }

    #[tokio::test]
    async fn test_filled_requires_executed_price() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let result = sqlx::query(
            r#"
            INSERT INTO trades (symbol, quantity, side, requested_price, order_type,
                                status, broker, strategy, timestamp)
            VALUES ('AAPL', 1, 'buy', 10.0, 'limit', 'filled', 'paper', 'momentum', '2024-01-01T00:00:00Z')
            "#,
        )
        .execute(&pool)
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_database_config_default() {
        let config = DatabaseConfig::default();
        assert_eq!(config.url, "sqlite://data/tradeledger.db");
        assert_eq!(config.max_connections, 5);
    }
}
