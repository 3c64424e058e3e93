//! Persistence Layer
//!
//! SQLite storage for the capital ledger, plans, live trades, their archive,
//! the realized PnL ledger and the order audit trail.
//!
//! # Tables
//!
//! - `settings`: risk profile singleton (`id = 1`) and the available swing capital counter
//! - `swing_plans`: trade intents and their lifecycle status
//! - `watchlist`: scanner watchlist rows per scan date
//! - `trades`: live OPEN/PARTIAL trades only; closed trades are deleted
//! - `trade_history`: one immutable row per fully closed trade
//! - `realized_pnl`: append-only exit ledger
//! - `order_audit`, `broker_trades`: one row per order attempt, one per broker outcome
//! - `missing_instruments`: symbol resolution misses per broker
//! - `run_state`: scheduler "already ran" markers
//!
//! File databases use WAL journaling so dashboard readers never block the
//! scheduler's writes.

pub mod ledger;
pub mod models;
pub mod order_audit;
pub mod plan_repository;
pub mod run_state;
pub mod trade_store;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::domain::errors::StoreError;

/// Database connection pool
pub type DbPool = SqlitePool;

fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

/// Initialize the database connection pool and run migrations
///
/// In-memory databases are pinned to a single, never-recycled connection;
/// every pooled connection would otherwise see its own empty database.
pub async fn init_database(database_url: &str, max_connections: u32) -> Result<DbPool, StoreError> {
    info!("Initializing database: {}", database_url);

    let in_memory = is_in_memory(database_url);

    if !in_memory {
        if let Some(db_path) = database_url.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::Database(sqlx::Error::Configuration(Box::new(e)))
                    })?;
                }
            }
        }
    }

    let mut options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(max_connections.max(1))
    };

    let pool = pool_options.connect_with(options).await?;

    run_migrations(&pool).await?;

    info!("✓ Database initialized successfully");

    Ok(pool)
}

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "settings",
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            total_capital REAL NOT NULL,
            max_swing_capital REAL NOT NULL,
            per_trade_cap REAL NOT NULL,
            risk_percent REAL NOT NULL,
            max_open_trades INTEGER NOT NULL,
            price_brackets TEXT NOT NULL DEFAULT '[]',
            available_swing_capital REAL NOT NULL,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    ),
    (
        "swing_plans",
        r#"
        CREATE TABLE IF NOT EXISTS swing_plans (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            symbol TEXT NOT NULL,
            strategy TEXT NOT NULL,
            side TEXT NOT NULL CHECK (side IN ('LONG', 'SHORT')),
            entry_price REAL NOT NULL,
            stop_loss REAL NOT NULL,
            target REAL NOT NULL,
            risk_reward REAL NOT NULL,
            status TEXT NOT NULL CHECK (status IN
                ('PLANNED', 'APPROVED', 'REJECTED', 'HOLD', 'TRIGGERED', 'EXPIRED')),
            reason TEXT,
            confidence INTEGER,
            planned_qty INTEGER,
            inputs TEXT NOT NULL DEFAULT '{}',
            created_at DATETIME NOT NULL,
            expires_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    ),
    (
        "idx_swing_plans_status",
        "CREATE INDEX IF NOT EXISTS idx_swing_plans_status ON swing_plans(status, symbol)",
    ),
    (
        "watchlist",
        r#"
        CREATE TABLE IF NOT EXISTS watchlist (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            scan_date DATE NOT NULL,
            symbol TEXT NOT NULL,
            strategy TEXT NOT NULL,
            bias TEXT NOT NULL,
            score REAL NOT NULL,
            created_at DATETIME NOT NULL,
            UNIQUE (scan_date, symbol, strategy)
        )
        "#,
    ),
    (
        "trades",
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            plan_id INTEGER,
            symbol TEXT NOT NULL,
            strategy TEXT NOT NULL,
            side TEXT NOT NULL CHECK (side IN ('LONG', 'SHORT')),
            entry_price REAL NOT NULL CHECK (entry_price > 0),
            stop_loss REAL NOT NULL,
            trailing_stop REAL NOT NULL,
            target REAL NOT NULL,
            initial_qty INTEGER NOT NULL CHECK (initial_qty > 0),
            remaining_qty INTEGER NOT NULL CHECK (remaining_qty > 0),
            position_value REAL NOT NULL,
            risk_amount REAL NOT NULL,
            risk_per_unit REAL NOT NULL,
            confidence INTEGER NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('OPEN', 'PARTIAL')),
            hold_mode INTEGER NOT NULL DEFAULT 0,
            entry_day DATE NOT NULL,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            CHECK (remaining_qty <= initial_qty)
        )
        "#,
    ),
    (
        "idx_trades_symbol",
        "CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol)",
    ),
    (
        "trade_history",
        r#"
        CREATE TABLE IF NOT EXISTS trade_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            trade_id INTEGER NOT NULL UNIQUE,
            symbol TEXT NOT NULL,
            strategy TEXT NOT NULL,
            side TEXT NOT NULL,
            entry_price REAL NOT NULL,
            exit_price REAL NOT NULL,
            stop_loss REAL NOT NULL,
            target REAL NOT NULL,
            initial_qty INTEGER NOT NULL,
            closed_qty INTEGER NOT NULL,
            initial_position_value REAL NOT NULL,
            risk_amount REAL NOT NULL,
            confidence INTEGER NOT NULL,
            exit_reason TEXT NOT NULL,
            entry_day DATE NOT NULL,
            opened_at DATETIME NOT NULL,
            closed_at DATETIME NOT NULL
        )
        "#,
    ),
    (
        "realized_pnl",
        r#"
        CREATE TABLE IF NOT EXISTS realized_pnl (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            trade_id INTEGER NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            quantity INTEGER NOT NULL CHECK (quantity > 0),
            entry_price REAL NOT NULL,
            exit_price REAL NOT NULL,
            pnl REAL NOT NULL,
            exit_reason TEXT NOT NULL,
            exit_time DATETIME NOT NULL,
            day DATE NOT NULL,
            week TEXT NOT NULL,
            month TEXT NOT NULL
        )
        "#,
    ),
    (
        "idx_realized_pnl_day",
        "CREATE INDEX IF NOT EXISTS idx_realized_pnl_day ON realized_pnl(day)",
    ),
    (
        "order_audit",
        r#"
        CREATE TABLE IF NOT EXISTS order_audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            trade_id INTEGER NOT NULL,
            symbol TEXT NOT NULL,
            broker TEXT NOT NULL,
            mode TEXT NOT NULL CHECK (mode IN ('PAPER', 'LIVE')),
            purpose TEXT NOT NULL CHECK (purpose IN ('ENTRY', 'EXIT')),
            side TEXT NOT NULL CHECK (side IN ('BUY', 'SELL')),
            quantity INTEGER NOT NULL,
            instrument_id TEXT,
            status TEXT NOT NULL CHECK (status IN ('ATTEMPTED', 'SUCCESS', 'FAILED', 'SKIPPED')),
            request TEXT NOT NULL,
            response TEXT,
            error TEXT,
            created_at DATETIME NOT NULL,
            completed_at DATETIME
        )
        "#,
    ),
    (
        "idx_order_audit_trade",
        "CREATE INDEX IF NOT EXISTS idx_order_audit_trade ON order_audit(trade_id)",
    ),
    (
        "broker_trades",
        r#"
        CREATE TABLE IF NOT EXISTS broker_trades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            audit_id INTEGER NOT NULL REFERENCES order_audit(id),
            trade_id INTEGER NOT NULL,
            broker TEXT NOT NULL,
            purpose TEXT NOT NULL,
            side TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            order_id TEXT,
            status TEXT NOT NULL,
            error TEXT,
            created_at DATETIME NOT NULL
        )
        "#,
    ),
    (
        "idx_broker_trades_trade",
        "CREATE INDEX IF NOT EXISTS idx_broker_trades_trade ON broker_trades(trade_id, purpose)",
    ),
    (
        "missing_instruments",
        r#"
        CREATE TABLE IF NOT EXISTS missing_instruments (
            broker TEXT NOT NULL,
            symbol TEXT NOT NULL,
            miss_count INTEGER NOT NULL DEFAULT 1,
            first_seen DATETIME NOT NULL,
            last_seen DATETIME NOT NULL,
            PRIMARY KEY (broker, symbol)
        )
        "#,
    ),
    (
        "run_state",
        r#"
        CREATE TABLE IF NOT EXISTS run_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            state TEXT NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    ),
];

/// Run database migrations
async fn run_migrations(pool: &DbPool) -> Result<(), StoreError> {
    info!("Running database migrations...");

    for (name, statement) in MIGRATIONS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Migration(format!("Failed to create {}: {}", name, e)))?;
    }

    info!("✓ Database migrations completed");
    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> DbPool {
    init_database("sqlite::memory:", 1)
        .await
        .expect("in-memory database")
}
