//! Error taxonomy for the swing engine
//!
//! - Structural errors (bad prices or quantities) are rejected synchronously and never retried.
//! - Capital and risk limits are not errors at all; they surface as `HOLD` verdicts.
//! - Transient I/O failures are retried with backoff by the resilience layer.
//! - Persistence failures roll back the enclosing transaction and are retried by the next tick.

use std::fmt;
use thiserror::Error;

/// Position sizing refused the inputs. Callers treat this as a rejection signal.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SizingError {
    #[error("Entry and stop must be positive (entry {entry}, stop {stop})")]
    NonPositivePrice { entry: f64, stop: f64 },

    #[error("Zero per-unit risk: entry equals stop ({price})")]
    ZeroRisk { price: f64 },

    #[error("Capital too small: risk {risk_amount:.2} buys no units at {per_unit_risk:.2} per unit")]
    ZeroQuantity { risk_amount: f64, per_unit_risk: f64 },
}

/// Persistence-layer failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Invalid plan transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Insufficient swing capital: required {required:.2}, available {available:.2}")]
    InsufficientCapital { required: f64, available: f64 },

    #[error("Capital invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn corrupt(field: &str, value: impl fmt::Display) -> Self {
        StoreError::Corrupt(format!("{}: {}", field, value))
    }
}

/// Order gateway failures
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid quantity {requested} (remaining {remaining})")]
    InvalidQuantity { requested: i64, remaining: i64 },

    #[error("Trade {0} is not live")]
    TradeNotLive(i64),

    #[error("No exit price available for {0}")]
    MissingExitPrice(String),

    #[error("No broker eligible for {0}")]
    NoEligibleBroker(String),

    #[error("All brokers failed: {0}")]
    AllBrokersFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Top-level error for engine phases
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Scanner error: {0}")]
    Scan(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl EngineError {
    /// Retrying on the next tick might help
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Store(StoreError::Database(_)) => true,
            EngineError::Store(_) => false,
            EngineError::Gateway(GatewayError::AllBrokersFailed(_)) => true,
            EngineError::Gateway(GatewayError::Store(StoreError::Database(_))) => true,
            EngineError::Gateway(_) => false,
            EngineError::Scan(_) => true,
            EngineError::Timeout(_) => true,
        }
    }

    /// Short code for log filtering
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::Store(StoreError::InsufficientCapital { .. }) => "ERR_CAPITAL",
            EngineError::Store(StoreError::InvalidTransition { .. }) => "ERR_TRANSITION",
            EngineError::Store(StoreError::InvariantViolation(_)) => "ERR_INVARIANT",
            EngineError::Store(_) => "ERR_STORE",
            EngineError::Gateway(GatewayError::InvalidQuantity { .. }) => "ERR_QUANTITY",
            EngineError::Gateway(_) => "ERR_GATEWAY",
            EngineError::Scan(_) => "ERR_SCAN",
            EngineError::Timeout(_) => "ERR_TIMEOUT",
        }
    }
}
