//! Broker Client Trait
//!
//! Capability interface every broker adapter implements. The order gateway
//! iterates a registry of these in priority order instead of branching on
//! broker names, so adding a broker never touches routing logic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::entities::order::OrderSide;

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised by broker adapters
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
}

impl BrokerError {
    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Network(_) | BrokerError::Timeout)
    }
}

/// Order payload sent to a broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub instrument_id: String,
    pub side: OrderSide,
    pub quantity: i64,
    /// Client tag linking the order back to the trade
    pub tag: String,
}

/// Broker acceptance of an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    #[serde(default)]
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub quantity: i64,
    pub average_price: f64,
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Registry key, matched against `BrokerSettings::name`
    fn name(&self) -> &str;

    /// Establish or refresh the trading session
    async fn login(&self) -> BrokerResult<()>;

    /// Map an exchange symbol to the broker's instrument id.
    /// `Ok(None)` means the broker does not know the symbol.
    async fn resolve_instrument(&self, symbol: &str) -> BrokerResult<Option<String>>;

    /// Place an order; `Ok` means the broker accepted it
    async fn place_order(&self, request: &OrderRequest) -> BrokerResult<OrderAck>;

    async fn get_holdings(&self) -> BrokerResult<Vec<Holding>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BrokerError::Network("reset".into()).is_transient());
        assert!(BrokerError::Timeout.is_transient());
        assert!(!BrokerError::Rejected("margin".into()).is_transient());
        assert!(!BrokerError::Authentication("expired".into()).is_transient());
    }
}
