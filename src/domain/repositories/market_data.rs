use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MarketDataError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Malformed quote: {0}")]
    Malformed(String),

    /// Circuit open and nothing cached
    #[error("Quote unavailable: {0}")]
    Unavailable(String),
}

impl MarketDataError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MarketDataError::Network(_) | MarketDataError::Timeout)
    }
}

/// Market data collaborator. `Ok(None)` means no data for the symbol.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn get_ltp(&self, symbol: &str) -> Result<Option<f64>, MarketDataError>;

    async fn get_daily_close(&self, symbol: &str) -> Result<Option<f64>, MarketDataError>;

    /// Average true range used for volatility trailing stops
    async fn get_atr(&self, _symbol: &str) -> Result<Option<f64>, MarketDataError> {
        Ok(None)
    }
}
