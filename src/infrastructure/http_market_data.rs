//! Quote service client
//!
//! `GET {base}/quote/{symbol}` returns `{ "ltp": .., "close": .., "atr": .. }`,
//! each field optional. A 404 means the service has no data for the symbol.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::domain::repositories::market_data::{MarketData, MarketDataError};

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    ltp: Option<f64>,
    #[serde(default)]
    close: Option<f64>,
    #[serde(default)]
    atr: Option<f64>,
}

pub struct HttpMarketData {
    client: Client,
    base_url: String,
}

impl HttpMarketData {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn quote(&self, symbol: &str) -> Result<Quote, MarketDataError> {
        let url = format!("{}/quote/{}", self.base_url, symbol);
        let response = self
            .client
            .get(&url)
            .header("User-Agent", "swingcore/0.1.0")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MarketDataError::Timeout
                } else {
                    MarketDataError::Network(e.to_string())
                }
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(Quote::default()),
            s if s.is_success() => response
                .json::<Quote>()
                .await
                .map_err(|e| MarketDataError::Malformed(e.to_string())),
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                Err(MarketDataError::Network(format!("quote {}: {}", symbol, s)))
            }
            s => Err(MarketDataError::Malformed(format!("quote {}: {}", symbol, s))),
        }
    }
}

/// Non-finite or non-positive values are treated as missing
fn usable(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

#[async_trait]
impl MarketData for HttpMarketData {
    async fn get_ltp(&self, symbol: &str) -> Result<Option<f64>, MarketDataError> {
        Ok(usable(self.quote(symbol).await?.ltp))
    }

    async fn get_daily_close(&self, symbol: &str) -> Result<Option<f64>, MarketDataError> {
        Ok(usable(self.quote(symbol).await?.close))
    }

    async fn get_atr(&self, symbol: &str) -> Result<Option<f64>, MarketDataError> {
        Ok(usable(self.quote(symbol).await?.atr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_fields_are_optional() {
        let quote: Quote = serde_json::from_str(r#"{"ltp": 101.5}"#).unwrap();
        assert_eq!(quote.ltp, Some(101.5));
        assert!(quote.close.is_none());
        assert!(quote.atr.is_none());
    }

    #[test]
    fn test_unusable_values_are_missing() {
        assert_eq!(usable(Some(0.0)), None);
        assert_eq!(usable(Some(f64::NAN)), None);
        assert_eq!(usable(Some(-3.0)), None);
        assert_eq!(usable(Some(42.0)), Some(42.0));
    }
}
