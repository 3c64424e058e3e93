//! Resilient market data
//!
//! Wraps a market data collaborator with a per-call timeout, bounded
//! retries and a per-symbol circuit breaker. While a symbol's breaker is
//! cooling down, or once retries are exhausted, the last known value is
//! served from an LRU cache instead of calling out again.

use async_trait::async_trait;
use lru::LruCache;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::domain::repositories::market_data::{MarketData, MarketDataError};
use crate::domain::services::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::domain::services::retry::RetryPolicy;

const CACHE_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum QuoteKind {
    Ltp,
    DailyClose,
    Atr,
}

impl QuoteKind {
    fn as_str(&self) -> &'static str {
        match self {
            QuoteKind::Ltp => "ltp",
            QuoteKind::DailyClose => "close",
            QuoteKind::Atr => "atr",
        }
    }
}

pub struct ResilientMarketData {
    inner: Arc<dyn MarketData>,
    retry: RetryPolicy,
    breaker_config: CircuitBreakerConfig,
    call_timeout: Duration,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    last_known: Mutex<LruCache<(QuoteKind, String), f64>>,
}

impl ResilientMarketData {
    pub fn new(
        inner: Arc<dyn MarketData>,
        retry: RetryPolicy,
        breaker_config: CircuitBreakerConfig,
        call_timeout: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            retry,
            breaker_config,
            call_timeout,
            breakers: Mutex::new(HashMap::new()),
            last_known: Mutex::new(LruCache::new(capacity)),
        }
    }

    async fn breaker_for(&self, symbol: &str) -> CircuitBreaker {
        let mut breakers = self.breakers.lock().await;
        breakers
            .entry(symbol.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.breaker_config.clone()))
            .clone()
    }

    async fn cached(&self, kind: QuoteKind, symbol: &str) -> Option<f64> {
        self.last_known
            .lock()
            .await
            .get(&(kind, symbol.to_string()))
            .copied()
    }

    async fn guarded<F, Fut>(&self, kind: QuoteKind, symbol: &str, fetch: F) -> Result<Option<f64>, MarketDataError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<f64>, MarketDataError>>,
    {
        let breaker = self.breaker_for(symbol).await;

        if !breaker.is_call_permitted().await {
            debug!("Quote breaker open for {}, serving last known {}", symbol, kind.as_str());
            return match self.cached(kind, symbol).await {
                Some(value) => Ok(Some(value)),
                None => Err(MarketDataError::Unavailable(symbol.to_string())),
            };
        }

        let label = format!("{} {}", kind.as_str(), symbol);
        let call_timeout = self.call_timeout;
        let result = self
            .retry
            .run(&label, MarketDataError::is_transient, || {
                let call = fetch();
                async move {
                    match timeout(call_timeout, call).await {
                        Ok(result) => result,
                        Err(_) => Err(MarketDataError::Timeout),
                    }
                }
            })
            .await;

        match result {
            Ok(value) => {
                breaker.on_success().await;
                if let Some(v) = value {
                    self.last_known.lock().await.put((kind, symbol.to_string()), v);
                }
                Ok(value)
            }
            Err(e) => {
                breaker.on_failure().await;
                match self.cached(kind, symbol).await {
                    Some(value) => {
                        warn!("{} failed ({}), using last known {:.2}", label, e, value);
                        Ok(Some(value))
                    }
                    None => {
                        warn!("{} failed with nothing cached: {}", label, e);
                        Err(e)
                    }
                }
            }
        }
    }
}

#[async_trait]
impl MarketData for ResilientMarketData {
    async fn get_ltp(&self, symbol: &str) -> Result<Option<f64>, MarketDataError> {
        self.guarded(QuoteKind::Ltp, symbol, || self.inner.get_ltp(symbol))
            .await
    }

    async fn get_daily_close(&self, symbol: &str) -> Result<Option<f64>, MarketDataError> {
        self.guarded(QuoteKind::DailyClose, symbol, || self.inner.get_daily_close(symbol))
            .await
    }

    async fn get_atr(&self, symbol: &str) -> Result<Option<f64>, MarketDataError> {
        self.guarded(QuoteKind::Atr, symbol, || self.inner.get_atr(symbol))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::MockMarketData;

    fn resilient(inner: Arc<MockMarketData>, cooldown: Duration) -> ResilientMarketData {
        ResilientMarketData::new(
            inner,
            RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            CircuitBreakerConfig {
                failure_threshold: 1,
                cooldown,
            },
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_passes_through_and_caches() {
        let inner = Arc::new(MockMarketData::new());
        inner.set_price("INFY", 1500.0).await;
        let data = resilient(inner.clone(), Duration::from_secs(60));

        assert_eq!(data.get_ltp("INFY").await.unwrap(), Some(1500.0));
        assert_eq!(data.get_ltp("TCS").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_serves_last_known_during_cooldown() {
        let inner = Arc::new(MockMarketData::new());
        inner.set_price("INFY", 1500.0).await;
        let data = resilient(inner.clone(), Duration::from_secs(60));
        data.get_ltp("INFY").await.unwrap();

        inner.fail_symbol("INFY").await;
        assert_eq!(data.get_ltp("INFY").await.unwrap(), Some(1500.0));
        let calls_after_failure = inner.calls();

        // Breaker is open: no further calls reach the source
        assert_eq!(data.get_ltp("INFY").await.unwrap(), Some(1500.0));
        assert_eq!(inner.calls(), calls_after_failure);
    }

    #[tokio::test]
    async fn test_unavailable_without_cache() {
        let inner = Arc::new(MockMarketData::new());
        inner.fail_symbol("INFY").await;
        let data = resilient(inner.clone(), Duration::from_secs(60));

        assert!(data.get_ltp("INFY").await.is_err());
        assert!(matches!(
            data.get_ltp("INFY").await,
            Err(MarketDataError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_symbol_does_not_trip_others() {
        let inner = Arc::new(MockMarketData::new());
        inner.set_price("TCS", 3500.0).await;
        inner.fail_symbol("INFY").await;
        let data = resilient(inner.clone(), Duration::from_secs(60));

        assert!(data.get_ltp("INFY").await.is_err());
        assert_eq!(data.get_ltp("TCS").await.unwrap(), Some(3500.0));
    }
}
