//! In-memory collaborators for paper sessions and tests
//!
//! Each mock implements one capability trait and records what it was asked
//! to do, so callers can assert on routing and call counts.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::domain::entities::order::OrderSide;
use crate::domain::entities::plan::ConfidenceInputs;
use crate::domain::repositories::broker_client::{
    BrokerClient, BrokerError, BrokerResult, Holding, OrderAck, OrderRequest,
};
use crate::domain::repositories::market_data::{MarketData, MarketDataError};
use crate::domain::repositories::signal_source::{ScanError, ScanOutput, SignalSource};

/// Broker that accepts every order unless told otherwise
pub struct MockBroker {
    name: String,
    login_error: Mutex<Option<BrokerError>>,
    order_errors: Mutex<VecDeque<BrokerError>>,
    always_reject: Mutex<Option<BrokerError>>,
    unknown_symbols: Mutex<HashSet<String>>,
    order_delay: Mutex<Option<Duration>>,
    orders: Mutex<Vec<OrderRequest>>,
    login_calls: AtomicUsize,
    order_calls: AtomicUsize,
}

impl MockBroker {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            login_error: Mutex::new(None),
            order_errors: Mutex::new(VecDeque::new()),
            always_reject: Mutex::new(None),
            unknown_symbols: Mutex::new(HashSet::new()),
            order_delay: Mutex::new(None),
            orders: Mutex::new(Vec::new()),
            login_calls: AtomicUsize::new(0),
            order_calls: AtomicUsize::new(0),
        }
    }

    pub async fn fail_login(&self, error: BrokerError) {
        *self.login_error.lock().await = Some(error);
    }

    /// Fail the next `place_order` calls with these errors, in order
    pub async fn queue_order_errors(&self, errors: impl IntoIterator<Item = BrokerError>) {
        self.order_errors.lock().await.extend(errors);
    }

    /// Fail every `place_order` call from now on
    pub async fn reject_all(&self, error: BrokerError) {
        *self.always_reject.lock().await = Some(error);
    }

    /// Acknowledge every order only after `delay`
    pub async fn delay_orders(&self, delay: Duration) {
        *self.order_delay.lock().await = Some(delay);
    }

    pub async fn forget_symbol(&self, symbol: &str) {
        self.unknown_symbols.lock().await.insert(symbol.to_string());
    }

    /// Orders the broker accepted
    pub async fn orders(&self) -> Vec<OrderRequest> {
        self.orders.lock().await.clone()
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn order_calls(&self) -> usize {
        self.order_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn login(&self) -> BrokerResult<()> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        match self.login_error.lock().await.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn resolve_instrument(&self, symbol: &str) -> BrokerResult<Option<String>> {
        if self.unknown_symbols.lock().await.contains(symbol) {
            return Ok(None);
        }
        Ok(Some(format!("{}-{}", self.name, symbol)))
    }

    async fn place_order(&self, request: &OrderRequest) -> BrokerResult<OrderAck> {
        let call = self.order_calls.fetch_add(1, Ordering::SeqCst) + 1;

        let delay = *self.order_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(e) = self.order_errors.lock().await.pop_front() {
            return Err(e);
        }
        if let Some(e) = self.always_reject.lock().await.clone() {
            return Err(e);
        }

        self.orders.lock().await.push(request.clone());
        Ok(OrderAck {
            order_id: format!("{}-{}", self.name, call),
            raw: serde_json::json!({ "status": "accepted", "broker": self.name }),
        })
    }

    async fn get_holdings(&self) -> BrokerResult<Vec<Holding>> {
        let mut net: HashMap<String, i64> = HashMap::new();
        for order in self.orders.lock().await.iter() {
            let signed = match order.side {
                OrderSide::Buy => order.quantity,
                OrderSide::Sell => -order.quantity,
            };
            *net.entry(order.symbol.clone()).or_default() += signed;
        }
        Ok(net
            .into_iter()
            .filter(|(_, qty)| *qty != 0)
            .map(|(symbol, quantity)| Holding {
                symbol,
                quantity,
                average_price: 0.0,
            })
            .collect())
    }
}

/// Scripted quotes keyed by symbol
#[derive(Default)]
pub struct MockMarketData {
    prices: Mutex<HashMap<String, f64>>,
    closes: Mutex<HashMap<String, f64>>,
    atrs: Mutex<HashMap<String, f64>>,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl MockMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_price(&self, symbol: &str, price: f64) {
        self.prices.lock().await.insert(symbol.to_string(), price);
    }

    pub async fn set_close(&self, symbol: &str, close: f64) {
        self.closes.lock().await.insert(symbol.to_string(), close);
    }

    pub async fn set_atr(&self, symbol: &str, atr: f64) {
        self.atrs.lock().await.insert(symbol.to_string(), atr);
    }

    /// Every call for `symbol` fails with a network error
    pub async fn fail_symbol(&self, symbol: &str) {
        self.failing.lock().await.insert(symbol.to_string());
    }

    pub async fn recover_symbol(&self, symbol: &str) {
        self.failing.lock().await.remove(symbol);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn lookup(&self, table: &Mutex<HashMap<String, f64>>, symbol: &str) -> Result<Option<f64>, MarketDataError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().await.contains(symbol) {
            return Err(MarketDataError::Network(format!("{} feed down", symbol)));
        }
        Ok(table.lock().await.get(symbol).copied())
    }
}

#[async_trait]
impl MarketData for MockMarketData {
    async fn get_ltp(&self, symbol: &str) -> Result<Option<f64>, MarketDataError> {
        self.lookup(&self.prices, symbol).await
    }

    async fn get_daily_close(&self, symbol: &str) -> Result<Option<f64>, MarketDataError> {
        self.lookup(&self.closes, symbol).await
    }

    async fn get_atr(&self, symbol: &str) -> Result<Option<f64>, MarketDataError> {
        self.lookup(&self.atrs, symbol).await
    }
}

/// Scanner returning a fixed output
#[derive(Default)]
pub struct MockSignalSource {
    output: Mutex<ScanOutput>,
    refreshed: Mutex<HashMap<String, ConfidenceInputs>>,
    scan_error: Mutex<Option<ScanError>>,
    scans: AtomicUsize,
}

impl MockSignalSource {
    pub fn new(output: ScanOutput) -> Self {
        Self {
            output: Mutex::new(output),
            ..Self::default()
        }
    }

    pub async fn set_output(&self, output: ScanOutput) {
        *self.output.lock().await = output;
    }

    pub async fn set_refreshed_inputs(&self, symbol: &str, inputs: ConfidenceInputs) {
        self.refreshed.lock().await.insert(symbol.to_string(), inputs);
    }

    pub async fn fail_scans(&self, error: Option<ScanError>) {
        *self.scan_error.lock().await = error;
    }

    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalSource for MockSignalSource {
    async fn scan(&self, _day: NaiveDate) -> Result<ScanOutput, ScanError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.scan_error.lock().await.clone() {
            return Err(e);
        }
        Ok(self.output.lock().await.clone())
    }

    async fn refresh_inputs(&self, symbol: &str) -> Option<ConfidenceInputs> {
        self.refreshed.lock().await.get(symbol).cloned()
    }
}
