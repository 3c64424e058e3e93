use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inclusive range of entry prices the desk is allowed to trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBracket {
    pub min_price: f64,
    pub max_price: f64,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl PriceBracket {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.min_price && price <= self.max_price
    }
}

/// Capital and risk settings singleton.
///
/// `available_swing_capital` is only ever changed through
/// `CapitalLedger::adjust_available_capital`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskProfile {
    pub total_capital: f64,
    pub max_swing_capital: f64,
    pub per_trade_cap: f64,
    pub risk_percent: f64,
    pub max_open_trades: i64,
    pub price_brackets: Vec<PriceBracket>,
    pub available_swing_capital: f64,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl RiskProfile {
    /// Profile with nothing committed yet
    pub fn new(
        total_capital: f64,
        max_swing_capital: f64,
        per_trade_cap: f64,
        risk_percent: f64,
        max_open_trades: i64,
    ) -> Self {
        Self {
            total_capital,
            max_swing_capital,
            per_trade_cap,
            risk_percent,
            max_open_trades,
            price_brackets: Vec::new(),
            available_swing_capital: max_swing_capital,
            updated_at: Utc::now(),
        }
    }

    pub fn with_brackets(mut self, brackets: Vec<PriceBracket>) -> Self {
        self.price_brackets = brackets;
        self
    }

    /// Capital risked on a single trade
    pub fn risk_amount(&self) -> f64 {
        self.total_capital * (self.risk_percent / 100.0)
    }

    pub fn enabled_brackets(&self) -> impl Iterator<Item = &PriceBracket> {
        self.price_brackets.iter().filter(|b| b.enabled)
    }
}

impl Default for RiskProfile {
    fn default() -> Self {
        Self::new(100_000.0, 50_000.0, 20_000.0, 1.0, 5)
    }
}
