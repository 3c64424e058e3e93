use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::entities::order::OrderSide;

/// Direction of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    /// Order side that opens a position in this direction
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position in this direction
    pub fn exit_order_side(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }

    /// Direction-aware PnL: `(exit - entry) * qty` for longs, negated for shorts
    pub fn signed_pnl(&self, entry_price: f64, exit_price: f64, quantity: i64) -> f64 {
        let raw = (exit_price - entry_price) * quantity as f64;
        match self {
            Side::Long => raw,
            Side::Short => -raw,
        }
    }

    /// Level `amount` away from `base` in the profitable direction
    pub fn favorable_offset(&self, base: f64, amount: f64) -> f64 {
        match self {
            Side::Long => base + amount,
            Side::Short => base - amount,
        }
    }

    /// Level `amount` away from `base` in the losing direction
    pub fn adverse_offset(&self, base: f64, amount: f64) -> f64 {
        match self {
            Side::Long => base - amount,
            Side::Short => base + amount,
        }
    }

    /// True once `price` has reached a profit level
    pub fn has_reached(&self, price: f64, level: f64) -> bool {
        match self {
            Side::Long => price >= level,
            Side::Short => price <= level,
        }
    }

    /// True once `price` has crossed a protective level
    pub fn has_breached(&self, price: f64, level: f64) -> bool {
        match self {
            Side::Long => price <= level,
            Side::Short => price >= level,
        }
    }

    /// True when `candidate` protects more profit than `current`
    pub fn is_more_favorable(&self, candidate: f64, current: f64) -> bool {
        match self {
            Side::Long => candidate > current,
            Side::Short => candidate < current,
        }
    }

    /// The tighter of two protective levels
    pub fn tighter_stop(&self, a: f64, b: f64) -> f64 {
        match self {
            Side::Long => a.max(b),
            Side::Short => a.min(b),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LONG" | "BUY" => Ok(Side::Long),
            "SHORT" | "SELL" => Ok(Side::Short),
            other => Err(format!("Unknown side: {}", other)),
        }
    }
}

/// Status of a live trade. Closed trades leave the live table entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Open,
    Partial,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "OPEN",
            TradeStatus::Partial => "PARTIAL",
        }
    }
}

impl FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(TradeStatus::Open),
            "PARTIAL" => Ok(TradeStatus::Partial),
            other => Err(format!("Unknown trade status: {}", other)),
        }
    }
}

/// Why quantity left a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    EmergencyExit,
    SlHit,
    SlCloseBased,
    PartialBook,
    TargetHit,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::EmergencyExit => "EMERGENCY_EXIT",
            ExitReason::SlHit => "SL_HIT",
            ExitReason::SlCloseBased => "SL_CLOSE_BASED",
            ExitReason::PartialBook => "PARTIAL_BOOK",
            ExitReason::TargetHit => "TARGET_HIT",
            ExitReason::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExitReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EMERGENCY_EXIT" => Ok(ExitReason::EmergencyExit),
            "SL_HIT" => Ok(ExitReason::SlHit),
            "SL_CLOSE_BASED" => Ok(ExitReason::SlCloseBased),
            "PARTIAL_BOOK" => Ok(ExitReason::PartialBook),
            "TARGET_HIT" => Ok(ExitReason::TargetHit),
            "MANUAL" => Ok(ExitReason::Manual),
            other => Err(format!("Unknown exit reason: {}", other)),
        }
    }
}

/// A capital-committed live position.
///
/// `position_value` is always `remaining_qty * entry_price`; the store
/// recomputes it on every mutation rather than adjusting it incrementally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trade {
    pub id: i64,
    pub plan_id: Option<i64>,
    pub symbol: String,
    pub strategy: String,
    pub side: Side,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub trailing_stop: f64,
    pub target: f64,
    pub initial_qty: i64,
    pub remaining_qty: i64,
    pub position_value: f64,
    pub risk_amount: f64,
    pub risk_per_unit: f64,
    pub confidence: i64,
    pub status: TradeStatus,
    pub hold_mode: bool,
    pub entry_day: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trade {
    /// Stop currently protecting the trade: the tighter of the initial and trailing stop
    pub fn effective_stop(&self) -> f64 {
        self.side.tighter_stop(self.stop_loss, self.trailing_stop)
    }

    pub fn is_same_day(&self, today: NaiveDate) -> bool {
        self.entry_day == today
    }
}

/// Input to `TradeStore::save_trade`
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrade {
    pub plan_id: Option<i64>,
    pub symbol: String,
    pub strategy: String,
    pub side: Side,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub target: f64,
    pub quantity: i64,
    pub confidence: i64,
    pub entry_day: NaiveDate,
}

impl NewTrade {
    pub fn position_value(&self) -> f64 {
        self.entry_price * self.quantity as f64
    }

    pub fn risk_per_unit(&self) -> f64 {
        (self.entry_price - self.stop_loss).abs()
    }

    pub fn risk_amount(&self) -> f64 {
        self.risk_per_unit() * self.quantity as f64
    }
}

/// Immutable archive row for a fully closed trade
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeHistory {
    pub id: i64,
    pub trade_id: i64,
    pub symbol: String,
    pub strategy: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub stop_loss: f64,
    pub target: f64,
    pub initial_qty: i64,
    pub closed_qty: i64,
    pub initial_position_value: f64,
    pub risk_amount: f64,
    pub confidence: i64,
    pub exit_reason: ExitReason,
    pub entry_day: NaiveDate,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// Append-only realized PnL ledger row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealizedPnl {
    pub id: i64,
    pub trade_id: i64,
    pub symbol: String,
    pub side: Side,
    pub quantity: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub exit_reason: ExitReason,
    pub exit_time: DateTime<Utc>,
    pub day: NaiveDate,
    pub week: String,
    pub month: String,
}

/// Reporting buckets derived from an exit date: (`2026-W43`, `2026-10`)
pub fn pnl_buckets(day: NaiveDate) -> (String, String) {
    let iso = day.iso_week();
    (
        format!("{}-W{:02}", iso.year(), iso.week()),
        format!("{}-{:02}", day.year(), day.month()),
    )
}
