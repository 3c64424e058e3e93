//! Database Models
//!
//! Row structs as stored in SQLite. Enum columns are kept as text and parsed
//! into domain entities through `TryFrom`, so a corrupt row surfaces as
//! `StoreError::Corrupt` instead of a panic.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::FromRow;
use std::str::FromStr;

use crate::domain::entities::order::{BrokerTrade, OrderAudit};
use crate::domain::entities::plan::SwingPlan;
use crate::domain::entities::settings::RiskProfile;
use crate::domain::entities::trade::{RealizedPnl, Trade, TradeHistory};
use crate::domain::errors::StoreError;

fn parse<T: FromStr<Err = String>>(field: &str, value: &str) -> Result<T, StoreError> {
    value.parse().map_err(|e: String| StoreError::corrupt(field, e))
}

/// Settings singleton row
#[derive(Debug, Clone, FromRow)]
pub struct SettingsRecord {
    pub total_capital: f64,
    pub max_swing_capital: f64,
    pub per_trade_cap: f64,
    pub risk_percent: f64,
    pub max_open_trades: i64,
    pub price_brackets: String, // JSON array
    pub available_swing_capital: f64,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SettingsRecord> for RiskProfile {
    type Error = StoreError;

    fn try_from(row: SettingsRecord) -> Result<Self, Self::Error> {
        Ok(RiskProfile {
            total_capital: row.total_capital,
            max_swing_capital: row.max_swing_capital,
            per_trade_cap: row.per_trade_cap,
            risk_percent: row.risk_percent,
            max_open_trades: row.max_open_trades,
            price_brackets: serde_json::from_str(&row.price_brackets)?,
            available_swing_capital: row.available_swing_capital,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PlanRecord {
    pub id: i64,
    pub symbol: String,
    pub strategy: String,
    pub side: String,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub target: f64,
    pub risk_reward: f64,
    pub status: String,
    pub reason: Option<String>,
    pub confidence: Option<i64>,
    pub planned_qty: Option<i64>,
    pub inputs: String, // JSON object
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PlanRecord> for SwingPlan {
    type Error = StoreError;

    fn try_from(row: PlanRecord) -> Result<Self, Self::Error> {
        Ok(SwingPlan {
            id: row.id,
            side: parse("side", &row.side)?,
            status: parse("status", &row.status)?,
            inputs: serde_json::from_str(&row.inputs)?,
            symbol: row.symbol,
            strategy: row.strategy,
            entry_price: row.entry_price,
            stop_loss: row.stop_loss,
            target: row.target,
            risk_reward: row.risk_reward,
            reason: row.reason,
            confidence: row.confidence,
            planned_qty: row.planned_qty,
            created_at: row.created_at,
            expires_at: row.expires_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TradeRecord {
    pub id: i64,
    pub plan_id: Option<i64>,
    pub symbol: String,
    pub strategy: String,
    pub side: String,
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
    pub status: String, // "OPEN" or "PARTIAL"
    pub hold_mode: bool,
    pub entry_day: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<TradeRecord> for Trade {
    type Error = StoreError;

    fn try_from(row: TradeRecord) -> Result<Self, Self::Error> {
        Ok(Trade {
            id: row.id,
            plan_id: row.plan_id,
            side: parse("side", &row.side)?,
            status: parse("status", &row.status)?,
            symbol: row.symbol,
            strategy: row.strategy,
            entry_price: row.entry_price,
            stop_loss: row.stop_loss,
            trailing_stop: row.trailing_stop,
            target: row.target,
            initial_qty: row.initial_qty,
            remaining_qty: row.remaining_qty,
            position_value: row.position_value,
            risk_amount: row.risk_amount,
            risk_per_unit: row.risk_per_unit,
            confidence: row.confidence,
            hold_mode: row.hold_mode,
            entry_day: row.entry_day,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TradeHistoryRecord {
    pub id: i64,
    pub trade_id: i64,
    pub symbol: String,
    pub strategy: String,
    pub side: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub stop_loss: f64,
    pub target: f64,
    pub initial_qty: i64,
    pub closed_qty: i64,
    pub initial_position_value: f64,
    pub risk_amount: f64,
    pub confidence: i64,
    pub exit_reason: String,
    pub entry_day: NaiveDate,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl TryFrom<TradeHistoryRecord> for TradeHistory {
    type Error = StoreError;

    fn try_from(row: TradeHistoryRecord) -> Result<Self, Self::Error> {
        Ok(TradeHistory {
            id: row.id,
            trade_id: row.trade_id,
            side: parse("side", &row.side)?,
            exit_reason: parse("exit_reason", &row.exit_reason)?,
            symbol: row.symbol,
            strategy: row.strategy,
            entry_price: row.entry_price,
            exit_price: row.exit_price,
            stop_loss: row.stop_loss,
            target: row.target,
            initial_qty: row.initial_qty,
            closed_qty: row.closed_qty,
            initial_position_value: row.initial_position_value,
            risk_amount: row.risk_amount,
            confidence: row.confidence,
            entry_day: row.entry_day,
            opened_at: row.opened_at,
            closed_at: row.closed_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct RealizedPnlRecord {
    pub id: i64,
    pub trade_id: i64,
    pub symbol: String,
    pub side: String,
    pub quantity: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub exit_reason: String,
    pub exit_time: DateTime<Utc>,
    pub day: NaiveDate,
    pub week: String,
    pub month: String,
}

impl TryFrom<RealizedPnlRecord> for RealizedPnl {
    type Error = StoreError;

    fn try_from(row: RealizedPnlRecord) -> Result<Self, Self::Error> {
        Ok(RealizedPnl {
            id: row.id,
            trade_id: row.trade_id,
            side: parse("side", &row.side)?,
            exit_reason: parse("exit_reason", &row.exit_reason)?,
            symbol: row.symbol,
            quantity: row.quantity,
            entry_price: row.entry_price,
            exit_price: row.exit_price,
            pnl: row.pnl,
            exit_time: row.exit_time,
            day: row.day,
            week: row.week,
            month: row.month,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct OrderAuditRecord {
    pub id: i64,
    pub trade_id: i64,
    pub symbol: String,
    pub broker: String,
    pub mode: String,
    pub purpose: String,
    pub side: String,
    pub quantity: i64,
    pub instrument_id: Option<String>,
    pub status: String,
    pub request: String,          // JSON
    pub response: Option<String>, // JSON
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<OrderAuditRecord> for OrderAudit {
    type Error = StoreError;

    fn try_from(row: OrderAuditRecord) -> Result<Self, Self::Error> {
        let response = match row.response.as_deref() {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };
        Ok(OrderAudit {
            id: row.id,
            trade_id: row.trade_id,
            mode: parse("mode", &row.mode)?,
            purpose: parse("purpose", &row.purpose)?,
            side: parse("side", &row.side)?,
            status: parse("status", &row.status)?,
            request: serde_json::from_str(&row.request)?,
            response,
            symbol: row.symbol,
            broker: row.broker,
            quantity: row.quantity,
            instrument_id: row.instrument_id,
            error: row.error,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BrokerTradeRecord {
    pub id: i64,
    pub audit_id: i64,
    pub trade_id: i64,
    pub broker: String,
    pub purpose: String,
    pub side: String,
    pub quantity: i64,
    pub order_id: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<BrokerTradeRecord> for BrokerTrade {
    type Error = StoreError;

    fn try_from(row: BrokerTradeRecord) -> Result<Self, Self::Error> {
        Ok(BrokerTrade {
            id: row.id,
            audit_id: row.audit_id,
            trade_id: row.trade_id,
            purpose: parse("purpose", &row.purpose)?,
            side: parse("side", &row.side)?,
            status: parse("status", &row.status)?,
            broker: row.broker,
            quantity: row.quantity,
            order_id: row.order_id,
            error: row.error,
            created_at: row.created_at,
        })
    }
}

/// Symbol a broker could not resolve to an instrument
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct MissingInstrumentRecord {
    pub broker: String,
    pub symbol: String,
    pub miss_count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Collect rows into entities, failing on the first corrupt row
pub fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}
