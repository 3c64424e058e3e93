//! Exit rules for open trades
//!
//! One tick of a trade resolves to exactly one `MonitorAction`. Rules are
//! evaluated top to bottom and the first match wins:
//!
//! 1. Emergency exit far beyond the stop
//! 2. Stop hit (intraday for same-day entries, close-based in hold mode)
//! 3. One-time partial booking at `partial_book_rr` R
//! 4. Volatility trailing stop ratchet (hold mode only)
//! 5. Target hit

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::entities::trade::{ExitReason, Trade, TradeStatus};

/// Tunable exit policy constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitPolicy {
    /// Profit, in R multiples, at which half the position is booked
    pub partial_book_rr: f64,
    /// Loss, in R multiples, that forces an emergency exit
    pub hard_exit_multiple: f64,
    /// ATR multiple subtracted from price for the trailing stop
    pub trail_atr_multiple: f64,
    /// In hold mode, only the daily close may trigger the stop
    pub sl_on_close: bool,
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self {
            partial_book_rr: 1.0,
            hard_exit_multiple: 1.5,
            trail_atr_multiple: 2.0,
            sl_on_close: true,
        }
    }
}

/// Market observations for one trade on one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketSnapshot {
    pub price: f64,
    pub daily_close: Option<f64>,
    pub atr: Option<f64>,
    pub today: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorAction {
    /// Exit the full remaining quantity
    Close { reason: ExitReason },
    /// Exit part of the position
    BookPartial { quantity: i64 },
    /// Ratchet the trailing stop forward
    Trail { new_stop: f64 },
    /// Intrabar stop breach ignored until the daily close confirms it
    HoldOnStop,
    Hold,
}

pub fn evaluate(trade: &Trade, market: &MarketSnapshot, policy: &ExitPolicy) -> MonitorAction {
    let side = trade.side;
    let price = market.price;
    let risk = trade.risk_per_unit;

    let emergency_level = side.adverse_offset(trade.entry_price, risk * policy.hard_exit_multiple);
    if side.has_breached(price, emergency_level) {
        return MonitorAction::Close {
            reason: ExitReason::EmergencyExit,
        };
    }

    let stop = trade.effective_stop();
    if side.has_breached(price, stop) {
        if trade.is_same_day(market.today) {
            return MonitorAction::Close {
                reason: ExitReason::SlHit,
            };
        }
        if trade.hold_mode && policy.sl_on_close {
            return match market.daily_close {
                Some(close) if side.has_breached(close, stop) => MonitorAction::Close {
                    reason: ExitReason::SlCloseBased,
                },
                _ => MonitorAction::HoldOnStop,
            };
        }
        return MonitorAction::Close {
            reason: ExitReason::SlHit,
        };
    }

    if trade.status == TradeStatus::Open {
        let book_level = side.favorable_offset(trade.entry_price, risk * policy.partial_book_rr);
        let half = trade.remaining_qty / 2;
        if side.has_reached(price, book_level) && half >= 1 {
            return MonitorAction::BookPartial { quantity: half };
        }
    }

    if trade.hold_mode {
        if let Some(atr) = market.atr.filter(|a| *a > 0.0) {
            let candidate = side.adverse_offset(price, atr * policy.trail_atr_multiple);
            if side.is_more_favorable(candidate, stop) {
                return MonitorAction::Trail { new_stop: candidate };
            }
        }
    }

    if side.has_reached(price, trade.target) {
        return MonitorAction::Close {
            reason: ExitReason::TargetHit,
        };
    }

    MonitorAction::Hold
}
