//! Position sizing and the pre-trade risk gate
//!
//! Both functions are pure: they read a `RiskProfile` and the current
//! exposure, and never touch capital. Capital is only committed when the
//! trade store saves the trade.

use serde::Serialize;

use crate::domain::entities::settings::RiskProfile;
use crate::domain::errors::SizingError;

/// Result of sizing a trade
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionSize {
    pub quantity: i64,
    pub risk_amount: f64,
    pub per_unit_risk: f64,
    pub position_value: f64,
}

/// Capital already committed to live trades
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Exposure {
    pub open_trades: i64,
    pub used_capital: f64,
}

/// Guardrails, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GateRule {
    MaxOpenTrades,
    SwingCapital,
    PerTradeCap,
    PriceBracket,
}

/// Advisory verdict from `can_take_trade`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskCheck {
    pub allowed: bool,
    pub rule: Option<GateRule>,
    pub reason: String,
}

impl RiskCheck {
    fn allowed() -> Self {
        Self {
            allowed: true,
            rule: None,
            reason: "OK".to_string(),
        }
    }

    fn blocked(rule: GateRule, reason: String) -> Self {
        Self {
            allowed: false,
            rule: Some(rule),
            reason,
        }
    }
}

/// Size a position from the fixed-fractional risk budget.
///
/// `qty = floor(risk_amount / |entry - stop|)` where
/// `risk_amount = total_capital * risk_percent / 100`.
pub fn size_position(
    profile: &RiskProfile,
    entry: f64,
    stop: f64,
) -> Result<PositionSize, SizingError> {
    if !(entry > 0.0 && stop > 0.0) || !entry.is_finite() || !stop.is_finite() {
        return Err(SizingError::NonPositivePrice { entry, stop });
    }

    let per_unit_risk = (entry - stop).abs();
    if per_unit_risk <= f64::EPSILON {
        return Err(SizingError::ZeroRisk { price: entry });
    }

    let risk_amount = profile.risk_amount();
    let quantity = (risk_amount / per_unit_risk).floor();
    if !quantity.is_finite() || quantity < 1.0 {
        return Err(SizingError::ZeroQuantity {
            risk_amount,
            per_unit_risk,
        });
    }

    let quantity = quantity as i64;
    Ok(PositionSize {
        quantity,
        risk_amount,
        per_unit_risk,
        position_value: quantity as f64 * entry,
    })
}

/// Evaluate the guardrails in fixed order; the first failing rule wins.
pub fn can_take_trade(
    profile: &RiskProfile,
    exposure: &Exposure,
    position_value: f64,
    entry_price: f64,
) -> RiskCheck {
    if exposure.open_trades >= profile.max_open_trades {
        return RiskCheck::blocked(
            GateRule::MaxOpenTrades,
            format!(
                "Max open trades reached ({}/{})",
                exposure.open_trades, profile.max_open_trades
            ),
        );
    }

    if exposure.used_capital + position_value > profile.max_swing_capital {
        return RiskCheck::blocked(
            GateRule::SwingCapital,
            format!(
                "Swing capital exceeded: used {:.2} + {:.2} > {:.2}",
                exposure.used_capital, position_value, profile.max_swing_capital
            ),
        );
    }

    if position_value > profile.per_trade_cap {
        return RiskCheck::blocked(
            GateRule::PerTradeCap,
            format!(
                "Per-trade cap exceeded: {:.2} > {:.2}",
                position_value, profile.per_trade_cap
            ),
        );
    }

    let mut brackets = profile.enabled_brackets().peekable();
    if brackets.peek().is_some() && !brackets.any(|b| b.contains(entry_price)) {
        return RiskCheck::blocked(
            GateRule::PriceBracket,
            format!("Entry {:.2} outside enabled price brackets", entry_price),
        );
    }

    RiskCheck::allowed()
}
