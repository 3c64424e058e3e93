//! Position Monitor
//!
//! One pass evaluates every live trade independently: fetch a price, pick
//! exactly one action from the exit rules, apply it. A failing or slow
//! trade is logged and counted, never allowed to stop the others.

use chrono::NaiveDate;
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::order_gateway::OrderGateway;
use crate::domain::entities::order::OrderConfig;
use crate::domain::entities::trade::{ExitReason, Trade};
use crate::domain::errors::{EngineError, StoreError};
use crate::domain::repositories::market_data::MarketData;
use crate::domain::services::exit_rules::{self, ExitPolicy, MarketSnapshot, MonitorAction};
use crate::persistence::trade_store::TradeStore;

/// Counters for one monitor pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorReport {
    pub evaluated: usize,
    pub closed: usize,
    pub partials: usize,
    pub trailed: usize,
    pub held: usize,
    pub no_price: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TradeTick {
    Closed,
    Partial,
    Trailed,
    Held,
    NoPrice,
    /// Exit order went out but no broker filled it
    Unfilled,
}

pub struct PositionMonitor {
    store: Arc<TradeStore>,
    gateway: Arc<OrderGateway>,
    market_data: Arc<dyn MarketData>,
    policy: ExitPolicy,
    per_trade_timeout: Duration,
}

impl PositionMonitor {
    pub fn new(
        store: Arc<TradeStore>,
        gateway: Arc<OrderGateway>,
        market_data: Arc<dyn MarketData>,
        policy: ExitPolicy,
        per_trade_timeout: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            market_data,
            policy,
            per_trade_timeout,
        }
    }

    pub async fn run_pass(&self, config: &OrderConfig, today: NaiveDate) -> Result<MonitorReport, StoreError> {
        let trades = self.store.fetch_open_trades().await?;
        let mut report = MonitorReport {
            evaluated: trades.len(),
            ..MonitorReport::default()
        };
        if trades.is_empty() {
            return Ok(report);
        }

        // The deadline bounds the quote reads only; an order already sent must
        // be allowed to finish so its audit row and trade mutation land.
        let ticks = join_all(trades.iter().map(|trade| async move {
            let result = match timeout(self.per_trade_timeout, self.evaluate_trade(trade, today)).await {
                Ok(Some((action, price))) => self.apply(config, trade, action, price).await,
                Ok(None) => Ok(TradeTick::NoPrice),
                Err(_) => Err(EngineError::Timeout(self.per_trade_timeout)),
            };
            (trade, result)
        }))
        .await;

        for (trade, result) in ticks {
            match result {
                Ok(TradeTick::Closed) => report.closed += 1,
                Ok(TradeTick::Partial) => report.partials += 1,
                Ok(TradeTick::Trailed) => report.trailed += 1,
                Ok(TradeTick::Held) => report.held += 1,
                Ok(TradeTick::NoPrice) => report.no_price += 1,
                Ok(TradeTick::Unfilled) => report.failed += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(
                        "[{}] Monitor failed for trade {} ({}): {}",
                        e.error_code(),
                        trade.id,
                        trade.symbol,
                        e
                    );
                }
            }
        }

        info!(
            "Monitor pass: {} trades, {} closed, {} partial, {} trailed, {} held, {} without price, {} failed",
            report.evaluated,
            report.closed,
            report.partials,
            report.trailed,
            report.held,
            report.no_price,
            report.failed
        );
        Ok(report)
    }

    /// Read quotes and pick the action. `None` when there is no usable price.
    async fn evaluate_trade(&self, trade: &Trade, today: NaiveDate) -> Option<(MonitorAction, f64)> {
        let price = match self.market_data.get_ltp(&trade.symbol).await {
            Ok(Some(price)) => price,
            Ok(None) => {
                debug!("No price for {}, skipping this tick", trade.symbol);
                return None;
            }
            Err(e) => {
                warn!("Price fetch failed for {}: {}", trade.symbol, e);
                return None;
            }
        };

        // Close-based stops and trailing only apply once the trade is held overnight
        let (daily_close, atr) = if trade.hold_mode {
            (
                self.market_data.get_daily_close(&trade.symbol).await.ok().flatten(),
                self.market_data.get_atr(&trade.symbol).await.ok().flatten(),
            )
        } else {
            (None, None)
        };

        let snapshot = MarketSnapshot {
            price,
            daily_close,
            atr,
            today,
        };
        let action = exit_rules::evaluate(trade, &snapshot, &self.policy);
        debug!("{} @ {:.2}: {:?}", trade.symbol, price, action);
        Some((action, price))
    }

    async fn apply(
        &self,
        config: &OrderConfig,
        trade: &Trade,
        action: MonitorAction,
        price: f64,
    ) -> Result<TradeTick, EngineError> {
        match action {
            MonitorAction::Close { reason } => {
                let filled = self.exit(config, trade, trade.remaining_qty, reason, price).await?;
                Ok(if filled { TradeTick::Closed } else { TradeTick::Unfilled })
            }
            MonitorAction::BookPartial { quantity } => {
                let filled = self
                    .exit(config, trade, quantity, ExitReason::PartialBook, price)
                    .await?;
                Ok(if filled { TradeTick::Partial } else { TradeTick::Unfilled })
            }
            MonitorAction::Trail { new_stop } => {
                if self.store.update_sl(trade.id, new_stop).await? {
                    info!(
                        "↑ {} trailing stop {:.2} -> {:.2}",
                        trade.symbol,
                        trade.effective_stop(),
                        new_stop
                    );
                    Ok(TradeTick::Trailed)
                } else {
                    Ok(TradeTick::Held)
                }
            }
            MonitorAction::HoldOnStop => {
                info!(
                    "{} below stop intraday at {:.2}, waiting for the daily close",
                    trade.symbol, price
                );
                Ok(TradeTick::Held)
            }
            MonitorAction::Hold => Ok(TradeTick::Held),
        }
    }

    async fn exit(
        &self,
        config: &OrderConfig,
        trade: &Trade,
        quantity: i64,
        reason: ExitReason,
        price: f64,
    ) -> Result<bool, EngineError> {
        let filled = self
            .gateway
            .place_exit(
                config,
                trade.id,
                &trade.symbol,
                quantity,
                trade.side.exit_order_side(),
                reason,
                Some(price),
            )
            .await?;
        Ok(filled)
    }
}
