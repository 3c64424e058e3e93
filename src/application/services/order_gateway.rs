//! Order Gateway
//!
//! Single entry point for entry and exit orders. Every call:
//! 1. validates the quantity against the live trade
//! 2. writes one `order_audit` row and finalizes it exactly once
//! 3. in PAPER mode, skips brokers entirely
//! 4. in LIVE mode, tries every eligible broker in priority order and
//!    succeeds if any of them accepts
//!
//! Exits mutate the trade store only after a terminal broker result.

use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::domain::entities::order::{
    BrokerSettings, OrderAuditStatus, OrderConfig, OrderMode, OrderPurpose, OrderSide,
};
use crate::domain::entities::trade::{ExitReason, Trade};
use crate::domain::errors::{GatewayError, StoreError};
use crate::domain::repositories::broker_client::{BrokerError, OrderRequest};
use crate::domain::repositories::market_data::MarketData;
use crate::domain::services::retry::RetryPolicy;
use crate::infrastructure::broker_registry::{BrokerRegistry, RegisteredBroker};
use crate::persistence::order_audit::{AuditResult, NewBrokerTrade, NewOrderAudit, OrderAuditRepository};
use crate::persistence::trade_store::{ExitOutcome, TradeStore};

pub const PAPER_BROKER: &str = "PAPER";
pub const PAPER_REASON: &str = "PAPER MODE";

/// Brokers logged in or knocked out during this process lifetime
#[derive(Debug, Default)]
struct SessionState {
    logged_in: HashSet<String>,
    disabled: HashSet<String>,
}

/// Outcome of one broker attempt
#[derive(Debug, Clone, PartialEq)]
enum BrokerOutcome {
    Filled {
        order_id: String,
        instrument_id: String,
        raw: serde_json::Value,
    },
    Failed(String),
    Skipped(String),
}

impl BrokerOutcome {
    fn status(&self) -> OrderAuditStatus {
        match self {
            BrokerOutcome::Filled { .. } => OrderAuditStatus::Success,
            BrokerOutcome::Failed(_) => OrderAuditStatus::Failed,
            BrokerOutcome::Skipped(_) => OrderAuditStatus::Skipped,
        }
    }
}

/// What is being ordered, shared by every broker attempt of one call
struct OrderIntent<'a> {
    trade_id: i64,
    symbol: &'a str,
    quantity: i64,
    side: OrderSide,
    purpose: OrderPurpose,
}

impl OrderIntent<'_> {
    fn tag(&self) -> String {
        format!("swing-{}-{}", self.trade_id, self.purpose.as_str().to_ascii_lowercase())
    }
}

pub struct OrderGateway {
    registry: Arc<BrokerRegistry>,
    store: Arc<TradeStore>,
    audit: Arc<OrderAuditRepository>,
    market_data: Option<Arc<dyn MarketData>>,
    retry: RetryPolicy,
    session: Mutex<SessionState>,
}

impl OrderGateway {
    pub fn new(
        registry: Arc<BrokerRegistry>,
        store: Arc<TradeStore>,
        audit: Arc<OrderAuditRepository>,
        market_data: Option<Arc<dyn MarketData>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            store,
            audit,
            market_data,
            retry,
            session: Mutex::new(SessionState::default()),
        }
    }

    /// Re-enable brokers disabled by login failures, force fresh logins and close every breaker
    pub async fn reset_sessions(&self) {
        let mut session = self.session.lock().await;
        if !session.disabled.is_empty() {
            info!("Re-enabling brokers: {:?}", session.disabled);
        }
        *session = SessionState::default();
        for broker in self.registry.iter() {
            broker.breaker.reset().await;
        }
    }

    pub async fn disabled_brokers(&self) -> Vec<String> {
        let mut names: Vec<_> = self.session.lock().await.disabled.iter().cloned().collect();
        names.sort();
        names
    }

    /// Send the entry order for a freshly saved trade
    pub async fn place_entry(
        &self,
        config: &OrderConfig,
        trade_id: i64,
        symbol: &str,
        qty: i64,
        side: OrderSide,
    ) -> Result<bool, GatewayError> {
        let trade = self.live_trade(trade_id, qty).await?;
        let intent = OrderIntent {
            trade_id: trade.id,
            symbol,
            quantity: qty,
            side,
            purpose: OrderPurpose::Entry,
        };
        let request = json!({
            "trade_id": trade.id,
            "symbol": symbol,
            "side": side,
            "quantity": qty,
            "entry_price": trade.entry_price,
        });

        match config.mode {
            OrderMode::Paper => {
                self.record_paper(&intent, request).await?;
                info!("📄 PAPER entry {} {} x{} (trade {})", side, symbol, qty, trade_id);
                Ok(true)
            }
            OrderMode::Live => Ok(self.route_live(config, &intent, request).await?),
        }
    }

    /// Send an exit order and, once filled, book it in the trade store.
    ///
    /// `exit_price` falls back to the last traded price when not given.
    #[allow(clippy::too_many_arguments)]
    pub async fn place_exit(
        &self,
        config: &OrderConfig,
        trade_id: i64,
        symbol: &str,
        exit_qty: i64,
        side: OrderSide,
        exit_reason: ExitReason,
        exit_price: Option<f64>,
    ) -> Result<bool, GatewayError> {
        let trade = self.live_trade(trade_id, exit_qty).await?;
        let exit_price = self.resolve_exit_price(symbol, exit_price).await?;

        let intent = OrderIntent {
            trade_id: trade.id,
            symbol,
            quantity: exit_qty,
            side,
            purpose: OrderPurpose::Exit,
        };
        let request = json!({
            "trade_id": trade.id,
            "symbol": symbol,
            "side": side,
            "quantity": exit_qty,
            "exit_reason": exit_reason,
            "exit_price": exit_price,
        });

        let filled = match config.mode {
            OrderMode::Paper => {
                self.record_paper(&intent, request).await?;
                true
            }
            OrderMode::Live => self.route_live(config, &intent, request).await?,
        };
        if !filled {
            return Ok(false);
        }

        match self
            .store
            .finalize_exit(trade_id, exit_qty, exit_price, exit_reason)
            .await?
        {
            ExitOutcome::Partial { remaining_qty, pnl, .. } => {
                info!(
                    "✓ {} partial exit x{} @ {:.2} ({}), {} left, pnl {:.2}",
                    symbol, exit_qty, exit_price, exit_reason, remaining_qty, pnl.pnl
                );
                Ok(true)
            }
            ExitOutcome::Closed { pnl, .. } => {
                info!(
                    "✓ {} closed x{} @ {:.2} ({}), pnl {:.2}",
                    symbol, exit_qty, exit_price, exit_reason, pnl.pnl
                );
                Ok(true)
            }
            ExitOutcome::NoOp => {
                warn!("Exit for trade {} filled but the trade had already changed", trade_id);
                Ok(false)
            }
        }
    }

    async fn live_trade(&self, trade_id: i64, qty: i64) -> Result<Trade, GatewayError> {
        let trade = self
            .store
            .get(trade_id)
            .await?
            .ok_or(GatewayError::TradeNotLive(trade_id))?;

        if qty <= 0 || qty > trade.remaining_qty {
            return Err(GatewayError::InvalidQuantity {
                requested: qty,
                remaining: trade.remaining_qty,
            });
        }
        Ok(trade)
    }

    async fn resolve_exit_price(&self, symbol: &str, given: Option<f64>) -> Result<f64, GatewayError> {
        if let Some(price) = given.filter(|p| p.is_finite() && *p > 0.0) {
            return Ok(price);
        }

        let Some(market_data) = &self.market_data else {
            return Err(GatewayError::MissingExitPrice(symbol.to_string()));
        };
        match market_data.get_ltp(symbol).await {
            Ok(Some(price)) if price.is_finite() && price > 0.0 => Ok(price),
            Ok(_) => Err(GatewayError::MissingExitPrice(symbol.to_string())),
            Err(e) => {
                warn!("No exit price for {}: {}", symbol, e);
                Err(GatewayError::MissingExitPrice(symbol.to_string()))
            }
        }
    }

    async fn record_paper(&self, intent: &OrderIntent<'_>, request: serde_json::Value) -> Result<(), StoreError> {
        let audit_id = self
            .audit
            .begin(&NewOrderAudit {
                trade_id: intent.trade_id,
                symbol: intent.symbol.to_string(),
                broker: PAPER_BROKER.to_string(),
                mode: OrderMode::Paper,
                purpose: intent.purpose,
                side: intent.side,
                quantity: intent.quantity,
                request,
            })
            .await?;

        self.audit
            .finalize(
                audit_id,
                &AuditResult {
                    status: OrderAuditStatus::Skipped,
                    instrument_id: None,
                    response: Some(json!({ "reason": PAPER_REASON })),
                    error: None,
                },
            )
            .await?;
        Ok(())
    }

    /// LIVE routing. Broker-side failures are logged and reported as `false`;
    /// only persistence failures propagate.
    async fn route_live(
        &self,
        config: &OrderConfig,
        intent: &OrderIntent<'_>,
        request: serde_json::Value,
    ) -> Result<bool, StoreError> {
        match self.dispatch(config, intent, request).await {
            Ok(()) => Ok(true),
            Err(GatewayError::NoEligibleBroker(msg)) | Err(GatewayError::AllBrokersFailed(msg)) => {
                error!(
                    "✗ {} {} x{} not placed: {}",
                    intent.purpose.as_str(),
                    intent.symbol,
                    intent.quantity,
                    msg
                );
                Ok(false)
            }
            Err(GatewayError::Store(e)) => Err(e),
            Err(other) => {
                error!("✗ Unexpected gateway error for trade {}: {}", intent.trade_id, other);
                Ok(false)
            }
        }
    }

    async fn dispatch(
        &self,
        config: &OrderConfig,
        intent: &OrderIntent<'_>,
        request: serde_json::Value,
    ) -> Result<(), GatewayError> {
        let candidates = self.candidates(config, intent).await?;
        let broker_label = if candidates.is_empty() {
            "NONE".to_string()
        } else {
            candidates
                .iter()
                .map(|(b, _)| b.name())
                .collect::<Vec<_>>()
                .join(",")
        };

        let audit_id = self
            .audit
            .begin(&NewOrderAudit {
                trade_id: intent.trade_id,
                symbol: intent.symbol.to_string(),
                broker: broker_label,
                mode: OrderMode::Live,
                purpose: intent.purpose,
                side: intent.side,
                quantity: intent.quantity,
                request,
            })
            .await?;

        if candidates.is_empty() {
            let reason = format!("no enabled auto-order broker for {}", intent.symbol);
            self.audit
                .finalize(
                    audit_id,
                    &AuditResult {
                        status: OrderAuditStatus::Failed,
                        instrument_id: None,
                        response: None,
                        error: Some(reason.clone()),
                    },
                )
                .await?;
            return Err(GatewayError::NoEligibleBroker(reason));
        }

        let mut fills = Vec::new();
        let mut failures = Vec::new();
        // A bookkeeping failure stops routing, but the audit row is still finalized
        let mut store_error = None;

        for (broker, settings) in &candidates {
            let outcome = match self.execute_on(broker, settings, intent).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    failures.push(format!("{}: {}", broker.name(), e));
                    store_error = Some(e);
                    break;
                }
            };

            let (order_id, error) = match &outcome {
                BrokerOutcome::Filled { order_id, .. } => (Some(order_id.clone()), None),
                BrokerOutcome::Failed(e) | BrokerOutcome::Skipped(e) => (None, Some(e.clone())),
            };
            let recorded = self
                .audit
                .record_broker_trade(&NewBrokerTrade {
                    audit_id,
                    trade_id: intent.trade_id,
                    broker: broker.name().to_string(),
                    purpose: intent.purpose,
                    side: intent.side,
                    quantity: intent.quantity,
                    order_id,
                    status: outcome.status(),
                    error: error.clone(),
                })
                .await;

            match outcome {
                BrokerOutcome::Filled {
                    order_id,
                    instrument_id,
                    raw,
                } => {
                    info!(
                        "✓ {} accepted {} {} x{} (order {})",
                        broker.name(),
                        intent.side,
                        intent.symbol,
                        intent.quantity,
                        order_id
                    );
                    fills.push((broker.name().to_string(), order_id, instrument_id, raw));
                }
                _ => {
                    let message = error.unwrap_or_default();
                    warn!("{} did not fill {}: {}", broker.name(), intent.symbol, message);
                    failures.push(format!("{}: {}", broker.name(), message));
                }
            }

            if let Err(e) = recorded {
                error!("Failed to record {} leg for trade {}: {}", broker.name(), intent.trade_id, e);
                store_error = Some(e);
                break;
            }
        }

        let summary = failures.join("; ");
        let result = if fills.is_empty() {
            AuditResult {
                status: OrderAuditStatus::Failed,
                instrument_id: None,
                response: None,
                error: Some(summary.clone()),
            }
        } else {
            AuditResult {
                status: OrderAuditStatus::Success,
                instrument_id: fills.first().map(|(_, _, id, _)| id.clone()),
                response: Some(json!({
                    "fills": fills
                        .iter()
                        .map(|(broker, order_id, _, raw)| json!({ "broker": broker, "order_id": order_id, "raw": raw }))
                        .collect::<Vec<_>>(),
                    "failures": failures,
                })),
                error: None,
            }
        };
        self.audit.finalize(audit_id, &result).await?;

        if let Some(e) = store_error {
            return Err(GatewayError::Store(e));
        }
        if fills.is_empty() {
            return Err(GatewayError::AllBrokersFailed(summary));
        }
        Ok(())
    }

    /// Eligible brokers in priority order.
    ///
    /// Exits go only to the brokers that filled the entry, when there are any.
    async fn candidates(
        &self,
        config: &OrderConfig,
        intent: &OrderIntent<'_>,
    ) -> Result<Vec<(RegisteredBroker, BrokerSettings)>, StoreError> {
        let disabled = self.session.lock().await.disabled.clone();

        let eligible: Vec<(RegisteredBroker, BrokerSettings)> = self
            .registry
            .iter()
            .filter(|b| !disabled.contains(&b.name().to_ascii_lowercase()))
            .filter_map(|b| {
                config
                    .broker(b.name())
                    .filter(|s| s.accepts_orders())
                    .map(|s| (b.clone(), s.clone()))
            })
            .collect();

        if intent.purpose == OrderPurpose::Exit {
            let executing = self.audit.executing_brokers(intent.trade_id).await?;
            if !executing.is_empty() {
                debug!("Trade {} exits route to {:?}", intent.trade_id, executing);
                return Ok(eligible
                    .into_iter()
                    .filter(|(b, _)| executing.iter().any(|e| e.eq_ignore_ascii_case(b.name())))
                    .collect());
            }
        }
        Ok(eligible)
    }

    async fn execute_on(
        &self,
        broker: &RegisteredBroker,
        settings: &BrokerSettings,
        intent: &OrderIntent<'_>,
    ) -> Result<BrokerOutcome, StoreError> {
        let name = broker.name().to_ascii_lowercase();

        if let Some(max_qty) = settings.max_qty {
            if intent.quantity > max_qty {
                return Ok(BrokerOutcome::Skipped(format!(
                    "quantity {} exceeds max {}",
                    intent.quantity, max_qty
                )));
            }
        }

        let needs_login = !self.session.lock().await.logged_in.contains(&name);
        if needs_login {
            if let Err(e) = broker.client.login().await {
                let mut session = self.session.lock().await;
                session.disabled.insert(name.clone());
                error!("✗ {} login failed, disabled for this session: {}", broker.name(), e);
                return Ok(BrokerOutcome::Failed(format!("login failed: {}", e)));
            }
            self.session.lock().await.logged_in.insert(name.clone());
        }

        if !broker.breaker.is_call_permitted().await {
            let remaining = broker.breaker.cooldown_remaining().await.unwrap_or_default();
            return Ok(BrokerOutcome::Failed(format!(
                "circuit open, retry in {}s",
                remaining.as_secs()
            )));
        }

        let label = format!("{} resolve {}", broker.name(), intent.symbol);
        let resolved = self
            .retry
            .run(&label, BrokerError::is_transient, || {
                broker.client.resolve_instrument(intent.symbol)
            })
            .await;
        let instrument_id = match resolved {
            Ok(Some(id)) => id,
            Ok(None) => {
                self.audit
                    .record_missing_instrument(broker.name(), intent.symbol)
                    .await?;
                return Ok(BrokerOutcome::Failed(format!(
                    "instrument not found for {}",
                    intent.symbol
                )));
            }
            Err(e) => return Ok(self.on_broker_error(broker, &name, e).await),
        };

        let request = OrderRequest {
            symbol: intent.symbol.to_string(),
            instrument_id: instrument_id.clone(),
            side: intent.side,
            quantity: intent.quantity,
            tag: intent.tag(),
        };
        let label = format!("{} order {}", broker.name(), intent.symbol);
        match self
            .retry
            .run(&label, BrokerError::is_transient, || broker.client.place_order(&request))
            .await
        {
            Ok(ack) => {
                broker.breaker.on_success().await;
                Ok(BrokerOutcome::Filled {
                    order_id: ack.order_id,
                    instrument_id,
                    raw: ack.raw,
                })
            }
            Err(e) => Ok(self.on_broker_error(broker, &name, e).await),
        }
    }

    async fn on_broker_error(&self, broker: &RegisteredBroker, name: &str, e: BrokerError) -> BrokerOutcome {
        match &e {
            BrokerError::Authentication(_) => {
                let mut session = self.session.lock().await;
                session.logged_in.remove(name);
                session.disabled.insert(name.to_string());
                error!("✗ {} session rejected, disabled: {}", broker.name(), e);
            }
            e if e.is_transient() => {
                broker.breaker.on_failure().await;
                warn!("{} unreachable, cooling down: {}", broker.name(), e);
            }
            _ => {}
        }
        BrokerOutcome::Failed(e.to_string())
    }
}
