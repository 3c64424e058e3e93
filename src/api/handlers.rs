use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{Local, NaiveDate};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use super::AppState;
use crate::application::scheduler::PhaseOutcome;
use crate::domain::entities::run_state::Phase;
use crate::domain::errors::{EngineError, StoreError};
use crate::persistence::ledger::LimitsUpdate;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult = Result<Json<Value>, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

impl LimitQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RunQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct WatchlistQuery {
    pub date: Option<NaiveDate>,
}

fn store_failure(e: StoreError) -> ApiError {
    engine_failure(EngineError::Store(e))
}

fn engine_failure(e: EngineError) -> ApiError {
    error!("[{}] API request failed: {}", e.error_code(), e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string(), "code": e.error_code() })),
    )
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let config = state.order_config.snapshot();
    Json(json!({
        "status": "running",
        "order_mode": config.mode.as_str(),
        "disabled_brokers": state.gateway.disabled_brokers().await,
        "run_state": state.scheduler.run_state().await,
    }))
}

pub async fn open_trades(State(state): State<AppState>) -> ApiResult {
    let trades = state.store.fetch_open_trades().await.map_err(store_failure)?;
    Ok(Json(json!({ "count": trades.len(), "trades": trades })))
}

pub async fn closed_trades(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> ApiResult {
    let trades = state
        .store
        .fetch_recent_closed(query.limit())
        .await
        .map_err(store_failure)?;
    Ok(Json(json!({ "count": trades.len(), "trades": trades })))
}

pub async fn active_plans(State(state): State<AppState>) -> ApiResult {
    let plans = state.plans.fetch_active_plans().await.map_err(store_failure)?;
    Ok(Json(json!({ "count": plans.len(), "plans": plans })))
}

pub async fn realized_pnl(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> ApiResult {
    let total = state.store.total_realized_pnl().await.map_err(store_failure)?;
    let entries = state
        .store
        .fetch_realized_pnl(query.limit())
        .await
        .map_err(store_failure)?;
    Ok(Json(json!({ "total": total, "entries": entries })))
}

pub async fn order_audit(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> ApiResult {
    let orders = state.audit.fetch_order_audit(query.limit()).await.map_err(store_failure)?;
    let missing = state.audit.missing_instruments().await.map_err(store_failure)?;
    Ok(Json(json!({ "orders": orders, "missing_instruments": missing })))
}

/// Settings, live exposure and the ledger drift
pub async fn capital(State(state): State<AppState>) -> ApiResult {
    let snapshot = state.ledger.snapshot().await.map_err(store_failure)?;
    let drift = state.ledger.verify_invariant().await.map_err(store_failure)?;
    Ok(Json(json!({
        "settings": snapshot.profile,
        "exposure": snapshot.exposure,
        "invariant_drift": drift,
    })))
}

/// Replace the risk limits. A swing capital below what live trades lock is a conflict.
pub async fn update_limits(State(state): State<AppState>, Json(update): Json<LimitsUpdate>) -> ApiResult {
    match state.ledger.update_limits(&update).await {
        Ok(profile) => Ok(Json(json!({ "settings": profile }))),
        Err(StoreError::InvariantViolation(msg)) => Err((StatusCode::CONFLICT, Json(json!({ "error": msg })))),
        Err(e) => Err(store_failure(e)),
    }
}

pub async fn watchlist(State(state): State<AppState>, Query(query): Query<WatchlistQuery>) -> ApiResult {
    let date = query.date.unwrap_or_else(|| Local::now().date_naive());
    let entries = state.plans.fetch_watchlist(date).await.map_err(store_failure)?;
    Ok(Json(json!({ "date": date, "count": entries.len(), "entries": entries })))
}

pub async fn run_phase(
    State(state): State<AppState>,
    Path(phase): Path<String>,
    Query(query): Query<RunQuery>,
) -> ApiResult {
    let phase: Phase = phase
        .parse()
        .map_err(|e: String| (StatusCode::BAD_REQUEST, Json(json!({ "error": e }))))?;

    match state.scheduler.run_manual(phase, query.force).await {
        Ok(PhaseOutcome::Ran(summary)) => Ok(Json(json!({ "phase": phase, "ran": true, "summary": summary }))),
        Ok(PhaseOutcome::AlreadyRan) => Ok(Json(json!({
            "phase": phase,
            "ran": false,
            "message": "Already ran; pass force=true to re-run",
        }))),
        Err(e) => Err(engine_failure(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::scheduler::{Scheduler, SchedulerConfig, SchedulerDeps};
    use crate::application::services::decision_engine::DecisionEngine;
    use crate::application::services::order_gateway::OrderGateway;
    use crate::application::services::position_monitor::PositionMonitor;
    use crate::config::StaticOrderConfig;
    use crate::domain::entities::order::OrderConfig;
    use crate::domain::entities::plan::WatchlistEntry;
    use crate::domain::entities::settings::RiskProfile;
    use crate::domain::repositories::signal_source::ScanOutput;
    use crate::domain::services::circuit_breaker::CircuitBreakerConfig;
    use crate::domain::services::exit_rules::ExitPolicy;
    use crate::domain::services::retry::RetryPolicy;
    use crate::infrastructure::broker_registry::BrokerRegistry;
    use crate::infrastructure::mock::{MockMarketData, MockSignalSource};
    use crate::persistence::ledger::CapitalLedger;
    use crate::persistence::order_audit::OrderAuditRepository;
    use crate::persistence::plan_repository::PlanRepository;
    use crate::persistence::run_state::RunStateRepository;
    use crate::persistence::{test_pool, DbPool};
    use crate::persistence::trade_store::TradeStore;
    use std::sync::Arc;
    use std::time::Duration;

    async fn state() -> AppState {
        state_and_pool().await.0
    }

    async fn state_and_pool() -> (AppState, DbPool) {
        let pool = test_pool().await;
        let ledger = Arc::new(CapitalLedger::new(pool.clone()));
        ledger
            .ensure_settings(&RiskProfile::new(100_000.0, 50_000.0, 25_000.0, 1.0, 5))
            .await
            .unwrap();

        let store = Arc::new(TradeStore::new(pool.clone()));
        let plans = Arc::new(PlanRepository::new(pool.clone()));
        let audit = Arc::new(OrderAuditRepository::new(pool.clone()));
        let market = Arc::new(MockMarketData::new());
        let order_config = Arc::new(StaticOrderConfig::new(OrderConfig::paper()));

        let gateway = Arc::new(OrderGateway::new(
            Arc::new(BrokerRegistry::new(CircuitBreakerConfig::default())),
            store.clone(),
            audit.clone(),
            None,
            RetryPolicy::default(),
        ));
        let monitor = Arc::new(PositionMonitor::new(
            store.clone(),
            gateway.clone(),
            market.clone(),
            ExitPolicy::default(),
            Duration::from_secs(1),
        ));

        let scheduler = Scheduler::load(
            SchedulerConfig::default(),
            Duration::from_secs(1),
            SchedulerDeps {
                plans: plans.clone(),
                store: store.clone(),
                engine: Arc::new(DecisionEngine::new(ledger.clone(), store.clone(), 6)),
                gateway: gateway.clone(),
                monitor,
                market_data: market,
                signals: Arc::new(MockSignalSource::new(ScanOutput::default())),
                order_config: order_config.clone(),
                run_state: RunStateRepository::new(pool.clone()),
            },
        )
        .await
        .unwrap();

        let state = AppState {
            scheduler: Arc::new(scheduler),
            store,
            plans,
            audit,
            ledger,
            gateway,
            order_config,
        };
        (state, pool)
    }

    #[tokio::test]
    async fn test_health_reports_mode() {
        let Json(body) = health(State(state().await)).await;
        assert_eq!(body["status"], "running");
        assert_eq!(body["order_mode"], "PAPER");
    }

    #[tokio::test]
    async fn test_capital_reports_zero_drift() {
        let Json(body) = capital(State(state().await)).await.unwrap();
        assert_eq!(body["settings"]["available_swing_capital"], 50_000.0);
        assert_eq!(body["exposure"]["open_trades"], 0);
        assert_eq!(body["invariant_drift"], 0.0);
    }

    #[tokio::test]
    async fn test_manual_run_then_already_ran() {
        let state = state().await;

        let Json(first) = run_phase(
            State(state.clone()),
            Path("scan".to_string()),
            Query(RunQuery::default()),
        )
        .await
        .unwrap();
        assert_eq!(first["ran"], true);
        assert_eq!(first["phase"], "daily_scan");

        let Json(second) = run_phase(
            State(state.clone()),
            Path("daily_scan".to_string()),
            Query(RunQuery::default()),
        )
        .await
        .unwrap();
        assert_eq!(second["ran"], false);

        let Json(forced) = run_phase(State(state), Path("scan".to_string()), Query(RunQuery { force: true }))
            .await
            .unwrap();
        assert_eq!(forced["ran"], true);
    }

    #[tokio::test]
    async fn test_unknown_phase_is_bad_request() {
        let err = run_phase(
            State(state().await),
            Path("lunch".to_string()),
            Query(RunQuery::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_limit_is_clamped() {
        assert_eq!(LimitQuery { limit: None }.limit(), DEFAULT_LIMIT);
        assert_eq!(LimitQuery { limit: Some(0) }.limit(), 1);
        assert_eq!(LimitQuery { limit: Some(10_000) }.limit(), MAX_LIMIT);
    }

    fn limits(max_swing_capital: f64) -> LimitsUpdate {
        LimitsUpdate {
            total_capital: 100_000.0,
            max_swing_capital,
            per_trade_cap: 25_000.0,
            risk_percent: 1.0,
            max_open_trades: 5,
            price_brackets: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_update_limits_conflicts_with_locked_capital() {
        let (state, pool) = state_and_pool().await;
        {
            let mut conn = pool.acquire().await.unwrap();
            CapitalLedger::adjust_available_capital(&mut conn, -20_000.0)
                .await
                .unwrap();
        }

        let err = update_limits(State(state.clone()), Json(limits(10_000.0)))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::CONFLICT);

        let Json(body) = update_limits(State(state), Json(limits(60_000.0))).await.unwrap();
        assert_eq!(body["settings"]["available_swing_capital"], 40_000.0);
    }

    #[tokio::test]
    async fn test_watchlist_for_scan_date() {
        let state = state().await;
        let day = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        state
            .plans
            .save_watchlist(
                day,
                &[WatchlistEntry {
                    symbol: "INFY".to_string(),
                    strategy: "pullback".to_string(),
                    bias: "LONG".to_string(),
                    score: 8.0,
                }],
            )
            .await
            .unwrap();

        let Json(body) = watchlist(State(state), Query(WatchlistQuery { date: Some(day) }))
            .await
            .unwrap();
        assert_eq!(body["count"], 1);
        assert_eq!(body["entries"][0]["symbol"], "INFY");
    }
}
