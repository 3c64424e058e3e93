//! Operator HTTP surface
//!
//! Dashboard queries, the risk-limit update and the manual phase trigger.
//! Every route shares one rate limiter.

pub mod handlers;
pub mod rate_limit;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::application::scheduler::Scheduler;
use crate::application::services::order_gateway::OrderGateway;
use crate::config::OrderConfigSource;
use crate::persistence::ledger::CapitalLedger;
use crate::persistence::order_audit::OrderAuditRepository;
use crate::persistence::plan_repository::PlanRepository;
use crate::persistence::trade_store::TradeStore;

use rate_limit::{rate_limit_middleware, ApiRateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<TradeStore>,
    pub plans: Arc<PlanRepository>,
    pub audit: Arc<OrderAuditRepository>,
    pub ledger: Arc<CapitalLedger>,
    pub gateway: Arc<OrderGateway>,
    pub order_config: Arc<dyn OrderConfigSource>,
}

pub fn router(state: AppState, limiter: ApiRateLimiter) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/trades/open", get(handlers::open_trades))
        .route("/trades/closed", get(handlers::closed_trades))
        .route("/plans/active", get(handlers::active_plans))
        .route("/pnl", get(handlers::realized_pnl))
        .route("/orders/audit", get(handlers::order_audit))
        .route("/capital", get(handlers::capital))
        .route("/watchlist", get(handlers::watchlist))
        .route("/settings/limits", put(handlers::update_limits))
        .route("/run/:phase", post(handlers::run_phase))
        .layer(middleware::from_fn_with_state(limiter, rate_limit_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
