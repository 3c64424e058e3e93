use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use swingcore::api::{self, rate_limit::create_rate_limiter, AppState};
use swingcore::application::scheduler::{Scheduler, SchedulerDeps};
use swingcore::application::services::decision_engine::DecisionEngine;
use swingcore::application::services::market_data::ResilientMarketData;
use swingcore::application::services::order_gateway::OrderGateway;
use swingcore::application::services::position_monitor::PositionMonitor;
use swingcore::config::{EngineConfig, EnvOrderConfig, OrderConfigSource};
use swingcore::domain::repositories::market_data::MarketData;
use swingcore::infrastructure::broker_registry::BrokerRegistry;
use swingcore::infrastructure::file_signal_source::FileSignalSource;
use swingcore::infrastructure::http_market_data::HttpMarketData;
use swingcore::infrastructure::mock::MockMarketData;
use swingcore::persistence::init_database;
use swingcore::persistence::ledger::CapitalLedger;
use swingcore::persistence::order_audit::OrderAuditRepository;
use swingcore::persistence::plan_repository::PlanRepository;
use swingcore::persistence::run_state::RunStateRepository;
use swingcore::persistence::trade_store::TradeStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = dotenvy::dotenv() {
        // A missing .env is normal in production
        if !e.not_found() {
            eprintln!("Failed to read .env: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "swingcore=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env();
    info!(
        "Swing engine starting in {} mode ({} brokers configured)",
        config.order_mode.as_str(),
        config.brokers.len()
    );

    let pool = init_database(&config.database_url, config.database_max_connections).await?;

    let ledger = Arc::new(CapitalLedger::new(pool.clone()));
    let profile = ledger.ensure_settings(&config.seed).await?;
    info!(
        "Swing capital: {:.2} available of {:.2}",
        profile.available_swing_capital, profile.max_swing_capital
    );
    let drift = ledger.verify_invariant().await?;
    if drift.abs() > 0.01 {
        warn!("Starting with capital drift {:.4}", drift);
    }

    let store = Arc::new(TradeStore::new(pool.clone()));
    let plans = Arc::new(PlanRepository::new(pool.clone()));
    let audit = Arc::new(OrderAuditRepository::new(pool.clone()));

    let registry = Arc::new(BrokerRegistry::from_endpoints(
        &config.brokers,
        config.resilience.breaker.clone(),
        config.resilience.per_symbol_timeout,
    ));

    let feed: Arc<dyn MarketData> = match config.market_data_url.as_deref() {
        Some(url) => match HttpMarketData::new(url, config.resilience.per_symbol_timeout) {
            Ok(client) => {
                info!("✓ Market data client created for {}", url);
                Arc::new(client)
            }
            Err(e) => {
                error!("✗ Failed to create market data client: {}", e);
                return Err(e.into());
            }
        },
        None => {
            warn!("MARKET_DATA_URL not set, using an empty in-memory quote feed");
            Arc::new(MockMarketData::new())
        }
    };
    let market_data: Arc<dyn MarketData> = Arc::new(ResilientMarketData::new(
        feed,
        config.resilience.retry.clone(),
        config.resilience.breaker.clone(),
        config.resilience.per_symbol_timeout,
    ));

    let gateway = Arc::new(OrderGateway::new(
        registry,
        store.clone(),
        audit.clone(),
        Some(market_data.clone()),
        config.resilience.retry.clone(),
    ));
    let monitor = Arc::new(PositionMonitor::new(
        store.clone(),
        gateway.clone(),
        market_data.clone(),
        config.exit_policy.clone(),
        config.resilience.per_symbol_timeout,
    ));
    let engine = Arc::new(DecisionEngine::new(ledger.clone(), store.clone(), config.min_confidence));
    let order_config: Arc<dyn OrderConfigSource> = Arc::new(EnvOrderConfig::new(config.order_config_file.clone()));

    let scheduler = Arc::new(
        Scheduler::load(
            config.scheduler.clone(),
            config.resilience.per_symbol_timeout,
            SchedulerDeps {
                plans: plans.clone(),
                store: store.clone(),
                engine,
                gateway: gateway.clone(),
                monitor,
                market_data,
                signals: Arc::new(FileSignalSource::new(config.scanner_output_path.clone())),
                order_config: order_config.clone(),
                run_state: RunStateRepository::new(pool.clone()),
            },
        )
        .await?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown_rx));

    let app = api::router(
        AppState {
            scheduler,
            store,
            plans,
            audit,
            ledger,
            gateway,
            order_config,
        },
        create_rate_limiter(config.api.requests_per_minute),
    );

    let listener = tokio::net::TcpListener::bind(&config.api.bind).await?;
    info!("Listening on {}", config.api.bind);

    let shutdown_signal = async move {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => {
                    error!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = on_signal(
            "SIGTERM",
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).map(|mut sig| async move {
                sig.recv().await;
            }),
        );

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    };

    info!("Server started successfully. Press Ctrl+C to stop.");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    info!("Server shutting down gracefully...");
    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_task.await {
        error!("Scheduler task ended abnormally: {}", e);
    }

    pool.close().await;
    info!("Shutdown complete");
    Ok(())
}

/// Resolves when the signal arrives. A handler that failed to install never resolves.
async fn on_signal<F: Future<Output = ()>>(name: &str, installed: std::io::Result<F>) {
    match installed {
        Ok(signal) => {
            signal.await;
            info!("Received {} signal", name);
        }
        Err(e) => {
            error!("Failed to install {} handler: {}", name, e);
            std::future::pending::<()>().await;
        }
    }
}
