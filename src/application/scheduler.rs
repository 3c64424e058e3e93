//! Daily phase scheduler
//!
//! A single loop wakes every `tick` and runs whichever phases are due:
//! inside their wall-clock window and not yet marked as run. Daily phases
//! are keyed by date, the trigger/monitor phase by a coarse time bucket.
//! Run markers are persisted, so a restart never repeats completed work.
//!
//! Operators can force any phase through `run_manual`. The run-state lock is
//! held for the whole phase, so a manual run and the loop never interleave.

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::application::services::decision_engine::{Candidate, Commitment, DecisionEngine, Verdict};
use crate::application::services::order_gateway::OrderGateway;
use crate::application::services::position_monitor::{MonitorReport, PositionMonitor};
use crate::config::OrderConfigSource;
use crate::domain::entities::order::OrderConfig;
use crate::domain::entities::plan::{PlanStatus, SwingPlan};
use crate::domain::entities::run_state::{Phase, RunState};
use crate::domain::errors::{EngineError, StoreError};
use crate::domain::repositories::market_data::MarketData;
use crate::domain::repositories::signal_source::SignalSource;
use crate::domain::services::confidence;
use crate::persistence::plan_repository::{PlanRepository, TransitionDetails};
use crate::persistence::run_state::RunStateRepository;
use crate::persistence::trade_store::TradeStore;

/// Half-open local time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        time >= self.start && time < self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

impl FromStr for TimeWindow {
    type Err = String;

    /// Parses `HH:MM-HH:MM`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("expected HH:MM-HH:MM, got {}", s))?;
        let parse = |part: &str| {
            NaiveTime::parse_from_str(part.trim(), "%H:%M").map_err(|e| format!("{}: {}", part, e))
        };
        let (start, end) = (parse(start)?, parse(end)?);
        if end <= start {
            return Err(format!("window {} ends before it starts", s));
        }
        Ok(Self { start, end })
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub scan_window: TimeWindow,
    pub decision_window: TimeWindow,
    pub confirm_window: TimeWindow,
    pub trigger_window: TimeWindow,
    pub bucket_minutes: u32,
    pub tick: Duration,
    pub plan_expiry_days: i64,
}

impl SchedulerConfig {
    pub fn window(&self, phase: Phase) -> TimeWindow {
        match phase {
            Phase::DailyScan => self.scan_window,
            Phase::DecisionRunner => self.decision_window,
            Phase::MorningConfirm => self.confirm_window,
            Phase::TriggerMonitor => self.trigger_window,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_window: TimeWindow::new(hm(8, 30), hm(9, 10)),
            decision_window: TimeWindow::new(hm(9, 15), hm(9, 20)),
            confirm_window: TimeWindow::new(hm(9, 15), hm(9, 30)),
            trigger_window: TimeWindow::new(hm(9, 20), hm(15, 25)),
            bucket_minutes: 5,
            tick: Duration::from_secs(30),
            plan_expiry_days: crate::domain::entities::plan::DEFAULT_PLAN_EXPIRY_DAYS,
        }
    }
}

/// Phases due at `now`, in execution order
pub fn due_phases(config: &SchedulerConfig, state: &RunState, now: NaiveDateTime) -> Vec<Phase> {
    Phase::ALL
        .into_iter()
        .filter(|phase| config.window(*phase).contains(now.time()))
        .filter(|phase| !state.has_run(*phase, now, config.bucket_minutes))
        .collect()
}

/// What one phase run did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhaseSummary {
    pub phase: String,
    pub watchlist: usize,
    pub plans_created: usize,
    pub plans_skipped: usize,
    pub plans_expired: u64,
    pub approved: usize,
    pub rejected: usize,
    pub held: usize,
    pub demoted: usize,
    pub triggered: usize,
    pub entry_failures: usize,
    pub failures: usize,
    pub monitor: Option<MonitorReport>,
}

impl PhaseSummary {
    fn new(phase: Phase) -> Self {
        Self {
            phase: phase.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "summary", rename_all = "snake_case")]
pub enum PhaseOutcome {
    Ran(PhaseSummary),
    AlreadyRan,
}

/// Collaborators the phases drive
pub struct SchedulerDeps {
    pub plans: Arc<PlanRepository>,
    pub store: Arc<TradeStore>,
    pub engine: Arc<DecisionEngine>,
    pub gateway: Arc<OrderGateway>,
    pub monitor: Arc<PositionMonitor>,
    pub market_data: Arc<dyn MarketData>,
    pub signals: Arc<dyn SignalSource>,
    pub order_config: Arc<dyn OrderConfigSource>,
    pub run_state: RunStateRepository,
}

pub struct Scheduler {
    config: SchedulerConfig,
    per_symbol_timeout: Duration,
    deps: SchedulerDeps,
    state: Mutex<RunState>,
}

impl Scheduler {
    /// Build the scheduler with the persisted run state
    pub async fn load(
        config: SchedulerConfig,
        per_symbol_timeout: Duration,
        deps: SchedulerDeps,
    ) -> Result<Self, StoreError> {
        let state = deps.run_state.load().await?;
        debug!("Loaded run state: {:?}", state);
        Ok(Self {
            config,
            per_symbol_timeout,
            deps,
            state: Mutex::new(state),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub async fn run_state(&self) -> RunState {
        self.state.lock().await.clone()
    }

    /// Drive the loop until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Scheduler started (tick {:?})", self.config.tick);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_at(Local::now().naive_local()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Scheduler stopped");
    }

    /// Run every phase due at `now`. A failed phase stays unmarked so the next tick retries it.
    pub async fn tick_at(&self, now: NaiveDateTime) -> Vec<(Phase, Result<PhaseSummary, EngineError>)> {
        let mut state = self.state.lock().await;
        let mut results = Vec::new();

        for phase in due_phases(&self.config, &state, now) {
            let result = self.run_phase(phase, now).await;
            match &result {
                Ok(_) => {
                    if let Err(e) = self.mark_ran(&mut state, phase, now).await {
                        error!("Failed to persist run state after {}: {}", phase, e);
                    }
                }
                Err(e) => error!(
                    "[{}] {} failed{}: {}",
                    e.error_code(),
                    phase,
                    if e.is_recoverable() { ", will retry" } else { "" },
                    e
                ),
            }
            results.push((phase, result));
        }
        results
    }

    pub async fn run_manual(&self, phase: Phase, force: bool) -> Result<PhaseOutcome, EngineError> {
        self.run_manual_at(phase, force, Local::now().naive_local()).await
    }

    /// Operator entry point. Without `force`, a phase already run for the
    /// current day (or trigger bucket) is not repeated.
    pub async fn run_manual_at(
        &self,
        phase: Phase,
        force: bool,
        now: NaiveDateTime,
    ) -> Result<PhaseOutcome, EngineError> {
        let mut state = self.state.lock().await;

        if !force && state.has_run(phase, now, self.config.bucket_minutes) {
            info!("{} already ran, use force to re-run", phase);
            return Ok(PhaseOutcome::AlreadyRan);
        }

        info!("Manual run: {}{}", phase, if force { " (forced)" } else { "" });
        let summary = self.run_phase(phase, now).await?;
        self.mark_ran(&mut state, phase, now).await?;
        Ok(PhaseOutcome::Ran(summary))
    }

    async fn mark_ran(&self, state: &mut RunState, phase: Phase, now: NaiveDateTime) -> Result<(), StoreError> {
        let next = state.clone().mark_ran(phase, now, self.config.bucket_minutes);
        self.deps.run_state.save(&next).await?;
        *state = next;
        Ok(())
    }

    async fn run_phase(&self, phase: Phase, now: NaiveDateTime) -> Result<PhaseSummary, EngineError> {
        let summary = match phase {
            Phase::DailyScan => self.daily_scan(now.date()).await?,
            Phase::DecisionRunner => self.decision_runner().await?,
            Phase::MorningConfirm => self.morning_confirm().await?,
            Phase::TriggerMonitor => self.trigger_monitor(now.date()).await?,
        };
        info!("✓ {} done: {:?}", phase, summary);
        Ok(summary)
    }

    async fn daily_scan(&self, today: NaiveDate) -> Result<PhaseSummary, EngineError> {
        let mut summary = PhaseSummary::new(Phase::DailyScan);

        // New trading day: brokers knocked out yesterday get another chance
        self.deps.gateway.reset_sessions().await;
        summary.plans_expired = self.deps.plans.expire_stale(Utc::now()).await?;

        let output = self
            .deps
            .signals
            .scan(today)
            .await
            .map_err(|e| EngineError::Scan(e.to_string()))?;

        summary.watchlist = self.deps.plans.save_watchlist(today, &output.watchlist).await?;

        for proposal in &output.plans {
            let duplicate = self
                .deps
                .plans
                .has_active_plan(&proposal.symbol, &proposal.strategy)
                .await?
                || self.deps.store.has_open_trade(&proposal.symbol).await?;
            if duplicate {
                debug!("{} ({}) already planned or open, skipped", proposal.symbol, proposal.strategy);
                summary.plans_skipped += 1;
                continue;
            }

            match self
                .deps
                .plans
                .insert_plan(proposal, Utc::now(), self.config.plan_expiry_days)
                .await
            {
                Ok(_) => summary.plans_created += 1,
                Err(e) => {
                    error!("Could not store plan for {}: {}", proposal.symbol, e);
                    summary.failures += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Confirm overnight plans into sized, approved plans
    async fn decision_runner(&self) -> Result<PhaseSummary, EngineError> {
        let mut summary = PhaseSummary::new(Phase::DecisionRunner);
        let pending = self
            .deps
            .plans
            .fetch_by_status(&[PlanStatus::Planned, PlanStatus::Hold])
            .await?;

        for plan in pending {
            let verdict = match self.deps.engine.evaluate(&Candidate::from(&plan)).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    error!("Evaluation failed for plan {} ({}): {}", plan.id, plan.symbol, e);
                    summary.failures += 1;
                    continue;
                }
            };

            let status = verdict.status();
            match status {
                PlanStatus::Approved => summary.approved += 1,
                PlanStatus::Rejected => summary.rejected += 1,
                _ => summary.held += 1,
            }
            if status == plan.status {
                continue;
            }

            let details = TransitionDetails {
                reason: Some(verdict.reason().to_string()),
                confidence: verdict.confidence(),
                planned_qty: match &verdict {
                    Verdict::Approved(ticket) => Some(ticket.size.quantity),
                    _ => None,
                },
            };
            if !self.transition(&plan, status, details).await {
                summary.failures += 1;
            }
        }
        Ok(summary)
    }

    /// Re-score approved plans with fresh scanner inputs, demoting any that
    /// fell below the confidence floor
    async fn morning_confirm(&self) -> Result<PhaseSummary, EngineError> {
        let mut summary = PhaseSummary::new(Phase::MorningConfirm);
        let approved = self.deps.plans.fetch_by_status(&[PlanStatus::Approved]).await?;

        for plan in approved {
            let Some(inputs) = self.deps.signals.refresh_inputs(&plan.symbol).await else {
                debug!("No fresh inputs for {}, keeping approval", plan.symbol);
                summary.approved += 1;
                continue;
            };
            self.deps.plans.update_inputs(plan.id, &inputs).await?;

            let rr = Candidate::from(&plan).effective_risk_reward();
            let score = confidence::score(&inputs, rr);
            if score >= self.deps.engine.min_confidence() {
                summary.approved += 1;
                continue;
            }

            warn!(
                "{} confidence fell from {} to {}, demoting",
                plan.symbol,
                plan.confidence.map_or("?".to_string(), |c| c.to_string()),
                score
            );
            let details = TransitionDetails {
                reason: Some(format!("Confidence regressed to {}", score)),
                confidence: Some(score),
                planned_qty: None,
            };
            if self.transition(&plan, PlanStatus::Hold, details).await {
                summary.demoted += 1;
            } else {
                summary.failures += 1;
            }
        }
        Ok(summary)
    }

    /// Enter plans whose trigger price was reached, then run the monitor pass
    async fn trigger_monitor(&self, today: NaiveDate) -> Result<PhaseSummary, EngineError> {
        let mut summary = PhaseSummary::new(Phase::TriggerMonitor);
        summary.plans_expired = self.deps.plans.expire_stale(Utc::now()).await?;

        // Read once: the mode in force for this whole pass
        let order_config = self.deps.order_config.snapshot();
        let pending = self.deps.plans.fetch_active_plans().await?;

        let priced = join_all(pending.iter().map(|plan| async move {
            let price = timeout(self.per_symbol_timeout, self.deps.market_data.get_ltp(&plan.symbol)).await;
            (plan, price)
        }))
        .await;

        for (plan, price) in priced {
            let price = match price {
                Ok(Ok(Some(price))) => price,
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => {
                    warn!("No trigger price for {}: {}", plan.symbol, e);
                    continue;
                }
                Err(_) => {
                    warn!("Price fetch for {} timed out after {:?}", plan.symbol, self.per_symbol_timeout);
                    continue;
                }
            };

            if !plan.side.has_reached(price, plan.entry_price) {
                continue;
            }
            debug!("{} triggered at {:.2} (entry {:.2})", plan.symbol, price, plan.entry_price);

            match self.trigger_plan(plan, &order_config, today).await {
                Ok(TriggerResult::Entered) => summary.triggered += 1,
                Ok(TriggerResult::EntryFailed) => summary.entry_failures += 1,
                Ok(TriggerResult::Rejected) => summary.rejected += 1,
                Ok(TriggerResult::Held) => summary.held += 1,
                Err(e) => {
                    error!("[{}] Trigger failed for {}: {}", e.error_code(), plan.symbol, e);
                    summary.failures += 1;
                }
            }
        }

        summary.monitor = Some(self.deps.monitor.run_pass(&order_config, today).await?);
        Ok(summary)
    }

    async fn trigger_plan(
        &self,
        plan: &SwingPlan,
        order_config: &OrderConfig,
        today: NaiveDate,
    ) -> Result<TriggerResult, EngineError> {
        match self
            .deps
            .engine
            .approve_and_commit(&Candidate::from(plan), today)
            .await?
        {
            Commitment::Opened { trade, confidence } => {
                let placed = self
                    .deps
                    .gateway
                    .place_entry(
                        order_config,
                        trade.id,
                        &trade.symbol,
                        trade.initial_qty,
                        trade.side.entry_order_side(),
                    )
                    .await;

                match placed {
                    Ok(true) => {
                        let details = TransitionDetails {
                            reason: Some(format!("Entered as trade {}", trade.id)),
                            confidence: Some(confidence),
                            planned_qty: Some(trade.initial_qty),
                        };
                        self.transition(plan, PlanStatus::Triggered, details).await;
                        info!(
                            "✓ {} entered: {} x{} @ {:.2}",
                            trade.symbol, trade.side, trade.initial_qty, trade.entry_price
                        );
                        Ok(TriggerResult::Entered)
                    }
                    outcome => {
                        if let Err(e) = &outcome {
                            error!("Entry order for {} errored: {}", trade.symbol, e);
                        }
                        self.deps.store.discard_trade(trade.id).await?;
                        if plan.status != PlanStatus::Hold {
                            self.transition(plan, PlanStatus::Hold, TransitionDetails::reason("Entry order failed"))
                                .await;
                        }
                        Ok(TriggerResult::EntryFailed)
                    }
                }
            }
            Commitment::Rejected { reason, confidence } => {
                let details = TransitionDetails {
                    reason: Some(reason),
                    confidence,
                    planned_qty: None,
                };
                self.transition(plan, PlanStatus::Rejected, details).await;
                Ok(TriggerResult::Rejected)
            }
            Commitment::Hold { reason, confidence } => {
                if plan.status != PlanStatus::Hold {
                    let details = TransitionDetails {
                        reason: Some(reason),
                        confidence,
                        planned_qty: None,
                    };
                    self.transition(plan, PlanStatus::Hold, details).await;
                }
                Ok(TriggerResult::Held)
            }
        }
    }

    /// Apply a plan transition, logging instead of failing the phase
    async fn transition(&self, plan: &SwingPlan, to: PlanStatus, details: TransitionDetails) -> bool {
        match self.deps.plans.transition(plan.id, to, details).await {
            Ok(_) => true,
            Err(e) => {
                error!("Plan {} ({}) {} -> {} failed: {}", plan.id, plan.symbol, plan.status, to, e);
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TriggerResult {
    Entered,
    EntryFailed,
    Rejected,
    Held,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticOrderConfig;
    use crate::domain::entities::order::{BrokerSettings, OrderMode};
    use crate::domain::entities::plan::{ConfidenceInputs, PlanProposal, WatchlistEntry};
    use crate::domain::entities::settings::RiskProfile;
    use crate::domain::entities::trade::Side;
    use crate::domain::repositories::broker_client::BrokerError;
    use crate::domain::repositories::signal_source::{ScanError, ScanOutput};
    use crate::domain::services::circuit_breaker::CircuitBreakerConfig;
    use crate::domain::services::exit_rules::ExitPolicy;
    use crate::domain::services::retry::RetryPolicy;
    use crate::infrastructure::broker_registry::BrokerRegistry;
    use crate::infrastructure::mock::{MockBroker, MockMarketData, MockSignalSource};
    use crate::persistence::ledger::CapitalLedger;
    use crate::persistence::order_audit::OrderAuditRepository;
    use crate::persistence::test_pool;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 19)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn strong() -> ConfidenceInputs {
        ConfidenceInputs {
            htf_trend_bullish: true,
            favorable_location: true,
            rsi: Some(55.0),
            volume_ratio: Some(1.5),
        }
    }

    fn proposal(symbol: &str, inputs: ConfidenceInputs) -> PlanProposal {
        PlanProposal {
            symbol: symbol.to_string(),
            strategy: "pullback".to_string(),
            side: Side::Long,
            entry: 50.0,
            sl: 48.0,
            target: 54.0,
            rr: 2.0,
            expiry: None,
            inputs,
        }
    }

    struct Harness {
        scheduler: Scheduler,
        signals: Arc<MockSignalSource>,
        market: Arc<MockMarketData>,
        broker: Arc<MockBroker>,
        order_config: Arc<StaticOrderConfig>,
        plans: Arc<PlanRepository>,
        store: Arc<TradeStore>,
        pool: crate::persistence::DbPool,
    }

    async fn harness(output: ScanOutput) -> Harness {
        let pool = test_pool().await;
        let ledger = Arc::new(CapitalLedger::new(pool.clone()));
        ledger
            .ensure_settings(&RiskProfile::new(100_000.0, 50_000.0, 25_000.0, 1.0, 5))
            .await
            .unwrap();

        let broker = Arc::new(MockBroker::new("dhan"));
        let mut registry = BrokerRegistry::new(CircuitBreakerConfig::default());
        registry.register(broker.clone());

        let store = Arc::new(TradeStore::new(pool.clone()));
        let plans = Arc::new(PlanRepository::new(pool.clone()));
        let market = Arc::new(MockMarketData::new());
        let signals = Arc::new(MockSignalSource::new(output));
        let order_config = Arc::new(StaticOrderConfig::new(OrderConfig::paper()));

        let gateway = Arc::new(OrderGateway::new(
            Arc::new(registry),
            store.clone(),
            Arc::new(OrderAuditRepository::new(pool.clone())),
            Some(market.clone()),
            RetryPolicy {
                max_attempts: 1,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        ));
        let monitor = Arc::new(PositionMonitor::new(
            store.clone(),
            gateway.clone(),
            market.clone(),
            ExitPolicy::default(),
            Duration::from_secs(2),
        ));
        let engine = Arc::new(DecisionEngine::new(ledger, store.clone(), 6));

        let scheduler = Scheduler::load(
            SchedulerConfig::default(),
            Duration::from_secs(2),
            SchedulerDeps {
                plans: plans.clone(),
                store: store.clone(),
                engine,
                gateway,
                monitor,
                market_data: market.clone(),
                signals: signals.clone(),
                order_config: order_config.clone(),
                run_state: RunStateRepository::new(pool.clone()),
            },
        )
        .await
        .unwrap();

        Harness {
            scheduler,
            signals,
            market,
            broker,
            order_config,
            plans,
            store,
            pool,
        }
    }

    #[test]
    fn test_time_window_parsing() {
        let window: TimeWindow = "09:15-09:20".parse().unwrap();
        assert!(window.contains(hm(9, 15)));
        assert!(window.contains(hm(9, 19)));
        assert!(!window.contains(hm(9, 20)));
        assert_eq!(window.to_string(), "09:15-09:20");

        assert!("9am".parse::<TimeWindow>().is_err());
        assert!("10:00-09:00".parse::<TimeWindow>().is_err());
    }

    #[test]
    fn test_due_phases_respect_windows_and_markers() {
        let config = SchedulerConfig::default();
        let state = RunState::default();

        assert_eq!(due_phases(&config, &state, at(8, 45)), vec![Phase::DailyScan]);
        assert_eq!(
            due_phases(&config, &state, at(9, 16)),
            vec![Phase::DecisionRunner, Phase::MorningConfirm]
        );
        assert!(due_phases(&config, &state, at(16, 0)).is_empty());

        let state = state.mark_ran(Phase::TriggerMonitor, at(9, 21), config.bucket_minutes);
        assert!(!due_phases(&config, &state, at(9, 24)).contains(&Phase::TriggerMonitor));
        assert!(due_phases(&config, &state, at(9, 25)).contains(&Phase::TriggerMonitor));
    }

    #[tokio::test]
    async fn test_scan_runs_once_per_day_unless_forced() {
        let h = harness(ScanOutput {
            watchlist: vec![WatchlistEntry {
                symbol: "INFY".to_string(),
                strategy: "pullback".to_string(),
                bias: "LONG".to_string(),
                score: 8.0,
            }],
            plans: vec![proposal("INFY", strong())],
        })
        .await;

        let first = h.scheduler.run_manual_at(Phase::DailyScan, false, at(8, 40)).await.unwrap();
        let PhaseOutcome::Ran(summary) = first else {
            panic!("expected a run");
        };
        assert_eq!(summary.plans_created, 1);
        assert_eq!(summary.watchlist, 1);

        let second = h.scheduler.run_manual_at(Phase::DailyScan, false, at(8, 50)).await.unwrap();
        assert_eq!(second, PhaseOutcome::AlreadyRan);
        assert_eq!(h.signals.scans(), 1);

        // Forced re-run scans again but does not duplicate the live plan
        let forced = h.scheduler.run_manual_at(Phase::DailyScan, true, at(8, 55)).await.unwrap();
        let PhaseOutcome::Ran(summary) = forced else {
            panic!("expected a run");
        };
        assert_eq!(summary.plans_skipped, 1);
        assert_eq!(h.signals.scans(), 2);
        assert_eq!(h.plans.fetch_active_plans().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_phase_is_retried_next_tick() {
        let h = harness(ScanOutput::default()).await;
        h.signals
            .fail_scans(Some(ScanError::Io("scanner offline".into())))
            .await;

        let results = h.scheduler.tick_at(at(8, 40)).await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].1, Err(EngineError::Scan(_))));
        assert!(!h.scheduler.run_state().await.has_run(Phase::DailyScan, at(8, 40), 5));

        h.signals.fail_scans(None).await;
        let results = h.scheduler.tick_at(at(8, 41)).await;
        assert!(results[0].1.is_ok());
        assert!(h.scheduler.tick_at(at(8, 42)).await.is_empty());
    }

    #[tokio::test]
    async fn test_run_state_survives_restart() {
        let h = harness(ScanOutput::default()).await;
        h.scheduler.tick_at(at(8, 40)).await;

        let reloaded = RunStateRepository::new(h.pool.clone()).load().await.unwrap();
        assert!(reloaded.has_run(Phase::DailyScan, at(8, 45), 5));
    }

    #[tokio::test]
    async fn test_decision_runner_records_confirmation() {
        let h = harness(ScanOutput {
            watchlist: Vec::new(),
            plans: vec![proposal("INFY", strong()), proposal("TCS", ConfidenceInputs::default())],
        })
        .await;
        h.scheduler.tick_at(at(8, 40)).await;

        let results = h.scheduler.tick_at(at(9, 15)).await;
        let (_, decision) = &results[0];
        let summary = decision.as_ref().unwrap();
        assert_eq!(summary.approved, 1);
        assert_eq!(summary.rejected, 1);

        let approved = h.plans.fetch_by_status(&[PlanStatus::Approved]).await.unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].symbol, "INFY");
        assert_eq!(approved[0].confidence, Some(8));
        assert_eq!(approved[0].planned_qty, Some(500));

        let rejected = h.plans.fetch_by_status(&[PlanStatus::Rejected]).await.unwrap();
        assert_eq!(rejected[0].reason.as_deref(), Some("Low confidence"));
    }

    #[tokio::test]
    async fn test_morning_confirm_demotes_on_regression() {
        let h = harness(ScanOutput {
            watchlist: Vec::new(),
            plans: vec![proposal("INFY", strong())],
        })
        .await;
        h.scheduler.run_manual_at(Phase::DailyScan, false, at(8, 40)).await.unwrap();
        h.scheduler.run_manual_at(Phase::DecisionRunner, false, at(9, 15)).await.unwrap();

        h.signals
            .set_refreshed_inputs(
                "INFY",
                ConfidenceInputs {
                    htf_trend_bullish: true,
                    ..ConfidenceInputs::default()
                },
            )
            .await;
        let outcome = h.scheduler.run_manual_at(Phase::MorningConfirm, false, at(9, 16)).await.unwrap();
        let PhaseOutcome::Ran(summary) = outcome else {
            panic!("expected a run");
        };
        assert_eq!(summary.demoted, 1);

        let held = h.plans.fetch_by_status(&[PlanStatus::Hold]).await.unwrap();
        assert_eq!(held[0].reason.as_deref(), Some("Confidence regressed to 3"));
        assert_eq!(held[0].confidence, Some(3));
    }

    #[tokio::test]
    async fn test_trigger_enters_and_marks_plan() {
        let h = harness(ScanOutput {
            watchlist: Vec::new(),
            plans: vec![proposal("INFY", strong()), proposal("TCS", strong())],
        })
        .await;
        h.scheduler.run_manual_at(Phase::DailyScan, false, at(8, 40)).await.unwrap();

        h.market.set_price("INFY", 50.2).await;
        h.market.set_price("TCS", 49.0).await;
        let outcome = h.scheduler.run_manual_at(Phase::TriggerMonitor, false, at(9, 30)).await.unwrap();
        let PhaseOutcome::Ran(summary) = outcome else {
            panic!("expected a run");
        };
        assert_eq!(summary.triggered, 1);
        assert_eq!(summary.monitor.unwrap().evaluated, 1);

        let triggered = h.plans.fetch_by_status(&[PlanStatus::Triggered]).await.unwrap();
        assert_eq!(triggered[0].symbol, "INFY");
        let open = h.store.fetch_open_trades().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].plan_id, Some(triggered[0].id));
    }

    #[tokio::test]
    async fn test_failed_live_entry_rolls_back_trade() {
        let h = harness(ScanOutput {
            watchlist: Vec::new(),
            plans: vec![proposal("INFY", strong())],
        })
        .await;
        h.scheduler.run_manual_at(Phase::DailyScan, false, at(8, 40)).await.unwrap();

        h.broker.reject_all(BrokerError::Rejected("no margin".into())).await;
        h.order_config.set(OrderConfig {
            mode: OrderMode::Live,
            brokers: vec![BrokerSettings {
                name: "dhan".to_string(),
                enabled: true,
                auto_order: true,
                max_qty: None,
            }],
        });
        h.market.set_price("INFY", 50.0).await;

        let outcome = h.scheduler.run_manual_at(Phase::TriggerMonitor, false, at(9, 30)).await.unwrap();
        let PhaseOutcome::Ran(summary) = outcome else {
            panic!("expected a run");
        };
        assert_eq!(summary.entry_failures, 1);
        assert!(h.store.fetch_open_trades().await.unwrap().is_empty());

        let held = h.plans.fetch_by_status(&[PlanStatus::Hold]).await.unwrap();
        assert_eq!(held[0].reason.as_deref(), Some("Entry order failed"));

        let ledger = CapitalLedger::new(h.pool.clone());
        assert_eq!(ledger.settings().await.unwrap().available_swing_capital, 50_000.0);
    }
}
