//! Decision Engine
//!
//! Turns a plan into a verdict. The pipeline short-circuits on the first
//! failing stage:
//!
//! 1. Price structure (entry/stop positive and on the right side of each other)
//! 2. Duplicate guard (a live trade already exists for the symbol)
//! 3. Confidence score against the minimum
//! 4. Position sizing
//! 5. Risk gate
//!
//! Structural, confidence and sizing failures reject the plan. Duplicates and
//! risk-gate failures only hold it, since they may clear on a later pass.

use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::entities::plan::{ConfidenceInputs, PlanStatus, SwingPlan};
use crate::domain::entities::trade::{NewTrade, Side, Trade};
use crate::domain::errors::StoreError;
use crate::domain::services::confidence;
use crate::domain::services::risk::PositionSize;
use crate::persistence::ledger::{CapitalLedger, LedgerSnapshot};
use crate::persistence::trade_store::TradeStore;

/// Everything the engine needs to know about a plan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub plan_id: Option<i64>,
    pub symbol: String,
    pub strategy: String,
    pub side: Side,
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
    pub risk_reward: f64,
    pub inputs: ConfidenceInputs,
}

impl Candidate {
    /// Scanner RR when given, otherwise derived from the prices
    pub fn effective_risk_reward(&self) -> f64 {
        if self.risk_reward > 0.0 {
            return self.risk_reward;
        }
        let risk = (self.entry - self.stop).abs();
        if risk > 0.0 {
            (self.target - self.entry).abs() / risk
        } else {
            0.0
        }
    }

    fn has_valid_structure(&self) -> bool {
        let finite = self.entry.is_finite() && self.stop.is_finite();
        let positive = self.entry > 0.0 && self.stop > 0.0;
        let ordered = match self.side {
            Side::Long => self.entry > self.stop,
            Side::Short => self.entry < self.stop,
        };
        finite && positive && ordered
    }
}

impl From<&SwingPlan> for Candidate {
    fn from(plan: &SwingPlan) -> Self {
        Self {
            plan_id: Some(plan.id),
            symbol: plan.symbol.clone(),
            strategy: plan.strategy.clone(),
            side: plan.side,
            entry: plan.entry_price,
            stop: plan.stop_loss,
            target: plan.target,
            risk_reward: plan.risk_reward,
            inputs: plan.inputs.clone(),
        }
    }
}

/// An approved, sized trade ready to be saved
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeTicket {
    pub candidate: Candidate,
    pub confidence: i64,
    pub size: PositionSize,
}

impl TradeTicket {
    pub fn into_new_trade(self, entry_day: NaiveDate) -> NewTrade {
        NewTrade {
            plan_id: self.candidate.plan_id,
            symbol: self.candidate.symbol,
            strategy: self.candidate.strategy,
            side: self.candidate.side,
            entry_price: self.candidate.entry,
            stop_loss: self.candidate.stop,
            target: self.candidate.target,
            quantity: self.size.quantity,
            confidence: self.confidence,
            entry_day,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Verdict {
    Approved(TradeTicket),
    Rejected {
        reason: String,
        confidence: Option<i64>,
    },
    Hold {
        reason: String,
        confidence: Option<i64>,
    },
}

impl Verdict {
    pub fn status(&self) -> PlanStatus {
        match self {
            Verdict::Approved(_) => PlanStatus::Approved,
            Verdict::Rejected { .. } => PlanStatus::Rejected,
            Verdict::Hold { .. } => PlanStatus::Hold,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Verdict::Approved(_) => "Approved",
            Verdict::Rejected { reason, .. } | Verdict::Hold { reason, .. } => reason,
        }
    }

    pub fn confidence(&self) -> Option<i64> {
        match self {
            Verdict::Approved(ticket) => Some(ticket.confidence),
            Verdict::Rejected { confidence, .. } | Verdict::Hold { confidence, .. } => *confidence,
        }
    }
}

/// Pure evaluation pipeline
pub fn decide(
    candidate: &Candidate,
    has_open_trade: bool,
    ledger: &LedgerSnapshot,
    min_confidence: i64,
) -> Verdict {
    if !candidate.has_valid_structure() {
        return Verdict::Rejected {
            reason: "Invalid price structure".to_string(),
            confidence: None,
        };
    }

    if has_open_trade {
        return Verdict::Hold {
            reason: "Duplicate open trade".to_string(),
            confidence: None,
        };
    }

    let score = confidence::score(&candidate.inputs, candidate.effective_risk_reward());
    if score < min_confidence {
        return Verdict::Rejected {
            reason: "Low confidence".to_string(),
            confidence: Some(score),
        };
    }

    let size = match ledger.size_position(candidate.entry, candidate.stop) {
        Ok(size) => size,
        Err(e) => {
            return Verdict::Rejected {
                reason: format!("Sizing failed: {}", e),
                confidence: Some(score),
            }
        }
    };

    let check = ledger.can_take_trade(size.position_value, candidate.entry);
    if !check.allowed {
        return Verdict::Hold {
            reason: check.reason,
            confidence: Some(score),
        };
    }

    Verdict::Approved(TradeTicket {
        candidate: candidate.clone(),
        confidence: score,
        size,
    })
}

/// Result of `DecisionEngine::approve_and_commit`
#[derive(Debug, Clone, PartialEq)]
pub enum Commitment {
    Opened { trade: Trade, confidence: i64 },
    Rejected { reason: String, confidence: Option<i64> },
    Hold { reason: String, confidence: Option<i64> },
}

pub struct DecisionEngine {
    ledger: Arc<CapitalLedger>,
    store: Arc<TradeStore>,
    min_confidence: i64,
}

impl DecisionEngine {
    pub fn new(ledger: Arc<CapitalLedger>, store: Arc<TradeStore>, min_confidence: i64) -> Self {
        Self {
            ledger,
            store,
            min_confidence,
        }
    }

    pub fn min_confidence(&self) -> i64 {
        self.min_confidence
    }

    /// Evaluate against current ledger state without side effects
    pub async fn evaluate(&self, candidate: &Candidate) -> Result<Verdict, StoreError> {
        let has_open = self.store.has_open_trade(&candidate.symbol).await?;
        let snapshot = self.ledger.snapshot().await?;
        let verdict = decide(candidate, has_open, &snapshot, self.min_confidence);

        debug!(
            "Decision for {}: {} ({})",
            candidate.symbol,
            verdict.status(),
            verdict.reason()
        );
        Ok(verdict)
    }

    /// Evaluate and, on approval, save the trade (locking its capital).
    ///
    /// Losing a capital race to a concurrent save turns into a hold.
    pub async fn approve_and_commit(
        &self,
        candidate: &Candidate,
        entry_day: NaiveDate,
    ) -> Result<Commitment, StoreError> {
        match self.evaluate(candidate).await? {
            Verdict::Approved(ticket) => {
                let confidence = ticket.confidence;
                match self.store.save_trade(&ticket.into_new_trade(entry_day)).await {
                    Ok(trade) => {
                        info!(
                            "✓ {} approved with confidence {} (qty {})",
                            trade.symbol, confidence, trade.initial_qty
                        );
                        Ok(Commitment::Opened { trade, confidence })
                    }
                    Err(StoreError::InsufficientCapital { required, available }) => {
                        warn!("{} held: capital taken concurrently", candidate.symbol);
                        Ok(Commitment::Hold {
                            reason: format!(
                                "Insufficient swing capital: required {:.2}, available {:.2}",
                                required, available
                            ),
                            confidence: Some(confidence),
                        })
                    }
                    Err(e) => Err(e),
                }
            }
            Verdict::Rejected { reason, confidence } => Ok(Commitment::Rejected { reason, confidence }),
            Verdict::Hold { reason, confidence } => Ok(Commitment::Hold { reason, confidence }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::settings::{PriceBracket, RiskProfile};
    use crate::domain::services::risk::Exposure;
    use crate::persistence::test_pool;

    fn strong_inputs() -> ConfidenceInputs {
        ConfidenceInputs {
            htf_trend_bullish: true,
            favorable_location: true,
            rsi: Some(55.0),
            volume_ratio: Some(1.6),
        }
    }

    fn candidate() -> Candidate {
        Candidate {
            plan_id: Some(1),
            symbol: "INFY".to_string(),
            strategy: "pullback".to_string(),
            side: Side::Long,
            entry: 50.0,
            stop: 48.0,
            target: 54.0,
            risk_reward: 2.0,
            inputs: strong_inputs(),
        }
    }

    fn snapshot() -> LedgerSnapshot {
        LedgerSnapshot {
            profile: RiskProfile::new(100_000.0, 50_000.0, 25_000.0, 1.0, 5),
            exposure: Exposure::default(),
        }
    }

    #[test]
    fn test_approves_sized_ticket() {
        let Verdict::Approved(ticket) = decide(&candidate(), false, &snapshot(), 6) else {
            panic!("expected approval");
        };
        assert_eq!(ticket.confidence, 8);
        assert_eq!(ticket.size.quantity, 500);
        assert_eq!(ticket.size.position_value, 25_000.0);
    }

    #[test]
    fn test_structure_checked_first() {
        let mut bad = candidate();
        bad.stop = 52.0;
        let verdict = decide(&bad, true, &snapshot(), 6);
        assert_eq!(verdict.status(), PlanStatus::Rejected);
        assert_eq!(verdict.reason(), "Invalid price structure");

        let mut short = candidate();
        short.side = Side::Short;
        short.stop = 52.0;
        short.target = 46.0;
        assert_eq!(decide(&short, false, &snapshot(), 6).status(), PlanStatus::Approved);
    }

    #[test]
    fn test_duplicate_holds_before_confidence() {
        let mut weak = candidate();
        weak.inputs = ConfidenceInputs::default();
        let verdict = decide(&weak, true, &snapshot(), 6);
        assert_eq!(verdict.status(), PlanStatus::Hold);
        assert_eq!(verdict.reason(), "Duplicate open trade");
    }

    #[test]
    fn test_low_confidence_rejects_with_score() {
        let mut weak = candidate();
        weak.inputs = ConfidenceInputs {
            htf_trend_bullish: true,
            ..ConfidenceInputs::default()
        };
        let verdict = decide(&weak, false, &snapshot(), 6);
        assert_eq!(verdict.status(), PlanStatus::Rejected);
        assert_eq!(verdict.reason(), "Low confidence");
        assert_eq!(verdict.confidence(), Some(3));
    }

    #[test]
    fn test_sizing_failure_rejects() {
        let mut tiny = snapshot();
        tiny.profile.total_capital = 100.0;
        let verdict = decide(&candidate(), false, &tiny, 6);
        assert_eq!(verdict.status(), PlanStatus::Rejected);
        assert!(verdict.reason().starts_with("Sizing failed"));
    }

    #[test]
    fn test_risk_gate_holds() {
        let mut full = snapshot();
        full.exposure = Exposure {
            open_trades: 5,
            used_capital: 10_000.0,
        };
        let verdict = decide(&candidate(), false, &full, 6);
        assert_eq!(verdict.status(), PlanStatus::Hold);
        assert!(verdict.reason().starts_with("Max open trades"));

        let mut bracketed = snapshot();
        bracketed.profile = bracketed.profile.with_brackets(vec![PriceBracket {
            min_price: 100.0,
            max_price: 500.0,
            enabled: true,
        }]);
        assert_eq!(decide(&candidate(), false, &bracketed, 6).status(), PlanStatus::Hold);
    }

    #[test]
    fn test_derived_risk_reward() {
        let mut c = candidate();
        c.risk_reward = 0.0;
        assert_eq!(c.effective_risk_reward(), 2.0);
    }

    #[tokio::test]
    async fn test_commit_locks_capital_and_holds_duplicates() {
        let pool = test_pool().await;
        let ledger = Arc::new(CapitalLedger::new(pool.clone()));
        ledger
            .ensure_settings(&RiskProfile::new(100_000.0, 50_000.0, 25_000.0, 1.0, 5))
            .await
            .unwrap();
        let store = Arc::new(TradeStore::new(pool));
        let engine = DecisionEngine::new(ledger.clone(), store.clone(), 6);
        let day = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();

        let Commitment::Opened { trade, confidence } =
            engine.approve_and_commit(&candidate(), day).await.unwrap()
        else {
            panic!("expected trade");
        };
        assert_eq!(confidence, 8);
        assert_eq!(trade.confidence, 8);
        assert_eq!(trade.position_value, 25_000.0);
        assert_eq!(ledger.settings().await.unwrap().available_swing_capital, 25_000.0);

        let again = engine.approve_and_commit(&candidate(), day).await.unwrap();
        assert!(matches!(again, Commitment::Hold { ref reason, .. } if reason == "Duplicate open trade"));
    }
}
