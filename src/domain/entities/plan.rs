use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::entities::trade::Side;

/// Default window after which an untriggered plan expires
pub const DEFAULT_PLAN_EXPIRY_DAYS: i64 = 7;

/// Lifecycle of a trade intent.
///
/// `Rejected`, `Triggered` and `Expired` are terminal: a plan never changes
/// once it reaches one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanStatus {
    Planned,
    Approved,
    Rejected,
    Hold,
    Triggered,
    Expired,
}

impl PlanStatus {
    pub const ACTIVE: [PlanStatus; 3] = [PlanStatus::Planned, PlanStatus::Approved, PlanStatus::Hold];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Planned => "PLANNED",
            PlanStatus::Approved => "APPROVED",
            PlanStatus::Rejected => "REJECTED",
            PlanStatus::Hold => "HOLD",
            PlanStatus::Triggered => "TRIGGERED",
            PlanStatus::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Rejected | PlanStatus::Triggered | PlanStatus::Expired
        )
    }

    pub fn can_transition_to(&self, next: PlanStatus) -> bool {
        use PlanStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Expired) => true,
            (Planned, Approved | Rejected | Hold | Triggered) => true,
            (Hold, Approved | Rejected | Triggered) => true,
            // Morning confirmation may demote an approved plan
            (Approved, Hold | Rejected | Triggered) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PLANNED" => Ok(PlanStatus::Planned),
            "APPROVED" => Ok(PlanStatus::Approved),
            "REJECTED" => Ok(PlanStatus::Rejected),
            "HOLD" => Ok(PlanStatus::Hold),
            "TRIGGERED" => Ok(PlanStatus::Triggered),
            "EXPIRED" => Ok(PlanStatus::Expired),
            other => Err(format!("Unknown plan status: {}", other)),
        }
    }
}

/// Scanner-provided inputs to the confidence rubric
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceInputs {
    pub htf_trend_bullish: bool,
    pub favorable_location: bool,
    pub rsi: Option<f64>,
    pub volume_ratio: Option<f64>,
}

/// A trade intent awaiting evaluation and a price trigger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwingPlan {
    pub id: i64,
    pub symbol: String,
    pub strategy: String,
    pub side: Side,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub target: f64,
    pub risk_reward: f64,
    pub status: PlanStatus,
    pub reason: Option<String>,
    pub confidence: Option<i64>,
    pub planned_qty: Option<i64>,
    pub inputs: ConfidenceInputs,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SwingPlan {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && now > self.expires_at
    }
}

/// Plan proposal emitted by the external scanner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanProposal {
    pub symbol: String,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_side")]
    pub side: Side,
    pub entry: f64,
    pub sl: f64,
    pub target: f64,
    pub rr: f64,
    /// Expiry in days; the configured default applies when absent
    #[serde(default)]
    pub expiry: Option<i64>,
    #[serde(default)]
    pub inputs: ConfidenceInputs,
}

fn default_strategy() -> String {
    "swing".to_string()
}

fn default_side() -> Side {
    Side::Long
}

impl PlanProposal {
    pub fn expires_at(&self, created_at: DateTime<Utc>, default_days: i64) -> DateTime<Utc> {
        created_at + Duration::days(self.expiry.unwrap_or(default_days).max(1))
    }
}

/// Watchlist row emitted by the scanner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub symbol: String,
    pub strategy: String,
    pub bias: String,
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses_never_transition() {
        for terminal in [PlanStatus::Rejected, PlanStatus::Triggered, PlanStatus::Expired] {
            for next in [
                PlanStatus::Planned,
                PlanStatus::Approved,
                PlanStatus::Hold,
                PlanStatus::Triggered,
                PlanStatus::Expired,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_allowed_transitions() {
        assert!(PlanStatus::Planned.can_transition_to(PlanStatus::Triggered));
        assert!(PlanStatus::Planned.can_transition_to(PlanStatus::Hold));
        assert!(PlanStatus::Hold.can_transition_to(PlanStatus::Approved));
        assert!(PlanStatus::Hold.can_transition_to(PlanStatus::Expired));
        assert!(PlanStatus::Approved.can_transition_to(PlanStatus::Hold));
        assert!(!PlanStatus::Hold.can_transition_to(PlanStatus::Hold));
        assert!(!PlanStatus::Hold.can_transition_to(PlanStatus::Planned));
    }

    #[test]
    fn test_proposal_deserializes_with_defaults() {
        let json = r#"{"symbol":"TCS","entry":50.0,"sl":48.0,"target":54.0,"rr":2.0}"#;
        let proposal: PlanProposal = serde_json::from_str(json).unwrap();
        assert_eq!(proposal.side, Side::Long);
        assert_eq!(proposal.strategy, "swing");
        assert_eq!(proposal.inputs, ConfidenceInputs::default());

        let created = Utc::now();
        assert_eq!(
            proposal.expires_at(created, DEFAULT_PLAN_EXPIRY_DAYS),
            created + Duration::days(7)
        );
    }
}
