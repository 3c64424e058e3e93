use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::entities::plan::{ConfidenceInputs, PlanProposal, WatchlistEntry};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScanError {
    #[error("Scanner output unreadable: {0}")]
    Io(String),

    #[error("Scanner output malformed: {0}")]
    Parse(String),
}

/// Everything one scanner run produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanOutput {
    #[serde(default)]
    pub watchlist: Vec<WatchlistEntry>,
    #[serde(default)]
    pub plans: Vec<PlanProposal>,
}

/// External scanning component
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn scan(&self, day: NaiveDate) -> Result<ScanOutput, ScanError>;

    /// Latest confidence inputs for a symbol, used by morning confirmation
    async fn refresh_inputs(&self, symbol: &str) -> Option<ConfidenceInputs>;
}
