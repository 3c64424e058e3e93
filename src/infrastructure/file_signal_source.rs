//! Scanner output reader
//!
//! The external scanner writes one JSON document per run:
//!
//! ```json
//! {
//!   "scan_date": "2026-10-19",
//!   "watchlist": [{"symbol": "INFY", "strategy": "pullback", "bias": "LONG", "score": 7.5}],
//!   "plans": [{"symbol": "INFY", "entry": 1500, "sl": 1470, "target": 1560, "rr": 2.0}]
//! }
//! ```
//!
//! Morning confirmation re-reads the same file to pick up refreshed
//! confidence inputs.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::domain::entities::plan::ConfidenceInputs;
use crate::domain::repositories::signal_source::{ScanError, ScanOutput, SignalSource};

#[derive(Debug, Deserialize)]
struct ScannerFile {
    #[serde(default)]
    scan_date: Option<NaiveDate>,
    #[serde(flatten)]
    output: ScanOutput,
}

pub struct FileSignalSource {
    path: PathBuf,
}

impl FileSignalSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read(&self) -> Result<ScannerFile, ScanError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ScanError::Io(format!("{}: {}", self.path.display(), e)))?;
        serde_json::from_str(&raw).map_err(|e| ScanError::Parse(e.to_string()))
    }
}

#[async_trait]
impl SignalSource for FileSignalSource {
    async fn scan(&self, day: NaiveDate) -> Result<ScanOutput, ScanError> {
        let file = self.read().await?;

        if let Some(scan_date) = file.scan_date {
            if scan_date != day {
                warn!(
                    "Scanner output is dated {} but today is {}; ignoring it",
                    scan_date, day
                );
                return Ok(ScanOutput::default());
            }
        }

        debug!(
            "Scanner output: {} watchlist rows, {} plans",
            file.output.watchlist.len(),
            file.output.plans.len()
        );
        Ok(file.output)
    }

    async fn refresh_inputs(&self, symbol: &str) -> Option<ConfidenceInputs> {
        match self.read().await {
            Ok(file) => file
                .output
                .plans
                .into_iter()
                .find(|p| p.symbol.eq_ignore_ascii_case(symbol))
                .map(|p| p.inputs),
            Err(e) => {
                warn!("Could not refresh inputs for {}: {}", symbol, e);
                None
            }
        }
    }
}
