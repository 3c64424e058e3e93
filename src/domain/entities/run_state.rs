use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named daily phases driven by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    DailyScan,
    DecisionRunner,
    MorningConfirm,
    TriggerMonitor,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::DailyScan,
        Phase::DecisionRunner,
        Phase::MorningConfirm,
        Phase::TriggerMonitor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::DailyScan => "daily_scan",
            Phase::DecisionRunner => "decision_runner",
            Phase::MorningConfirm => "morning_confirm",
            Phase::TriggerMonitor => "trigger_monitor",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily_scan" | "scan" => Ok(Phase::DailyScan),
            "decision_runner" | "decision" => Ok(Phase::DecisionRunner),
            "morning_confirm" | "confirm" => Ok(Phase::MorningConfirm),
            "trigger_monitor" | "trigger" | "monitor" => Ok(Phase::TriggerMonitor),
            other => Err(format!("Unknown phase: {}", other)),
        }
    }
}

/// Coarse time bucket inside the trigger window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSlot {
    pub day: NaiveDate,
    pub bucket: u32,
}

impl TriggerSlot {
    pub fn at(now: NaiveDateTime, bucket_minutes: u32) -> Self {
        let minutes = now.hour() * 60 + now.minute();
        Self {
            day: now.date(),
            bucket: minutes / bucket_minutes.max(1),
        }
    }
}

/// Persisted "already ran" markers, one per phase.
///
/// Passed into and returned from scheduling decisions so a restart never
/// re-runs a completed phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub last_scan: Option<NaiveDate>,
    pub last_decision: Option<NaiveDate>,
    pub last_confirm: Option<NaiveDate>,
    pub last_trigger_slot: Option<TriggerSlot>,
}

impl RunState {
    pub fn has_run(&self, phase: Phase, now: NaiveDateTime, bucket_minutes: u32) -> bool {
        let today = Some(now.date());
        match phase {
            Phase::DailyScan => self.last_scan == today,
            Phase::DecisionRunner => self.last_decision == today,
            Phase::MorningConfirm => self.last_confirm == today,
            Phase::TriggerMonitor => {
                self.last_trigger_slot == Some(TriggerSlot::at(now, bucket_minutes))
            }
        }
    }

    pub fn mark_ran(mut self, phase: Phase, now: NaiveDateTime, bucket_minutes: u32) -> Self {
        let today = now.date();
        match phase {
            Phase::DailyScan => self.last_scan = Some(today),
            Phase::DecisionRunner => self.last_decision = Some(today),
            Phase::MorningConfirm => self.last_confirm = Some(today),
            Phase::TriggerMonitor => {
                self.last_trigger_slot = Some(TriggerSlot::at(now, bucket_minutes))
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 19)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_daily_phase_marks_whole_day() {
        let state = RunState::default().mark_ran(Phase::DailyScan, at(8, 35), 5);
        assert!(state.has_run(Phase::DailyScan, at(14, 0), 5));
        assert!(!state.has_run(Phase::DecisionRunner, at(14, 0), 5));

        let tomorrow = at(8, 35) + chrono::Duration::days(1);
        assert!(!state.has_run(Phase::DailyScan, tomorrow, 5));
    }

    #[test]
    fn test_trigger_phase_marks_bucket_only() {
        let state = RunState::default().mark_ran(Phase::TriggerMonitor, at(9, 21), 5);
        assert!(state.has_run(Phase::TriggerMonitor, at(9, 24), 5));
        assert!(!state.has_run(Phase::TriggerMonitor, at(9, 25), 5));
    }

    #[test]
    fn test_phase_aliases() {
        assert_eq!("scan".parse::<Phase>(), Ok(Phase::DailyScan));
        assert_eq!("TRIGGER".parse::<Phase>(), Ok(Phase::TriggerMonitor));
        assert!("lunch".parse::<Phase>().is_err());
    }

    #[test]
    fn test_run_state_serializes() {
        let state = RunState::default().mark_ran(Phase::MorningConfirm, at(9, 16), 5);
        let json = serde_json::to_string(&state).unwrap();
        let back: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
