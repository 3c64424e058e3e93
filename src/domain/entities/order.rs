use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            other => Err(format!("Unknown order side: {}", other)),
        }
    }
}

/// Simulated vs. real broker execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderMode {
    Paper,
    Live,
}

impl OrderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderMode::Paper => "PAPER",
            OrderMode::Live => "LIVE",
        }
    }
}

impl FromStr for OrderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PAPER" => Ok(OrderMode::Paper),
            "LIVE" => Ok(OrderMode::Live),
            other => Err(format!("Unknown order mode: {}", other)),
        }
    }
}

/// Whether an order opens or reduces a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderPurpose {
    Entry,
    Exit,
}

impl OrderPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderPurpose::Entry => "ENTRY",
            OrderPurpose::Exit => "EXIT",
        }
    }
}

impl FromStr for OrderPurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENTRY" => Ok(OrderPurpose::Entry),
            "EXIT" => Ok(OrderPurpose::Exit),
            other => Err(format!("Unknown order purpose: {}", other)),
        }
    }
}

/// Audit status. Starts `Attempted` and moves exactly once to a terminal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderAuditStatus {
    Attempted,
    Success,
    Failed,
    Skipped,
}

impl OrderAuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAuditStatus::Attempted => "ATTEMPTED",
            OrderAuditStatus::Success => "SUCCESS",
            OrderAuditStatus::Failed => "FAILED",
            OrderAuditStatus::Skipped => "SKIPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderAuditStatus::Attempted)
    }
}

impl FromStr for OrderAuditStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ATTEMPTED" => Ok(OrderAuditStatus::Attempted),
            "SUCCESS" => Ok(OrderAuditStatus::Success),
            "FAILED" => Ok(OrderAuditStatus::Failed),
            "SKIPPED" => Ok(OrderAuditStatus::Skipped),
            other => Err(format!("Unknown audit status: {}", other)),
        }
    }
}

/// One order attempt issued by the gateway
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderAudit {
    pub id: i64,
    pub trade_id: i64,
    pub symbol: String,
    pub broker: String,
    pub mode: OrderMode,
    pub purpose: OrderPurpose,
    pub side: OrderSide,
    pub quantity: i64,
    pub instrument_id: Option<String>,
    pub status: OrderAuditStatus,
    pub request: serde_json::Value,
    pub response: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-broker execution outcome linked to an audit row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerTrade {
    pub id: i64,
    pub audit_id: i64,
    pub trade_id: i64,
    pub broker: String,
    pub purpose: OrderPurpose,
    pub side: OrderSide,
    pub quantity: i64,
    pub order_id: Option<String>,
    pub status: OrderAuditStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-broker switches read from the settings surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerSettings {
    pub name: String,
    pub enabled: bool,
    pub auto_order: bool,
    pub max_qty: Option<i64>,
}

impl BrokerSettings {
    pub fn accepts_orders(&self) -> bool {
        self.enabled && self.auto_order
    }
}

/// Snapshot of order routing configuration taken once per gateway call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderConfig {
    pub mode: OrderMode,
    pub brokers: Vec<BrokerSettings>,
}

impl OrderConfig {
    pub fn paper() -> Self {
        Self {
            mode: OrderMode::Paper,
            brokers: Vec::new(),
        }
    }

    pub fn broker(&self, name: &str) -> Option<&BrokerSettings> {
        self.brokers.iter().find(|b| b.name.eq_ignore_ascii_case(name))
    }
}
