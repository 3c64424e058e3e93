//! Engine configuration
//!
//! Everything is read from the environment (after `dotenvy` has loaded a
//! `.env` file, if any). Invalid values are logged and replaced by their
//! defaults so a typo never keeps the engine from starting.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;
use tracing::warn;

use crate::application::scheduler::SchedulerConfig;
use crate::domain::entities::order::{BrokerSettings, OrderConfig, OrderMode};
use crate::domain::entities::plan::DEFAULT_PLAN_EXPIRY_DAYS;
use crate::domain::entities::settings::RiskProfile;
use crate::domain::services::circuit_breaker::CircuitBreakerConfig;
use crate::domain::services::confidence::DEFAULT_MIN_CONFIDENCE;
use crate::domain::services::exit_rules::ExitPolicy;
use crate::domain::services::retry::RetryPolicy;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/swingcore.db";
pub const DEFAULT_SCANNER_OUTPUT: &str = "data/scanner_output.json";
pub const DEFAULT_API_BIND: &str = "127.0.0.1:3000";
pub const DEFAULT_ORDER_CONFIG_FILE: &str = ".env";

/// One configured broker: routing switches plus connection details
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerEndpoint {
    pub name: String,
    pub enabled: bool,
    pub auto_order: bool,
    pub max_qty: Option<i64>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

impl BrokerEndpoint {
    fn from_lookup<L: Fn(&str) -> Option<String>>(name: &str, lookup: &L) -> Self {
        let prefix = format!("BROKER_{}", name.to_ascii_uppercase());
        let key = |suffix: &str| format!("{}_{}", prefix, suffix);
        Self {
            name: name.to_string(),
            enabled: parse_or(lookup, &key("ENABLED"), Flag(true)).0,
            auto_order: parse_or(lookup, &key("AUTO_ORDER"), Flag(false)).0,
            max_qty: lookup(&key("MAX_QTY")).and_then(|raw| match raw.trim().parse::<i64>() {
                Ok(qty) if qty > 0 => Some(qty),
                _ => {
                    warn!("Invalid {}: {:?}, no quantity cap applied", key("MAX_QTY"), raw);
                    None
                }
            }),
            base_url: non_empty(lookup(&key("BASE_URL"))),
            api_key: non_empty(lookup(&key("API_KEY"))),
            api_secret: non_empty(lookup(&key("API_SECRET"))),
        }
    }

    pub fn settings(&self) -> BrokerSettings {
        BrokerSettings {
            name: self.name.clone(),
            enabled: self.enabled,
            auto_order: self.auto_order,
            max_qty: self.max_qty,
        }
    }
}

/// Retry, breaker and timeout settings shared by every remote call
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
    pub per_symbol_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            per_symbol_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind: String,
    pub requests_per_minute: u32,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub order_mode: OrderMode,
    /// Dotenv file re-read for the order mode and broker flags
    pub order_config_file: PathBuf,
    /// In routing priority order
    pub brokers: Vec<BrokerEndpoint>,
    pub market_data_url: Option<String>,
    pub scanner_output_path: PathBuf,
    pub exit_policy: ExitPolicy,
    pub plan_expiry_days: i64,
    pub min_confidence: i64,
    pub scheduler: SchedulerConfig,
    pub resilience: ResilienceConfig,
    pub api: ApiConfig,
    /// Used only when the settings row does not exist yet
    pub seed: RiskProfile,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<L: Fn(&str) -> Option<String>>(lookup: L) -> Self {
        let defaults = SchedulerConfig::default();
        let seed_defaults = RiskProfile::default();
        let plan_expiry_days = parse_or(&lookup, "PLAN_EXPIRY_DAYS", DEFAULT_PLAN_EXPIRY_DAYS).max(1);

        let scheduler = SchedulerConfig {
            scan_window: parse_or(&lookup, "SCAN_WINDOW", defaults.scan_window),
            decision_window: parse_or(&lookup, "DECISION_WINDOW", defaults.decision_window),
            confirm_window: parse_or(&lookup, "CONFIRM_WINDOW", defaults.confirm_window),
            trigger_window: parse_or(&lookup, "TRIGGER_WINDOW", defaults.trigger_window),
            bucket_minutes: parse_or(&lookup, "TRIGGER_BUCKET_MINUTES", defaults.bucket_minutes).max(1),
            tick: Duration::from_secs(
                parse_or(&lookup, "SCHEDULER_TICK_SECONDS", defaults.tick.as_secs()).max(1),
            ),
            plan_expiry_days,
        };

        let resilience = ResilienceConfig {
            retry: RetryPolicy {
                max_attempts: parse_or(&lookup, "RETRY_MAX_ATTEMPTS", 3u32).max(1),
                initial_delay: Duration::from_millis(parse_or(&lookup, "RETRY_INITIAL_DELAY_MS", 200u64)),
                max_delay: Duration::from_millis(parse_or(&lookup, "RETRY_MAX_DELAY_MS", 2000u64)),
            },
            breaker: CircuitBreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_secs(parse_or(&lookup, "BREAKER_COOLDOWN_SECS", 60u64)),
            },
            per_symbol_timeout: Duration::from_millis(parse_or(&lookup, "PER_SYMBOL_TIMEOUT_MS", 5000u64)),
        };

        let exit_defaults = ExitPolicy::default();
        let exit_policy = ExitPolicy {
            partial_book_rr: parse_or(&lookup, "PARTIAL_BOOK_RR", exit_defaults.partial_book_rr),
            hard_exit_multiple: parse_or(&lookup, "HARD_EXIT_MULTIPLE", exit_defaults.hard_exit_multiple),
            trail_atr_multiple: parse_or(&lookup, "TRAIL_ATR_MULTIPLE", exit_defaults.trail_atr_multiple),
            sl_on_close: parse_or(&lookup, "SL_ON_CLOSE", Flag(exit_defaults.sl_on_close)).0,
        };

        let seed = RiskProfile::new(
            parse_or(&lookup, "TOTAL_CAPITAL", seed_defaults.total_capital),
            parse_or(&lookup, "MAX_SWING_CAPITAL", seed_defaults.max_swing_capital),
            parse_or(&lookup, "PER_TRADE_CAP", seed_defaults.per_trade_cap),
            parse_or(&lookup, "RISK_PERCENT", seed_defaults.risk_percent),
            parse_or(&lookup, "MAX_OPEN_TRADES", seed_defaults.max_open_trades),
        );

        Self {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 5u32),
            order_mode: parse_or(&lookup, "ORDER_MODE", OrderMode::Paper),
            order_config_file: PathBuf::from(
                lookup("ORDER_CONFIG_FILE").unwrap_or_else(|| DEFAULT_ORDER_CONFIG_FILE.to_string()),
            ),
            brokers: broker_endpoints(&lookup),
            market_data_url: non_empty(lookup("MARKET_DATA_URL")),
            scanner_output_path: PathBuf::from(
                lookup("SCANNER_OUTPUT_PATH").unwrap_or_else(|| DEFAULT_SCANNER_OUTPUT.to_string()),
            ),
            exit_policy,
            plan_expiry_days,
            min_confidence: parse_or(&lookup, "MIN_CONFIDENCE", DEFAULT_MIN_CONFIDENCE),
            scheduler,
            resilience,
            api: ApiConfig {
                bind: lookup("API_BIND").unwrap_or_else(|| DEFAULT_API_BIND.to_string()),
                requests_per_minute: parse_or(&lookup, "API_REQUESTS_PER_MINUTE", 60u32).max(1),
            },
            seed,
        }
    }

    pub fn order_config(&self) -> OrderConfig {
        OrderConfig {
            mode: self.order_mode,
            brokers: self.brokers.iter().map(BrokerEndpoint::settings).collect(),
        }
    }
}

/// Supplies the order routing configuration for one gateway call
pub trait OrderConfigSource: Send + Sync {
    fn snapshot(&self) -> OrderConfig;
}

/// Re-reads `ORDER_MODE` and the broker flags on every snapshot.
///
/// Values in the dotenv file win over the process environment, so editing
/// the file switches PAPER/LIVE or a broker flag without a restart.
pub struct EnvOrderConfig {
    path: PathBuf,
}

impl EnvOrderConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn file_values(&self) -> HashMap<String, String> {
        match dotenvy::from_path_iter(&self.path) {
            Ok(entries) => entries
                .filter_map(|entry| match entry {
                    Ok(pair) => Some(pair),
                    Err(e) => {
                        warn!("Skipping unreadable line in {}: {}", self.path.display(), e);
                        None
                    }
                })
                .collect(),
            Err(e) => {
                if !e.not_found() {
                    warn!("Failed to read {}: {}", self.path.display(), e);
                }
                HashMap::new()
            }
        }
    }
}

impl OrderConfigSource for EnvOrderConfig {
    fn snapshot(&self) -> OrderConfig {
        let file = self.file_values();
        let lookup = |key: &str| file.get(key).cloned().or_else(|| std::env::var(key).ok());
        OrderConfig {
            mode: parse_or(&lookup, "ORDER_MODE", OrderMode::Paper),
            brokers: broker_endpoints(&lookup)
                .iter()
                .map(BrokerEndpoint::settings)
                .collect(),
        }
    }
}

/// In-memory configuration an operator (or a test) can swap at runtime
pub struct StaticOrderConfig {
    inner: RwLock<OrderConfig>,
}

impl StaticOrderConfig {
    pub fn new(config: OrderConfig) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    pub fn set(&self, config: OrderConfig) {
        match self.inner.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}

impl OrderConfigSource for StaticOrderConfig {
    fn snapshot(&self) -> OrderConfig {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn broker_endpoints<L: Fn(&str) -> Option<String>>(lookup: &L) -> Vec<BrokerEndpoint> {
    lookup("BROKERS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| BrokerEndpoint::from_lookup(&name.to_ascii_lowercase(), lookup))
        .collect()
}

/// Boolean env flag accepting true/false, 1/0, yes/no, on/off
#[derive(Debug, Clone, Copy, PartialEq)]
struct Flag(bool);

impl FromStr for Flag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Flag(true)),
            "false" | "0" | "no" | "off" => Ok(Flag(false)),
            other => Err(format!("not a boolean: {}", other)),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_or<T, L>(lookup: &L, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
    L: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!("Invalid {}: {:?}, using default {:?}", key, raw, default);
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_lookup(|_| None);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.order_mode, OrderMode::Paper);
        assert!(config.brokers.is_empty());
        assert_eq!(config.exit_policy, ExitPolicy::default());
        assert_eq!(config.min_confidence, 6);
        assert_eq!(config.plan_expiry_days, 7);
        assert_eq!(config.scheduler.bucket_minutes, 5);
        assert_eq!(config.resilience.retry.max_attempts, 3);
        assert_eq!(config.api.requests_per_minute, 60);
        assert_eq!(config.seed.available_swing_capital, config.seed.max_swing_capital);
    }

    #[test]
    fn test_brokers_in_priority_order() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("ORDER_MODE", "live"),
            ("BROKERS", "Dhan, angel"),
            ("BROKER_DHAN_AUTO_ORDER", "yes"),
            ("BROKER_DHAN_MAX_QTY", "250"),
            ("BROKER_DHAN_BASE_URL", "https://dhan.example"),
            ("BROKER_ANGEL_ENABLED", "0"),
        ]));

        assert_eq!(config.order_mode, OrderMode::Live);
        let names: Vec<_> = config.brokers.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["dhan", "angel"]);

        let dhan = &config.brokers[0];
        assert!(dhan.enabled && dhan.auto_order);
        assert_eq!(dhan.max_qty, Some(250));
        assert_eq!(dhan.base_url.as_deref(), Some("https://dhan.example"));

        let order_config = config.order_config();
        assert!(order_config.broker("DHAN").unwrap().accepts_orders());
        assert!(!order_config.broker("angel").unwrap().accepts_orders());
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("ORDER_MODE", "sometimes"),
            ("PARTIAL_BOOK_RR", "lots"),
            ("SCAN_WINDOW", "9am"),
            ("SL_ON_CLOSE", "maybe"),
            ("PLAN_EXPIRY_DAYS", "0"),
        ]));
        assert_eq!(config.order_mode, OrderMode::Paper);
        assert_eq!(config.exit_policy.partial_book_rr, 1.0);
        assert!(config.exit_policy.sl_on_close);
        assert_eq!(config.scheduler.scan_window, SchedulerConfig::default().scan_window);
        assert_eq!(config.plan_expiry_days, 1);
    }

    #[test]
    fn test_static_order_config_swaps() {
        let source = StaticOrderConfig::new(OrderConfig::paper());
        assert_eq!(source.snapshot().mode, OrderMode::Paper);
        source.set(OrderConfig {
            mode: OrderMode::Live,
            brokers: Vec::new(),
        });
        assert_eq!(source.snapshot().mode, OrderMode::Live);
    }

    #[test]
    fn test_env_order_config_follows_file_edits() {
        let path = std::env::temp_dir().join(format!("swingcore-order-{}.env", std::process::id()));
        let source = EnvOrderConfig::new(&path);

        std::fs::write(&path, "ORDER_MODE=PAPER\n").unwrap();
        assert_eq!(source.snapshot().mode, OrderMode::Paper);

        std::fs::write(&path, "ORDER_MODE=LIVE\nBROKERS=dhan\nBROKER_DHAN_AUTO_ORDER=true\n").unwrap();
        let live = source.snapshot();
        assert_eq!(live.mode, OrderMode::Live);
        assert!(live.broker("dhan").unwrap().accepts_orders());

        std::fs::remove_file(&path).unwrap();
    }
}
