use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Cooling down; calls are refused without touching the remote side
    Open,
    /// Cooldown elapsed; the next call is a trial against the remote side
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Exhausted retry sequences before the circuit opens
    pub failure_threshold: u32,
    /// How long an open circuit refuses calls
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 1,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker guarding one remote dependency (a broker, or one symbol's quotes).
///
/// Cloning shares state, so a breaker can be handed to several tasks.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
            })),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Whether a call may go out now. Moves an expired open circuit to half-open.
    pub async fn is_call_permitted(&self) -> bool {
        let mut state = self.state.lock().await;
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = state
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.config.cooldown);
                if cooled {
                    state.state = CircuitState::HalfOpen;
                }
                cooled
            }
        }
    }

    pub async fn on_success(&self) {
        let mut state = self.state.lock().await;
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.opened_at = None;
    }

    pub async fn on_failure(&self) {
        let mut state = self.state.lock().await;
        state.failure_count += 1;
        let should_open = state.state == CircuitState::HalfOpen
            || state.failure_count >= self.config.failure_threshold;
        if should_open {
            state.state = CircuitState::Open;
            state.opened_at = Some(Instant::now());
        }
    }

    /// Remaining cooldown, if the circuit is open
    pub async fn cooldown_remaining(&self) -> Option<Duration> {
        let state = self.state.lock().await;
        match (state.state, state.opened_at) {
            (CircuitState::Open, Some(at)) => Some(self.config.cooldown.saturating_sub(at.elapsed())),
            _ => None,
        }
    }

    pub async fn reset(&self) {
        self.on_success().await;
    }
}
