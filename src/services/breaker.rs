//! Circuit breaker over collaborator endpoints.
//!
//! Repeated failures against one collaborator open its circuit so workers
//! stop burning their retry budgets against a dead endpoint. After a
//! cooldown the circuit goes half-open and probe calls decide whether to
//! close it again.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::domain::models::Phase;
use crate::services::config::BreakerConfig;

/// State of one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are blocked until the cooldown elapses.
    Open,
    /// Probing whether the collaborator recovered.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<DateTime<Utc>>,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: None,
        }
    }
}

/// Per-phase circuit breakers shared by all workers.
#[derive(Debug)]
pub struct CircuitBreakerService {
    config: BreakerConfig,
    circuits: RwLock<HashMap<Phase, Circuit>>,
}

impl CircuitBreakerService {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            circuits: RwLock::new(HashMap::new()),
        }
    }

    fn cooldown(&self) -> Duration {
        Duration::milliseconds(self.config.open_cooldown_ms as i64)
    }

    /// Whether a call to this collaborator may proceed right now.
    ///
    /// An open circuit whose cooldown has elapsed flips to half-open and
    /// lets the probe through.
    pub async fn allow(&self, phase: Phase) -> bool {
        if !self.config.enabled {
            return true;
        }
        let mut circuits = self.circuits.write().await;
        let circuit = circuits.entry(phase).or_default();
        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = circuit
                    .opened_at
                    .map(|at| Utc::now() - at)
                    .unwrap_or_else(Duration::zero);
                if elapsed >= self.cooldown() {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.half_open_successes = 0;
                    tracing::info!(phase = %phase, "Circuit half-open, probing collaborator");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self, phase: Phase) {
        if !self.config.enabled {
            return;
        }
        let mut circuits = self.circuits.write().await;
        let circuit = circuits.entry(phase).or_default();
        match circuit.state {
            CircuitState::Closed => {
                circuit.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                circuit.half_open_successes += 1;
                if circuit.half_open_successes >= self.config.success_threshold {
                    tracing::info!(phase = %phase, "Circuit closed");
                    *circuit = Circuit::default();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self, phase: Phase) {
        if !self.config.enabled {
            return;
        }
        let mut circuits = self.circuits.write().await;
        let circuit = circuits.entry(phase).or_default();
        match circuit.state {
            CircuitState::Closed => {
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(Utc::now());
                    tracing::warn!(
                        phase = %phase,
                        failures = circuit.consecutive_failures,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(Utc::now());
                circuit.half_open_successes = 0;
                tracing::warn!(phase = %phase, "Probe failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    pub async fn state(&self, phase: Phase) -> CircuitState {
        let circuits = self.circuits.read().await;
        circuits
            .get(&phase)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }
}
