//! Configuration for the self-healing workflow engine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::models::{Criticality, InvariantSpec, Phase};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
    #[error("Failed to read configuration: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Validation failed for {field}: {reason}")]
    ValidationError { field: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: LimitsConfig,
    pub retries: RetryConfig,
    pub backoff: BackoffConfig,
    pub diagnosis: DiagnosisConfig,
    pub test: TestConfig,
    pub proof: ProofConfig,
    pub dedup: DedupConfig,
    pub activities: ActivitiesConfig,
    pub breaker: BreakerConfig,
    pub redaction: RedactionConfig,
    /// Workflow names eligible for self-healing. Empty means all.
    pub allowed_workflows: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: LimitsConfig::default(),
            retries: RetryConfig::default(),
            backoff: BackoffConfig::default(),
            diagnosis: DiagnosisConfig::default(),
            test: TestConfig::default(),
            proof: ProofConfig::default(),
            dedup: DedupConfig::default(),
            activities: ActivitiesConfig::default(),
            breaker: BreakerConfig::default(),
            redaction: RedactionConfig::default(),
            allowed_workflows: Vec::new(),
        }
    }
}

/// Concurrency and wall-clock limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Upper bound on in-flight cases.
    pub max_concurrent_cases: usize,
    /// Admission queue depth before `Backpressure`.
    pub queue_buffer: usize,
    /// Per-case wall-clock budget.
    pub global_deadline_ms: u64,
    /// Events older than this are rejected at admission.
    pub stale_cutoff_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_cases: 100,
            queue_buffer: 1000,
            global_deadline_ms: 20 * 60 * 1000,
            stale_cutoff_ms: 24 * 60 * 60 * 1000,
        }
    }
}

/// Per-phase caps on the feedback edges back into diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Patch invocations allowed before `patch_exhausted`.
    pub patch: u32,
    /// Test invocations allowed before `test_failed`.
    pub test: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { patch: 2, test: 1 }
    }
}

/// Exponential backoff between transient retries of one activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            cap_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosisConfig {
    /// Diagnoses below this confidence are downgraded to `unknown`.
    pub min_confidence: f64,
    /// Failure-report size target, in estimated tokens (`len / 4`).
    pub token_budget: usize,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            token_budget: 16_384,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Suite handed to the sandbox runner.
    pub suite: String,
    /// Flakiness score above which a passing run is still marked flaky.
    pub flaky_threshold: f64,
    /// Per-run sandbox timeout forwarded to the runner.
    pub timeout_ms: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            suite: "default".to_string(),
            flaky_threshold: 0.2,
            timeout_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProofConfig {
    /// Invariants at or above this criticality must prove for merge.
    pub criticality_threshold: Criticality,
    pub per_theorem_budget_ms: u64,
    /// Declared invariant catalog; scope selects per changed surface.
    pub invariants: Vec<InvariantSpec>,
}

impl Default for ProofConfig {
    fn default() -> Self {
        Self {
            criticality_threshold: Criticality::Medium,
            per_theorem_budget_ms: 2000,
            invariants: Vec::new(),
        }
    }
}

impl ProofConfig {
    /// Invariants whose scope covers the changed files.
    pub fn select<'a>(&'a self, files_changed: &[String]) -> Vec<&'a InvariantSpec> {
        self.invariants
            .iter()
            .filter(|inv| inv.applies_to(files_changed))
            .collect()
    }

    /// Names of the selected invariants that block merge.
    pub fn required<'a>(&'a self, files_changed: &[String]) -> Vec<&'a InvariantSpec> {
        self.select(files_changed)
            .into_iter()
            .filter(|inv| inv.criticality >= self.criticality_threshold)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Admission TTL: one case per failure triple per window.
    pub ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { ttl_secs: 3600 }
    }
}

/// Timeout and network-attempt budget for one collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    pub timeout_ms: u64,
    pub max_attempts: u32,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivitiesConfig {
    pub diagnoser: ActivityConfig,
    pub patcher: ActivityConfig,
    pub test_runner: ActivityConfig,
    pub prover: ActivityConfig,
    pub merger: ActivityConfig,
}

impl Default for ActivitiesConfig {
    fn default() -> Self {
        Self {
            diagnoser: ActivityConfig {
                timeout_ms: 60_000,
                max_attempts: 3,
            },
            patcher: ActivityConfig {
                timeout_ms: 120_000,
                max_attempts: 3,
            },
            test_runner: ActivityConfig {
                timeout_ms: 900_000,
                max_attempts: 2,
            },
            prover: ActivityConfig {
                timeout_ms: 300_000,
                max_attempts: 2,
            },
            merger: ActivityConfig {
                timeout_ms: 30_000,
                max_attempts: 3,
            },
        }
    }
}

/// Circuit breaker over collaborator endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub enabled: bool,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Successes in half-open state required to close.
    pub success_threshold: u32,
    /// How long an open circuit blocks calls before probing.
    pub open_cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            open_cooldown_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    /// Extra regexes scrubbed in addition to the built-in secret set.
    pub extra_patterns: Vec<String>,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn unit_interval(field: &str, value: f64) -> Result<(), ConfigError> {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ValidationError {
                    field: field.to_string(),
                    reason: format!("{value} is outside [0, 1]"),
                });
            }
            Ok(())
        }

        if self.limits.max_concurrent_cases == 0 {
            return Err(ConfigError::ValidationError {
                field: "limits.max_concurrent_cases".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.limits.queue_buffer == 0 {
            return Err(ConfigError::ValidationError {
                field: "limits.queue_buffer".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.backoff.cap_ms < self.backoff.base_ms {
            return Err(ConfigError::ValidationError {
                field: "backoff.cap_ms".to_string(),
                reason: "must be >= backoff.base_ms".to_string(),
            });
        }
        unit_interval("diagnosis.min_confidence", self.diagnosis.min_confidence)?;
        unit_interval("test.flaky_threshold", self.test.flaky_threshold)?;
        for (name, activity) in [
            ("diagnoser", &self.activities.diagnoser),
            ("patcher", &self.activities.patcher),
            ("test_runner", &self.activities.test_runner),
            ("prover", &self.activities.prover),
            ("merger", &self.activities.merger),
        ] {
            if activity.max_attempts == 0 {
                return Err(ConfigError::ValidationError {
                    field: format!("activities.{name}.max_attempts"),
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        for pattern in &self.redaction.extra_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(ConfigError::ValidationError {
                    field: "redaction.extra_patterns".to_string(),
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Activity settings for a phase.
    pub fn activity(&self, phase: Phase) -> &ActivityConfig {
        match phase {
            Phase::Diagnose => &self.activities.diagnoser,
            Phase::Patch => &self.activities.patcher,
            Phase::Test => &self.activities.test_runner,
            Phase::Prove => &self.activities.prover,
            Phase::Merge => &self.activities.merger,
        }
    }

    /// Feedback-edge cap for a phase; phases without one never loop back.
    pub fn max_retries(&self, phase: Phase) -> u32 {
        match phase {
            Phase::Patch => self.retries.patch,
            Phase::Test => self.retries.test,
            _ => 0,
        }
    }

    pub fn global_deadline(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.limits.global_deadline_ms as i64)
    }

    pub fn stale_cutoff(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.limits.stale_cutoff_ms as i64)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup.ttl_secs)
    }
}
