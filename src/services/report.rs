//! Failure-report assembly for the diagnoser.
//!
//! Raw forge context goes through redaction first, then truncation down
//! to the configured token budget. Tokens are estimated as `len / 4`.

use crate::domain::models::{Case, FailureReport, RawFailureContext};
use crate::services::config::DiagnosisConfig;
use crate::services::redaction::SecretRedactor;

/// Builds the payload handed to the diagnoser.
#[derive(Debug, Clone)]
pub struct ReportAssembler {
    redactor: SecretRedactor,
    token_budget: usize,
}

impl ReportAssembler {
    pub fn new(redactor: SecretRedactor, config: &DiagnosisConfig) -> Self {
        Self {
            redactor,
            token_budget: config.token_budget,
        }
    }

    /// Assemble, redact, and truncate a report for one case.
    pub fn assemble(&self, case: &Case, raw: RawFailureContext) -> FailureReport {
        let mut redactions = 0u32;
        let mut scrub = |text: String| {
            let scrubbed = self.redactor.scrub(&text);
            redactions += scrubbed.count;
            scrubbed.text
        };

        let failure_message = scrub(raw.failure_message);
        let error_logs = scrub(raw.error_logs);
        let test_logs = scrub(raw.test_logs);
        let diff = scrub(raw.diff);
        let failed_tests: Vec<String> = raw.failed_tests.into_iter().map(&mut scrub).collect();
        let environment = raw
            .environment
            .into_iter()
            .map(|(k, v)| {
                let v = scrub(v);
                (k, v)
            })
            .collect();

        let mut previous_attempts = case.prior_attempts.clone();
        for attempt in &mut previous_attempts {
            redactions += self.redactor.scrub_in_place(&mut attempt.error);
        }

        let mut report = FailureReport {
            repository: case.repository.clone(),
            run_id: case.run_id,
            head_sha: case.head_sha.clone(),
            branch: case.branch.clone(),
            failure_message,
            error_logs,
            test_logs,
            diff,
            failed_tests,
            environment,
            previous_attempts,
            redactions,
        };
        self.truncate(&mut report);
        report
    }

    fn estimated_tokens(report: &FailureReport) -> usize {
        let chars = report.failure_message.len()
            + report.error_logs.len()
            + report.test_logs.len()
            + report.diff.len()
            + report.failed_tests.iter().map(String::len).sum::<usize>();
        chars / 4
    }

    /// Truncate fields in priority order, each capped at an equal share of
    /// the budget remaining when it is reached. Unused share rolls forward,
    /// so high-priority fields get first claim.
    fn truncate(&self, report: &mut FailureReport) {
        if Self::estimated_tokens(report) <= self.token_budget {
            return;
        }
        let mut remaining = self.token_budget * 4;

        {
            let fields: [&mut String; 4] = [
                &mut report.failure_message,
                &mut report.error_logs,
                &mut report.test_logs,
                &mut report.diff,
            ];
            let total_fields = fields.len() + 1; // + failed_tests
            for (i, field) in fields.into_iter().enumerate() {
                let share = remaining / (total_fields - i);
                if field.len() > share {
                    truncate_on_boundary(field, share);
                }
                remaining = remaining.saturating_sub(field.len());
            }
        }

        let mut kept = Vec::new();
        for test in report.failed_tests.drain(..) {
            if test.len() <= remaining {
                remaining -= test.len();
                kept.push(test);
            } else {
                break;
            }
        }
        report.failed_tests = kept;
    }
}

/// Truncate without splitting a UTF-8 code point.
fn truncate_on_boundary(text: &mut String, max_len: usize) {
    if text.len() <= max_len {
        return;
    }
    let mut cut = max_len;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::domain::models::{Case, FailureEvent, Phase};
    use crate::services::config::RedactionConfig;

    fn case() -> Case {
        let event = FailureEvent {
            repository: "acme/app".to_string(),
            run_id: 42,
            head_sha: "abc123".to_string(),
            branch: "main".to_string(),
            workflow: "ci".to_string(),
            actor: "octocat".to_string(),
            installation_id: 1,
            received_at: Utc::now(),
        };
        let now = Utc::now();
        Case::admit(&event, now, now + chrono::Duration::minutes(20))
    }

    fn assembler(token_budget: usize) -> ReportAssembler {
        let redactor = SecretRedactor::new(&RedactionConfig::default()).unwrap();
        ReportAssembler::new(
            redactor,
            &DiagnosisConfig {
                min_confidence: 0.5,
                token_budget,
            },
        )
    }

    #[test]
    fn test_secrets_removed_and_counted() {
        let raw = RawFailureContext {
            failure_message: "auth failed with Bearer abc123def456ghi789".to_string(),
            error_logs: "DEPLOY_TOKEN=tok_123456 rejected".to_string(),
            ..Default::default()
        };
        let report = assembler(16_384).assemble(&case(), raw);
        assert!(!report.failure_message.contains("abc123def456ghi789"));
        assert!(!report.error_logs.contains("tok_123456"));
        assert_eq!(report.redactions, 2);
    }

    #[test]
    fn test_prior_attempts_carried_and_scrubbed() {
        let mut case = case();
        case.note_prior_attempt(Phase::Patch, 1, "link error; retry with PUBLISH_TOKEN=xyz9");
        let report = assembler(16_384).assemble(&case, RawFailureContext::default());
        assert_eq!(report.previous_attempts.len(), 1);
        assert!(!report.previous_attempts[0].error.contains("xyz9"));
    }

    #[test]
    fn test_under_budget_untouched() {
        let raw = RawFailureContext {
            failure_message: "short".to_string(),
            diff: "tiny diff".to_string(),
            failed_tests: vec!["test_a".to_string()],
            ..Default::default()
        };
        let report = assembler(16_384).assemble(&case(), raw);
        assert_eq!(report.failure_message, "short");
        assert_eq!(report.diff, "tiny diff");
        assert_eq!(report.failed_tests.len(), 1);
    }

    #[test]
    fn test_truncation_prefers_earlier_fields() {
        // 100-token budget = 400 chars across five fields.
        let raw = RawFailureContext {
            failure_message: "m".repeat(50),
            error_logs: "e".repeat(5000),
            test_logs: "t".repeat(5000),
            diff: "d".repeat(5000),
            failed_tests: vec!["x".repeat(500)],
            ..Default::default()
        };
        let report = assembler(100).assemble(&case(), raw);

        // Highest priority field fits whole; its unused share rolls on.
        assert_eq!(report.failure_message.len(), 50);
        assert!(report.error_logs.len() <= 87); // (400 - 50) / 4
        assert!(report.test_logs.len() < 5000);
        assert!(report.diff.len() < 5000);
        // The oversized failed test no longer fits.
        assert!(report.failed_tests.is_empty());

        let total = report.failure_message.len()
            + report.error_logs.len()
            + report.test_logs.len()
            + report.diff.len();
        assert!(total <= 400);
    }
}
