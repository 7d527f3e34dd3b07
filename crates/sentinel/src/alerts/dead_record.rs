//! Dead-record detection.
//!
//! A source can look perfectly healthy to the breaker while its collector
//! brings back nothing: every attempt succeeds and every payload is empty.
//! A count-based check over recent results catches that without parsing
//! anything.

use super::{AlertCandidate, AlertDetector, StateSnapshot};
use crate::config::AlertConfig;
use crate::types::{AlertKind, Severity};

pub struct DeadRecordDetector;

impl AlertDetector for DeadRecordDetector {
    fn kind(&self) -> AlertKind {
        AlertKind::DeadRecord
    }

    fn evaluate(&self, snapshot: &StateSnapshot, config: &AlertConfig) -> Vec<AlertCandidate> {
        let mut candidates = Vec::new();
        let window = config.dead_record_attempts;

        for source in &snapshot.sources {
            if source.recent_results.len() < window {
                continue;
            }

            let recent = &source.recent_results[source.recent_results.len() - window..];
            let all_empty_successes = recent
                .iter()
                .all(|(success, records)| *success && *records == 0);
            if !all_empty_successes {
                continue;
            }

            candidates.push(AlertCandidate {
                kind: AlertKind::DeadRecord,
                source_id: Some(source.source_id.clone()),
                severity: Severity::Warning,
                message: format!(
                    "Last {} collections from {} succeeded but returned no records",
                    window, source.source_id,
                ),
                pattern: source.health.pattern,
                auto_recoverable: false,
            });
        }

        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::SourceSnapshot;
    use crate::types::{CircuitBreakerState, CircuitState, HealthScore};
    use chrono::Utc;

    fn source(recent_results: Vec<(bool, u64)>) -> SourceSnapshot {
        let now = Utc::now();
        SourceSnapshot {
            source_id: "registry".to_string(),
            health: HealthScore::new("registry", now),
            breaker: CircuitBreakerState {
                source_id: "registry".to_string(),
                state: CircuitState::Closed,
                opened_at: None,
                next_probe_at: None,
                failure_count: 0,
                active_strategy: None,
            },
            first_seen_at: now,
            last_attempt_at: Some(now),
            last_success_at: Some(now),
            expected_interval_secs: 300,
            has_fallback: false,
            recent_results,
        }
    }

    fn evaluate(recent_results: Vec<(bool, u64)>) -> Vec<AlertCandidate> {
        let snapshot = StateSnapshot {
            taken_at: Utc::now(),
            sources: vec![source(recent_results)],
        };
        DeadRecordDetector.evaluate(&snapshot, &AlertConfig::default())
    }

    #[test]
    fn test_healthy_results_are_quiet() {
        assert!(evaluate(vec![(true, 12); 8]).is_empty());
    }

    #[test]
    fn test_empty_successes_raise_warning() {
        let candidates = evaluate(vec![(true, 0); 5]);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].severity, Severity::Warning);
    }

    #[test]
    fn test_failures_do_not_count_as_dead_records() {
        // Failing attempts are the breaker's business, not this detector's
        assert!(evaluate(vec![(false, 0); 5]).is_empty());
    }

    #[test]
    fn test_short_history_is_quiet() {
        assert!(evaluate(vec![(true, 0); 3]).is_empty());
    }

    #[test]
    fn test_one_real_payload_in_window_is_quiet() {
        let mut results = vec![(true, 0); 5];
        results[2] = (true, 4);
        assert!(evaluate(results).is_empty());
    }
}
