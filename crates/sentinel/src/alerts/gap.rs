//! Collection gap detection.
//!
//! A source that has not produced a successful collection within a multiple
//! of its expected cadence has gone quiet, whatever its breaker thinks.

use super::{recoverable, AlertCandidate, AlertDetector, StateSnapshot};
use crate::config::AlertConfig;
use crate::types::{AlertKind, Severity};

pub struct GapDetector;

impl AlertDetector for GapDetector {
    fn kind(&self) -> AlertKind {
        AlertKind::CollectionGap
    }

    fn evaluate(&self, snapshot: &StateSnapshot, config: &AlertConfig) -> Vec<AlertCandidate> {
        let mut candidates = Vec::new();

        for source in &snapshot.sources {
            // A source that has never succeeded is measured from first sight
            let anchor = source.last_success_at.unwrap_or(source.first_seen_at);
            let gap_secs = (snapshot.taken_at - anchor).num_seconds().max(0) as u64;
            let expected = source.expected_interval_secs.max(1);

            let warning_after = (expected as f64 * config.gap_multiplier) as u64;
            let critical_after = (expected as f64 * config.gap_critical_multiplier) as u64;

            if gap_secs <= warning_after {
                continue;
            }

            let severity = if gap_secs > critical_after {
                Severity::Critical
            } else {
                Severity::Warning
            };

            candidates.push(AlertCandidate {
                kind: AlertKind::CollectionGap,
                source_id: Some(source.source_id.clone()),
                severity,
                message: format!(
                    "No successful collection from {} for {}m (expected every {}m)",
                    source.source_id,
                    gap_secs / 60,
                    expected / 60,
                ),
                pattern: source.health.pattern,
                auto_recoverable: recoverable(
                    AlertKind::CollectionGap,
                    source.health.pattern,
                    source.has_fallback,
                ),
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
    use chrono::{Duration, Utc};

    fn source(last_success_secs_ago: i64) -> SourceSnapshot {
        let now = Utc::now();
        SourceSnapshot {
            source_id: "tides".to_string(),
            health: HealthScore::new("tides", now),
            breaker: CircuitBreakerState {
                source_id: "tides".to_string(),
                state: CircuitState::Closed,
                opened_at: None,
                next_probe_at: None,
                failure_count: 0,
                active_strategy: None,
            },
            first_seen_at: now - Duration::hours(6),
            last_attempt_at: Some(now),
            last_success_at: Some(now - Duration::seconds(last_success_secs_ago)),
            expected_interval_secs: 300,
            has_fallback: false,
            recent_results: Vec::new(),
        }
    }

    fn evaluate(snapshot_source: SourceSnapshot) -> Vec<AlertCandidate> {
        let snapshot = StateSnapshot {
            taken_at: Utc::now(),
            sources: vec![snapshot_source],
        };
        GapDetector.evaluate(&snapshot, &AlertConfig::default())
    }

    #[test]
    fn test_fresh_source_is_quiet() {
        assert!(evaluate(source(60)).is_empty());
    }

    #[test]
    fn test_gap_warns_past_double_interval() {
        let candidates = evaluate(source(700));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].severity, Severity::Warning);
    }

    #[test]
    fn test_gap_goes_critical_past_quadruple_interval() {
        let candidates = evaluate(source(1300));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].severity, Severity::Critical);
    }

    #[test]
    fn test_never_successful_source_measured_from_first_seen() {
        let mut snapshot_source = source(0);
        snapshot_source.last_success_at = None;
        let candidates = evaluate(snapshot_source);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].severity, Severity::Critical);
    }
}
