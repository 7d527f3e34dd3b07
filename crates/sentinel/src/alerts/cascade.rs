//! Cascade failure detection.
//!
//! When a large fraction of sources trip their breakers inside the same
//! window, the cause is almost always a shared upstream dependency. One
//! source-less critical alert replaces the N per-source ones, which keeps
//! a systemic outage from turning into an alert storm.

use super::{blocked_sources, AlertCandidate, AlertDetector, StateSnapshot};
use crate::config::AlertConfig;
use crate::types::{AlertKind, FailurePattern, Severity};

pub struct CascadeDetector;

impl AlertDetector for CascadeDetector {
    fn kind(&self) -> AlertKind {
        AlertKind::CascadeFailure
    }

    fn evaluate(&self, snapshot: &StateSnapshot, config: &AlertConfig) -> Vec<AlertCandidate> {
        let total = snapshot.sources.len();
        if total < config.cascade_min_sources {
            return Vec::new();
        }

        let blocked = blocked_sources(snapshot);
        let fraction = blocked.len() as f64 / total as f64;
        if fraction <= config.cascade_fraction {
            return Vec::new();
        }

        let mut affected: Vec<&str> = blocked.iter().map(|s| s.source_id.as_str()).collect();
        affected.sort_unstable();
        let shown = affected.iter().take(5).copied().collect::<Vec<_>>().join(", ");
        let suffix = if affected.len() > 5 { ", ..." } else { "" };

        vec![AlertCandidate {
            kind: AlertKind::CascadeFailure,
            source_id: None,
            severity: Severity::Critical,
            message: format!(
                "{}/{} sources have open or degraded breakers ({}{suffix})",
                blocked.len(),
                total,
                shown,
            ),
            pattern: Some(FailurePattern::SystematicOutage),
            auto_recoverable: false,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::SourceSnapshot;
    use crate::types::{CircuitBreakerState, CircuitState, HealthScore};
    use chrono::{Duration, Utc};

    fn source(id: &str, state: CircuitState) -> SourceSnapshot {
        let now = Utc::now();
        SourceSnapshot {
            source_id: id.to_string(),
            health: HealthScore::new(id, now),
            breaker: CircuitBreakerState {
                source_id: id.to_string(),
                state,
                opened_at: state.is_blocking().then_some(now),
                next_probe_at: state.is_blocking().then(|| now + Duration::seconds(30)),
                failure_count: 0,
                active_strategy: None,
            },
            first_seen_at: now,
            last_attempt_at: Some(now),
            last_success_at: Some(now),
            expected_interval_secs: 300,
            has_fallback: false,
            recent_results: Vec::new(),
        }
    }

    fn evaluate(states: &[CircuitState]) -> Vec<AlertCandidate> {
        let sources = states
            .iter()
            .enumerate()
            .map(|(i, state)| source(&format!("s{i}"), *state))
            .collect();
        let snapshot = StateSnapshot {
            taken_at: Utc::now(),
            sources,
        };
        CascadeDetector.evaluate(&snapshot, &AlertConfig::default())
    }

    #[test]
    fn test_below_threshold_is_quiet() {
        let mut states = vec![CircuitState::Closed; 10];
        states[0] = CircuitState::Open;
        states[1] = CircuitState::Open;
        assert!(evaluate(&states).is_empty());
    }

    #[test]
    fn test_four_of_ten_open_is_one_cascade() {
        let mut states = vec![CircuitState::Closed; 10];
        for state in states.iter_mut().take(4) {
            *state = CircuitState::Open;
        }

        let candidates = evaluate(&states);
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].source_id.is_none());
        assert_eq!(candidates[0].severity, Severity::Critical);
    }

    #[test]
    fn test_degraded_counts_toward_cascade() {
        let states = vec![
            CircuitState::Open,
            CircuitState::Degraded,
            CircuitState::Closed,
        ];
        assert_eq!(evaluate(&states).len(), 1);
    }

    #[test]
    fn test_small_populations_never_cascade() {
        let states = vec![CircuitState::Open, CircuitState::Open];
        assert!(evaluate(&states).is_empty());
    }
}
