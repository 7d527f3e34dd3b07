//! Alert manager: polling detectors over a consistent state snapshot, with
//! deduplication enforced in one place.
//!
//! Detectors never fire events of their own; the engine's scheduler calls
//! [`AlertManager::evaluate`] on a fixed tick, which bounds alert volume.
//! The "at most one unresolved alert per `(source_id, kind)`" rule lives in
//! an explicit lookup table here, not as ad hoc flags.

mod cascade;
mod dead_record;
mod gap;

pub use cascade::CascadeDetector;
pub use dead_record::DeadRecordDetector;
pub use gap::GapDetector;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::info;

use crate::config::AlertConfig;
use crate::recovery::strategy_for;
use crate::types::{
    Alert, AlertKind, CircuitBreakerState, CircuitState, FailurePattern, HealthScore, Severity,
};

/// Point-in-time view of one source, assembled without holding more than
/// one source lock at a time.
#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    pub source_id: String,
    pub health: HealthScore,
    pub breaker: CircuitBreakerState,
    pub first_seen_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub expected_interval_secs: u64,
    pub has_fallback: bool,
    /// `(success, records_returned)` per recent attempt, newest last
    pub recent_results: Vec<(bool, u64)>,
}

/// Consistent snapshot of all per-source state, taken by the engine.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub taken_at: DateTime<Utc>,
    pub sources: Vec<SourceSnapshot>,
}

/// A detector's proposal before deduplication.
#[derive(Debug, Clone)]
pub struct AlertCandidate {
    pub kind: AlertKind,
    pub source_id: Option<String>,
    pub severity: Severity,
    pub message: String,
    pub pattern: Option<FailurePattern>,
    pub auto_recoverable: bool,
}

/// One detector, evaluated against the shared snapshot.
pub trait AlertDetector: Send + Sync {
    /// Alert kind this detector owns
    fn kind(&self) -> AlertKind;

    /// Propose alerts for the current state; empty when healthy
    fn evaluate(&self, snapshot: &StateSnapshot, config: &AlertConfig) -> Vec<AlertCandidate>;
}

/// Dedup key: one unresolved alert per `(source_id, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AlertKey {
    source_id: Option<String>,
    kind: AlertKind,
}

/// Alert lifecycle transition, drained by the engine for the append log.
#[derive(Debug, Clone, Serialize)]
pub struct AlertTransition {
    pub transition: &'static str,
    pub alert: Alert,
}

/// Owns the dedup table and the detector set.
pub struct AlertManager {
    config: AlertConfig,
    detectors: Vec<Box<dyn AlertDetector>>,
    active: HashMap<AlertKey, Alert>,
    transitions: Vec<AlertTransition>,
}

impl AlertManager {
    #[must_use]
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            detectors: vec![
                Box::new(GapDetector),
                Box::new(CascadeDetector),
                Box::new(DeadRecordDetector),
            ],
            active: HashMap::new(),
            transitions: Vec::new(),
        }
    }

    /// Run every detector against the snapshot and reconcile the table.
    ///
    /// Idempotent: re-running without state change touches existing alerts
    /// instead of duplicating them, and detector-owned alerts whose
    /// condition cleared are resolved.
    pub fn evaluate(&mut self, snapshot: &StateSnapshot) -> Vec<Alert> {
        let now = snapshot.taken_at;
        let mut seen: Vec<AlertKey> = Vec::new();

        let candidates: Vec<AlertCandidate> = self
            .detectors
            .iter()
            .flat_map(|d| d.evaluate(snapshot, &self.config))
            .collect();

        for candidate in candidates {
            seen.push(AlertKey {
                source_id: candidate.source_id.clone(),
                kind: candidate.kind,
            });
            self.raise(candidate, now);
        }

        // Detector-owned alerts whose condition no longer holds resolve here;
        // breaker-driven kinds resolve on recovery events instead.
        let detector_kinds: Vec<AlertKind> = self.detectors.iter().map(|d| d.kind()).collect();
        let stale: Vec<AlertKey> = self
            .active
            .keys()
            .filter(|key| detector_kinds.contains(&key.kind) && !seen.contains(key))
            .cloned()
            .collect();
        for key in stale {
            self.resolve_key(&key, now);
        }

        self.active_alerts(None)
    }

    /// Raise or touch the alert for a candidate.
    pub fn raise(&mut self, candidate: AlertCandidate, now: DateTime<Utc>) {
        let key = AlertKey {
            source_id: candidate.source_id.clone(),
            kind: candidate.kind,
        };

        if let Some(existing) = self.active.get_mut(&key) {
            existing.count += 1;
            existing.created_at = now;
            existing.message = candidate.message;
            existing.pattern = candidate.pattern.or(existing.pattern);
            existing.auto_recoverable = candidate.auto_recoverable;
            if candidate.severity > existing.severity {
                info!(
                    kind = %existing.kind.as_str(),
                    source_id = ?existing.source_id,
                    severity = %candidate.severity.as_str(),
                    "Alert escalated"
                );
                existing.severity = candidate.severity;
                self.transitions.push(AlertTransition {
                    transition: "escalated",
                    alert: existing.clone(),
                });
            }
            return;
        }

        let mut alert = Alert::new(candidate.kind, candidate.message, now)
            .with_severity(candidate.severity)
            .auto_recoverable(candidate.auto_recoverable);
        if let Some(source_id) = candidate.source_id {
            alert = alert.with_source(source_id);
        }
        if let Some(pattern) = candidate.pattern {
            alert = alert.with_pattern(pattern);
        }

        info!(
            kind = %alert.kind.as_str(),
            source_id = ?alert.source_id,
            severity = %alert.severity.as_str(),
            message = %alert.message,
            "Alert raised"
        );
        self.transitions.push(AlertTransition {
            transition: "raised",
            alert: alert.clone(),
        });
        self.active.insert(key, alert);
    }

    /// Resolve the unresolved alert for `(source_id, kind)`, if any.
    pub fn resolve(
        &mut self,
        source_id: Option<&str>,
        kind: AlertKind,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let key = AlertKey {
            source_id: source_id.map(String::from),
            kind,
        };
        self.resolve_key(&key, now)
    }

    fn resolve_key(&mut self, key: &AlertKey, now: DateTime<Utc>) -> Option<Alert> {
        let mut alert = self.active.remove(key)?;
        alert.resolved_at = Some(now);
        info!(
            kind = %alert.kind.as_str(),
            source_id = ?alert.source_id,
            "Alert resolved"
        );
        self.transitions.push(AlertTransition {
            transition: "resolved",
            alert: alert.clone(),
        });
        Some(alert)
    }

    /// Record an informational alert that is born resolved (e.g. recovery
    /// notices); it hits the transition log but never the active table.
    pub fn notice(&mut self, candidate: AlertCandidate, now: DateTime<Utc>) {
        let mut alert = Alert::new(candidate.kind, candidate.message, now)
            .with_severity(candidate.severity);
        if let Some(source_id) = candidate.source_id {
            alert = alert.with_source(source_id);
        }
        alert.resolved_at = Some(now);
        self.transitions.push(AlertTransition {
            transition: "notice",
            alert,
        });
    }

    /// Unresolved alerts, most severe first, optionally filtered.
    #[must_use]
    pub fn active_alerts(&self, min_severity: Option<Severity>) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .active
            .values()
            .filter(|a| min_severity.map_or(true, |min| a.severity >= min))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.created_at.cmp(&b.created_at)));
        alerts
    }

    /// Drain buffered transitions for the append-only alert log.
    pub fn drain_transitions(&mut self) -> Vec<AlertTransition> {
        std::mem::take(&mut self.transitions)
    }
}

/// Whether an alert of `kind` can recover without an operator.
///
/// Only collection gaps and opened circuits auto-recover, and only when the
/// classified pattern maps to a strategy that does not need a human.
#[must_use]
pub fn recoverable(kind: AlertKind, pattern: Option<FailurePattern>, has_fallback: bool) -> bool {
    if !matches!(kind, AlertKind::CollectionGap | AlertKind::CircuitOpened) {
        return false;
    }
    let pattern = pattern.unwrap_or(FailurePattern::Unknown);
    !strategy_for(pattern, has_fallback).needs_operator()
}

/// Count of sources whose breaker currently blocks collection.
#[must_use]
pub(crate) fn blocked_sources(snapshot: &StateSnapshot) -> Vec<&SourceSnapshot> {
    snapshot
        .sources
        .iter()
        .filter(|s| matches!(s.breaker.state, CircuitState::Open | CircuitState::Degraded))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn source_snapshot(id: &str, state: CircuitState, now: DateTime<Utc>) -> SourceSnapshot {
        SourceSnapshot {
            source_id: id.to_string(),
            health: HealthScore::new(id, now),
            breaker: CircuitBreakerState {
                source_id: id.to_string(),
                state,
                opened_at: state.is_blocking().then_some(now),
                next_probe_at: state.is_blocking().then(|| now + Duration::seconds(30)),
                failure_count: u32::from(state.is_blocking()),
                active_strategy: None,
            },
            first_seen_at: now - Duration::hours(1),
            last_attempt_at: Some(now),
            last_success_at: Some(now),
            expected_interval_secs: 300,
            has_fallback: false,
            recent_results: vec![(true, 10); 5],
        }
    }

    fn snapshot(sources: Vec<SourceSnapshot>, now: DateTime<Utc>) -> StateSnapshot {
        StateSnapshot {
            taken_at: now,
            sources,
        }
    }

    #[test]
    fn test_dedup_touches_instead_of_duplicating() {
        let now = Utc::now();
        let mut manager = AlertManager::new(AlertConfig::default());

        let candidate = AlertCandidate {
            kind: AlertKind::CircuitOpened,
            source_id: Some("s1".to_string()),
            severity: Severity::Warning,
            message: "breaker opened".to_string(),
            pattern: None,
            auto_recoverable: true,
        };

        manager.raise(candidate.clone(), now);
        manager.raise(candidate, now + Duration::seconds(60));

        let active = manager.active_alerts(None);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].count, 2);
        assert_eq!(active[0].created_at, now + Duration::seconds(60));
    }

    #[test]
    fn test_evaluate_idempotent() {
        let now = Utc::now();
        let mut manager = AlertManager::new(AlertConfig::default());

        let mut stale = source_snapshot("s1", CircuitState::Closed, now);
        stale.last_success_at = Some(now - Duration::seconds(900));

        let snap = snapshot(vec![stale], now);
        let first = manager.evaluate(&snap);
        let second = manager.evaluate(&snap);

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].id, second[0].id);
    }

    #[test]
    fn test_gap_resolves_when_condition_clears() {
        let now = Utc::now();
        let mut manager = AlertManager::new(AlertConfig::default());

        let mut stale = source_snapshot("s1", CircuitState::Closed, now);
        stale.last_success_at = Some(now - Duration::seconds(900));
        assert_eq!(manager.evaluate(&snapshot(vec![stale], now)).len(), 1);

        let healthy = source_snapshot("s1", CircuitState::Closed, now);
        assert!(manager.evaluate(&snapshot(vec![healthy], now)).is_empty());

        let transitions = manager.drain_transitions();
        assert!(transitions.iter().any(|t| t.transition == "resolved"));
    }

    #[test]
    fn test_severity_escalation_recorded() {
        let now = Utc::now();
        let mut manager = AlertManager::new(AlertConfig::default());

        let mut candidate = AlertCandidate {
            kind: AlertKind::CollectionGap,
            source_id: Some("s1".to_string()),
            severity: Severity::Warning,
            message: "gap".to_string(),
            pattern: None,
            auto_recoverable: true,
        };
        manager.raise(candidate.clone(), now);

        candidate.severity = Severity::Critical;
        manager.raise(candidate, now);

        let active = manager.active_alerts(None);
        assert_eq!(active[0].severity, Severity::Critical);

        let transitions = manager.drain_transitions();
        assert!(transitions.iter().any(|t| t.transition == "escalated"));
    }

    #[test]
    fn test_cascade_single_alert_for_many_open_sources() {
        let now = Utc::now();
        let mut manager = AlertManager::new(AlertConfig::default());

        let mut sources = Vec::new();
        for i in 0..10 {
            let state = if i < 4 {
                CircuitState::Open
            } else {
                CircuitState::Closed
            };
            sources.push(source_snapshot(&format!("s{i}"), state, now));
        }

        let active = manager.evaluate(&snapshot(sources, now));
        let cascades: Vec<&Alert> = active
            .iter()
            .filter(|a| a.kind == AlertKind::CascadeFailure)
            .collect();
        assert_eq!(cascades.len(), 1);
        assert!(cascades[0].source_id.is_none());
        assert_eq!(cascades[0].severity, Severity::Critical);
    }

    #[test]
    fn test_min_severity_filter() {
        let now = Utc::now();
        let mut manager = AlertManager::new(AlertConfig::default());

        manager.raise(
            AlertCandidate {
                kind: AlertKind::DeadRecord,
                source_id: Some("s1".to_string()),
                severity: Severity::Warning,
                message: "dead".to_string(),
                pattern: None,
                auto_recoverable: false,
            },
            now,
        );

        assert_eq!(manager.active_alerts(Some(Severity::Critical)).len(), 0);
        assert_eq!(manager.active_alerts(Some(Severity::Warning)).len(), 1);
    }

    #[test]
    fn test_recoverable_rules() {
        assert!(recoverable(
            AlertKind::CircuitOpened,
            Some(FailurePattern::Timeout),
            false
        ));
        // Schema changes always need a human
        assert!(!recoverable(
            AlertKind::CircuitOpened,
            Some(FailurePattern::SchemaChanged),
            true
        ));
        // Systematic outage recovers only through a fallback
        assert!(recoverable(
            AlertKind::CollectionGap,
            Some(FailurePattern::SystematicOutage),
            true
        ));
        assert!(!recoverable(
            AlertKind::CollectionGap,
            Some(FailurePattern::SystematicOutage),
            false
        ));
        assert!(!recoverable(AlertKind::DeadRecord, None, true));
    }
}
