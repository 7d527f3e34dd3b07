//! Per-source circuit breaker state machine.
//!
//! Each source owns one [`SourceBreaker`] living inside the engine's
//! per-source lock arena, so transitions are atomic per source and one
//! stuck source never stalls the rest. The breaker holds no clock of its
//! own; callers pass `now`, which keeps every transition testable.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::types::{AllowDecision, AllowReason, CircuitBreakerState, CircuitState, RecoveryStrategy};

/// Events emitted by breaker transitions, consumed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// Breaker tripped open after hitting the failure threshold
    Opened,
    /// A half-open probe failed and the breaker re-opened
    ProbeFailed,
    /// The source recovered and the breaker closed
    Recovered { from: CircuitState },
}

/// Exponential backoff with jitter and a ceiling.
///
/// `failure_count` of 1 yields roughly the base; each further failure
/// doubles the raw value until the ceiling.
#[must_use]
pub fn backoff_duration(config: &BreakerConfig, failure_count: u32) -> Duration {
    let exponent = failure_count.saturating_sub(1).min(31);
    let raw_secs = config
        .backoff_base_secs
        .saturating_mul(1_u64 << exponent)
        .min(config.backoff_ceiling_secs);

    let jitter = rand::thread_rng().gen_range(-config.jitter_fraction..=config.jitter_fraction);
    let jittered = (raw_secs as f64 * (1.0 + jitter)).max(1.0);
    Duration::seconds(jittered as i64)
}

/// Circuit breaker for a single source.
#[derive(Debug)]
pub struct SourceBreaker {
    source_id: String,
    state: CircuitState,
    opened_at: Option<DateTime<Utc>>,
    next_probe_at: Option<DateTime<Utc>>,
    failure_count: u32,
    active_strategy: Option<RecoveryStrategy>,
    probe_in_flight: bool,
}

impl SourceBreaker {
    #[must_use]
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            state: CircuitState::Closed,
            opened_at: None,
            next_probe_at: None,
            failure_count: 0,
            active_strategy: None,
            probe_in_flight: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state
    }

    #[must_use]
    pub fn next_probe_at(&self) -> Option<DateTime<Utc>> {
        self.next_probe_at
    }

    /// Serializable view for the query interface and persistence.
    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerState {
        CircuitBreakerState {
            source_id: self.source_id.clone(),
            state: self.state,
            opened_at: self.opened_at,
            next_probe_at: self.next_probe_at,
            failure_count: self.failure_count,
            active_strategy: self.active_strategy,
        }
    }

    /// Restore from a persisted snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: &CircuitBreakerState) -> Self {
        Self {
            source_id: snapshot.source_id.clone(),
            state: snapshot.state,
            opened_at: snapshot.opened_at,
            next_probe_at: snapshot.next_probe_at,
            failure_count: snapshot.failure_count,
            active_strategy: snapshot.active_strategy,
            probe_in_flight: false,
        }
    }

    /// Decide whether a collection attempt may proceed.
    ///
    /// Answers purely from in-memory state. An `Open` breaker whose probe
    /// window has elapsed transitions to `HalfOpen` here, before the probe
    /// is permitted; exactly one probe slot exists at a time.
    pub fn allow(&mut self, now: DateTime<Utc>) -> AllowDecision {
        match self.state {
            CircuitState::Closed => AllowDecision::allowed(AllowReason::Closed, self.state),
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    AllowDecision::denied(AllowReason::ProbeInFlight, self.state)
                } else {
                    self.probe_in_flight = true;
                    AllowDecision::allowed(AllowReason::ProbePermitted, self.state)
                }
            }
            CircuitState::Open => {
                if self.probe_due(now) {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    info!(source_id = %self.source_id, "Breaker half-open, probe permitted");
                    AllowDecision::allowed(AllowReason::ProbePermitted, self.state)
                } else {
                    AllowDecision::denied(AllowReason::OpenUntilProbe, self.state)
                }
            }
            CircuitState::Degraded => {
                // Primary stays logically open while the fallback collects;
                // probes of the primary still run on schedule.
                if self.probe_due(now) && !self.probe_in_flight {
                    self.probe_in_flight = true;
                    AllowDecision::allowed(AllowReason::ProbePermitted, self.state)
                } else {
                    AllowDecision::denied(AllowReason::DegradedUseFallback, self.state)
                }
            }
        }
    }

    fn probe_due(&self, now: DateTime<Utc>) -> bool {
        self.next_probe_at.is_some_and(|at| now >= at)
    }

    /// Non-consuming view of what `allow` would say, used for report acks.
    ///
    /// Never claims the probe slot; a collector that wants to probe still
    /// has to go through [`SourceBreaker::allow`].
    #[must_use]
    pub fn advisory(&self, now: DateTime<Utc>) -> AllowDecision {
        match self.state {
            CircuitState::Closed => AllowDecision::allowed(AllowReason::Closed, self.state),
            CircuitState::HalfOpen => {
                AllowDecision::denied(AllowReason::ProbeInFlight, self.state)
            }
            CircuitState::Open => {
                if self.probe_due(now) {
                    AllowDecision::allowed(AllowReason::ProbePermitted, self.state)
                } else {
                    AllowDecision::denied(AllowReason::OpenUntilProbe, self.state)
                }
            }
            CircuitState::Degraded => {
                AllowDecision::denied(AllowReason::DegradedUseFallback, self.state)
            }
        }
    }

    /// Fold an attempt result into the state machine.
    ///
    /// `consecutive_failures` comes from the analyzer's health score; the
    /// breaker itself only counts failures across open/probe cycles.
    pub fn record_result(
        &mut self,
        success: bool,
        consecutive_failures: u32,
        config: &BreakerConfig,
        now: DateTime<Utc>,
    ) -> Option<BreakerEvent> {
        match self.state {
            CircuitState::Closed => {
                if success {
                    self.failure_count = 0;
                    None
                } else if consecutive_failures >= config.failure_threshold {
                    self.trip(config, now);
                    Some(BreakerEvent::Opened)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.probe_in_flight = false;
                if success {
                    let from = self.state;
                    self.close();
                    Some(BreakerEvent::Recovered { from })
                } else {
                    self.failure_count += 1;
                    self.state = CircuitState::Open;
                    self.next_probe_at = Some(now + backoff_duration(config, self.failure_count));
                    warn!(
                        source_id = %self.source_id,
                        failure_count = %self.failure_count,
                        "Probe failed, breaker re-opened"
                    );
                    Some(BreakerEvent::ProbeFailed)
                }
            }
            CircuitState::Open | CircuitState::Degraded => {
                if self.probe_in_flight {
                    // Degraded probe result
                    self.probe_in_flight = false;
                    if success {
                        let from = self.state;
                        self.close();
                        return Some(BreakerEvent::Recovered { from });
                    }
                    self.failure_count += 1;
                    self.next_probe_at = Some(now + backoff_duration(config, self.failure_count));
                    return Some(BreakerEvent::ProbeFailed);
                }
                if success {
                    // Late success from an attempt that started before the
                    // trip: the source independently recovered.
                    let from = self.state;
                    self.close();
                    return Some(BreakerEvent::Recovered { from });
                }
                None
            }
        }
    }

    fn trip(&mut self, config: &BreakerConfig, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.failure_count = 1;
        self.next_probe_at = Some(now + backoff_duration(config, self.failure_count));
        warn!(
            source_id = %self.source_id,
            next_probe_at = ?self.next_probe_at,
            "Breaker opened"
        );
    }

    fn close(&mut self) {
        info!(source_id = %self.source_id, from = ?self.state, "Breaker closed");
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.next_probe_at = None;
        self.failure_count = 0;
        self.active_strategy = None;
        self.probe_in_flight = false;
    }

    /// Break-glass reset to `Closed` regardless of history.
    ///
    /// Returns the previous state so the caller can audit-log it; the
    /// transition itself cannot fail.
    pub fn force_reset(&mut self) -> CircuitState {
        let previous = self.state;
        self.close();
        previous
    }

    /// Orchestrator decision: primary stays blocked while a fallback runs.
    ///
    /// The probe schedule stays live so primary recovery is still observed.
    pub fn enter_degraded(
        &mut self,
        strategy: RecoveryStrategy,
        config: &BreakerConfig,
        now: DateTime<Utc>,
    ) {
        self.state = CircuitState::Degraded;
        self.active_strategy = Some(strategy);
        if self.opened_at.is_none() {
            self.opened_at = Some(now);
        }
        if self.next_probe_at.is_none() {
            self.next_probe_at = Some(now + backoff_duration(config, self.failure_count.max(1)));
        }
    }

    pub fn set_active_strategy(&mut self, strategy: Option<RecoveryStrategy>) {
        self.active_strategy = strategy;
    }

    /// Re-arm an immediate probe, clearing accumulated backoff.
    pub fn clear_backoff(&mut self, now: DateTime<Utc>) {
        if matches!(self.state, CircuitState::Open | CircuitState::Degraded) {
            self.next_probe_at = Some(now);
        }
    }

    /// Fail closed after an internal fault: block attempts until a probe.
    pub fn trip_safe(&mut self, config: &BreakerConfig, now: DateTime<Utc>) {
        if self.state == CircuitState::Closed {
            self.trip(config, now);
        }
    }
}
