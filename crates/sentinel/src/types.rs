//! Core types shared across the sentinel subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One completed collection cycle reported by a collector.
///
/// Immutable and append-only; collectors produce these, the sentinel
/// consumes each exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionAttempt {
    /// Source that was collected
    pub source_id: String,
    /// When the attempt started
    pub started_at: DateTime<Utc>,
    /// When the attempt finished
    pub finished_at: DateTime<Utc>,
    /// Whether the attempt succeeded
    pub success: bool,
    /// Records returned by the collector (0 on failure)
    #[serde(default)]
    pub records_returned: u64,
    /// Coarse error classification from the collector
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    /// Free-text error detail (empty on success)
    #[serde(default)]
    pub error_detail: String,
    /// End-to-end latency of the attempt
    pub latency_ms: u64,
}

/// Coarse error classification reported by collectors.
///
/// Collectors map their own failures onto this enum; the confidence
/// analyzer refines a run of them into a [`FailurePattern`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// HTTP error with status code
    Http(u16),
    /// The request timed out
    Timeout,
    /// The payload could not be parsed into the expected shape
    Parse,
    /// Connection-level failure (DNS, refused, reset)
    Network,
    /// The upstream rejected the request for quota reasons
    RateLimited,
    /// Anything else
    Other,
}

/// Decaying-window health aggregate for one source.
///
/// Mutated only by the confidence analyzer; every other component reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthScore {
    pub source_id: String,
    /// Estimated probability the source is currently healthy, in [0, 1]
    pub confidence: f64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_updated: DateTime<Utc>,
    pub trend: Trend,
    /// Classification of the current failing run, if any
    #[serde(default)]
    pub pattern: Option<FailurePattern>,
}

impl HealthScore {
    /// Initial score for a source that has not reported yet.
    #[must_use]
    pub fn new(source_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.to_string(),
            confidence: 1.0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_updated: now,
            trend: Trend::Stable,
            pattern: None,
        }
    }
}

/// Direction the confidence score is moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

/// Classified failure pattern for a run of recent failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePattern {
    RateLimited,
    Timeout,
    SchemaChanged,
    SystematicOutage,
    Transient,
    Unknown,
}

impl FailurePattern {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::SchemaChanged => "schema_changed",
            Self::SystematicOutage => "systematic_outage",
            Self::Transient => "transient",
            Self::Unknown => "unknown",
        }
    }
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Attempts allowed
    Closed,
    /// Attempts blocked until the next probe window
    Open,
    /// Exactly one probe attempt in flight
    HalfOpen,
    /// Primary logically open while a fallback runs
    Degraded,
}

impl CircuitState {
    /// Whether regular (non-probe) attempts are blocked in this state.
    #[must_use]
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::Open | Self::HalfOpen | Self::Degraded)
    }
}

/// Serializable view of one source's breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub source_id: String,
    pub state: CircuitState,
    pub opened_at: Option<DateTime<Utc>>,
    /// Always set while `state` is `Open` or `Degraded`
    pub next_probe_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    #[serde(default)]
    pub active_strategy: Option<RecoveryStrategy>,
}

/// Alert severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "critical" | "crit" => Ok(Self::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Kinds of alert the manager can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    CollectionGap,
    DeadRecord,
    CascadeFailure,
    CircuitOpened,
    CircuitRecovered,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CollectionGap => "collection_gap",
            Self::DeadRecord => "dead_record",
            Self::CascadeFailure => "cascade_failure",
            Self::CircuitOpened => "circuit_opened",
            Self::CircuitRecovered => "circuit_recovered",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CollectionGap => "Collection Gap",
            Self::DeadRecord => "Dead Records",
            Self::CascadeFailure => "Cascade Failure",
            Self::CircuitOpened => "Circuit Opened",
            Self::CircuitRecovered => "Circuit Recovered",
        }
    }
}

/// An operator-facing alert.
///
/// At most one unresolved alert exists per `(source_id, kind)`; repeat
/// detections touch the existing alert instead of duplicating it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: Severity,
    pub kind: AlertKind,
    /// `None` for cascade-wide alerts
    pub source_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub pattern: Option<FailurePattern>,
    pub auto_recoverable: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    /// How many times this condition has been detected while unresolved
    #[serde(default = "default_count")]
    pub count: u32,
}

fn default_count() -> u32 {
    1
}

impl Alert {
    pub fn new(kind: AlertKind, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            severity: Severity::Warning,
            kind,
            source_id: None,
            message: message.into(),
            pattern: None,
            auto_recoverable: false,
            created_at: now,
            resolved_at: None,
            count: 1,
        }
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    #[must_use]
    pub fn with_pattern(mut self, pattern: FailurePattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    #[must_use]
    pub fn auto_recoverable(mut self, value: bool) -> Self {
        self.auto_recoverable = value;
        self
    }

    /// Whether the alert is still unresolved.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Recovery strategies the orchestrator can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    ExponentialBackoff,
    FallbackSource,
    DegradedMode,
    RestartCollector,
    ManualEscalation,
}

impl RecoveryStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExponentialBackoff => "exponential_backoff",
            Self::FallbackSource => "fallback_source",
            Self::DegradedMode => "degraded_mode",
            Self::RestartCollector => "restart_collector",
            Self::ManualEscalation => "manual_escalation",
        }
    }

    /// Whether the strategy requires a human before the source can recover.
    #[must_use]
    pub fn needs_operator(self) -> bool {
        matches!(self, Self::ManualEscalation)
    }
}

/// Status of a recovery plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl PlanStatus {
    /// Terminal states feed back into the health score and stop execution.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// One step of a recovery plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum PlanStep {
    /// Wait out the breaker backoff before probing
    WaitForProbe,
    /// Probe the source and feed the result back
    Probe,
    /// Switch collection to the configured fallback source
    EngageFallback { fallback_id: String },
    /// Signal the collector supervisor to restart the collector
    RestartCollector,
    /// Clear breaker backoff and re-arm an immediate probe
    ClearBackoff,
    /// Hand the source to a human
    Escalate,
}

/// A recovery plan owned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub id: Uuid,
    pub source_id: String,
    pub strategy: RecoveryStrategy,
    pub steps: Vec<PlanStep>,
    pub status: PlanStatus,
    pub attempt_count: u32,
    /// Classification that triggered the plan
    pub pattern: FailurePattern,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Why an attempt was allowed or denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowReason {
    /// Breaker closed, normal operation
    Closed,
    /// Breaker half-open, this call holds the single probe slot
    ProbePermitted,
    /// Breaker open, probe window not reached
    OpenUntilProbe,
    /// Another probe is already in flight
    ProbeInFlight,
    /// Primary blocked, collection should run against the fallback
    DegradedUseFallback,
}

impl AllowReason {
    pub fn message(self) -> &'static str {
        match self {
            Self::Closed => "breaker closed",
            Self::ProbePermitted => "probe attempt permitted",
            Self::OpenUntilProbe => "breaker open until next probe window",
            Self::ProbeInFlight => "a probe is already in flight",
            Self::DegradedUseFallback => "primary degraded, use the fallback source",
        }
    }
}

/// Decision returned to collectors before each attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowDecision {
    pub allowed: bool,
    pub reason: AllowReason,
    pub state: CircuitState,
}

impl AllowDecision {
    #[must_use]
    pub fn allowed(reason: AllowReason, state: CircuitState) -> Self {
        Self {
            allowed: true,
            reason,
            state,
        }
    }

    #[must_use]
    pub fn denied(reason: AllowReason, state: CircuitState) -> Self {
        Self {
            allowed: false,
            reason,
            state,
        }
    }
}

/// Inbound report from a collector, one per collection cycle.
///
/// Timestamps are stamped on receipt; collectors only supply the latency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptReport {
    pub source_id: String,
    pub success: bool,
    #[serde(default)]
    pub records_returned: u64,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub error_detail: String,
    pub latency_ms: u64,
}

impl AttemptReport {
    /// Expand into the canonical attempt record.
    #[must_use]
    pub fn into_attempt(self, now: DateTime<Utc>) -> CollectionAttempt {
        CollectionAttempt {
            started_at: now - chrono::Duration::milliseconds(self.latency_ms as i64),
            finished_at: now,
            source_id: self.source_id,
            success: self.success,
            records_returned: self.records_returned,
            error_kind: self.error_kind,
            error_detail: self.error_detail,
            latency_ms: self.latency_ms,
        }
    }
}

/// Acknowledgement returned for every reported attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportAck {
    pub health: HealthScore,
    /// Advisory decision for the collector's next cycle
    pub decision: AllowDecision,
}

/// Break-glass audit record for manual overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub source_id: String,
    /// Operator identity as supplied by the caller
    pub actor: String,
    pub action: String,
    pub previous_state: CircuitState,
    pub at: DateTime<Utc>,
}
