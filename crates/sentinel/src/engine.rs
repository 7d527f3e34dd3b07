//! The sentinel engine: composition root wiring the analyzer, breakers,
//! alert manager, recovery orchestrator, and store together.
//!
//! Concurrency model: each source's mutable state (window, health score,
//! breaker) lives in one cell behind its own lock, held only for in-memory
//! work. Cross-source reads (cascade detection, listings) take a snapshot
//! one source at a time, so no code path ever holds two source locks.
//! Persistence is asynchronous and best-effort; a persistence fault fails
//! the affected source closed rather than letting it pass as healthy.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::alerts::{recoverable, AlertCandidate, AlertManager, SourceSnapshot, StateSnapshot};
use crate::breaker::{BreakerEvent, SourceBreaker};
use crate::confidence::{AttemptWindow, ConfidenceAnalyzer};
use crate::config::SentinelConfig;
use crate::error::SentinelError;
use crate::probe::{ProbeOutcome, ProbeRunner};
use crate::recovery::{PlanOutcome, RecoveryOrchestrator};
use crate::store::{SourceRow, Store};
use crate::types::{
    Alert, AlertKind, AllowDecision, AttemptReport, AuditEntry, CircuitBreakerState, CircuitState,
    CollectionAttempt, ErrorKind, FailurePattern, HealthScore, PlanStatus, PlanStep, RecoveryPlan,
    RecoveryStrategy, ReportAck, Severity,
};

/// Poll interval for plan steps that wait on breaker state.
const STEP_POLL_MS: u64 = 500;

/// All per-source mutable state, guarded by one lock per source.
struct SourceCell {
    window: AttemptWindow,
    health: HealthScore,
    breaker: SourceBreaker,
    first_seen_at: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
}

impl SourceCell {
    fn new(source_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            window: AttemptWindow::new(),
            health: HealthScore::new(source_id, now),
            breaker: SourceBreaker::new(source_id),
            first_seen_at: now,
            last_attempt_at: None,
            last_success_at: None,
        }
    }

    fn from_row(row: &SourceRow, now: DateTime<Utc>) -> Self {
        Self {
            window: AttemptWindow::new(),
            health: row.health.clone(),
            breaker: SourceBreaker::from_snapshot(&row.breaker),
            first_seen_at: now,
            last_attempt_at: Some(row.health.last_updated),
            last_success_at: None,
        }
    }

    fn row(&self) -> SourceRow {
        SourceRow {
            health: self.health.clone(),
            breaker: self.breaker.snapshot(),
        }
    }
}

struct Inner {
    config: SentinelConfig,
    analyzer: ConfidenceAnalyzer,
    sources: RwLock<HashMap<String, Arc<Mutex<SourceCell>>>>,
    /// Last failure time per source, for systemic-outage classification
    recent_failures: Mutex<HashMap<String, DateTime<Utc>>>,
    alerts: Mutex<AlertManager>,
    recovery: Mutex<RecoveryOrchestrator>,
    store: Store,
    probes: ProbeRunner,
}

/// Outcome of one pass over a plan's steps.
enum StepRun {
    Recovered,
    NotRecovered,
    Cancelled,
}

/// Public handle to the sentinel subsystem; cheap to clone.
#[derive(Clone)]
pub struct Sentinel {
    inner: Arc<Inner>,
}

impl Sentinel {
    /// Build the engine and restore persisted state.
    pub async fn new(config: SentinelConfig) -> anyhow::Result<Self> {
        let store = Store::new(&config.store)?;
        let probes = ProbeRunner::new(std::time::Duration::from_secs(
            config.recovery.step_timeout_secs,
        ));

        let engine = Self {
            inner: Arc::new(Inner {
                analyzer: ConfidenceAnalyzer::new(config.analyzer.clone()),
                alerts: Mutex::new(AlertManager::new(config.alerts.clone())),
                recovery: Mutex::new(RecoveryOrchestrator::new(config.recovery.clone())),
                sources: RwLock::new(HashMap::new()),
                recent_failures: Mutex::new(HashMap::new()),
                store,
                probes,
                config,
            }),
        };
        engine.restore().await;
        Ok(engine)
    }

    /// Restore breaker state from the snapshot and replay the attempts log
    /// through the analyzer so health scores survive restarts.
    async fn restore(&self) {
        let now = Utc::now();

        let rows = match self.inner.store.load_snapshot().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Could not load snapshot, starting fresh");
                Vec::new()
            }
        };
        if !rows.is_empty() {
            let mut sources = self.inner.sources.write().await;
            for row in &rows {
                sources.insert(
                    row.health.source_id.clone(),
                    Arc::new(Mutex::new(SourceCell::from_row(row, now))),
                );
            }
            info!(sources = %rows.len(), "Restored persisted source state");
        }

        let history = match self.inner.store.recent_attempts(now).await {
            Ok(history) => history,
            Err(e) => {
                warn!(error = %e, "Could not read attempts log, skipping health rebuild");
                return;
            }
        };
        for attempt in &history {
            let cell = self.cell(&attempt.source_id).await;
            let mut cell = cell.lock().await;
            let cell = &mut *cell;
            self.inner.analyzer.rebuild(
                &mut cell.window,
                &mut cell.health,
                std::slice::from_ref(attempt),
            );
            cell.last_attempt_at = Some(attempt.finished_at);
            if attempt.success {
                cell.last_success_at = Some(attempt.finished_at);
            }
        }
        if !history.is_empty() {
            debug!(attempts = %history.len(), "Replayed attempts log into health scores");
        }
    }

    /// Get or create the cell for a source.
    async fn cell(&self, source_id: &str) -> Arc<Mutex<SourceCell>> {
        {
            let sources = self.inner.sources.read().await;
            if let Some(cell) = sources.get(source_id) {
                return cell.clone();
            }
        }
        let mut sources = self.inner.sources.write().await;
        sources
            .entry(source_id.to_string())
            .or_insert_with(|| {
                info!(source_id = %source_id, "Registering new source");
                Arc::new(Mutex::new(SourceCell::new(source_id, Utc::now())))
            })
            .clone()
    }

    async fn existing_cell(
        &self,
        source_id: &str,
    ) -> Result<Arc<Mutex<SourceCell>>, SentinelError> {
        let sources = self.inner.sources.read().await;
        sources
            .get(source_id)
            .cloned()
            .ok_or_else(|| SentinelError::UnknownSource(source_id.to_string()))
    }

    /// Ingest one collection attempt. Never fails: collectors always get an
    /// acknowledgement, and internal faults resolve to a deny-by-default
    /// advisory decision.
    pub async fn report_attempt(&self, report: AttemptReport) -> ReportAck {
        let now = Utc::now();
        let source_id = report.source_id.clone();
        let attempt = report.into_attempt(now);

        let failing_sources = self.note_failure(&source_id, attempt.success, now).await;

        let cell = self.cell(&source_id).await;
        let (ack, row, event) = {
            let mut cell = cell.lock().await;
            let cell = &mut *cell;
            let classification = self.inner.analyzer.record(
                &mut cell.window,
                &mut cell.health,
                &attempt,
                failing_sources,
            );
            let consecutive_failures = cell.health.consecutive_failures;
            let event = cell.breaker.record_result(
                attempt.success,
                consecutive_failures,
                &self.inner.config.breaker,
                now,
            );

            cell.last_attempt_at = Some(now);
            if attempt.success {
                cell.last_success_at = Some(now);
            }

            let ack = ReportAck {
                health: cell.health.clone(),
                decision: cell.breaker.advisory(now),
            };
            (ack, cell.row(), event.map(|e| (e, classification)))
        };

        self.persist_report(&source_id, attempt, row);

        if let Some((event, classification)) = event {
            match event {
                BreakerEvent::Opened => {
                    let pattern = classification.unwrap_or(FailurePattern::Unknown);
                    self.handle_opened(&source_id, pattern, now).await;
                }
                BreakerEvent::ProbeFailed => self.handle_probe_failed(&source_id, now).await,
                BreakerEvent::Recovered { from } => {
                    self.handle_recovered(&source_id, from, now).await;
                }
            }
        }

        ack
    }

    /// Track cross-source failures inside the systemic window and return the
    /// number of distinct sources currently failing.
    async fn note_failure(&self, source_id: &str, success: bool, now: DateTime<Utc>) -> usize {
        let horizon =
            now - Duration::seconds(self.inner.config.analyzer.systemic_window_secs as i64);
        let mut failures = self.inner.recent_failures.lock().await;
        failures.retain(|_, at| *at >= horizon);
        if success {
            failures.remove(source_id);
        } else {
            failures.insert(source_id.to_string(), now);
        }
        failures.len()
    }

    /// Gate a collection attempt. Answers purely from in-memory state.
    pub async fn allow(&self, source_id: &str) -> AllowDecision {
        let now = Utc::now();
        let cell = self.cell(source_id).await;
        let mut cell = cell.lock().await;
        let before = cell.breaker.state();
        let decision = cell.breaker.allow(now);
        if cell.breaker.state() != before {
            // Open -> HalfOpen transition is worth persisting
            let row = cell.row();
            drop(cell);
            self.persist_row(source_id, row);
        }
        decision
    }

    async fn handle_opened(&self, source_id: &str, pattern: FailurePattern, now: DateTime<Utc>) {
        let source_config = self.inner.config.source(source_id);
        let has_fallback = source_config.fallback.is_some();

        {
            let mut alerts = self.inner.alerts.lock().await;
            alerts.raise(
                AlertCandidate {
                    kind: AlertKind::CircuitOpened,
                    source_id: Some(source_id.to_string()),
                    severity: Severity::Warning,
                    message: format!(
                        "Circuit opened for {source_id} (pattern: {})",
                        pattern.as_str()
                    ),
                    pattern: Some(pattern),
                    auto_recoverable: recoverable(
                        AlertKind::CircuitOpened,
                        Some(pattern),
                        has_fallback,
                    ),
                },
                now,
            );
        }

        let plan = {
            let mut recovery = self.inner.recovery.lock().await;
            recovery.on_breaker_opened(source_id, pattern, source_config.fallback.as_deref(), now)
        };
        self.reflect_strategy(source_id, plan.strategy).await;

        if plan.strategy.needs_operator() {
            self.raise_escalation(&plan, now).await;
        } else if plan.status == PlanStatus::Pending {
            self.spawn_plan_executor(source_id.to_string());
        }
        self.flush_alert_log().await;
    }

    async fn handle_probe_failed(&self, source_id: &str, now: DateTime<Utc>) {
        let outcome = {
            let mut recovery = self.inner.recovery.lock().await;
            // Only charge the plan while an execution pass is live; a plan
            // already back in Pending was charged by the executor.
            match recovery.plan(source_id).map(|p| p.status) {
                Some(PlanStatus::Running) => recovery.fail_attempt(source_id, now),
                _ => None,
            }
        };
        if let Some(PlanOutcome::Escalated(plan)) = outcome {
            self.raise_escalation(&plan, now).await;
        }
        self.flush_alert_log().await;
    }

    async fn handle_recovered(&self, source_id: &str, from: CircuitState, now: DateTime<Utc>) {
        {
            let mut alerts = self.inner.alerts.lock().await;
            alerts.resolve(Some(source_id), AlertKind::CircuitOpened, now);
            alerts.resolve(Some(source_id), AlertKind::CollectionGap, now);
            alerts.notice(
                AlertCandidate {
                    kind: AlertKind::CircuitRecovered,
                    source_id: Some(source_id.to_string()),
                    severity: Severity::Info,
                    message: format!("{source_id} recovered (was {from:?})"),
                    pattern: None,
                    auto_recoverable: false,
                },
                now,
            );
        }

        {
            let mut recovery = self.inner.recovery.lock().await;
            recovery.cancel_if_recovered(source_id, now);
        }

        if let Ok(cell) = self.existing_cell(source_id).await {
            let row = cell.lock().await.row();
            self.persist_row(source_id, row);
        }
        self.flush_alert_log().await;
    }

    /// Mirror the plan's strategy onto the breaker state so query consumers
    /// see which recovery is active; cleared again when the breaker closes.
    async fn reflect_strategy(&self, source_id: &str, strategy: RecoveryStrategy) {
        if let Ok(cell) = self.existing_cell(source_id).await {
            cell.lock().await.breaker.set_active_strategy(Some(strategy));
        }
    }

    async fn raise_escalation(&self, plan: &RecoveryPlan, now: DateTime<Utc>) {
        self.reflect_strategy(&plan.source_id, plan.strategy).await;
        let mut alerts = self.inner.alerts.lock().await;
        alerts.raise(
            AlertCandidate {
                kind: AlertKind::CircuitOpened,
                source_id: Some(plan.source_id.clone()),
                severity: Severity::Critical,
                message: format!(
                    "{} needs operator attention after {} recovery attempts (pattern: {})",
                    plan.source_id,
                    plan.attempt_count,
                    plan.pattern.as_str()
                ),
                pattern: Some(plan.pattern),
                auto_recoverable: false,
            },
            now,
        );
    }

    // =========================================================================
    // Recovery plan execution
    // =========================================================================

    fn spawn_plan_executor(&self, source_id: String) {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                let plan = {
                    let mut recovery = engine.inner.recovery.lock().await;
                    recovery.begin_execution(&source_id, Utc::now())
                };
                let Some(plan) = plan else { break };

                debug!(
                    source_id = %source_id,
                    strategy = %plan.strategy.as_str(),
                    attempt = %plan.attempt_count,
                    "Executing recovery plan"
                );
                let run = engine.run_plan_steps(&plan).await;

                let now = Utc::now();
                match run {
                    StepRun::Recovered => {
                        let mut recovery = engine.inner.recovery.lock().await;
                        recovery.complete(&source_id, now);
                        break;
                    }
                    StepRun::Cancelled => break,
                    StepRun::NotRecovered => {
                        let outcome = {
                            let mut recovery = engine.inner.recovery.lock().await;
                            match recovery.plan(&source_id).map(|p| p.status) {
                                // No breaker event recorded this pass; charge it here
                                Some(PlanStatus::Running) => {
                                    recovery.fail_attempt(&source_id, now)
                                }
                                // A probe result already moved the plan on
                                Some(PlanStatus::Pending) => None,
                                _ => break,
                            }
                        };
                        if let Some(PlanOutcome::Escalated(plan)) = outcome {
                            engine.raise_escalation(&plan, now).await;
                            engine.flush_alert_log().await;
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn run_plan_steps(&self, plan: &RecoveryPlan) -> StepRun {
        for step in &plan.steps {
            if self.plan_superseded(&plan.source_id, plan.id).await {
                return StepRun::Cancelled;
            }
            let outcome = match step {
                PlanStep::WaitForProbe => self.wait_for_probe(&plan.source_id).await,
                PlanStep::Probe => self.execute_probe(&plan.source_id).await,
                PlanStep::EngageFallback { fallback_id } => {
                    self.engage_fallback(&plan.source_id, fallback_id).await
                }
                PlanStep::RestartCollector => {
                    // The sentinel does not own collectors; this structured
                    // line is the contract with the collector supervisor.
                    info!(
                        source_id = %plan.source_id,
                        action = "restart_collector",
                        "Requesting collector restart"
                    );
                    StepRun::NotRecovered
                }
                PlanStep::ClearBackoff => {
                    if let Ok(cell) = self.existing_cell(&plan.source_id).await {
                        cell.lock().await.breaker.clear_backoff(Utc::now());
                    }
                    StepRun::NotRecovered
                }
                PlanStep::Escalate => StepRun::NotRecovered,
            };
            match outcome {
                StepRun::Recovered => return StepRun::Recovered,
                StepRun::Cancelled => return StepRun::Cancelled,
                StepRun::NotRecovered => {}
            }
        }
        StepRun::NotRecovered
    }

    /// True when the plan this executor was spawned for is no longer the
    /// live, running plan for its source.
    async fn plan_superseded(&self, source_id: &str, plan_id: uuid::Uuid) -> bool {
        let recovery = self.inner.recovery.lock().await;
        match recovery.plan(source_id) {
            Some(plan) => plan.id != plan_id || plan.status != PlanStatus::Running,
            None => true,
        }
    }

    /// Sleep until the breaker's probe window opens, watching for
    /// independent recovery the whole time.
    async fn wait_for_probe(&self, source_id: &str) -> StepRun {
        loop {
            let Ok(cell) = self.existing_cell(source_id).await else {
                return StepRun::Cancelled;
            };
            {
                let cell = cell.lock().await;
                if !cell.breaker.state().is_blocking() {
                    return StepRun::Recovered;
                }
                if cell
                    .breaker
                    .next_probe_at()
                    .is_some_and(|at| Utc::now() >= at)
                {
                    return StepRun::NotRecovered;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(STEP_POLL_MS)).await;
        }
    }

    /// Probe the source, either actively (configured probe URL) or by
    /// waiting out one step timeout for the collector's own attempt.
    async fn execute_probe(&self, source_id: &str) -> StepRun {
        let source_config = self.inner.config.source(source_id);
        let step_timeout =
            std::time::Duration::from_secs(self.inner.config.recovery.step_timeout_secs);

        if let Some(url) = source_config.probe_url.as_deref() {
            let decision = self.allow(source_id).await;
            if !decision.allowed {
                return StepRun::NotRecovered;
            }

            let outcome = match tokio::time::timeout(
                step_timeout,
                self.inner.probes.probe(source_id, Some(url)),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => ProbeOutcome::Failed {
                    latency_ms: step_timeout.as_millis() as u64,
                    reason: "probe step timed out".to_string(),
                },
            };

            let report = match &outcome {
                ProbeOutcome::Success { latency_ms } => AttemptReport {
                    source_id: source_id.to_string(),
                    success: true,
                    records_returned: 0,
                    error_kind: None,
                    error_detail: String::new(),
                    latency_ms: *latency_ms,
                },
                ProbeOutcome::Failed { latency_ms, reason } => AttemptReport {
                    source_id: source_id.to_string(),
                    success: false,
                    records_returned: 0,
                    error_kind: Some(ErrorKind::Network),
                    error_detail: reason.clone(),
                    latency_ms: *latency_ms,
                },
                ProbeOutcome::NotConfigured => return StepRun::NotRecovered,
            };
            self.report_attempt(report).await;

            if outcome.is_success() {
                return StepRun::Recovered;
            }
            return StepRun::NotRecovered;
        }

        // Passive probe: the collector itself holds the probe slot; watch
        // the breaker for the outcome, bounded by the step timeout.
        let deadline = tokio::time::Instant::now() + step_timeout;
        while tokio::time::Instant::now() < deadline {
            let Ok(cell) = self.existing_cell(source_id).await else {
                return StepRun::Cancelled;
            };
            if !cell.lock().await.breaker.state().is_blocking() {
                return StepRun::Recovered;
            }
            tokio::time::sleep(std::time::Duration::from_millis(STEP_POLL_MS)).await;
        }
        StepRun::NotRecovered
    }

    /// Switch the primary to degraded mode and make sure the fallback
    /// source is registered on its own health track.
    async fn engage_fallback(&self, source_id: &str, fallback_id: &str) -> StepRun {
        let now = Utc::now();
        if fallback_id.is_empty() {
            warn!(source_id = %source_id, "Fallback step without a configured fallback");
            return StepRun::NotRecovered;
        }

        // Register the fallback before touching the primary; the two locks
        // are never held together.
        self.cell(fallback_id).await;

        let Ok(cell) = self.existing_cell(source_id).await else {
            return StepRun::Cancelled;
        };
        let row = {
            let mut cell = cell.lock().await;
            cell.breaker.enter_degraded(
                RecoveryStrategy::FallbackSource,
                &self.inner.config.breaker,
                now,
            );
            cell.row()
        };
        info!(
            source_id = %source_id,
            fallback_id = %fallback_id,
            "Fallback engaged, primary degraded"
        );
        self.persist_row(source_id, row);
        StepRun::NotRecovered
    }

    // =========================================================================
    // Query and command interface
    // =========================================================================

    /// Current health scores, one per source or all sources.
    pub async fn get_health(&self, source_id: Option<&str>) -> Vec<HealthScore> {
        let cells = self.cells(source_id).await;
        let mut scores = Vec::with_capacity(cells.len());
        for cell in cells {
            scores.push(cell.lock().await.health.clone());
        }
        scores.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        scores
    }

    /// Current breaker states for all sources.
    pub async fn get_breaker_states(&self) -> Vec<CircuitBreakerState> {
        let cells = self.cells(None).await;
        let mut states = Vec::with_capacity(cells.len());
        for cell in cells {
            states.push(cell.lock().await.breaker.snapshot());
        }
        states.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        states
    }

    /// Unresolved alerts, optionally filtered by minimum severity.
    pub async fn get_active_alerts(&self, min_severity: Option<Severity>) -> Vec<Alert> {
        self.inner.alerts.lock().await.active_alerts(min_severity)
    }

    /// Recovery plans, live and recently finished.
    pub async fn get_recovery_plans(&self) -> Vec<RecoveryPlan> {
        let mut plans = self.inner.recovery.lock().await.plans();
        plans.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        plans
    }

    /// Manual probe: bypasses collector scheduling but still respects the
    /// breaker. With a configured probe URL the probe actually runs and its
    /// result feeds back through the normal pipeline.
    pub async fn test_connection(&self, source_id: &str) -> Result<AllowDecision, SentinelError> {
        let cell = self.existing_cell(source_id).await?;
        let source_config = self.inner.config.source(source_id);

        if source_config.probe_url.is_none() {
            // Nothing to actively probe; report what a collector would see
            // without consuming the probe slot.
            let cell = cell.lock().await;
            return Ok(cell.breaker.advisory(Utc::now()));
        }

        let decision = self.allow(source_id).await;
        if !decision.allowed {
            return Ok(decision);
        }

        let outcome = self
            .inner
            .probes
            .probe(source_id, source_config.probe_url.as_deref())
            .await;
        let (success, latency_ms, error_detail) = match outcome {
            ProbeOutcome::Success { latency_ms } => (true, latency_ms, String::new()),
            ProbeOutcome::Failed { latency_ms, reason } => (false, latency_ms, reason),
            ProbeOutcome::NotConfigured => (false, 0, "no probe url".to_string()),
        };
        self.report_attempt(AttemptReport {
            source_id: source_id.to_string(),
            success,
            records_returned: 0,
            error_kind: if success { None } else { Some(ErrorKind::Network) },
            error_detail,
            latency_ms,
        })
        .await;

        Ok(decision)
    }

    /// Break-glass: force a source's breaker closed regardless of history.
    ///
    /// Audit-logged with the supplied actor identity; the reset itself
    /// cannot fail once the source is known.
    pub async fn force_reset(
        &self,
        source_id: &str,
        actor: &str,
    ) -> Result<CircuitBreakerState, SentinelError> {
        let now = Utc::now();
        let cell = self.existing_cell(source_id).await?;

        let (previous, row, snapshot) = {
            let mut cell = cell.lock().await;
            let previous = cell.breaker.force_reset();
            cell.health.consecutive_failures = 0;
            cell.health.pattern = None;
            (previous, cell.row(), cell.breaker.snapshot())
        };

        let entry = AuditEntry {
            source_id: source_id.to_string(),
            actor: actor.to_string(),
            action: "force_reset".to_string(),
            previous_state: previous,
            at: now,
        };
        info!(
            source_id = %source_id,
            actor = %actor,
            previous_state = ?previous,
            "Break-glass force reset"
        );
        if let Err(e) = self.inner.store.append_audit(&entry).await {
            // The reset already happened and is in the tracing log; the
            // audit file write must still be loud.
            error!(error = %e, source_id = %source_id, "Failed to persist audit entry");
        }

        {
            let mut alerts = self.inner.alerts.lock().await;
            alerts.resolve(Some(source_id), AlertKind::CircuitOpened, now);
        }
        {
            let mut recovery = self.inner.recovery.lock().await;
            recovery.cancel_if_recovered(source_id, now);
        }

        self.persist_row(source_id, row);
        self.flush_alert_log().await;
        Ok(snapshot)
    }

    /// Bounded historical query for diagnostics.
    pub async fn get_history(
        &self,
        source_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CollectionAttempt>, SentinelError> {
        self.inner
            .store
            .read_attempts(source_id, since)
            .await
            .map_err(|e| SentinelError::Store(e.to_string()))
    }

    /// Run the alert detectors over a fresh snapshot now.
    pub async fn evaluate_alerts(&self) -> Vec<Alert> {
        let snapshot = self.snapshot().await;
        let alerts = {
            let mut manager = self.inner.alerts.lock().await;
            manager.evaluate(&snapshot)
        };
        self.flush_alert_log().await;
        alerts
    }

    /// Long-running scheduler: periodic alert evaluation and log compaction.
    pub async fn run_scheduler(&self) {
        let mut evaluate_tick = tokio::time::interval(std::time::Duration::from_secs(
            self.inner.config.alerts.evaluate_interval_secs,
        ));
        let mut compact_tick =
            tokio::time::interval(std::time::Duration::from_secs(60 * 60));

        info!(
            interval_secs = %self.inner.config.alerts.evaluate_interval_secs,
            "Starting alert scheduler"
        );
        loop {
            tokio::select! {
                _ = evaluate_tick.tick() => {
                    let active = self.evaluate_alerts().await;
                    debug!(active = %active.len(), "Alert evaluation pass complete");
                }
                _ = compact_tick.tick() => {
                    if let Err(e) = self.inner.store.compact_attempts(Utc::now()).await {
                        warn!(error = %e, "Attempts log compaction failed");
                    }
                    let mut recovery = self.inner.recovery.lock().await;
                    recovery.cleanup();
                }
            }
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn cells(&self, source_id: Option<&str>) -> Vec<Arc<Mutex<SourceCell>>> {
        let sources = self.inner.sources.read().await;
        match source_id {
            Some(id) => sources.get(id).cloned().into_iter().collect(),
            None => sources.values().cloned().collect(),
        }
    }

    /// Consistent snapshot of all per-source state, one source lock at a
    /// time.
    async fn snapshot(&self) -> StateSnapshot {
        let now = Utc::now();
        let entries: Vec<(String, Arc<Mutex<SourceCell>>)> = {
            let sources = self.inner.sources.read().await;
            sources
                .iter()
                .map(|(id, cell)| (id.clone(), cell.clone()))
                .collect()
        };

        let mut snapshots = Vec::with_capacity(entries.len());
        for (source_id, cell) in entries {
            let source_config = self.inner.config.source(&source_id);
            let cell = cell.lock().await;
            snapshots.push(SourceSnapshot {
                source_id: source_id.clone(),
                health: cell.health.clone(),
                breaker: cell.breaker.snapshot(),
                first_seen_at: cell.first_seen_at,
                last_attempt_at: cell.last_attempt_at,
                last_success_at: cell.last_success_at,
                expected_interval_secs: source_config.expected_interval_secs,
                has_fallback: source_config.fallback.is_some(),
                recent_results: cell
                    .window
                    .samples()
                    .iter()
                    .map(|s| (s.success, s.records_returned))
                    .collect(),
            });
        }
        snapshots.sort_by(|a, b| a.source_id.cmp(&b.source_id));

        StateSnapshot {
            taken_at: now,
            sources: snapshots,
        }
    }

    /// Persist an attempt and its source row off the hot path. A write
    /// failure fails the source closed instead of passing it as healthy.
    fn persist_report(&self, source_id: &str, attempt: CollectionAttempt, row: SourceRow) {
        let engine = self.clone();
        let source_id = source_id.to_string();
        tokio::spawn(async move {
            let attempt_result = engine.inner.store.append_attempt(&attempt).await;
            let row_result = engine.inner.store.upsert_source(row).await;
            if let Err(e) = attempt_result.and(row_result) {
                error!(error = %e, source_id = %source_id, "Persistence failed, failing source closed");
                if let Ok(cell) = engine.existing_cell(&source_id).await {
                    cell.lock()
                        .await
                        .breaker
                        .trip_safe(&engine.inner.config.breaker, Utc::now());
                }
            }
        });
    }

    fn persist_row(&self, source_id: &str, row: SourceRow) {
        let engine = self.clone();
        let source_id = source_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = engine.inner.store.upsert_source(row).await {
                warn!(error = %e, source_id = %source_id, "Failed to persist source row");
            }
        });
    }

    async fn flush_alert_log(&self) {
        let transitions = {
            let mut alerts = self.inner.alerts.lock().await;
            alerts.drain_transitions()
        };
        for transition in transitions {
            if let Err(e) = self.inner.store.append_alert(&transition).await {
                warn!(error = %e, "Failed to append alert transition");
            }
        }
    }
}
