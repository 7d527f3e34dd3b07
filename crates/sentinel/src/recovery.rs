//! Recovery orchestrator: strategy selection and plan lifecycle.
//!
//! Strategy selection is an explicit table keyed by failure pattern, so new
//! patterns or strategies are additive. Plans are bounded: after
//! `max_attempts` executions the orchestrator escalates to a human
//! regardless of pattern, which guarantees every source converges to either
//! health or a visible alert.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RecoveryConfig;
use crate::types::{FailurePattern, PlanStatus, PlanStep, RecoveryPlan, RecoveryStrategy};

/// The classification → strategy table.
///
/// Schema changes are never auto-retried: a code or schema fix is required,
/// and retrying risks ingesting corrupt data.
#[must_use]
pub fn strategy_for(pattern: FailurePattern, has_fallback: bool) -> RecoveryStrategy {
    match pattern {
        FailurePattern::RateLimited | FailurePattern::Timeout => {
            RecoveryStrategy::ExponentialBackoff
        }
        FailurePattern::SchemaChanged => RecoveryStrategy::ManualEscalation,
        FailurePattern::SystematicOutage => {
            if has_fallback {
                RecoveryStrategy::FallbackSource
            } else {
                RecoveryStrategy::ManualEscalation
            }
        }
        FailurePattern::Transient | FailurePattern::Unknown => {
            RecoveryStrategy::ExponentialBackoff
        }
    }
}

/// Ordered steps for a strategy.
#[must_use]
pub fn steps_for(strategy: RecoveryStrategy, fallback_id: Option<&str>) -> Vec<PlanStep> {
    match strategy {
        RecoveryStrategy::ExponentialBackoff => vec![PlanStep::WaitForProbe, PlanStep::Probe],
        RecoveryStrategy::FallbackSource | RecoveryStrategy::DegradedMode => {
            let fallback_id = fallback_id.unwrap_or("").to_string();
            vec![
                PlanStep::EngageFallback { fallback_id },
                PlanStep::WaitForProbe,
                PlanStep::Probe,
            ]
        }
        RecoveryStrategy::RestartCollector => vec![
            PlanStep::RestartCollector,
            PlanStep::ClearBackoff,
            PlanStep::Probe,
        ],
        RecoveryStrategy::ManualEscalation => vec![PlanStep::Escalate],
    }
}

/// Outcome of a failed plan execution.
#[derive(Debug, Clone)]
pub enum PlanOutcome {
    /// Another execution is allowed
    Retry(RecoveryPlan),
    /// Attempt budget exhausted; the plan escalated to a human
    Escalated(RecoveryPlan),
}

/// Owns all recovery plans, one live plan per source.
pub struct RecoveryOrchestrator {
    config: RecoveryConfig,
    plans: HashMap<String, RecoveryPlan>,
    /// Consecutive timeout-classified opens per source; feeds the
    /// restart-collector escalation
    timeout_streaks: HashMap<String, u32>,
}

impl RecoveryOrchestrator {
    #[must_use]
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            plans: HashMap::new(),
            timeout_streaks: HashMap::new(),
        }
    }

    /// React to a breaker opening: select a strategy and build (or refresh)
    /// the source's plan.
    pub fn on_breaker_opened(
        &mut self,
        source_id: &str,
        pattern: FailurePattern,
        fallback_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> RecoveryPlan {
        let streak = self.timeout_streaks.entry(source_id.to_string()).or_insert(0);
        if pattern == FailurePattern::Timeout {
            *streak += 1;
        } else {
            *streak = 0;
        }
        let timeout_streak = *streak;

        let mut strategy = strategy_for(pattern, fallback_id.is_some());
        if pattern == FailurePattern::Timeout
            && timeout_streak >= self.config.restart_after_timeout_opens
        {
            strategy = RecoveryStrategy::RestartCollector;
        }

        // A breaker that re-opens while a plan is live consumes another
        // attempt from that plan's budget instead of starting fresh.
        if let Some(existing) = self.plans.get_mut(source_id) {
            if !existing.status.is_terminal() {
                existing.attempt_count += 1;
                existing.updated_at = now;
                if existing.attempt_count >= self.config.max_attempts {
                    Self::escalate(existing, now);
                } else {
                    existing.strategy = strategy;
                    existing.pattern = pattern;
                    existing.steps = steps_for(strategy, fallback_id);
                    existing.status = PlanStatus::Pending;
                }
                return existing.clone();
            }
        }

        let plan = RecoveryPlan {
            id: Uuid::new_v4(),
            source_id: source_id.to_string(),
            strategy,
            steps: steps_for(strategy, fallback_id),
            status: PlanStatus::Pending,
            attempt_count: 1,
            pattern,
            created_at: now,
            updated_at: now,
        };
        info!(
            source_id = %source_id,
            strategy = %strategy.as_str(),
            pattern = %pattern.as_str(),
            "Recovery plan created"
        );
        self.plans.insert(source_id.to_string(), plan.clone());
        plan
    }

    fn escalate(plan: &mut RecoveryPlan, now: DateTime<Utc>) {
        warn!(
            source_id = %plan.source_id,
            attempts = %plan.attempt_count,
            "Recovery attempts exhausted, escalating to operator"
        );
        plan.strategy = RecoveryStrategy::ManualEscalation;
        plan.steps = steps_for(RecoveryStrategy::ManualEscalation, None);
        plan.status = PlanStatus::Failed;
        plan.updated_at = now;
    }

    /// Claim a pending plan for execution.
    pub fn begin_execution(&mut self, source_id: &str, now: DateTime<Utc>) -> Option<RecoveryPlan> {
        let plan = self.plans.get_mut(source_id)?;
        if plan.status != PlanStatus::Pending || plan.strategy.needs_operator() {
            return None;
        }
        plan.status = PlanStatus::Running;
        plan.updated_at = now;
        Some(plan.clone())
    }

    /// Mark a plan finished after its steps completed.
    pub fn complete(&mut self, source_id: &str, now: DateTime<Utc>) -> Option<RecoveryPlan> {
        self.timeout_streaks.remove(source_id);
        let plan = self.plans.get_mut(source_id)?;
        if plan.status.is_terminal() {
            return Some(plan.clone());
        }
        plan.status = PlanStatus::Succeeded;
        plan.updated_at = now;
        info!(source_id = %source_id, "Recovery plan succeeded");
        Some(plan.clone())
    }

    /// The source recovered on its own; redundant work is dropped and the
    /// plan reads as succeeded.
    pub fn cancel_if_recovered(&mut self, source_id: &str, now: DateTime<Utc>) -> Option<RecoveryPlan> {
        self.timeout_streaks.remove(source_id);
        let plan = self.plans.get_mut(source_id)?;
        if plan.status.is_terminal() {
            return None;
        }
        plan.status = PlanStatus::Succeeded;
        plan.updated_at = now;
        info!(source_id = %source_id, "Source recovered independently, plan cancelled");
        Some(plan.clone())
    }

    /// Record a failed execution, escalating once the budget is spent.
    pub fn fail_attempt(&mut self, source_id: &str, now: DateTime<Utc>) -> Option<PlanOutcome> {
        let max_attempts = self.config.max_attempts;
        let plan = self.plans.get_mut(source_id)?;
        if plan.status.is_terminal() {
            return None;
        }

        plan.attempt_count += 1;
        plan.updated_at = now;
        if plan.attempt_count >= max_attempts {
            Self::escalate(plan, now);
            Some(PlanOutcome::Escalated(plan.clone()))
        } else {
            plan.status = PlanStatus::Pending;
            Some(PlanOutcome::Retry(plan.clone()))
        }
    }

    #[must_use]
    pub fn plan(&self, source_id: &str) -> Option<&RecoveryPlan> {
        self.plans.get(source_id)
    }

    /// All plans, live and terminal.
    #[must_use]
    pub fn plans(&self) -> Vec<RecoveryPlan> {
        self.plans.values().cloned().collect()
    }

    /// Drop terminal plans, keeping the map bounded.
    pub fn cleanup(&mut self) {
        let before = self.plans.len();
        self.plans.retain(|_, plan| !plan.status.is_terminal());
        let removed = before - self.plans.len();
        if removed > 0 {
            info!("Cleaned up {removed} finished recovery plans");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator() -> RecoveryOrchestrator {
        RecoveryOrchestrator::new(RecoveryConfig::default())
    }

    #[test]
    fn test_strategy_table() {
        assert_eq!(
            strategy_for(FailurePattern::RateLimited, false),
            RecoveryStrategy::ExponentialBackoff
        );
        assert_eq!(
            strategy_for(FailurePattern::Timeout, true),
            RecoveryStrategy::ExponentialBackoff
        );
        assert_eq!(
            strategy_for(FailurePattern::SchemaChanged, true),
            RecoveryStrategy::ManualEscalation
        );
        assert_eq!(
            strategy_for(FailurePattern::SystematicOutage, true),
            RecoveryStrategy::FallbackSource
        );
        assert_eq!(
            strategy_for(FailurePattern::SystematicOutage, false),
            RecoveryStrategy::ManualEscalation
        );
        assert_eq!(
            strategy_for(FailurePattern::Unknown, false),
            RecoveryStrategy::ExponentialBackoff
        );
    }

    #[test]
    fn test_backoff_plan_steps() {
        let mut orch = orchestrator();
        let plan = orch.on_breaker_opened("s1", FailurePattern::RateLimited, None, Utc::now());

        assert_eq!(plan.strategy, RecoveryStrategy::ExponentialBackoff);
        assert_eq!(plan.steps, vec![PlanStep::WaitForProbe, PlanStep::Probe]);
        assert_eq!(plan.status, PlanStatus::Pending);
        assert_eq!(plan.attempt_count, 1);
    }

    #[test]
    fn test_schema_change_never_auto_retried() {
        let mut orch = orchestrator();
        let now = Utc::now();
        let plan = orch.on_breaker_opened("s1", FailurePattern::SchemaChanged, Some("mirror"), now);

        assert_eq!(plan.strategy, RecoveryStrategy::ManualEscalation);
        assert_eq!(plan.steps, vec![PlanStep::Escalate]);
        // Escalation plans are never claimed for automatic execution
        assert!(orch.begin_execution("s1", now).is_none());
    }

    #[test]
    fn test_fallback_engaged_for_systemic_outage() {
        let mut orch = orchestrator();
        let plan = orch.on_breaker_opened(
            "s1",
            FailurePattern::SystematicOutage,
            Some("mirror"),
            Utc::now(),
        );

        assert_eq!(plan.strategy, RecoveryStrategy::FallbackSource);
        assert_eq!(
            plan.steps[0],
            PlanStep::EngageFallback {
                fallback_id: "mirror".to_string()
            }
        );
    }

    #[test]
    fn test_restart_collector_after_timeout_streak() {
        let mut orch = orchestrator();
        let now = Utc::now();

        let first = orch.on_breaker_opened("s1", FailurePattern::Timeout, None, now);
        assert_eq!(first.strategy, RecoveryStrategy::ExponentialBackoff);
        orch.on_breaker_opened("s1", FailurePattern::Timeout, None, now);
        let third = orch.on_breaker_opened("s1", FailurePattern::Timeout, None, now);

        assert_eq!(third.strategy, RecoveryStrategy::RestartCollector);
        assert!(third.steps.contains(&PlanStep::RestartCollector));
    }

    #[test]
    fn test_recovery_resets_timeout_streak() {
        let mut orch = orchestrator();
        let now = Utc::now();

        orch.on_breaker_opened("s1", FailurePattern::Timeout, None, now);
        orch.on_breaker_opened("s1", FailurePattern::Timeout, None, now);
        orch.complete("s1", now);
        orch.cleanup();

        let plan = orch.on_breaker_opened("s1", FailurePattern::Timeout, None, now);
        assert_eq!(plan.strategy, RecoveryStrategy::ExponentialBackoff);
    }

    #[test]
    fn test_plan_converges_to_escalation() {
        let mut orch = orchestrator();
        let now = Utc::now();
        orch.on_breaker_opened("s1", FailurePattern::Unknown, None, now);

        let mut escalated = false;
        for _ in 0..10 {
            match orch.fail_attempt("s1", now) {
                Some(PlanOutcome::Retry(_)) => {}
                Some(PlanOutcome::Escalated(plan)) => {
                    assert_eq!(plan.strategy, RecoveryStrategy::ManualEscalation);
                    assert_eq!(plan.status, PlanStatus::Failed);
                    escalated = true;
                }
                None => break,
            }
        }
        assert!(escalated, "plan never escalated");

        // Terminal plans absorb further failures without looping
        assert!(orch.fail_attempt("s1", now).is_none());
    }

    #[test]
    fn test_independent_recovery_cancels_plan() {
        let mut orch = orchestrator();
        let now = Utc::now();
        orch.on_breaker_opened("s1", FailurePattern::Unknown, None, now);
        orch.begin_execution("s1", now);

        let plan = orch.cancel_if_recovered("s1", now).unwrap();
        assert_eq!(plan.status, PlanStatus::Succeeded);

        // Cancelling again is a no-op
        assert!(orch.cancel_if_recovered("s1", now).is_none());
    }

    #[test]
    fn test_reopen_consumes_plan_budget() {
        let mut orch = orchestrator();
        let now = Utc::now();

        orch.on_breaker_opened("s1", FailurePattern::Unknown, None, now);
        for _ in 0..4 {
            orch.on_breaker_opened("s1", FailurePattern::Unknown, None, now);
        }

        let plan = orch.plan("s1").unwrap();
        assert_eq!(plan.strategy, RecoveryStrategy::ManualEscalation);
        assert_eq!(plan.status, PlanStatus::Failed);
    }
}
