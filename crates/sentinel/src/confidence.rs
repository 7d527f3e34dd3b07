//! Confidence analyzer: decaying-window health scoring and failure-pattern
//! classification.
//!
//! Pure in-memory logic over a per-source sliding window of attempts; no
//! network or storage I/O, which keeps it unit-testable without mocks. The
//! engine owns one [`AttemptWindow`] per source and serializes calls through
//! the per-source lock.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::collections::VecDeque;
use tracing::debug;

use crate::config::AnalyzerConfig;
use crate::types::{CollectionAttempt, ErrorKind, FailurePattern, HealthScore, Trend};

/// Error detail is truncated before entering the window; raw payloads can be
/// arbitrarily large.
const DETAIL_MAX_LEN: usize = 240;

/// Compact view of one attempt kept in the sliding window.
#[derive(Debug, Clone)]
pub struct AttemptSample {
    pub at: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: u64,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: String,
    pub records_returned: u64,
}

impl AttemptSample {
    fn from_attempt(attempt: &CollectionAttempt) -> Self {
        let mut detail = attempt.error_detail.clone();
        if let Some((idx, _)) = detail.char_indices().nth(DETAIL_MAX_LEN) {
            detail.truncate(idx);
        }
        Self {
            at: attempt.finished_at,
            success: attempt.success,
            latency_ms: attempt.latency_ms,
            error_kind: attempt.error_kind,
            error_detail: detail,
            records_returned: attempt.records_returned,
        }
    }
}

/// Bounded sliding window of recent attempts for one source.
#[derive(Debug, Default)]
pub struct AttemptWindow {
    samples: VecDeque<AttemptSample>,
}

impl AttemptWindow {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples newest-last.
    #[must_use]
    pub fn samples(&self) -> &VecDeque<AttemptSample> {
        &self.samples
    }

    /// The trailing run of consecutive failures, oldest-first.
    #[must_use]
    pub fn failing_run(&self) -> Vec<&AttemptSample> {
        let mut run: Vec<&AttemptSample> = self
            .samples
            .iter()
            .rev()
            .take_while(|s| !s.success)
            .collect();
        run.reverse();
        run
    }

    fn push(&mut self, sample: AttemptSample, config: &AnalyzerConfig, now: DateTime<Utc>) {
        self.samples.push_back(sample);

        while self.samples.len() > config.window_attempts {
            self.samples.pop_front();
        }
        let horizon = now - Duration::hours(config.window_hours);
        while self.samples.front().is_some_and(|s| s.at < horizon) {
            self.samples.pop_front();
        }
    }
}

/// Scores attempt streams and classifies failing runs.
pub struct ConfidenceAnalyzer {
    config: AnalyzerConfig,
    rate_limit_re: Regex,
    schema_re: Regex,
}

fn compile(regex: &str) -> Regex {
    Regex::new(regex).unwrap_or_else(|e| {
        tracing::warn!("Invalid classification regex '{regex}': {e}");
        Regex::new("^$").unwrap() // Match nothing as fallback
    })
}

impl ConfidenceAnalyzer {
    #[must_use]
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config,
            rate_limit_re: compile(r"(?i)rate.?limit|too many requests|quota"),
            schema_re: compile(r"(?i)schema|parse|unexpected (field|token)|missing field"),
        }
    }

    /// Fold a new attempt into the source's window and health score.
    ///
    /// Returns the classification for the current failing run when one was
    /// assigned; the engine forwards it to the circuit breaker.
    pub fn record(
        &self,
        window: &mut AttemptWindow,
        health: &mut HealthScore,
        attempt: &CollectionAttempt,
        failing_sources: usize,
    ) -> Option<FailurePattern> {
        let now = attempt.finished_at;
        window.push(AttemptSample::from_attempt(attempt), &self.config, now);

        let previous = health.confidence;
        health.confidence = self.confidence(window);
        health.last_updated = now;
        health.trend = self.trend(previous, health.confidence);

        if attempt.success {
            health.consecutive_successes += 1;
            health.consecutive_failures = 0;
            health.pattern = None;
            return None;
        }

        health.consecutive_successes = 0;
        health.consecutive_failures += 1;

        if health.consecutive_failures < self.config.min_classify_failures {
            return None;
        }

        let pattern = self.classify(&window.failing_run(), failing_sources);
        debug!(
            source_id = %health.source_id,
            pattern = %pattern.as_str(),
            consecutive_failures = %health.consecutive_failures,
            "Classified failing run"
        );
        health.pattern = Some(pattern);
        Some(pattern)
    }

    /// Replay persisted history through the window, e.g. after a restart.
    ///
    /// Cross-source outage hints are unavailable during replay, so systemic
    /// classification is left to live traffic.
    pub fn rebuild(
        &self,
        window: &mut AttemptWindow,
        health: &mut HealthScore,
        history: &[CollectionAttempt],
    ) {
        for attempt in history {
            self.record(window, health, attempt, 0);
        }
    }

    /// Weighted success ratio over the window, recent attempts weighted more
    /// heavily (exponential decay by attempt rank).
    #[must_use]
    pub fn confidence(&self, window: &AttemptWindow) -> f64 {
        if window.samples.is_empty() {
            return 1.0;
        }

        let half_life = self.config.half_life_attempts.max(1.0);
        let mut weighted_success = 0.0;
        let mut total_weight = 0.0;

        for (rank, sample) in window.samples.iter().rev().enumerate() {
            let weight = 0.5_f64.powf(rank as f64 / half_life);
            total_weight += weight;
            if sample.success {
                weighted_success += weight;
            }
        }

        weighted_success / total_weight
    }

    fn trend(&self, previous: f64, current: f64) -> Trend {
        let delta = current - previous;
        if delta > self.config.trend_hysteresis {
            Trend::Improving
        } else if delta < -self.config.trend_hysteresis {
            Trend::Degrading
        } else {
            Trend::Stable
        }
    }

    /// Assign the single best-matching pattern for a failing run.
    ///
    /// Heuristics are ordered; the first match wins.
    #[must_use]
    pub fn classify(&self, run: &[&AttemptSample], failing_sources: usize) -> FailurePattern {
        if run.is_empty() {
            return FailurePattern::Unknown;
        }

        if run.iter().any(|s| self.is_rate_limited(s)) {
            return FailurePattern::RateLimited;
        }

        if run.iter().all(|s| self.is_timeout(s)) {
            return FailurePattern::Timeout;
        }

        if run.iter().any(|s| self.is_schema_error(s)) {
            return FailurePattern::SchemaChanged;
        }

        if failing_sources >= self.config.systemic_min_sources {
            return FailurePattern::SystematicOutage;
        }

        // A run no longer than the classification floor with no clearer
        // signal reads as a blip rather than an established pattern.
        if run.len() <= self.config.min_classify_failures as usize {
            FailurePattern::Transient
        } else {
            FailurePattern::Unknown
        }
    }

    fn is_rate_limited(&self, sample: &AttemptSample) -> bool {
        matches!(
            sample.error_kind,
            Some(ErrorKind::RateLimited | ErrorKind::Http(429))
        ) || self.rate_limit_re.is_match(&sample.error_detail)
    }

    fn is_timeout(&self, sample: &AttemptSample) -> bool {
        matches!(sample.error_kind, Some(ErrorKind::Timeout))
            || sample.latency_ms >= self.config.timeout_threshold_ms
    }

    fn is_schema_error(&self, sample: &AttemptSample) -> bool {
        matches!(sample.error_kind, Some(ErrorKind::Parse))
            || self.schema_re.is_match(&sample.error_detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> ConfidenceAnalyzer {
        ConfidenceAnalyzer::new(AnalyzerConfig::default())
    }

    fn attempt(source: &str, success: bool) -> CollectionAttempt {
        let now = Utc::now();
        CollectionAttempt {
            source_id: source.to_string(),
            started_at: now,
            finished_at: now,
            success,
            records_returned: u64::from(success) * 10,
            error_kind: if success { None } else { Some(ErrorKind::Other) },
            error_detail: if success {
                String::new()
            } else {
                "boom".to_string()
            },
            latency_ms: 120,
        }
    }

    fn attempt_with(
        source: &str,
        kind: ErrorKind,
        detail: &str,
        latency_ms: u64,
    ) -> CollectionAttempt {
        CollectionAttempt {
            error_kind: Some(kind),
            error_detail: detail.to_string(),
            latency_ms,
            ..attempt(source, false)
        }
    }

    #[test]
    fn test_confidence_empty_window_is_optimistic() {
        let a = analyzer();
        assert!((a.confidence(&AttemptWindow::new()) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_confidence_non_increasing_across_failure_run() {
        let a = analyzer();
        let mut window = AttemptWindow::new();
        let mut health = HealthScore::new("s1", Utc::now());

        // Seed with successes so there is room to fall
        for _ in 0..5 {
            a.record(&mut window, &mut health, &attempt("s1", true), 0);
        }

        let mut last = health.confidence;
        for _ in 0..25 {
            a.record(&mut window, &mut health, &attempt("s1", false), 0);
            assert!(
                health.confidence <= last + f64::EPSILON,
                "confidence rose during a failure run: {last} -> {}",
                health.confidence
            );
            last = health.confidence;
        }
        assert_eq!(health.consecutive_failures, 25);
    }

    #[test]
    fn test_success_resets_upward_immediately() {
        let a = analyzer();
        let mut window = AttemptWindow::new();
        let mut health = HealthScore::new("s1", Utc::now());

        for _ in 0..4 {
            a.record(&mut window, &mut health, &attempt("s1", false), 0);
        }
        let low = health.confidence;

        a.record(&mut window, &mut health, &attempt("s1", true), 0);
        assert!(health.confidence > low);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.consecutive_successes, 1);
        assert!(health.pattern.is_none());
    }

    #[test]
    fn test_recent_attempts_weigh_more() {
        let a = analyzer();

        // Failure followed by successes vs successes followed by failure
        let mut old_failure = AttemptWindow::new();
        let mut new_failure = AttemptWindow::new();
        let mut h1 = HealthScore::new("s1", Utc::now());
        let mut h2 = HealthScore::new("s2", Utc::now());

        a.record(&mut old_failure, &mut h1, &attempt("s1", false), 0);
        for _ in 0..3 {
            a.record(&mut old_failure, &mut h1, &attempt("s1", true), 0);
        }

        for _ in 0..3 {
            a.record(&mut new_failure, &mut h2, &attempt("s2", true), 0);
        }
        a.record(&mut new_failure, &mut h2, &attempt("s2", false), 0);

        assert!(h1.confidence > h2.confidence);
    }

    #[test]
    fn test_window_bounded_by_attempt_count() {
        let a = analyzer();
        let mut window = AttemptWindow::new();
        let mut health = HealthScore::new("s1", Utc::now());

        for _ in 0..50 {
            a.record(&mut window, &mut health, &attempt("s1", true), 0);
        }
        assert_eq!(window.samples().len(), 20);
    }

    #[test]
    fn test_detail_truncation_is_char_safe() {
        let a = analyzer();
        let mut window = AttemptWindow::new();
        let mut health = HealthScore::new("s1", Utc::now());

        let detail = "ü".repeat(DETAIL_MAX_LEN + 50);
        a.record(
            &mut window,
            &mut health,
            &attempt_with("s1", ErrorKind::Other, &detail, 100),
            0,
        );

        let kept = &window.samples().back().unwrap().error_detail;
        assert_eq!(kept.chars().count(), DETAIL_MAX_LEN);
    }

    #[test]
    fn test_no_classification_below_floor() {
        let a = analyzer();
        let mut window = AttemptWindow::new();
        let mut health = HealthScore::new("s1", Utc::now());

        let classified = a.record(&mut window, &mut health, &attempt("s1", false), 0);
        assert!(classified.is_none());
        assert!(health.pattern.is_none());
    }

    #[test]
    fn test_classify_rate_limited() {
        let a = analyzer();
        let mut window = AttemptWindow::new();
        let mut health = HealthScore::new("s1", Utc::now());

        a.record(
            &mut window,
            &mut health,
            &attempt_with("s1", ErrorKind::Http(500), "server error", 100),
            0,
        );
        let classified = a.record(
            &mut window,
            &mut health,
            &attempt_with("s1", ErrorKind::Http(429), "Too Many Requests", 100),
            0,
        );
        assert_eq!(classified, Some(FailurePattern::RateLimited));
    }

    #[test]
    fn test_classify_timeout_requires_all_failures_slow() {
        let a = analyzer();
        let mut window = AttemptWindow::new();
        let mut health = HealthScore::new("s1", Utc::now());

        for _ in 0..3 {
            a.record(
                &mut window,
                &mut health,
                &attempt_with("s1", ErrorKind::Timeout, "deadline exceeded", 5000),
                0,
            );
        }
        assert_eq!(health.pattern, Some(FailurePattern::Timeout));

        // One fast failure in the run breaks the timeout reading
        let classified = a.record(
            &mut window,
            &mut health,
            &attempt_with("s1", ErrorKind::Other, "connection reset", 50),
            0,
        );
        assert_ne!(classified, Some(FailurePattern::Timeout));
    }

    #[test]
    fn test_classify_schema_changed() {
        let a = analyzer();
        let mut window = AttemptWindow::new();
        let mut health = HealthScore::new("s1", Utc::now());

        for _ in 0..2 {
            a.record(
                &mut window,
                &mut health,
                &attempt_with("s1", ErrorKind::Parse, "missing field `station_id`", 90),
                0,
            );
        }
        assert_eq!(health.pattern, Some(FailurePattern::SchemaChanged));
    }

    #[test]
    fn test_classify_systematic_outage() {
        let a = analyzer();
        let run = [
            attempt_with("s1", ErrorKind::Network, "connection refused", 100),
            attempt_with("s1", ErrorKind::Network, "connection refused", 100),
            attempt_with("s1", ErrorKind::Network, "connection refused", 100),
        ];
        let samples: Vec<AttemptSample> = run.iter().map(AttemptSample::from_attempt).collect();
        let refs: Vec<&AttemptSample> = samples.iter().collect();

        assert_eq!(a.classify(&refs, 4), FailurePattern::SystematicOutage);
        assert_eq!(a.classify(&refs, 1), FailurePattern::Unknown);
    }

    #[test]
    fn test_classify_short_unexplained_run_is_transient() {
        let a = analyzer();
        let run = [
            attempt_with("s1", ErrorKind::Other, "eof", 100),
            attempt_with("s1", ErrorKind::Other, "eof", 100),
        ];
        let samples: Vec<AttemptSample> = run.iter().map(AttemptSample::from_attempt).collect();
        let refs: Vec<&AttemptSample> = samples.iter().collect();

        assert_eq!(a.classify(&refs, 0), FailurePattern::Transient);
    }

    #[test]
    fn test_rebuild_replays_history() {
        let a = analyzer();
        let mut window = AttemptWindow::new();
        let mut health = HealthScore::new("s1", Utc::now());

        let history = vec![
            attempt("s1", true),
            attempt("s1", true),
            attempt("s1", false),
            attempt("s1", false),
        ];
        a.rebuild(&mut window, &mut health, &history);

        assert_eq!(health.consecutive_failures, 2);
        assert!(health.confidence < 1.0);
        assert_eq!(window.samples().len(), 4);
    }
}
