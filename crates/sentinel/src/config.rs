//! Configuration for the sentinel subsystem.
//!
//! All thresholds live here with serde-able defaults so a deployment can
//! override any subset from a JSON file (`sentinel-config.json` by
//! convention) without restating the rest.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    pub analyzer: AnalyzerConfig,
    pub breaker: BreakerConfig,
    pub alerts: AlertConfig,
    pub recovery: RecoveryConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
    /// Per-source settings keyed by source id; sources not listed here get
    /// [`SourceConfig::default`]
    pub sources: HashMap<String, SourceConfig>,
}

impl SentinelConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Load from a file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Settings for one source, defaulted when unlisted.
    #[must_use]
    pub fn source(&self, source_id: &str) -> SourceConfig {
        self.sources.get(source_id).cloned().unwrap_or_default()
    }
}

/// Confidence analyzer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Sliding window cap by attempt count
    pub window_attempts: usize,
    /// Sliding window cap by age (hours); the smaller window wins
    pub window_hours: i64,
    /// Exponential-decay half-life, in attempts
    pub half_life_attempts: f64,
    /// Consecutive failures before classification runs
    pub min_classify_failures: u32,
    /// Latency above this counts as a timeout signal (ms)
    pub timeout_threshold_ms: u64,
    /// Distinct failing sources in the same window that indicate a shared
    /// upstream outage rather than independent failures
    pub systemic_min_sources: usize,
    /// Window for counting failures across unrelated sources (seconds)
    pub systemic_window_secs: u64,
    /// Confidence delta below which the trend reads as stable
    pub trend_hysteresis: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            window_attempts: 20,
            window_hours: 24,
            half_life_attempts: 6.0,
            min_classify_failures: 2,
            timeout_threshold_ms: 3000,
            systemic_min_sources: 3,
            systemic_window_secs: 900,
            trend_hysteresis: 0.05,
        }
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// Base backoff (seconds)
    pub backoff_base_secs: u64,
    /// Backoff ceiling (seconds)
    pub backoff_ceiling_secs: u64,
    /// Jitter applied to each backoff, as a fraction of the raw value
    pub jitter_fraction: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            backoff_base_secs: 30,
            backoff_ceiling_secs: 1800,
            jitter_fraction: 0.2,
        }
    }
}

/// Alert manager tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Multiples of a source's expected interval before a gap warns
    pub gap_multiplier: f64,
    /// Multiples of the expected interval before a gap goes critical
    pub gap_critical_multiplier: f64,
    /// Fraction of sources open/degraded that reads as a cascade
    pub cascade_fraction: f64,
    /// Cascade detection needs at least this many known sources
    pub cascade_min_sources: usize,
    /// Consecutive successful-but-empty attempts before records read as dead
    pub dead_record_attempts: usize,
    /// Scheduler tick for `evaluate()` (seconds)
    pub evaluate_interval_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            gap_multiplier: 2.0,
            gap_critical_multiplier: 4.0,
            cascade_fraction: 0.3,
            cascade_min_sources: 3,
            dead_record_attempts: 5,
            evaluate_interval_secs: 60,
        }
    }
}

/// Recovery orchestrator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Plan executions before unconditional escalation
    pub max_attempts: u32,
    /// Bounded timeout per plan step (seconds)
    pub step_timeout_secs: u64,
    /// Consecutive timeout-classified opens before a collector restart
    pub restart_after_timeout_opens: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            step_timeout_secs: 30,
            restart_after_timeout_opens: 3,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory for the snapshot and append logs
    pub data_dir: String,
    /// Days of collection attempts to retain
    pub attempt_retention_days: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            attempt_retention_days: 7,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the HTTP interface
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8710".to_string(),
        }
    }
}

/// Per-source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Expected collection cadence (seconds); drives gap detection
    pub expected_interval_secs: u64,
    /// Fallback source engaged by the fallback recovery strategy
    pub fallback: Option<String>,
    /// URL probed by connection tests and recovery probes
    pub probe_url: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            expected_interval_secs: 300,
            fallback: None,
            probe_url: None,
        }
    }
}
