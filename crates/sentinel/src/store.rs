//! Best-effort persistence: a JSON snapshot of per-source state plus
//! append-only JSONL logs for attempts, alert transitions, and break-glass
//! audits.
//!
//! All writes happen off the hot path; `allow()` and `report_attempt()`
//! never wait on the filesystem. The attempts log is bounded by retention
//! and is sufficient to rebuild health scores after a restart.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::alerts::AlertTransition;
use crate::config::StoreConfig;
use crate::types::{AuditEntry, CircuitBreakerState, CollectionAttempt, HealthScore};

const SNAPSHOT_FILE: &str = "snapshot.json";
const ATTEMPTS_FILE: &str = "attempts.jsonl";
const ALERTS_FILE: &str = "alerts.jsonl";
const AUDIT_FILE: &str = "audit.jsonl";

/// One persisted row per source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRow {
    pub health: HealthScore,
    pub breaker: CircuitBreakerState,
}

/// Filesystem-backed store rooted at a data directory.
pub struct Store {
    data_dir: PathBuf,
    retention: Duration,
    /// Serializes snapshot read-modify-write cycles; upserts arrive from
    /// concurrently spawned persistence tasks
    snapshot_lock: tokio::sync::Mutex<()>,
}

impl Store {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let data_dir = PathBuf::from(&config.data_dir);
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;
        Ok(Self {
            data_dir,
            retention: Duration::days(config.attempt_retention_days),
            snapshot_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn path(&self, file: &str) -> PathBuf {
        self.data_dir.join(file)
    }

    /// Upsert the snapshot row for one source.
    ///
    /// The whole snapshot is rewritten atomically (temp file + rename); the
    /// per-source row count is small, one row per source.
    pub async fn upsert_source(&self, row: SourceRow) -> Result<()> {
        let _guard = self.snapshot_lock.lock().await;
        let mut rows = self.load_snapshot().await.unwrap_or_default();
        rows.retain(|r| r.health.source_id != row.health.source_id);
        rows.push(row);
        self.write_snapshot(&rows).await
    }

    async fn write_snapshot(&self, rows: &[SourceRow]) -> Result<()> {
        let path = self.path(SNAPSHOT_FILE);
        let tmp = self.path(&format!("{SNAPSHOT_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(rows).context("Failed to serialize snapshot")?;
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Load all persisted source rows; empty when no snapshot exists yet.
    pub async fn load_snapshot(&self) -> Result<Vec<SourceRow>> {
        let path = self.path(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&raw).context("Failed to parse snapshot")
    }

    pub async fn append_attempt(&self, attempt: &CollectionAttempt) -> Result<()> {
        self.append_line(ATTEMPTS_FILE, attempt).await
    }

    pub async fn append_alert(&self, transition: &AlertTransition) -> Result<()> {
        self.append_line(ALERTS_FILE, transition).await
    }

    pub async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.append_line(AUDIT_FILE, entry).await
    }

    async fn append_line<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let path = self.path(file);
        let mut line = serde_json::to_vec(value).context("Failed to serialize log entry")?;
        line.push(b'\n');

        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        handle
            .write_all(&line)
            .await
            .with_context(|| format!("Failed to append to {}", path.display()))?;
        Ok(())
    }

    /// Bounded historical read of one source's attempts.
    pub async fn read_attempts(
        &self,
        source_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CollectionAttempt>> {
        let path = self.path(ATTEMPTS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let mut attempts = Vec::new();
        for line in raw.lines() {
            match serde_json::from_str::<CollectionAttempt>(line) {
                Ok(attempt) => {
                    if attempt.source_id == source_id && attempt.finished_at >= since {
                        attempts.push(attempt);
                    }
                }
                Err(e) => warn!(error = %e, "Skipping unreadable attempt log line"),
            }
        }
        Ok(attempts)
    }

    /// Attempts for every source within the retention window, oldest first;
    /// used to rebuild health scores at startup.
    pub async fn recent_attempts(&self, now: DateTime<Utc>) -> Result<Vec<CollectionAttempt>> {
        let path = self.path(ATTEMPTS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let horizon = now - self.retention;
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let mut attempts: Vec<CollectionAttempt> = raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .filter(|a: &CollectionAttempt| a.finished_at >= horizon)
            .collect();
        attempts.sort_by_key(|a| a.finished_at);
        Ok(attempts)
    }

    /// Rewrite the attempts log dropping entries past retention.
    pub async fn compact_attempts(&self, now: DateTime<Utc>) -> Result<()> {
        let path = self.path(ATTEMPTS_FILE);
        if !path.exists() {
            return Ok(());
        }

        let horizon = now - self.retention;
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let mut kept = 0_usize;
        let mut dropped = 0_usize;
        let mut out = String::with_capacity(raw.len());
        for line in raw.lines() {
            match serde_json::from_str::<CollectionAttempt>(line) {
                Ok(attempt) if attempt.finished_at < horizon => dropped += 1,
                Ok(_) => {
                    out.push_str(line);
                    out.push('\n');
                    kept += 1;
                }
                // Unreadable lines are dropped on compaction
                Err(_) => dropped += 1,
            }
        }

        if dropped == 0 {
            return Ok(());
        }

        let tmp = self.path(&format!("{ATTEMPTS_FILE}.tmp"));
        tokio::fs::write(&tmp, out)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        debug!(kept, dropped, "Compacted attempts log");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CircuitState, Trend};
    use uuid::Uuid;

    fn test_store() -> Store {
        let dir = std::env::temp_dir().join(format!("sentinel-store-{}", Uuid::new_v4()));
        Store::new(&StoreConfig {
            data_dir: dir.to_string_lossy().into_owned(),
            attempt_retention_days: 7,
        })
        .unwrap()
    }

    fn row(source_id: &str, confidence: f64) -> SourceRow {
        let now = Utc::now();
        SourceRow {
            health: HealthScore {
                source_id: source_id.to_string(),
                confidence,
                consecutive_failures: 0,
                consecutive_successes: 3,
                last_updated: now,
                trend: Trend::Stable,
                pattern: None,
            },
            breaker: CircuitBreakerState {
                source_id: source_id.to_string(),
                state: CircuitState::Closed,
                opened_at: None,
                next_probe_at: None,
                failure_count: 0,
                active_strategy: None,
            },
        }
    }

    fn attempt(source_id: &str, finished_at: DateTime<Utc>) -> CollectionAttempt {
        CollectionAttempt {
            source_id: source_id.to_string(),
            started_at: finished_at,
            finished_at,
            success: true,
            records_returned: 5,
            error_kind: None,
            error_detail: String::new(),
            latency_ms: 80,
        }
    }

    #[tokio::test]
    async fn test_snapshot_upsert_roundtrip() {
        let store = test_store();

        store.upsert_source(row("s1", 0.9)).await.unwrap();
        store.upsert_source(row("s2", 0.5)).await.unwrap();
        // Upserting again replaces rather than duplicates
        store.upsert_source(row("s1", 0.4)).await.unwrap();

        let rows = store.load_snapshot().await.unwrap();
        assert_eq!(rows.len(), 2);
        let s1 = rows.iter().find(|r| r.health.source_id == "s1").unwrap();
        assert!((s1.health.confidence - 0.4).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_attempts_filtered_by_source_and_since() {
        let store = test_store();
        let now = Utc::now();

        store
            .append_attempt(&attempt("s1", now - Duration::hours(2)))
            .await
            .unwrap();
        store
            .append_attempt(&attempt("s1", now - Duration::minutes(5)))
            .await
            .unwrap();
        store.append_attempt(&attempt("s2", now)).await.unwrap();

        let recent = store
            .read_attempts("s1", now - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].source_id, "s1");
    }

    #[tokio::test]
    async fn test_compaction_drops_expired_attempts() {
        let store = test_store();
        let now = Utc::now();

        store
            .append_attempt(&attempt("s1", now - Duration::days(10)))
            .await
            .unwrap();
        store.append_attempt(&attempt("s1", now)).await.unwrap();

        store.compact_attempts(now).await.unwrap();

        let all = store
            .read_attempts("s1", now - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_feed_is_ordered() {
        let store = test_store();
        let now = Utc::now();

        store.append_attempt(&attempt("s1", now)).await.unwrap();
        store
            .append_attempt(&attempt("s2", now - Duration::minutes(30)))
            .await
            .unwrap();

        let feed = store.recent_attempts(now).await.unwrap();
        assert_eq!(feed.len(), 2);
        assert!(feed[0].finished_at <= feed[1].finished_at);
    }
}
