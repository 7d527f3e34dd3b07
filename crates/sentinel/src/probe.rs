//! Connection probes for manual tests and recovery plans.

use chrono::Utc;
use std::time::Duration;
use tracing::debug;

/// Result of probing a source endpoint.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    /// The endpoint answered with a non-server-error status
    Success { latency_ms: u64 },
    /// The endpoint failed or answered 5xx
    Failed { latency_ms: u64, reason: String },
    /// The source has no probe URL configured
    NotConfigured,
}

impl ProbeOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Lightweight HTTP prober shared by the engine.
pub struct ProbeRunner {
    client: reqwest::Client,
}

impl ProbeRunner {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Probe a source's configured endpoint.
    ///
    /// Rate-limit responses count as success: the upstream is alive, it is
    /// just refusing this particular request.
    pub async fn probe(&self, source_id: &str, probe_url: Option<&str>) -> ProbeOutcome {
        let Some(url) = probe_url else {
            return ProbeOutcome::NotConfigured;
        };

        let started = Utc::now();
        let result = self.client.get(url).send().await;
        let latency_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;

        match result {
            Ok(response) if !response.status().is_server_error() => {
                debug!(source_id = %source_id, status = %response.status(), latency_ms, "Probe succeeded");
                ProbeOutcome::Success { latency_ms }
            }
            Ok(response) => ProbeOutcome::Failed {
                latency_ms,
                reason: format!("probe returned {}", response.status()),
            },
            Err(e) => ProbeOutcome::Failed {
                latency_ms,
                reason: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_probe() {
        let runner = ProbeRunner::new(Duration::from_secs(1));
        let outcome = runner.probe("s1", None).await;
        assert!(matches!(outcome, ProbeOutcome::NotConfigured));
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        let runner = ProbeRunner::new(Duration::from_millis(300));
        // Reserved TEST-NET address, nothing listens there
        let outcome = runner.probe("s1", Some("http://192.0.2.1:9/")).await;
        assert!(matches!(outcome, ProbeOutcome::Failed { .. }));
    }
}
