//! Sentinel CLI
//!
//! Runs the collection health monitor (`serve`) and provides operator
//! commands against a running instance: health status, active alerts,
//! breaker states, manual connection tests, break-glass resets, and
//! historical queries.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use sentinel::config::SentinelConfig;
use sentinel::engine::Sentinel;
use sentinel::server;
use sentinel::types::{
    Alert, AllowDecision, CircuitBreakerState, CircuitState, CollectionAttempt, HealthScore,
    RecoveryPlan, Trend,
};

/// Collection health monitor - scores source confidence, trips circuit breakers, and orchestrates recovery
#[derive(Parser)]
#[command(name = "sentinel")]
#[command(about = "Collection health monitor - scores source confidence, trips circuit breakers, and orchestrates recovery")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (json or text)
    #[arg(long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Base URL of a running sentinel (for client commands)
    #[arg(long, default_value = "http://127.0.0.1:8710", global = true)]
    server: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    Json,
    #[default]
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sentinel server
    Serve {
        /// Path to the JSON config file
        #[arg(long, default_value = "sentinel-config.json")]
        config: String,

        /// Bind address (overrides config)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Current confidence and trend per source
    Status {
        /// Limit to one source
        #[arg(long)]
        source: Option<String>,
    },
    /// Active alerts
    Alerts {
        /// Minimum severity (info, warning, critical)
        #[arg(long)]
        severity: Option<String>,
    },
    /// Circuit breaker states
    Breakers,
    /// Recovery plans, live and recently finished
    Plans,
    /// Manual connection test for a source (respects the breaker)
    Test {
        /// Source to test
        source: String,
    },
    /// Break-glass: force a source's breaker closed
    Reset {
        /// Source to reset
        source: String,

        /// Operator identity for the audit log
        #[arg(long)]
        actor: String,
    },
    /// Recent collection attempts for a source
    History {
        /// Source to inspect
        source: String,

        /// Hours of history to fetch
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "sentinel=debug,info" } else { "sentinel=info,warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Commands::Serve { config, bind } => run_server(&config, bind).await,
        Commands::Status { source } => {
            let url = match &source {
                Some(id) => format!("{}/api/health?source_id={id}", cli.server),
                None => format!("{}/api/health", cli.server),
            };
            let scores: Vec<HealthScore> = get_json(&url).await?;
            match cli.format {
                OutputFormat::Json => print_json(&scores)?,
                OutputFormat::Text => render_status(&scores),
            }
            Ok(())
        }
        Commands::Alerts { severity } => {
            let url = match &severity {
                Some(s) => format!("{}/api/alerts?severity={s}", cli.server),
                None => format!("{}/api/alerts", cli.server),
            };
            let alerts: Vec<Alert> = get_json(&url).await?;
            match cli.format {
                OutputFormat::Json => print_json(&alerts)?,
                OutputFormat::Text => render_alerts(&alerts),
            }
            Ok(())
        }
        Commands::Breakers => {
            let states: Vec<CircuitBreakerState> =
                get_json(&format!("{}/api/breakers", cli.server)).await?;
            match cli.format {
                OutputFormat::Json => print_json(&states)?,
                OutputFormat::Text => render_breakers(&states),
            }
            Ok(())
        }
        Commands::Plans => {
            let plans: Vec<RecoveryPlan> = get_json(&format!("{}/api/plans", cli.server)).await?;
            match cli.format {
                OutputFormat::Json => print_json(&plans)?,
                OutputFormat::Text => render_plans(&plans),
            }
            Ok(())
        }
        Commands::Test { source } => {
            let decision: AllowDecision =
                post_json(&format!("{}/api/sources/{source}/test", cli.server), &()).await?;
            match cli.format {
                OutputFormat::Json => print_json(&decision)?,
                OutputFormat::Text => {
                    let verdict = if decision.allowed {
                        "ALLOWED".green().bold()
                    } else {
                        "DENIED".red().bold()
                    };
                    println!("{source}: {verdict} ({})", decision.reason.message());
                }
            }
            Ok(())
        }
        Commands::Reset { source, actor } => {
            let state: CircuitBreakerState = post_json(
                &format!("{}/api/sources/{source}/reset", cli.server),
                &serde_json::json!({ "actor": actor }),
            )
            .await?;
            match cli.format {
                OutputFormat::Json => print_json(&state)?,
                OutputFormat::Text => {
                    println!(
                        "{} breaker reset to {} by {actor}",
                        source,
                        render_state(state.state)
                    );
                }
            }
            Ok(())
        }
        Commands::History { source, hours } => {
            let since = (Utc::now() - Duration::hours(hours))
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
            let attempts: Vec<CollectionAttempt> = get_json(&format!(
                "{}/api/sources/{source}/history?since={since}",
                cli.server
            ))
            .await?;
            match cli.format {
                OutputFormat::Json => print_json(&attempts)?,
                OutputFormat::Text => render_history(&attempts),
            }
            Ok(())
        }
    }
}

async fn run_server(config_path: &str, bind: Option<String>) -> Result<()> {
    let config = SentinelConfig::load_or_default(config_path)?;
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());

    info!(config = %config_path, "Starting sentinel");
    let engine = Sentinel::new(config).await?;

    let scheduler = engine.clone();
    tokio::spawn(async move {
        scheduler.run_scheduler().await;
    });

    server::serve(engine, &bind).await
}

async fn get_json<T: serde::de::DeserializeOwned>(url: &str) -> Result<T> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("Failed to reach {url}"))?;
    parse_response(url, response).await
}

async fn post_json<B: serde::Serialize, T: serde::de::DeserializeOwned>(
    url: &str,
    body: &B,
) -> Result<T> {
    let response = reqwest::Client::new()
        .post(url)
        .json(body)
        .send()
        .await
        .with_context(|| format!("Failed to reach {url}"))?;
    parse_response(url, response).await
}

async fn parse_response<T: serde::de::DeserializeOwned>(
    url: &str,
    response: reqwest::Response,
) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("{url} returned {status}: {body}");
    }
    response
        .json()
        .await
        .with_context(|| format!("Failed to parse response from {url}"))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_status(scores: &[HealthScore]) {
    if scores.is_empty() {
        println!("No sources reported yet");
        return;
    }
    for score in scores {
        let confidence = format!("{:.2}", score.confidence);
        let confidence = if score.confidence >= 0.8 {
            confidence.green()
        } else if score.confidence >= 0.5 {
            confidence.yellow()
        } else {
            confidence.red()
        };
        let trend = match score.trend {
            Trend::Improving => "improving".green(),
            Trend::Stable => "stable".normal(),
            Trend::Degrading => "degrading".red(),
        };
        let pattern = score
            .pattern
            .map(|p| format!(" [{}]", p.as_str()))
            .unwrap_or_default();
        println!(
            "{:<24} confidence {confidence}  {trend}  failures {}{}",
            score.source_id.bold(),
            score.consecutive_failures,
            pattern.dimmed()
        );
    }
}

fn render_alerts(alerts: &[Alert]) {
    if alerts.is_empty() {
        println!("{}", "No active alerts".green());
        return;
    }
    for alert in alerts {
        let severity = match alert.severity {
            sentinel::types::Severity::Info => "INFO".normal(),
            sentinel::types::Severity::Warning => "WARNING".yellow().bold(),
            sentinel::types::Severity::Critical => "CRITICAL".red().bold(),
        };
        let auto = if alert.auto_recoverable {
            "auto-recoverable".dimmed()
        } else {
            "needs operator".red()
        };
        println!(
            "[{severity}] {} {} ({auto}, seen x{})",
            alert.kind.name().bold(),
            alert.message,
            alert.count
        );
    }
}

fn render_state(state: CircuitState) -> colored::ColoredString {
    match state {
        CircuitState::Closed => "CLOSED".green(),
        CircuitState::Open => "OPEN".red().bold(),
        CircuitState::HalfOpen => "HALF_OPEN".yellow(),
        CircuitState::Degraded => "DEGRADED".yellow().bold(),
    }
}

fn render_breakers(states: &[CircuitBreakerState]) {
    if states.is_empty() {
        println!("No sources reported yet");
        return;
    }
    for state in states {
        let probe = state
            .next_probe_at
            .map(|at| format!("  next probe {}", at.format("%H:%M:%S")))
            .unwrap_or_default();
        println!(
            "{:<24} {}  failures {}{}",
            state.source_id.bold(),
            render_state(state.state),
            state.failure_count,
            probe.dimmed()
        );
    }
}

fn render_plans(plans: &[RecoveryPlan]) {
    if plans.is_empty() {
        println!("No recovery plans");
        return;
    }
    for plan in plans {
        println!(
            "{:<24} {} ({}) attempt {}  status {:?}",
            plan.source_id.bold(),
            plan.strategy.as_str(),
            plan.pattern.as_str().dimmed(),
            plan.attempt_count,
            plan.status
        );
    }
}

fn render_history(attempts: &[CollectionAttempt]) {
    if attempts.is_empty() {
        println!("No attempts in range");
        return;
    }
    for attempt in attempts {
        let outcome = if attempt.success {
            "ok".green()
        } else {
            "fail".red()
        };
        let detail = if attempt.error_detail.is_empty() {
            String::new()
        } else {
            format!("  {}", attempt.error_detail)
        };
        println!(
            "{} {outcome:<4} {:>5}ms  {:>4} records{}",
            attempt.finished_at.format("%Y-%m-%d %H:%M:%S"),
            attempt.latency_ms,
            attempt.records_returned,
            detail.dimmed()
        );
    }
}
