//! Collection health sentinel.
//!
//! Ingests periodic results from many independent, unreliable external
//! data-collection jobs, distinguishes transient noise from real outages,
//! recovers automatically where possible, and raises targeted,
//! de-duplicated alerts otherwise.
//!
//! Data flows one direction: collectors report attempts, the confidence
//! analyzer scores them, the per-source circuit breaker gates further
//! attempts, the alert manager watches the whole fleet, and the recovery
//! orchestrator drives plans whose outcomes feed back into the scores.

pub mod alerts;
pub mod breaker;
pub mod confidence;
pub mod config;
pub mod engine;
pub mod error;
pub mod probe;
pub mod recovery;
pub mod server;
pub mod store;
pub mod types;

pub use config::SentinelConfig;
pub use engine::Sentinel;
pub use error::SentinelError;
