//! Subsystem error type exposed at the API seam.
//!
//! Internals use `anyhow` with context; only this enum crosses the HTTP and
//! library boundaries, so callers never see raw internal errors.

use thiserror::Error;

/// Errors surfaced by the sentinel API.
#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("persistence failure: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, SentinelError>;
