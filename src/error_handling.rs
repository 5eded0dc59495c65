use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per step, the first included.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `retry`-th throttled response (0-based): base, 2·base, 4·base, ...
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX))
    }
}

/// Failure taxonomy. Throttling only shows up as `RetryExhaustion` once the ceiling is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ProtocolRejection,
    TransportFault,
    RetryExhaustion,
    Aborted,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::ProtocolRejection => write!(f, "protocol-rejection"),
            FailureKind::TransportFault => write!(f, "transport-fault"),
            FailureKind::RetryExhaustion => write!(f, "retry-exhaustion"),
            FailureKind::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("HTTP {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("Invalid response body: {0}")]
    Decode(String),
    #[error("Payload encoding failed: {0}")]
    Encode(String),
    #[error("Max retries exceeded (429)")]
    RetryExhausted,
    #[error("Aborted")]
    Cancelled,
}

impl StepError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StepError::RetryExhausted => FailureKind::RetryExhaustion,
            StepError::Cancelled => FailureKind::Aborted,
            StepError::Transport(_)
            | StepError::UnexpectedStatus { .. }
            | StepError::Decode(_)
            | StepError::Encode(_) => FailureKind::TransportFault,
        }
    }

    /// Keeps the first 50 characters of a response body, like the error table expects.
    pub fn unexpected_status(status: u16, body: &str) -> Self {
        StepError::UnexpectedStatus { status, body: body.chars().take(50).collect() }
    }
}

/// Run-level failures that halt everything.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Run aborted by operator")]
    Aborted,
    #[error("Target unreachable at {url}: {source}")]
    TargetUnreachable { url: String, source: TransportError },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let p = RetryPolicy { max_attempts: 5, base_delay: Duration::from_millis(250) };
        let delays: Vec<_> = (0..4).map(|r| p.delay_for(r).as_millis()).collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000]);
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(200), Duration::from_secs(2).saturating_mul(u32::MAX));
    }

    #[test]
    fn unexpected_status_truncates_body() {
        let e = StepError::unexpected_status(502, &"x".repeat(80));
        assert_eq!(e.to_string(), format!("HTTP 502: {}", "x".repeat(50)));
        assert_eq!(e.kind(), FailureKind::TransportFault);
    }

    #[test]
    fn exhaustion_is_reported_distinctly() {
        assert_eq!(StepError::RetryExhausted.kind(), FailureKind::RetryExhaustion);
        let t = StepError::from(TransportError("connection refused".into()));
        assert_eq!(t.to_string(), "connection refused");
        assert_ne!(t.kind(), StepError::RetryExhausted.kind());
    }
}
