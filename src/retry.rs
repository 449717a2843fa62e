//! Bounded retry for model calls.
//!
//! Only [`CallError::Transient`] failures are retried (HTTP 429, 5xx,
//! network errors). A [`CallError::Fatal`] failure returns immediately.
//!
//! Backoff:
//! - `fixed`: the same delay before every retry.
//! - `exponential`: `delay × 2^(attempt-1)`, with the exponent capped at 5.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a failed model call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Worth retrying: rate limits, server errors, dropped connections.
    #[error("transient: {0}")]
    Transient(String),
    /// Retrying would give the same answer: bad request, auth, malformed response.
    #[error("{0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (1-based; the first retry is 2).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => self.delay * (1u32 << (attempt - 2).min(5)),
        }
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub fn run<T>(&self, mut op: impl FnMut(u32) -> Result<T, CallError>) -> Result<T, CallError> {
        let attempts = self.max_attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            let delay = self.delay_before(attempt);
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }

            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(CallError::Fatal(msg)) => return Err(CallError::Fatal(msg)),
                Err(err) => {
                    tracing::warn!(attempt, max_attempts = attempts, error = %err, "model call failed");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| CallError::Fatal("no attempts made".to_string())))
    }
}
