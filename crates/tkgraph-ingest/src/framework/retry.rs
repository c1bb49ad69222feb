//! Bounded retry with exponential backoff for remote calls
//!
//! Every attempt runs under a time budget of `connect_timeout + read_timeout`.
//! Only errors that classify themselves as transient are retried; the wait
//! before retry `n` (0-indexed) is `backoff_factor * 2^n`, so a call that
//! always fails is attempted exactly `max_retries + 1` times.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tkgraph_common::env::env_or;
use tracing::{debug, warn};

use crate::error::{IngestError, Result};

/// Classification hook for errors passed through [`RetryPolicy::run`]
pub trait Transient: Sized {
    /// Whether repeating the same call unchanged may succeed
    fn is_transient(&self) -> bool;

    /// Error to report when an attempt exceeds its time budget
    fn timed_out(after: Duration) -> Self;
}

/// Timeouts, retry bound and backoff applied to each remote call
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_retries: u32,
    /// Seconds; first retry waits this long, each later one twice the previous
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(300),
            max_retries: 3,
            backoff_factor: 0.5,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        connect_timeout: Duration,
        read_timeout: Duration,
        max_retries: u32,
        backoff_factor: f64,
    ) -> Self {
        Self {
            connect_timeout,
            read_timeout,
            max_retries,
            backoff_factor,
        }
    }

    /// Policy that never waits or retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            backoff_factor: 0.0,
            ..Self::default()
        }
    }

    /// Load from `TKAPI_CONNECT_TIMEOUT`, `TKAPI_READ_TIMEOUT`,
    /// `TKAPI_MAX_RETRIES` and `TKAPI_BACKOFF_FACTOR`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let connect: f64 = env_or(
            "TKAPI_CONNECT_TIMEOUT",
            defaults.connect_timeout.as_secs_f64(),
        )?;
        let read: f64 = env_or("TKAPI_READ_TIMEOUT", defaults.read_timeout.as_secs_f64())?;
        let max_retries: u32 = env_or("TKAPI_MAX_RETRIES", defaults.max_retries)?;
        let backoff_factor: f64 = env_or("TKAPI_BACKOFF_FACTOR", defaults.backoff_factor)?;

        let policy = Self {
            connect_timeout: seconds("TKAPI_CONNECT_TIMEOUT", connect)?,
            read_timeout: seconds("TKAPI_READ_TIMEOUT", read)?,
            max_retries,
            backoff_factor,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Wait before retry `attempt` (0-indexed)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        Duration::try_from_secs_f64(self.backoff_factor * 2f64.powi(exponent))
            .unwrap_or(Duration::MAX)
    }

    /// Total attempts a permanently failing call receives
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Time budget for a single attempt
    pub fn attempt_timeout(&self) -> Duration {
        self.connect_timeout.saturating_add(self.read_timeout)
    }

    /// HTTP client carrying this policy's timeouts
    pub fn http_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.attempt_timeout())
            .user_agent(concat!("tkgraph-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
    }

    /// Await one attempt under the per-attempt time budget
    pub async fn attempt<T, E, Fut>(&self, attempt: Fut) -> std::result::Result<T, E>
    where
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Transient,
    {
        let budget = self.attempt_timeout();
        match tokio::time::timeout(budget, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => Err(E::timed_out(budget)),
        }
    }

    /// Decide on failed attempt `attempt` (0-indexed).
    ///
    /// Returns `true` after sleeping out the backoff when `error` is
    /// transient and retries remain, `false` when the caller should give up.
    pub async fn retry_after<E>(&self, operation: &str, attempt: u32, error: &E) -> bool
    where
        E: Transient + Display,
    {
        if !error.is_transient() {
            return false;
        }
        if attempt >= self.max_retries {
            warn!(
                operation,
                attempts = attempt + 1,
                error = %error,
                "Retries exhausted"
            );
            return false;
        }

        let wait = self.backoff(attempt);
        warn!(
            operation,
            attempt = attempt + 1,
            max_attempts = self.max_attempts(),
            wait_secs = wait.as_secs_f64(),
            error = %error,
            "Transient failure, retrying"
        );
        tokio::time::sleep(wait).await;
        true
    }

    /// Run `op` until it succeeds, fails permanently or exhausts retries.
    ///
    /// `op` receives the 0-indexed attempt number. The last error is returned
    /// unchanged so callers can still tell transient from permanent failures.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> std::result::Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Transient + Display,
    {
        let mut attempt = 0u32;
        loop {
            match self.attempt(op(attempt)).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if !self.retry_after(operation, attempt, &e).await {
                        return Err(e);
                    }
                    attempt += 1;
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 0.0 {
            return Err(IngestError::config(format!(
                "backoff_factor must be a non-negative number, got {}",
                self.backoff_factor
            )));
        }
        if self.connect_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err(IngestError::config("timeouts must be greater than zero"));
        }
        Ok(())
    }
}

fn seconds(key: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        IngestError::config(format!(
            "{key} must be a non-negative number of seconds, got {value}"
        ))
    })
}
