//! Retry and error classification for destination submissions
//!
//! Provides exponential backoff and the mapping from raw RPC/revert messages to
//! the actuator's error classes.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Action, Actuator, ActuatorError, Receipt, TxHandle};
use crate::types::Chain;

/// Transaction retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Classifies errors for retry decisions
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    /// Temporary failure - should retry (RPC timeout, network issues)
    Transient,
    /// Nonce too low - another transaction from this signer landed first; refill and retry
    NonceTooLow,
    /// The destination already applied this hash
    AlreadyApplied,
    /// Business revert - never retried automatically
    Reverted,
    /// Unknown error - may retry with backoff
    Unknown,
}

/// Revert patterns the bridge contracts use for a hash they already applied
pub const DEFAULT_ALREADY_APPLIED_PATTERNS: &[&str] =
    &["already processed", "already finalized", "already applied"];

/// Classify an error for retry decisions
pub fn classify_error(error: &str, already_applied_patterns: &[String]) -> ErrorClass {
    let error_lower = error.to_lowercase();

    // Checked first: an "already processed" revert is also a revert
    if already_applied_patterns
        .iter()
        .any(|p| error_lower.contains(&p.to_lowercase()))
    {
        return ErrorClass::AlreadyApplied;
    }

    // Transient errors
    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
        || error_lower.contains("underpriced")
        || error_lower.contains("replacement transaction")
        || error_lower.contains("already known")
    {
        return ErrorClass::Transient;
    }

    // Nonce errors
    if error_lower.contains("nonce too low") || error_lower.contains("nonce too high") {
        return ErrorClass::NonceTooLow;
    }

    // Permanent errors
    if error_lower.contains("reverted")
        || error_lower.contains("execution reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("out of gas")
        || error_lower.contains("invalid parameters")
        || error_lower.contains("paused")
    {
        return ErrorClass::Reverted;
    }

    ErrorClass::Unknown
}

/// Maps raw error text onto [`ActuatorError`] with configurable patterns
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    already_applied_patterns: Vec<String>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(
            DEFAULT_ALREADY_APPLIED_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}

impl ErrorClassifier {
    pub fn new(already_applied_patterns: Vec<String>) -> Self {
        Self {
            already_applied_patterns,
        }
    }

    pub fn classify(&self, error: &str) -> ErrorClass {
        classify_error(error, &self.already_applied_patterns)
    }

    pub fn to_actuator_error(&self, error: &str) -> ActuatorError {
        match self.classify(error) {
            ErrorClass::AlreadyApplied => ActuatorError::AlreadyApplied,
            ErrorClass::Reverted => ActuatorError::Reverted(error.to_string()),
            ErrorClass::Transient | ErrorClass::NonceTooLow | ErrorClass::Unknown => {
                ActuatorError::Transient(error.to_string())
            }
        }
    }
}

/// Wraps an actuator with bounded backoff on transient failures.
///
/// Before re-sending after a transient submit error the destination is asked
/// whether the earlier attempt landed, so a lost response never turns into a
/// second call.
pub struct RetryingActuator<A> {
    inner: A,
    config: RetryConfig,
}

impl<A: Actuator> RetryingActuator<A> {
    pub fn new(inner: A, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    async fn backoff(&self, attempt: u32, op: &str, error: &ActuatorError) {
        let backoff = self.config.backoff_for_attempt(attempt);
        warn!(
            chain = %self.inner.chain(),
            attempt = attempt + 1,
            max = self.config.max_retries,
            ?backoff,
            error = %error,
            "{} failed, retrying after backoff",
            op
        );
        tokio::time::sleep(backoff).await;
    }
}

#[async_trait]
impl<A: Actuator> Actuator for RetryingActuator<A> {
    fn chain(&self) -> Chain {
        self.inner.chain()
    }

    async fn submit(&self, action: &Action) -> Result<TxHandle, ActuatorError> {
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                if let Ok(Some(receipt)) = self.inner.find_applied(action).await {
                    debug!(
                        transfer_hash = %action.transfer_hash(),
                        tx_hash = %receipt.tx_hash,
                        "Earlier attempt landed; not resubmitting"
                    );
                    return Ok(receipt.handle(self.inner.chain()));
                }
            }

            match self.inner.submit(action).await {
                Err(e) if e.is_transient() && self.config.should_retry(attempt) => {
                    self.backoff(attempt, "submit", &e).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn await_finality(&self, handle: &TxHandle) -> Result<Receipt, ActuatorError> {
        let mut attempt = 0;
        loop {
            match self.inner.await_finality(handle).await {
                Err(e) if e.is_transient() && self.config.should_retry(attempt) => {
                    self.backoff(attempt, "await_finality", &e).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn find_applied(&self, action: &Action) -> Result<Option<Receipt>, ActuatorError> {
        let mut attempt = 0;
        loop {
            match self.inner.find_applied(action).await {
                Err(e) if e.is_transient() && self.config.should_retry(attempt) => {
                    self.backoff(attempt, "find_applied", &e).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
