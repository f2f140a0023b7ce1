use std::future::Future;
use std::time::Duration;

use rand::Rng as _;
use thiserror::Error;

/// Retry decision returned by the error classifier callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Abort,
}

impl RetryAction {
    /// Map an `is_retryable()` style answer onto a decision.
    pub fn from_retryable(retryable: bool) -> Self {
        if retryable {
            Self::Retry
        } else {
            Self::Abort
        }
    }
}

/// Bounded exponential backoff with symmetric jitter and a per-attempt
/// timeout. Passed to each component at construction.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Fraction in `0.0..=1.0`; the nominal delay is scaled by `1 ± jitter`.
    pub jitter: f64,
    pub max_delay: Duration,
    /// Exceeding this counts as a transient failure. `None` disables it.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.1,
            max_delay: Duration::from_secs(60),
            attempt_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryPolicy {
    /// No waiting and no timeout.
    #[cfg(test)]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
            max_delay: Duration::ZERO,
            attempt_timeout: None,
        }
    }

    /// Same policy with a different per-attempt timeout.
    pub fn with_attempt_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            attempt_timeout: timeout,
            ..self.clone()
        }
    }

    /// Delay to wait before the given 1-indexed attempt.
    ///
    /// Formula: `base_delay * multiplier^(attempt-2) * (1 ± jitter)`, capped
    /// at `max_delay`. The first attempt never waits.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let nominal = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        let secs = (nominal * factor).clamp(0.0, self.max_delay.as_secs_f64());
        if secs.is_finite() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        }
    }
}

/// One failed attempt, kept for diagnostics and alert payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub error: String,
    pub timed_out: bool,
    pub delay_before: Duration,
}

/// Failure surfaced by [`retry_with_backoff`].
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The classifier rejected the error; no further attempts were made.
    #[error("{error}")]
    Permanent {
        error: E,
        history: Vec<AttemptRecord>,
    },

    /// Every attempt failed transiently. `last` is `None` when the final
    /// attempt timed out.
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last_error: String,
        last: Option<E>,
        history: Vec<AttemptRecord>,
    },
}

impl<E> RetryError<E> {
    pub fn history(&self) -> &[AttemptRecord] {
        match self {
            Self::Permanent { history, .. } | Self::Exhausted { history, .. } => history,
        }
    }

    /// The last underlying error, if the final attempt produced one.
    pub fn into_last(self) -> Option<E> {
        match self {
            Self::Permanent { error, .. } => Some(error),
            Self::Exhausted { last, .. } => last,
        }
    }
}

/// Retry an async operation with exponential backoff and jitter.
///
/// - `policy`: attempt budget, delays and per-attempt timeout
/// - `operation_name`: label used in log events and in the exhaustion error
/// - `classifier`: inspects an error and returns `Retry` or `Abort`
/// - `operation`: the async closure to retry
///
/// Emits one tracing event per attempt. Timeouts are always retried.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    policy: &RetryPolicy,
    operation_name: &str,
    classifier: C,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut history: Vec<AttemptRecord> = Vec::new();
    let mut last: Option<E> = None;
    let mut delay = Duration::ZERO;

    for attempt in 1..=max_attempts {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = match policy.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, operation()).await.ok(),
            None => Some(operation().await),
        };

        let (message, timed_out) = match result {
            Some(Ok(value)) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        "Succeeded after retry"
                    );
                } else {
                    tracing::trace!(operation = operation_name, attempt, "Succeeded");
                }
                return Ok(value);
            }
            Some(Err(e)) => {
                let message = e.to_string();
                if classifier(&e) == RetryAction::Abort {
                    history.push(AttemptRecord {
                        attempt,
                        error: message,
                        timed_out: false,
                        delay_before: delay,
                    });
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        "Permanent error, not retrying: {}",
                        e
                    );
                    return Err(RetryError::Permanent { error: e, history });
                }
                last = Some(e);
                (message, false)
            }
            None => {
                last = None;
                let limit = policy.attempt_timeout.unwrap_or_default();
                (format!("timed out after {}s", limit.as_secs_f64()), true)
            }
        };

        history.push(AttemptRecord {
            attempt,
            error: message.clone(),
            timed_out,
            delay_before: delay,
        });

        if attempt < max_attempts {
            delay = policy.delay_before_attempt(attempt + 1);
            tracing::warn!(
                operation = operation_name,
                attempt,
                max_attempts,
                timed_out,
                "Retryable error (attempt {}/{}), retrying in {:.1}s: {}",
                attempt,
                max_attempts,
                delay.as_secs_f64(),
                message
            );
        } else {
            tracing::error!(
                operation = operation_name,
                attempt,
                max_attempts,
                timed_out,
                "Retries exhausted: {}",
                message
            );
        }
    }

    let last_error = history
        .last()
        .map(|a| a.error.clone())
        .unwrap_or_default();
    Err(RetryError::Exhausted {
        operation: operation_name.to_string(),
        attempts: max_attempts,
        last_error,
        last,
        history,
    })
}
