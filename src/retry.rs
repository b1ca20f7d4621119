//! Backoff schedules and the pluggable retry classification contract
//!
//! The transport never decides whether a failed operation is retried. Callers
//! that route operations (see `bucket::BucketRouter`) ask a `RetryClassifier`
//! and wait the delay it returns. Server-specific heuristics, such as mapping
//! HTTP status codes to retryable or terminal, belong in custom classifiers.

use std::time::Duration;

use crate::operation::{Operation, OperationError};

/// Steps of the controlled schedule, in milliseconds; the last repeats
const CONTROLLED_STEPS_MS: [u64; 6] = [1, 10, 50, 100, 500, 1000];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Schedule {
    /// `initial * factor^attempt`, capped at `max`
    Exponential {
        initial: Duration,
        factor: u32,
        max: Duration,
    },
    /// Fixed ramp for operation retries
    Controlled,
}

/// Stateful delay generator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    schedule: Schedule,
    attempt: u32,
}

impl Backoff {
    pub fn exponential(initial: Duration, factor: u32, max: Duration) -> Self {
        debug_assert!(factor >= 1, "backoff factor must be at least 1");
        Backoff {
            schedule: Schedule::Exponential {
                initial,
                factor: factor.max(1),
                max,
            },
            attempt: 0,
        }
    }

    /// 1 ms, 10 ms, 50 ms, 100 ms, 500 ms, then 1 s for every later attempt
    pub fn controlled() -> Self {
        Backoff {
            schedule: Schedule::Controlled,
            attempt: 0,
        }
    }

    /// Delay for a given zero-based attempt, without advancing
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match &self.schedule {
            Schedule::Exponential {
                initial,
                factor,
                max,
            } => {
                let multiplier = factor.checked_pow(attempt).unwrap_or(u32::MAX);
                initial.checked_mul(multiplier).unwrap_or(*max).min(*max)
            }
            Schedule::Controlled => {
                let index = (attempt as usize).min(CONTROLLED_STEPS_MS.len() - 1);
                Duration::from_millis(CONTROLLED_STEPS_MS[index])
            }
        }
    }

    /// Delay for the current attempt, then advance
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// What to do with a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Resend a fresh copy after the delay
    Retry(Duration),
    /// Surface the failure to the caller
    Stop,
}

/// Decides whether a failed operation is sent again
pub trait RetryClassifier: Send + Sync {
    /// `attempt` counts previous tries, starting at zero
    fn classify(&self, op: &Operation, error: &OperationError, attempt: u32) -> RetryAction;
}

/// Default classifier
///
/// Retries anything that never reached a socket. Operations that may have
/// reached the server are retried only when idempotent. Timeouts and
/// oversized requests are terminal.
#[derive(Debug, Clone)]
pub struct BestEffortRetry {
    max_attempts: u32,
    backoff: Backoff,
}

impl BestEffortRetry {
    pub fn new(max_attempts: u32) -> Self {
        BestEffortRetry {
            max_attempts,
            backoff: Backoff::controlled(),
        }
    }
}

impl Default for BestEffortRetry {
    fn default() -> Self {
        BestEffortRetry::new(10)
    }
}

impl RetryClassifier for BestEffortRetry {
    fn classify(&self, op: &Operation, error: &OperationError, attempt: u32) -> RetryAction {
        if attempt + 1 >= self.max_attempts {
            return RetryAction::Stop;
        }
        let retryable = match error {
            OperationError::NotSent(_) => true,
            OperationError::Transport(_) | OperationError::Cancelled => op.idempotent(),
            OperationError::Timeout { .. } | OperationError::ValueTooLarge { .. } => false,
        };
        if retryable {
            RetryAction::Retry(self.backoff.delay_for(attempt))
        } else {
            RetryAction::Stop
        }
    }
}
