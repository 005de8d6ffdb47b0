use std::time::Duration;

/// How many attempts a request gets and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: f64,
}

impl RetryPolicy {
    /// `retries` is the total number of attempts (at least one is always
    /// made). `backoff` is in seconds.
    pub fn new(retries: u32, backoff: f64) -> Self {
        Self {
            max_attempts: retries.max(1),
            backoff,
        }
    }

    /// Attempts before a transient failure becomes final.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after the failed `attempt` (counting from 1):
    /// `backoff * 2^(attempt - 1)` seconds.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        Duration::try_from_secs_f64(self.backoff * 2f64.powi(exponent)).unwrap_or(Duration::ZERO)
    }
}

/// Classification of a single attempt's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The request succeeded.
    Success,
    /// The request may succeed if repeated.
    Transient,
    /// Repeating the request will not help.
    Permanent,
}

/// State of a retried request. `Attempting(n)` means attempt `n` is about to
/// run; every other state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Attempt `n` (from 1) is about to run.
    Attempting(u32),
    /// An attempt succeeded.
    Succeeded,
    /// Every attempt failed transiently; holds the number made.
    FailedTransient(u32),
    /// An attempt failed permanently.
    FailedPermanent,
}

impl RetryState {
    /// First attempt.
    pub fn start() -> Self {
        Self::Attempting(1)
    }

    /// Transition after an attempt. Terminal states never change.
    pub fn next(self, outcome: Outcome, policy: &RetryPolicy) -> Self {
        match (self, outcome) {
            (Self::Attempting(_), Outcome::Success) => Self::Succeeded,
            (Self::Attempting(_), Outcome::Permanent) => Self::FailedPermanent,
            (Self::Attempting(n), Outcome::Transient) if n < policy.max_attempts => {
                Self::Attempting(n + 1)
            }
            (Self::Attempting(n), Outcome::Transient) => Self::FailedTransient(n),
            (terminal, _) => terminal,
        }
    }

    /// Whether no further attempt will be made.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Attempting(_))
    }
}
