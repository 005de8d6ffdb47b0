use crate::retry::RetryPolicy;
use std::time::Duration;

/// Bytes requested by the first range read of every shard.
pub const DEFAULT_HEADER_BUDGET: usize = 256 * 1024;

/// Tuning knobs of an inspection run.
#[derive(Debug, Clone, PartialEq)]
pub struct InspectConfig {
    /// Number of shards fetched concurrently. Values below 1 behave as 1.
    pub concurrency: usize,
    /// Timeout applied to every HTTP request.
    pub timeout: Duration,
    /// Total attempts per request for transient failures.
    pub retries: u32,
    /// Base delay in seconds, doubled after every failed attempt.
    pub backoff: f64,
    /// Size of the first range read. Headers larger than this cost one
    /// extra request.
    pub header_budget: usize,
}

impl Default for InspectConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            timeout: Duration::from_secs(30),
            retries: 3,
            backoff: 1.0,
            header_budget: DEFAULT_HEADER_BUDGET,
        }
    }
}

impl InspectConfig {
    /// Sets the number of workers.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the total attempts per request.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the base backoff, in seconds.
    #[must_use]
    pub fn with_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the size of the first range read.
    #[must_use]
    pub fn with_header_budget(mut self, header_budget: usize) -> Self {
        self.header_budget = header_budget;
        self
    }

    /// Retry policy derived from `retries` and `backoff`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, self.backoff)
    }

    pub(crate) fn workers(&self) -> usize {
        self.concurrency.max(1)
    }
}
