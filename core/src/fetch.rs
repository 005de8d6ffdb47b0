use crate::config::InspectConfig;
use crate::header::{PREFIX_LEN, declared_header_len};
use crate::locate::ShardRef;
use crate::retry::{Outcome, RetryPolicy, RetryState};
use log::{debug, trace, warn};
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Why a request failed.
#[derive(Debug)]
pub enum FailureReason {
    /// The server answered with a non-success status.
    Status(StatusCode),
    /// No usable response: connection, timeout or body error.
    Transport(reqwest::Error),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => write!(f, "HTTP {status}"),
            Self::Transport(err) if err.is_timeout() => write!(f, "timed out ({err})"),
            Self::Transport(err) => write!(f, "{err}"),
        }
    }
}

/// Error type for range reads
#[derive(Debug, Error)]
pub enum FetchError {
    /// The server answered 404.
    #[error("{url} does not exist")]
    NotFound {
        /// Requested URL.
        url: Url,
    },

    /// Network failure, timeout, 429 or 5xx, still failing after `attempts`.
    #[error("transient failure fetching {url} after {attempts} attempt(s): {reason}")]
    Transient {
        /// Requested URL.
        url: Url,
        /// Attempts made.
        attempts: u32,
        /// Failure of the last attempt.
        reason: FailureReason,
    },

    /// Any other failure; never retried.
    #[error("fetching {url} failed: {reason}")]
    Permanent {
        /// Requested URL.
        url: Url,
        /// What went wrong.
        reason: FailureReason,
    },
}

impl FetchError {
    fn from_status(url: &Url, status: StatusCode) -> Self {
        let url = url.clone();
        if status == StatusCode::NOT_FOUND {
            Self::NotFound { url }
        } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Self::Transient {
                url,
                attempts: 1,
                reason: FailureReason::Status(status),
            }
        } else {
            Self::Permanent {
                url,
                reason: FailureReason::Status(status),
            }
        }
    }

    fn from_transport(url: &Url, err: reqwest::Error) -> Self {
        let url = url.clone();
        if err.is_builder() || err.is_redirect() {
            Self::Permanent {
                url,
                reason: FailureReason::Transport(err),
            }
        } else {
            Self::Transient {
                url,
                attempts: 1,
                reason: FailureReason::Transport(err),
            }
        }
    }

    /// Whether the failure was retryable.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// URL of the failed request.
    pub fn url(&self) -> &Url {
        match self {
            Self::NotFound { url } | Self::Transient { url, .. } | Self::Permanent { url, .. } => {
                url
            }
        }
    }

    fn outcome(result: &Result<Vec<u8>, Self>) -> Outcome {
        match result {
            Ok(_) => Outcome::Success,
            Err(err) if err.is_transient() => Outcome::Transient,
            Err(_) => Outcome::Permanent,
        }
    }

    fn with_attempts(self, attempts: u32) -> Self {
        match self {
            Self::Transient { url, reason, .. } => Self::Transient {
                url,
                attempts,
                reason,
            },
            other => other,
        }
    }
}

/// Header bytes of one shard as read from the remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHeader {
    /// Bytes from offset 0, cut at the end of the header when its length is
    /// known.
    pub bytes: Vec<u8>,
    /// Offset of the data section, `8 + declared length`, when the prefix
    /// could be read.
    pub data_start: Option<usize>,
}

/// Issues bounded range reads with per-request timeout and retries.
///
/// Cloning is cheap: the underlying `reqwest::Client` is reference counted.
#[derive(Clone, Debug)]
pub struct RangeFetcher {
    client: Client,
    token: Option<String>,
    timeout: Duration,
    policy: RetryPolicy,
    budget: usize,
}

impl RangeFetcher {
    /// Takes timeout, retries and budget from `config`. `token` is sent as a
    /// bearer token.
    pub fn new(client: Client, config: &InspectConfig, token: Option<String>) -> Self {
        Self {
            client,
            token,
            timeout: config.timeout,
            policy: config.retry_policy(),
            budget: config.header_budget.max(PREFIX_LEN),
        }
    }

    /// Retry policy applied to every request.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Reads the header of `shard` in at most two range requests: first
    /// `[0, budget)`, then `[0, 8 + L)` if the declared length `L` does not
    /// fit in the first read.
    pub async fn fetch_header(&self, shard: &ShardRef) -> Result<RawHeader, FetchError> {
        let url = shard.url();
        let mut bytes = self.get(url, Some(self.budget)).await?;
        let mut extent = header_extent(&bytes);

        if let Some(needed) = extent {
            // A short first read means the file ended; asking again won't help.
            if needed > bytes.len() && bytes.len() >= self.budget {
                debug!(
                    "{}: header needs {needed} bytes, budget was {}; fetching the rest",
                    shard.filename(),
                    self.budget
                );
                bytes = self.get(url, Some(needed)).await?;
                extent = header_extent(&bytes);
            }
        }
        if let Some(needed) = extent {
            bytes.truncate(needed);
        }

        trace!("{}: read {} header bytes", shard.filename(), bytes.len());
        Ok(RawHeader {
            bytes,
            data_start: extent,
        })
    }

    /// GETs `url`, reading at most `limit` bytes from the start of the
    /// resource when a limit is given. Transient failures are retried
    /// according to the policy.
    pub async fn get(&self, url: &Url, limit: Option<usize>) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 1;
        loop {
            let result = self.get_once(url, limit).await;
            let outcome = FetchError::outcome(&result);
            match RetryState::Attempting(attempt).next(outcome, &self.policy) {
                RetryState::Attempting(next) => {
                    let delay = self.policy.delay_after(attempt);
                    if let Err(err) = &result {
                        warn!(
                            "attempt {attempt}/{} failed: {err}; retrying in {delay:?}",
                            self.policy.max_attempts()
                        );
                    }
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryState::FailedTransient(attempts) => {
                    return result.map_err(|err| err.with_attempts(attempts));
                }
                RetryState::Succeeded | RetryState::FailedPermanent => return result,
            }
        }
    }

    async fn get_once(&self, url: &Url, limit: Option<usize>) -> Result<Vec<u8>, FetchError> {
        let mut request = self.client.get(url.clone()).timeout(self.timeout);
        if let Some(limit) = limit {
            request = request.header(RANGE, format!("bytes=0-{}", limit.saturating_sub(1)));
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let mut response = request
            .send()
            .await
            .map_err(|err| FetchError::from_transport(url, err))?;
        let status = response.status();
        trace!("GET {url} (limit {limit:?}) -> {status}");
        if !status.is_success() {
            return Err(FetchError::from_status(url, status));
        }

        // Servers that ignore Range answer 200 with the whole file; stop
        // reading once we have what we asked for.
        let mut buffer = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| FetchError::from_transport(url, err))?
        {
            buffer.extend_from_slice(&chunk);
            if let Some(limit) = limit {
                if buffer.len() >= limit {
                    buffer.truncate(limit);
                    break;
                }
            }
        }
        Ok(buffer)
    }
}

/// Total bytes occupied by prefix and header, if the prefix is readable and
/// within bounds.
fn header_extent(buffer: &[u8]) -> Option<usize> {
    declared_header_len(buffer).ok().map(|n| PREFIX_LEN + n)
}
