use crate::config::InspectConfig;
use crate::fetch::{FetchError, RangeFetcher};
use crate::header::{DecodeError, ShardHeader, decode_header};
use crate::locate::{LocateError, ModelRef, ShardLocator, ShardRef};
use crate::report::{AggregateReport, ReportBuilder, ShardErrorKind, ShardFailure};
use futures::future::join_all;
use log::{debug, info, warn};
use reqwest::Client;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinError, JoinHandle};

/// Why a single shard could not be inspected.
#[derive(Debug, Error)]
pub enum ShardError {
    /// The header bytes could not be fetched.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The header bytes did not decode.
    #[error("malformed header: {0}")]
    MalformedHeader(#[from] DecodeError),
}

impl ShardError {
    /// Presentation-level class of the error.
    pub fn kind(&self) -> ShardErrorKind {
        match self {
            Self::Fetch(err) if err.is_transient() => ShardErrorKind::TransientFetch,
            Self::Fetch(_) => ShardErrorKind::PermanentFetch,
            Self::MalformedHeader(_) => ShardErrorKind::MalformedHeader,
        }
    }
}

/// Why a run produced no report.
#[derive(Debug, Error)]
pub enum AggregationFailure {
    /// Shard discovery failed for a reason other than absence.
    #[error("locating shards failed: {0}")]
    Locator(#[source] LocateError),

    /// No shard could be inspected.
    #[error("every shard failed: {}", describe_failures(.0))]
    AllShardsFailed(Vec<ShardFailure>),
}

fn describe_failures(failures: &[ShardFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{} ({}: {})", failure.filename, failure.kind, failure.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum Error {
    /// The model has no safetensors weights at this revision.
    #[error("no safetensors weights found for {model} at revision {revision}")]
    NotFound {
        /// Model identifier.
        model: String,
        /// Revision looked at.
        revision: String,
    },

    /// Nothing could be aggregated.
    #[error("aggregation failed: {0}")]
    AggregationFailed(#[from] AggregationFailure),

    /// The HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    /// A worker task panicked or was cancelled.
    #[error("Join error: {0}")]
    Join(#[from] JoinError),
}

impl From<LocateError> for Error {
    fn from(err: LocateError) -> Self {
        match err {
            LocateError::NotFound { model, revision } => Self::NotFound { model, revision },
            other => Self::AggregationFailed(AggregationFailure::Locator(other)),
        }
    }
}

/// Result of a whole run.
pub type Result<T> = std::result::Result<T, Error>;

/// Entry point of the pipeline: locates a model's shards and aggregates their
/// headers.
#[derive(Debug, Clone)]
pub struct Inspector {
    client: Client,
    config: InspectConfig,
}

impl Inspector {
    /// Builds its own HTTP client.
    pub fn new(config: InspectConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("safetensors-inspect/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    /// Uses an existing client. The configured timeout is still applied per
    /// request.
    pub fn with_client(client: Client, config: InspectConfig) -> Self {
        Self { client, config }
    }

    /// Settings of every run.
    pub fn config(&self) -> &InspectConfig {
        &self.config
    }

    /// Fetcher carrying `model`'s token.
    pub fn fetcher(&self, model: &ModelRef) -> RangeFetcher {
        RangeFetcher::new(
            self.client.clone(),
            &self.config,
            model.token().map(String::from),
        )
    }

    /// Locates the shards of `model` and aggregates their headers.
    pub async fn inspect(&self, model: &ModelRef) -> Result<AggregateReport> {
        let fetcher = self.fetcher(model);
        let locator = ShardLocator::new(fetcher.clone(), model.clone())?;
        let shards = locator.locate().await?;
        info!(
            "inspecting {} shard(s) of {}@{} with {} worker(s)",
            shards.len(),
            model.id(),
            model.revision(),
            self.config.workers()
        );
        let report = aggregate(&fetcher, shards, self.config.workers()).await?;
        info!(
            "{} tensors, {} bytes, {} failed shard(s)",
            report.total_count(),
            report.total_bytes(),
            report.failures().len()
        );
        Ok(report)
    }
}

/// Fetches and decodes a single shard.
pub async fn inspect_shard(
    fetcher: &RangeFetcher,
    shard: &ShardRef,
) -> std::result::Result<ShardHeader, ShardError> {
    let raw = fetcher.fetch_header(shard).await?;
    let header = decode_header(&raw.bytes)?;
    debug!(
        "{}: {} tensors, data starts at byte {}",
        shard.filename(),
        header.tensors().len(),
        header.data_start()
    );
    Ok(header)
}

type ShardResult = std::result::Result<ShardHeader, ShardError>;

/// Inspects `shards` with `concurrency` workers pulling from a shared queue.
///
/// Results are folded into the report in shard order no matter which worker
/// finishes first. Failed shards are recorded and skipped; the run only fails
/// when no shard succeeds.
pub async fn aggregate(
    fetcher: &RangeFetcher,
    shards: Vec<ShardRef>,
    concurrency: usize,
) -> Result<AggregateReport> {
    let workers = concurrency.clamp(1, shards.len().max(1));
    let queue: Arc<Mutex<VecDeque<(usize, ShardRef)>>> =
        Arc::new(Mutex::new(shards.iter().cloned().enumerate().collect()));
    let (tx, mut rx) = mpsc::unbounded_channel::<(usize, ShardResult)>();

    let handles: Vec<JoinHandle<()>> = (0..workers)
        .map(|worker| {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let fetcher = fetcher.clone();
            tokio::spawn(async move {
                loop {
                    let next = queue.lock().await.pop_front();
                    let Some((index, shard)) = next else {
                        break;
                    };
                    debug!("worker {worker}: shard {index} ({})", shard.filename());
                    let result = inspect_shard(&fetcher, &shard).await;
                    if tx.send((index, result)).is_err() {
                        break;
                    }
                }
            })
        })
        .collect();
    drop(tx);

    // Completed shards wait here until every earlier shard is in.
    let mut pending: Vec<Option<ShardResult>> = shards.iter().map(|_| None).collect();
    let mut cursor = 0;
    let mut builder = ReportBuilder::default();
    while let Some((index, result)) = rx.recv().await {
        pending[index] = Some(result);
        while let Some(result) = pending.get_mut(cursor).and_then(Option::take) {
            let shard = &shards[cursor];
            match result {
                Ok(header) => builder.push_shard(shard, header),
                Err(err) => {
                    warn!("skipping {}: {err}", shard.filename());
                    builder.push_failure(ShardFailure {
                        filename: shard.filename().to_string(),
                        url: shard.url().clone(),
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                }
            }
            cursor += 1;
        }
    }

    for handle in join_all(handles).await {
        handle?;
    }

    if !shards.is_empty() && builder.succeeded() == 0 {
        return Err(AggregationFailure::AllShardsFailed(builder.into_failures()).into());
    }
    Ok(builder.finish())
}
