use crate::fetch::{FetchError, RangeFetcher};
use crate::header::PREFIX_LEN;
use indexmap::IndexMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Canonical name of a single-file checkpoint.
pub const SAFETENSORS_FILE: &str = "model.safetensors";
/// Canonical name of the shard index of a sharded checkpoint.
pub const SAFETENSORS_INDEX_FILE: &str = "model.safetensors.index.json";
/// Revision used when none is given.
pub const DEFAULT_REVISION: &str = "main";
/// Hub host used when no mirror is given.
pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// A model on the hub, at a given revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    id: String,
    revision: String,
    endpoint: Option<Url>,
    token: Option<String>,
}

impl ModelRef {
    /// `id` is `namespace/name`; revision defaults to `main`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: DEFAULT_REVISION.to_string(),
            endpoint: None,
            token: None,
        }
    }

    /// Branch, tag or commit to read.
    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    /// Replaces the default host for every URL of the run.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Bearer token sent with every request.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// `namespace/name` identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Revision to read.
    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// Mirror replacing [`DEFAULT_ENDPOINT`], if any.
    pub fn endpoint(&self) -> Option<&Url> {
        self.endpoint.as_ref()
    }

    /// Bearer token, if any.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

/// One physical file backing a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardRef {
    filename: String,
    url: Url,
    #[serde(skip)]
    indexed_tensors: Option<Vec<String>>,
}

impl ShardRef {
    /// A shard not tied to an index.
    pub fn new(filename: impl Into<String>, url: Url) -> Self {
        Self {
            filename: filename.into(),
            url,
            indexed_tensors: None,
        }
    }

    /// Records the tensor names the shard index assigns to this file.
    #[must_use]
    pub fn with_indexed_tensors(mut self, names: Vec<String>) -> Self {
        self.indexed_tensors = Some(names);
        self
    }

    /// File name within the repository.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Resolved download URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Tensor names the shard index places in this file, when the model is
    /// sharded.
    pub fn indexed_tensors(&self) -> Option<&[String]> {
        self.indexed_tensors.as_deref()
    }
}

/// Structure for deserializing model.safetensors.index.json
#[derive(Debug, Deserialize)]
pub struct SafetensorsIndex {
    /// Map of tensor names to their containing file
    pub weight_map: IndexMap<String, String>,
}

impl SafetensorsIndex {
    /// Files named by the index, in order of first appearance, each with the
    /// tensors it holds.
    pub fn shard_files(&self) -> IndexMap<&str, Vec<String>> {
        let mut files: IndexMap<&str, Vec<String>> = IndexMap::new();
        for (tensor, file) in &self.weight_map {
            files.entry(file.as_str()).or_default().push(tensor.clone());
        }
        files
    }
}

/// Error type for shard discovery
#[derive(Debug, Error)]
pub enum LocateError {
    /// Neither an index nor a single file exists.
    #[error("no safetensors weights for {model} at revision {revision}")]
    NotFound {
        /// Model identifier.
        model: String,
        /// Revision looked at.
        revision: String,
    },

    /// The endpoint cannot carry a path.
    #[error("endpoint {0} cannot be used as a base URL")]
    InvalidEndpoint(Url),

    /// A file URL could not be built.
    #[error("Url parsing error: {0}")]
    Url(#[from] url::ParseError),

    /// The index exists but could not be fetched.
    #[error("fetching the shard index failed: {0}")]
    Index(#[source] FetchError),

    /// The index is not a valid index document.
    #[error("shard index is not valid JSON: {0}")]
    MalformedIndex(#[from] serde_json::Error),

    /// The single-file probe failed for a reason other than 404.
    #[error("probing model.safetensors failed: {0}")]
    Probe(#[source] FetchError),
}

/// Resolves a [`ModelRef`] into the shard files to inspect.
pub struct ShardLocator {
    fetcher: RangeFetcher,
    model: ModelRef,
    base: Url,
}

impl ShardLocator {
    /// Fails when the model's endpoint cannot be used as a base URL.
    pub fn new(fetcher: RangeFetcher, model: ModelRef) -> Result<Self, LocateError> {
        let base = match model.endpoint() {
            Some(endpoint) => endpoint.clone(),
            None => Url::parse(DEFAULT_ENDPOINT)?,
        };
        if base.cannot_be_a_base() {
            return Err(LocateError::InvalidEndpoint(base));
        }
        Ok(Self {
            fetcher,
            model,
            base,
        })
    }

    /// Model being located.
    pub fn model(&self) -> &ModelRef {
        &self.model
    }

    /// `{endpoint}/{model}/resolve/{revision}/{filename}`. A revision such as
    /// `refs/pr/1` stays a single, percent-encoded path segment.
    pub fn file_url(&self, filename: &str) -> Result<Url, LocateError> {
        let mut url = self.base.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.path_segments_mut()
            .map_err(|_| LocateError::InvalidEndpoint(self.base.clone()))?
            .pop_if_empty()
            .extend(self.model.id().split('/'))
            .push("resolve")
            .push(self.model.revision())
            .extend(filename.split('/'));
        Ok(url)
    }

    /// Returns the shards of the model: the files listed by the shard index
    /// when there is one, otherwise the single canonical file.
    pub async fn locate(&self) -> Result<Vec<ShardRef>, LocateError> {
        let index_url = self.file_url(SAFETENSORS_INDEX_FILE)?;
        match self.fetcher.get(&index_url, None).await {
            Ok(bytes) => {
                let index: SafetensorsIndex = serde_json::from_slice(&bytes)?;
                let shards = index
                    .shard_files()
                    .into_iter()
                    .map(|(filename, tensors)| {
                        Ok(ShardRef::new(filename, self.file_url(filename)?)
                            .with_indexed_tensors(tensors))
                    })
                    .collect::<Result<Vec<_>, LocateError>>()?;
                if shards.is_empty() {
                    return Err(self.not_found());
                }
                info!(
                    "{} is sharded into {} file(s) ({} indexed tensors)",
                    self.model.id(),
                    shards.len(),
                    index.weight_map.len()
                );
                Ok(shards)
            }
            Err(FetchError::NotFound { .. }) => {
                debug!("no {SAFETENSORS_INDEX_FILE}, probing {SAFETENSORS_FILE}");
                self.probe_single_file().await
            }
            Err(err) => Err(LocateError::Index(err)),
        }
    }

    async fn probe_single_file(&self) -> Result<Vec<ShardRef>, LocateError> {
        let url = self.file_url(SAFETENSORS_FILE)?;
        match self.fetcher.get(&url, Some(PREFIX_LEN)).await {
            Ok(_) => Ok(vec![ShardRef::new(SAFETENSORS_FILE, url)]),
            Err(FetchError::NotFound { .. }) => Err(self.not_found()),
            Err(err) => Err(LocateError::Probe(err)),
        }
    }

    fn not_found(&self) -> LocateError {
        LocateError::NotFound {
            model: self.model.id().to_string(),
            revision: self.model.revision().to_string(),
        }
    }
}
