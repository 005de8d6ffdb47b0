//! In-process stand-in for the hub, plus safetensors fixtures.

use axum::Router;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_RANGE, RANGE};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use indexmap::IndexMap;
use safetensors::Dtype;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use url::Url;

/// Serves files by path, honouring `Range: bytes=a-b`, with injectable
/// failures and delays. Every request is counted per path.
#[derive(Debug, Default)]
pub struct MockHub {
    files: HashMap<String, Vec<u8>>,
    /// Status to answer with, for the first `n` requests or forever.
    failures: HashMap<String, (StatusCode, Option<usize>)>,
    delays: HashMap<String, Duration>,
    hits: Mutex<HashMap<String, usize>>,
    ignore_range: bool,
    token: Option<String>,
}

impl MockHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, path: &str, body: Vec<u8>) -> Self {
        self.files.insert(path.to_string(), body);
        self
    }

    pub fn failing(mut self, path: &str, status: StatusCode) -> Self {
        self.failures.insert(path.to_string(), (status, None));
        self
    }

    pub fn failing_times(mut self, path: &str, status: StatusCode, times: usize) -> Self {
        self.failures.insert(path.to_string(), (status, Some(times)));
        self
    }

    pub fn delayed(mut self, path: &str, delay: Duration) -> Self {
        self.delays.insert(path.to_string(), delay);
        self
    }

    /// Answers 200 with the whole file even when a range is requested.
    pub fn ignoring_range(mut self) -> Self {
        self.ignore_range = true;
        self
    }

    pub fn requiring_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or_default()
    }

    /// Binds an ephemeral local port and serves until the runtime shuts down.
    pub async fn serve(self) -> (Url, Arc<Self>) {
        let hub = Arc::new(self);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .fallback(respond)
            .with_state(Arc::clone(&hub));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (Url::parse(&format!("http://{addr}/")).unwrap(), hub)
    }
}

async fn respond(State(hub): State<Arc<MockHub>>, uri: Uri, headers: HeaderMap) -> Response {
    let path = uri.path().to_string();
    let hit = {
        let mut hits = hub.hits.lock().unwrap();
        let count = hits.entry(path.clone()).or_default();
        *count += 1;
        *count
    };

    if let Some(delay) = hub.delays.get(&path) {
        tokio::time::sleep(*delay).await;
    }
    if let Some(token) = &hub.token {
        let expected = format!("Bearer {token}");
        let sent = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        if sent != Some(expected.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    if let Some((status, times)) = hub.failures.get(&path) {
        if times.is_none_or(|n| hit <= n) {
            return (*status).into_response();
        }
    }
    let Some(body) = hub.files.get(&path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let range = headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range);
    match range {
        Some((start, end)) if !hub.ignore_range => {
            if start >= body.len() {
                let unsatisfied = format!("bytes */{}", body.len());
                return (StatusCode::RANGE_NOT_SATISFIABLE, [(CONTENT_RANGE, unsatisfied)])
                    .into_response();
            }
            let end = end.min(body.len() - 1);
            let content_range = format!("bytes {start}-{end}/{}", body.len());
            (
                StatusCode::PARTIAL_CONTENT,
                [(CONTENT_RANGE, content_range)],
                body[start..=end].to_vec(),
            )
                .into_response()
        }
        _ => body.clone().into_response(),
    }
}

fn parse_range(value: &str) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// `/{id}/resolve/main/{file}`
pub fn repo_path(id: &str, file: &str) -> String {
    format!("/{id}/resolve/main/{file}")
}

/// Length prefix followed by `header` as is.
pub fn raw_file(header: &str) -> Vec<u8> {
    let mut file = (header.len() as u64).to_le_bytes().to_vec();
    file.extend_from_slice(header.as_bytes());
    file
}

/// A valid safetensors file with zeroed, contiguous tensor data.
pub fn safetensors_file(entries: &[(&str, &str, &[usize])]) -> Vec<u8> {
    build_file(IndexMap::new(), entries)
}

/// Like [`safetensors_file`], with `pad` bytes of metadata inflating the
/// header.
pub fn padded_safetensors_file(entries: &[(&str, &str, &[usize])], pad: usize) -> Vec<u8> {
    let mut header = IndexMap::new();
    header.insert(
        "__metadata__".to_string(),
        json!({ "padding": " ".repeat(pad) }),
    );
    build_file(header, entries)
}

fn build_file(mut header: IndexMap<String, Value>, entries: &[(&str, &str, &[usize])]) -> Vec<u8> {
    let mut offset = 0;
    for (name, dtype, shape) in entries {
        let width = serde_json::from_value::<Dtype>(json!(dtype)).unwrap().size();
        let size = shape.iter().product::<usize>() * width;
        header.insert(
            name.to_string(),
            json!({ "dtype": dtype, "shape": shape, "data_offsets": [offset, offset + size] }),
        );
        offset += size;
    }
    let mut file = raw_file(&serde_json::to_string(&header).unwrap());
    file.resize(file.len() + offset, 0);
    file
}

#[derive(Serialize)]
struct Index<'a> {
    metadata: Value,
    weight_map: IndexMap<&'a str, &'a str>,
}

/// A `model.safetensors.index.json` body mapping tensors to files, in the
/// given order.
pub fn index_json(weight_map: &[(&str, &str)]) -> Vec<u8> {
    let index = Index {
        metadata: json!({ "total_size": 0 }),
        weight_map: weight_map.iter().copied().collect(),
    };
    serde_json::to_vec(&index).unwrap()
}
