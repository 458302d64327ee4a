//! Boundary to the external k-nearest-neighbour service.
//!
//! The service itself is opaque: anything implementing [`SimilarityIndex`]
//! will do. [`SignalIndex`] wraps one of them for a single signal kind and
//! enforces the vector schema, upsert batching and the query timeout.
//! Writes are eventually consistent; a query right after an upsert may not
//! see it yet.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, ops::Range, sync::Arc, time::Duration};
use tracing::{debug, info};

use crate::error::{Result, SignalError};
use crate::schema::VectorSchema;
use crate::types::{EventMetadata, IndexMatch, SignalKind};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: EventMetadata,
}

#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Inserts or replaces records by id.
    async fn upsert(&self, records: &[IndexRecord]) -> Result<()>;

    /// Nearest neighbours of `vector`, ordered by descending score.
    async fn query(&self, vector: &[f32], top_k: usize, include_metadata: bool) -> Result<Vec<IndexMatch>>;

    async fn count(&self) -> Result<usize>;
}

/// Splits `len` items into consecutive ranges of at most `batch_size`.
pub fn batch_ranges(len: usize, batch_size: usize) -> impl Iterator<Item = Range<usize>> {
    let step = batch_size.max(1);
    (0..len).step_by(step).map(move |start| start..(start + step).min(len))
}

/// One signal's view of an index.
#[derive(Clone)]
pub struct SignalIndex {
    kind: SignalKind,
    inner: Arc<dyn SimilarityIndex>,
    batch_size: usize,
    timeout: Option<Duration>,
}

impl SignalIndex {
    pub fn new(kind: SignalKind, inner: Arc<dyn SimilarityIndex>) -> Self {
        Self {
            kind,
            inner,
            batch_size: DEFAULT_BATCH_SIZE,
            timeout: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    pub fn schema(&self) -> &'static VectorSchema {
        VectorSchema::for_kind(self.kind)
    }

    /// Validates every record, then upserts in batches of at most the
    /// configured size. Returns the number of batch calls made.
    pub async fn upsert_batched(&self, records: &[IndexRecord]) -> Result<usize> {
        let schema = self.schema();
        for r in records {
            schema.validate(&r.values)?;
        }

        let mut calls = 0;
        for range in batch_ranges(records.len(), self.batch_size) {
            let batch = &records[range.clone()];
            self.inner.upsert(batch).await?;
            calls += 1;
            debug!("{} batch {}..{} upserted", self.kind, range.start, range.end);
        }
        info!("{} vectors upserted into {} index in {calls} batches", records.len(), self.kind);
        Ok(calls)
    }

    /// Schema-checked query, bounded by the configured timeout.
    pub async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<IndexMatch>> {
        self.schema().validate(vector)?;
        let fut = self.inner.query(vector, top_k, true);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                SignalError::IndexUnavailable(format!("{} query timed out after {limit:?}", self.kind))
            })?,
            None => fut.await,
        }
    }

    pub async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
}

#[derive(Default)]
struct MemoryState {
    records: Vec<IndexRecord>,
    by_id: HashMap<String, usize>,
}

/// Brute-force cosine index held in process memory.
#[derive(Default)]
pub struct MemoryIndex {
    state: RwLock<MemoryState>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[async_trait]
impl SimilarityIndex for MemoryIndex {
    async fn upsert(&self, records: &[IndexRecord]) -> Result<()> {
        let mut state = self.state.write();
        for r in records {
            match state.by_id.get(&r.id).copied() {
                Some(slot) => state.records[slot] = r.clone(),
                None => {
                    let slot = state.records.len();
                    state.by_id.insert(r.id.clone(), slot);
                    state.records.push(r.clone());
                }
            }
        }
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize, include_metadata: bool) -> Result<Vec<IndexMatch>> {
        let state = self.state.read();
        let mut matches: Vec<IndexMatch> = state
            .records
            .iter()
            .filter(|r| r.values.len() == vector.len())
            .map(|r| IndexMatch {
                id: r.id.clone(),
                score: cosine_similarity(vector, &r.values),
                metadata: include_metadata.then(|| r.metadata.clone()),
            })
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.state.read().records.len())
    }
}

/// Client for a hosted vector index speaking the Pinecone data-plane REST API.
pub struct HttpIndex {
    host: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryBody<'a> {
    vector: &'a [f32],
    top_k: usize,
    include_metadata: bool,
}

#[derive(Deserialize)]
struct QueryReply {
    #[serde(default)]
    matches: Vec<IndexMatch>,
}

#[derive(Serialize)]
struct UpsertBody<'a> {
    vectors: &'a [IndexRecord],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsReply {
    #[serde(default)]
    total_vector_count: usize,
}

impl HttpIndex {
    pub fn new(host: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SignalError::Config(format!("failed to build index HTTP client: {e}")))?;
        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", host.trim_end_matches('/'))
        };
        Ok(Self {
            host,
            api_key: api_key.to_string(),
            client,
        })
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.host, path);
        let resp = self
            .client
            .post(&url)
            .header("Api-Key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| SignalError::IndexUnavailable(format!("{url}: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(SignalError::IndexUnavailable(format!("HTTP {status}: {text}")));
        }
        Ok(resp)
    }
}

#[async_trait]
impl SimilarityIndex for HttpIndex {
    async fn upsert(&self, records: &[IndexRecord]) -> Result<()> {
        self.post("/vectors/upsert", &UpsertBody { vectors: records }).await?;
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize, include_metadata: bool) -> Result<Vec<IndexMatch>> {
        let body = QueryBody { vector, top_k, include_metadata };
        let reply: QueryReply = self
            .post("/query", &body)
            .await?
            .json()
            .await
            .map_err(|e| SignalError::IndexUnavailable(format!("bad query reply: {e}")))?;
        Ok(reply.matches)
    }

    async fn count(&self) -> Result<usize> {
        let reply: StatsReply = self
            .post("/describe_index_stats", &serde_json::json!({}))
            .await?
            .json()
            .await
            .map_err(|e| SignalError::IndexUnavailable(format!("bad stats reply: {e}")))?;
        Ok(reply.total_vector_count)
    }
}
