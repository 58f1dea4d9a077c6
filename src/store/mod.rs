pub mod payload;

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::IndexError;
use self::payload::{Point, PointPayload};

/// AND-filter over payload fields: equality plus any-of matching for tags.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    conditions: Vec<Condition>,
}

#[derive(Debug, Clone)]
enum Condition {
    Eq(String, Value),
    AnyOf(String, Vec<String>),
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(key.to_string(), value.into()));
        self
    }

    pub fn any_of(mut self, key: &str, values: Vec<String>) -> Self {
        self.conditions.push(Condition::AnyOf(key.to_string(), values));
        self
    }

    /// Qdrant filter JSON: `{"must": [{"key", "match": {...}}, ...]}`.
    pub fn to_qdrant(&self) -> Value {
        let must: Vec<Value> = self
            .conditions
            .iter()
            .map(|c| match c {
                Condition::Eq(key, value) => json!({ "key": key, "match": { "value": value } }),
                Condition::AnyOf(key, values) => json!({ "key": key, "match": { "any": values } }),
            })
            .collect();
        json!({ "must": must })
    }

    /// Evaluate the filter against a payload serialized to JSON. Used by
    /// in-memory stores; the remote store evaluates server-side.
    pub fn matches(&self, payload: &Value) -> bool {
        self.conditions.iter().all(|c| match c {
            Condition::Eq(key, expected) => payload.get(key) == Some(expected),
            Condition::AnyOf(key, values) => match payload.get(key) {
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| item.as_str().is_some_and(|s| values.iter().any(|v| v == s))),
                Some(Value::String(s)) => values.iter().any(|v| v == s),
                _ => false,
            },
        })
    }
}

/// A point as returned by scroll/search. Scrolls carry a zero score.
#[derive(Debug, Clone)]
pub struct StoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: PointPayload,
}

/// The vector database seam. All operations are idempotent given the
/// deterministic point ids.
pub trait VectorStore: Send + Sync {
    fn upsert_points(&self, points: &[Point]) -> Result<()>;
    fn set_payload(&self, point_ids: &[String], payload: &Value) -> Result<()>;
    fn delete_points(&self, point_ids: &[String]) -> Result<()>;
    fn search(&self, vector: &[f32], k: usize, filter: &SearchFilter) -> Result<Vec<StoredPoint>>;
    fn scroll_by_logical(&self, logical_id: &str, is_latest: Option<bool>)
    -> Result<Vec<StoredPoint>>;
}

/// REST adapter for a Qdrant-compatible vector store. Mutating calls use
/// `wait=true` so that demote-then-upsert sequencing is visible to readers
/// in order.
pub struct QdrantStore {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
    collection: String,
    upsert_batch: usize,
}

#[derive(Deserialize)]
struct Api<T> {
    result: T,
}

#[derive(Deserialize)]
struct ScrollResult {
    points: Vec<RawPoint>,
}

#[derive(Deserialize)]
struct RawPoint {
    id: Value,
    #[serde(default)]
    score: Option<f32>,
    payload: PointPayload,
}

impl RawPoint {
    fn into_stored(self) -> StoredPoint {
        let id = match self.id {
            Value::String(s) => s,
            other => other.to_string(),
        };
        StoredPoint { id, score: self.score.unwrap_or(0.0), payload: self.payload }
    }
}

impl QdrantStore {
    pub fn new(
        url: &str,
        api_key: &str,
        collection: &str,
        upsert_batch: usize,
        timeout: Duration,
    ) -> Self {
        let agent: ureq::Agent =
            ureq::Agent::config_builder().timeout_global(Some(timeout)).build().into();
        Self {
            agent,
            base_url: url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            collection: collection.to_string(),
            upsert_batch: upsert_batch.max(1),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection, suffix)
    }

    pub fn collection_exists(&self) -> Result<bool> {
        let mut request = self.agent.get(&self.url(""));
        if !self.api_key.is_empty() {
            request = request.header("api-key", self.api_key.clone());
        }
        match request.call() {
            Ok(_) => Ok(true),
            Err(ureq::Error::StatusCode(404)) => Ok(false),
            Err(e) => Err(IndexError::VectorStore(e.to_string()))
                .context("checking collection existence"),
        }
    }

    /// Create the collection with cosine distance at the given dimension.
    pub fn create_collection(&self, dim: usize) -> Result<()> {
        let body = json!({ "vectors": { "size": dim, "distance": "Cosine" } });
        self.put_json(&self.url(""), &body).context("creating collection")?;
        Ok(())
    }

    fn put_json(&self, url: &str, body: &Value) -> Result<Value> {
        let mut request = self.agent.put(url);
        if !self.api_key.is_empty() {
            request = request.header("api-key", self.api_key.clone());
        }
        let mut response =
            request.send_json(body).map_err(|e| IndexError::VectorStore(e.to_string()))?;
        response.body_mut().read_json().map_err(|e| IndexError::VectorStore(e.to_string()).into())
    }

    fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
        let mut request = self.agent.post(url);
        if !self.api_key.is_empty() {
            request = request.header("api-key", self.api_key.clone());
        }
        let mut response =
            request.send_json(body).map_err(|e| IndexError::VectorStore(e.to_string()))?;
        response.body_mut().read_json().map_err(|e| IndexError::VectorStore(e.to_string()).into())
    }
}

impl VectorStore for QdrantStore {
    fn upsert_points(&self, points: &[Point]) -> Result<()> {
        for batch in points.chunks(self.upsert_batch) {
            debug!(collection = %self.collection, count = batch.len(), "upserting points");
            let body = json!({ "points": batch });
            self.put_json(&self.url("/points?wait=true"), &body).context("upserting points")?;
        }
        Ok(())
    }

    fn set_payload(&self, point_ids: &[String], payload: &Value) -> Result<()> {
        if point_ids.is_empty() {
            return Ok(());
        }
        let body = json!({ "payload": payload, "points": point_ids });
        self.post_json(&self.url("/points/payload?wait=true"), &body)
            .context("setting point payload")?;
        Ok(())
    }

    fn delete_points(&self, point_ids: &[String]) -> Result<()> {
        if point_ids.is_empty() {
            return Ok(());
        }
        let body = json!({ "points": point_ids });
        self.post_json(&self.url("/points/delete?wait=true"), &body)
            .context("deleting points")?;
        Ok(())
    }

    fn search(&self, vector: &[f32], k: usize, filter: &SearchFilter) -> Result<Vec<StoredPoint>> {
        let body = json!({
            "vector": vector,
            "limit": k,
            "filter": filter.to_qdrant(),
            "with_payload": true,
        });
        let value = self.post_json(&self.url("/points/search"), &body).context("vector search")?;
        let parsed: Api<Vec<RawPoint>> =
            serde_json::from_value(value).map_err(|e| IndexError::VectorStore(e.to_string()))?;
        Ok(parsed.result.into_iter().map(RawPoint::into_stored).collect())
    }

    fn scroll_by_logical(
        &self,
        logical_id: &str,
        is_latest: Option<bool>,
    ) -> Result<Vec<StoredPoint>> {
        let mut filter = SearchFilter::new().eq("logical_id", logical_id);
        if let Some(latest) = is_latest {
            filter = filter.eq("is_latest", latest);
        }
        let body = json!({ "filter": filter.to_qdrant(), "limit": 100, "with_payload": true });
        let value =
            self.post_json(&self.url("/points/scroll"), &body).context("scrolling points")?;
        let parsed: Api<ScrollResult> =
            serde_json::from_value(value).map_err(|e| IndexError::VectorStore(e.to_string()))?;
        Ok(parsed.result.points.into_iter().map(RawPoint::into_stored).collect())
    }
}
