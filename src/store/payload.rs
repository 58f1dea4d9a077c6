use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::index::chunker::Chunk;
use crate::plugins::edges::Edge;

/// Deterministic point id: UUIDv5 of `logical_id:content_hash` under a fixed
/// namespace. Identical content always collides on the same id, which makes
/// upserts idempotent and crashed runs safely retryable.
pub fn point_id_for(logical_id: &str, content_hash: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, format!("{logical_id}:{content_hash}").as_bytes())
        .to_string()
}

/// Payload stored on every point: a fixed record of identity, versioning and
/// position keys plus the open-ended plugin-contributed part. Filterable
/// enrichment fields are first-class keys so the store can index them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointPayload {
    pub point_id: String,
    pub logical_id: String,
    pub repo: String,
    pub path: String,
    pub symbol: String,
    pub language: String,
    pub branch: String,
    pub commit_sha: String,
    pub content_hash: String,
    pub sig_hash: String,
    pub is_latest: bool,
    pub lines: [u32; 2],
    pub byte_range: [usize; 2],
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub neighbors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_lines: Option<[u32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_byte_range: Option<[usize; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nav_graph_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_meta: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_text: Option<String>,
    /// Plugin keys with no first-class slot.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PointPayload {
    /// Build the identity/versioning/position part of the payload for one
    /// chunk at one revision. Enrichment comes later via [`apply`].
    pub fn for_chunk(chunk: &Chunk, repo: &str, branch: &str, commit_sha: &str) -> Self {
        Self {
            point_id: point_id_for(&chunk.logical_id, &chunk.content_hash),
            logical_id: chunk.logical_id.clone(),
            repo: repo.to_string(),
            path: chunk.path.clone(),
            symbol: chunk.symbol.clone(),
            language: chunk.language.clone(),
            branch: branch.to_string(),
            commit_sha: commit_sha.to_string(),
            content_hash: chunk.content_hash.clone(),
            sig_hash: chunk.sig_hash.clone(),
            is_latest: true,
            lines: [chunk.range.start_line, chunk.range.end_line],
            byte_range: [chunk.range.byte_start, chunk.range.byte_end],
            neighbors: chunk.neighbors.clone(),
            block_id: chunk.block_id.clone(),
            block_lines: chunk.block_range.map(|b| [b.start_line, b.end_line]),
            block_byte_range: chunk.block_range.map(|b| [b.byte_start, b.byte_end]),
            stack_type: None,
            component_type: None,
            screen_name: None,
            layout_file: None,
            nav_graph_id: None,
            tags: Vec::new(),
            edges: Vec::new(),
            stack_meta: None,
            stack_text: None,
            extra: Map::new(),
        }
    }

    /// Merge plugin-contributed keys. Known enrichment keys land in their
    /// typed slots; everything else goes into the open map.
    pub fn apply(&mut self, extra: Map<String, Value>) {
        for (key, value) in extra {
            match key.as_str() {
                "stack_type" => self.stack_type = as_string(value),
                "component_type" => self.component_type = as_string(value),
                "screen_name" => self.screen_name = as_string(value),
                "layout_file" => self.layout_file = as_string(value),
                "nav_graph_id" => self.nav_graph_id = as_string(value),
                "stack_text" => self.stack_text = as_string(value),
                "tags" => {
                    if let Ok(tags) = serde_json::from_value(value) {
                        self.tags = tags;
                    }
                }
                "edges" => {
                    if let Ok(edges) = serde_json::from_value::<Vec<Edge>>(value) {
                        self.edges = edges;
                    }
                }
                "stack_meta" => {
                    if let Value::Object(map) = value {
                        self.stack_meta = Some(map);
                    }
                }
                _ => {
                    self.extra.insert(key, value);
                }
            }
        }
    }
}

fn as_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// One vector-store record: a chunk at one revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::chunker::Range;
    use crate::index::hasher::sha256_hex;

    fn chunk() -> Chunk {
        let content = "def f():\n    return 1\n".to_string();
        Chunk {
            logical_id: "demo:a.py#func:f".into(),
            symbol: "func:f".into(),
            path: "a.py".into(),
            language: "python".into(),
            range: Range::new(1, 2, 0, content.len()),
            content_hash: sha256_hex(content.as_bytes()),
            content,
            sig_hash: sha256_hex(b"function_definition:f"),
            neighbors: Vec::new(),
            block_id: None,
            block_range: None,
            meta: Map::new(),
        }
    }

    #[test]
    fn point_id_is_a_pure_function() {
        let a = point_id_for("repo:a.py#func:f", "hash1");
        let b = point_id_for("repo:a.py#func:f", "hash1");
        let c = point_id_for("repo:a.py#func:f", "hash2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, Uuid::parse_str(&a).unwrap().to_string());
    }

    #[test]
    fn payload_carries_identity_and_position() {
        let chunk = chunk();
        let payload = PointPayload::for_chunk(&chunk, "demo", "main", "abc123");
        assert_eq!(payload.point_id, point_id_for(&chunk.logical_id, &chunk.content_hash));
        assert_eq!(payload.lines, [1, 2]);
        assert_eq!(payload.byte_range, [0, chunk.content.len()]);
        assert!(payload.is_latest);
        assert_eq!(payload.commit_sha, "abc123");
        assert!(payload.block_lines.is_none());
    }

    #[test]
    fn apply_routes_known_keys_to_typed_slots() {
        let mut payload = PointPayload::for_chunk(&chunk(), "demo", "main", "abc");
        let mut extra = Map::new();
        extra.insert("screen_name".into(), Value::String("home".into()));
        extra.insert("tags".into(), serde_json::json!(["layout", "navgraph"]));
        extra.insert("custom_key".into(), Value::String("custom".into()));
        payload.apply(extra);
        assert_eq!(payload.screen_name.as_deref(), Some("home"));
        assert_eq!(payload.tags, vec!["layout", "navgraph"]);
        assert_eq!(payload.extra.get("custom_key").and_then(|v| v.as_str()), Some("custom"));
    }

    #[test]
    fn payload_round_trips_through_json() {
        let mut payload = PointPayload::for_chunk(&chunk(), "demo", "main", "abc");
        payload.apply({
            let mut m = Map::new();
            m.insert("edges".into(), serde_json::json!([{ "type": "NAVIGATES_TO", "target": "detail" }]));
            m
        });
        let value = serde_json::to_value(&payload).unwrap();
        let back: PointPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.logical_id, payload.logical_id);
        assert_eq!(back.edges.len(), 1);
        assert_eq!(back.edges[0].target, "detail");
    }
}
