use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Standard structural edge types across stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeType {
    BindsLayout,
    NavDestination,
    NavAction,
    NavigatesTo,
    UsesViewmodel,
    CallsApi,
}

/// A typed, directed relationship from a chunk to another named entity.
/// Targets are normalized strings, never pointers; resolution happens by
/// lookup at query time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

impl Edge {
    pub fn new(edge_type: EdgeType, target: impl Into<String>) -> Self {
        Self { edge_type, target: target.into(), meta: None }
    }

    pub fn with_meta(edge_type: EdgeType, target: impl Into<String>, meta: Map<String, Value>) -> Self {
        Self { edge_type, target: target.into(), meta: Some(meta) }
    }
}

/// Normalize id-like targets: drop any namespace prefix (`@+id/name`),
/// strip leading `@`/`+`, lower-case. Empty results are discarded.
pub fn normalize_id(value: &str) -> Option<String> {
    let mut cleaned = value;
    if let Some((_, rest)) = cleaned.split_once('/') {
        cleaned = rest;
    }
    let cleaned = cleaned.trim_start_matches(['@', '+']);
    if cleaned.is_empty() { None } else { Some(cleaned.to_lowercase()) }
}

/// Normalize layout names to repo-relative form (`layout/<name>.xml`).
pub fn normalize_layout_target(name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    let base = std::path::Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    Some(format!("layout/{base}.xml"))
}

/// Deduplicate edges by (type, target, canonical meta), preserving order.
pub fn dedupe_edges(edges: Vec<Edge>) -> Vec<Edge> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for edge in edges {
        let meta_key = edge
            .meta
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap_or_default())
            .unwrap_or_default();
        let key = (edge.edge_type, edge.target.clone(), meta_key);
        if seen.insert(key) {
            out.push(edge);
        }
    }
    out
}

pub fn merge_edges(a: Vec<Edge>, b: Vec<Edge>) -> Vec<Edge> {
    let mut merged = a;
    merged.extend(b);
    dedupe_edges(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_id_strips_prefixes() {
        assert_eq!(normalize_id("@+id/homeFragment").as_deref(), Some("homefragment"));
        assert_eq!(normalize_id("@id/detail").as_deref(), Some("detail"));
        assert_eq!(normalize_id("Detail").as_deref(), Some("detail"));
        assert_eq!(normalize_id("@+id/").is_none(), true);
    }

    #[test]
    fn normalize_layout_rewrites_to_layout_path() {
        assert_eq!(
            normalize_layout_target("activity_main").as_deref(),
            Some("layout/activity_main.xml")
        );
        assert_eq!(
            normalize_layout_target("res/layout/activity_main.xml").as_deref(),
            Some("layout/activity_main.xml")
        );
        assert!(normalize_layout_target("").is_none());
    }

    #[test]
    fn dedupe_keys_on_type_target_and_meta() {
        let mut meta = Map::new();
        meta.insert("source".into(), Value::String("home".into()));
        let edges = vec![
            Edge::new(EdgeType::NavDestination, "home"),
            Edge::new(EdgeType::NavDestination, "home"),
            Edge::new(EdgeType::NavAction, "home"),
            Edge::with_meta(EdgeType::NavAction, "home", meta.clone()),
            Edge::with_meta(EdgeType::NavAction, "home", meta),
        ];
        let deduped = dedupe_edges(edges);
        assert_eq!(deduped.len(), 3);
    }

    #[test]
    fn edge_type_serializes_screaming_snake() {
        let edge = Edge::new(EdgeType::BindsLayout, "layout/activity_main.xml");
        let json = serde_json::to_value(&edge).unwrap();
        assert_eq!(json["type"], "BINDS_LAYOUT");
        assert_eq!(json["target"], "layout/activity_main.xml");
        assert!(json.get("meta").is_none());
    }

    #[test]
    fn merge_concatenates_then_dedupes() {
        let a = vec![Edge::new(EdgeType::NavDestination, "home")];
        let b = vec![
            Edge::new(EdgeType::NavDestination, "home"),
            Edge::new(EdgeType::NavDestination, "detail"),
        ];
        let merged = merge_edges(a, b);
        assert_eq!(merged.len(), 2);
    }
}
