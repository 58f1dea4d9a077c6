use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::embed::Embedder;
use crate::index::relocate::line_to_byte;
use crate::store::payload::PointPayload;
use crate::store::{SearchFilter, VectorStore};

fn default_k() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub stack_type: Option<String>,
    #[serde(default)]
    pub component_type: Option<String>,
    #[serde(default)]
    pub screen_name: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            k: default_k(),
            repo: None,
            stack_type: None,
            component_type: None,
            screen_name: None,
            tags: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub payload: PointPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus_text: Option<String>,
}

/// Query path: embed the query, AND-filter on the latest view, vector
/// search, then hydrate block/focus texts from the working tree when a repo
/// root is at hand.
pub struct Retriever {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    repo_root: Option<PathBuf>,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        repo_root: Option<PathBuf>,
    ) -> Self {
        Self { store, embedder, repo_root }
    }

    pub fn search(&self, request: &SearchRequest, branch: &str) -> Result<Vec<SearchHit>> {
        let vector = self
            .embedder
            .embed(std::slice::from_ref(&request.query))?
            .into_iter()
            .next()
            .context("embedding service returned no vector for the query")?;

        let mut filter = SearchFilter::new().eq("is_latest", true).eq("branch", branch);
        if let Some(repo) = &request.repo {
            filter = filter.eq("repo", repo.as_str());
        }
        if let Some(stack) = &request.stack_type {
            filter = filter.eq("stack_type", stack.as_str());
        }
        if let Some(component) = &request.component_type {
            filter = filter.eq("component_type", component.as_str());
        }
        if let Some(screen) = &request.screen_name {
            // Stored lower-cased; lower-case the request side too.
            filter = filter.eq("screen_name", screen.to_lowercase());
        }
        if let Some(tags) = &request.tags {
            let mut tags: Vec<String> = tags.clone();
            tags.sort();
            tags.dedup();
            if !tags.is_empty() {
                filter = filter.any_of("tags", tags);
            }
        }

        let k = if request.k == 0 { default_k() } else { request.k };
        let hits = self.store.search(&vector, k, &filter)?;
        Ok(hits
            .into_iter()
            .map(|hit| {
                let (block_text, focus_text) = self.hydrate(&hit.payload);
                SearchHit { id: hit.id, score: hit.score, payload: hit.payload, block_text, focus_text }
            })
            .collect())
    }

    /// Slice the enclosing block and the chunk's own lines out of the
    /// current working-tree file. Any failure degrades to a hit without
    /// texts; it never fails the query.
    fn hydrate(&self, payload: &PointPayload) -> (Option<String>, Option<String>) {
        let Some(root) = &self.repo_root else {
            return (None, None);
        };
        let Some(block_lines) = payload.block_lines else {
            return (None, None);
        };
        let path = root.join(&payload.path);
        let src = match std::fs::read_to_string(&path) {
            Ok(src) => src,
            Err(err) => {
                warn!(path = %path.display(), %err, "hit hydration failed");
                return (None, None);
            }
        };

        let [block_start, block_end] = block_lines;
        let start = line_to_byte(&src, block_start);
        let end = line_to_byte(&src, block_end + 1);
        let block_text = src.get(start..end).map(str::to_string);

        let [focus_start, focus_end] = payload.lines;
        let start = line_to_byte(&src, focus_start);
        let end = line_to_byte(&src, focus_end + 1);
        let focus_text = src.get(start..end).map(str::to_string);

        (block_text, focus_text)
    }
}
