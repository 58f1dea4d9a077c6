pub mod chunker;
pub mod hasher;
pub mod relocate;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::embed::Embedder;
use crate::error::IndexError;
use crate::git::GitCli;
use crate::git::diff::{FileDiff, parse_unified_diff, translate};
use crate::plugins::StackPlugins;
use crate::registry::state::{load_state, save_state, sync_state_with_registry};
use crate::registry::{Registry, StatusPatch};
use crate::store::VectorStore;
use crate::store::payload::{Point, PointPayload};
use self::chunker::{Chunk, ChunkLimits, Range};
use self::relocate::{FUZZY_WINDOW, exact_relocate, fuzzy_relocate};

/// Progress events streamed by an indexing run. The stream is a lazy finite
/// sequence: one `started`, any number of `processing`, then exactly one of
/// `completed`, `noop` or `error`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum IndexEvent {
    Started {
        message: String,
        total_files: usize,
        processed_files: usize,
        last_commit: String,
    },
    Processing {
        message: String,
        file: String,
        total_files: usize,
        processed_files: usize,
        last_commit: String,
    },
    Completed {
        message: String,
        total_files: usize,
        processed_files: usize,
        last_commit: String,
    },
    Noop {
        message: String,
        last_commit: String,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_commit: Option<String>,
    },
}

impl IndexEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Noop { .. } | Self::Error { .. })
    }
}

/// Event sender that maps a dropped consumer to a cancellation error, so a
/// run aborts when nobody is listening anymore.
struct Sink(Sender<IndexEvent>);

impl Sink {
    fn emit(&self, event: IndexEvent) -> Result<()> {
        self.0
            .send(event)
            .map_err(|_| IndexError::Cancelled("progress consumer dropped".into()).into())
    }
}

/// Per-chunk decision and store mutation engine for one repository.
pub struct Indexer {
    repo_id: String,
    branch: String,
    git: GitCli,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    plugins: StackPlugins,
    stack_type: Option<String>,
    limits: ChunkLimits,
}

impl Indexer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo_path: &Path,
        repo_id: &str,
        branch: &str,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        plugins: StackPlugins,
        stack_type: Option<String>,
        limits: ChunkLimits,
    ) -> Result<Self> {
        Ok(Self {
            repo_id: repo_id.to_string(),
            branch: branch.to_string(),
            git: GitCli::new(repo_path)?,
            embedder,
            store,
            plugins,
            stack_type,
            limits,
        })
    }

    pub fn git(&self) -> &GitCli {
        &self.git
    }

    pub fn head(&self) -> Result<String> {
        self.git.head()
    }

    fn chunk_source(&self, src: &str, path: &str) -> Vec<Chunk> {
        chunker::chunks(
            src,
            path,
            &self.repo_id,
            self.stack_type.as_deref(),
            &self.plugins.chunk,
            &self.limits,
        )
    }

    fn build_payload(&self, chunk: &Chunk, commit_sha: &str) -> PointPayload {
        let mut payload = PointPayload::for_chunk(chunk, &self.repo_id, &self.branch, commit_sha);
        if !self.plugins.base_payload.is_empty() {
            payload.apply(self.plugins.base_payload.clone());
        }
        for plugin in &self.plugins.payload {
            payload.apply(plugin.build_payload(chunk, &self.branch, commit_sha));
        }
        payload
    }

    /// Embed and upsert one file's worth of chunks. Every logical id is
    /// demoted before its new point lands, so no reader ever observes two
    /// latest points; the whole file goes up as one batch.
    fn embed_and_upsert(&self, chunks: &[Chunk], commit_sha: &str) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embedder.embed(&texts)?;
        ensure!(
            vectors.len() == chunks.len(),
            "embedding service returned {} vectors for {} chunks",
            vectors.len(),
            chunks.len()
        );

        let mut points = Vec::with_capacity(chunks.len());
        for (chunk, vector) in chunks.iter().zip(vectors) {
            let latest = self.store.scroll_by_logical(&chunk.logical_id, Some(true))?;
            if !latest.is_empty() {
                let ids: Vec<String> = latest.iter().map(|p| p.id.clone()).collect();
                self.store.set_payload(&ids, &json!({ "is_latest": false }))?;
            }
            let payload = self.build_payload(chunk, commit_sha);
            points.push(Point { id: payload.point_id.clone(), vector, payload });
        }
        self.store.upsert_points(&points)?;
        Ok(points.len())
    }

    /// A deleted file loses its latest points entirely: re-chunk the base
    /// revision, look up each chunk's latest point, delete them. Historical
    /// (non-latest) points are left alone.
    fn remove_deleted_file(&self, base: &str, path: &str) -> Result<usize> {
        let Some(base_src) = self.git.show_file(Some(base), path)? else {
            return Ok(0);
        };
        let mut remove_ids = Vec::new();
        for chunk in dedupe_by_symbol(self.chunk_source(&base_src, path)) {
            let latest = self.store.scroll_by_logical(&chunk.logical_id, Some(true))?;
            remove_ids.extend(latest.into_iter().map(|p| p.id));
        }
        let count = remove_ids.len();
        self.store.delete_points(&remove_ids)?;
        if count > 0 {
            info!(path, points = count, "removed latest points for deleted file");
        }
        Ok(count)
    }

    /// The incremental decision tree for one changed file:
    ///   no latest point        -> new (embed + upsert)
    ///   content hash differs   -> changed (embed + upsert, demote previous)
    ///   translate clean        -> position-only (patch lines in place)
    ///   translate overlapped   -> relocalize (exact, then fuzzy); failure
    ///                             reclassifies as changed
    fn update_file(
        &self,
        fd: &FileDiff,
        head_src: &str,
        base: &str,
        commit_sha: &str,
    ) -> Result<()> {
        let head_chunks = dedupe_by_symbol(self.chunk_source(head_src, &fd.path));
        let base_src = self.git.show_file(Some(base), &fd.path)?.unwrap_or_default();

        let mut to_embed: Vec<Chunk> = Vec::new();
        let mut to_reposition: Vec<(Chunk, Range)> = Vec::new();

        for chunk in head_chunks {
            let latest = self.store.scroll_by_logical(&chunk.logical_id, Some(true))?;
            let Some(prev) = latest.first() else {
                to_embed.push(chunk);
                continue;
            };
            if prev.payload.content_hash != chunk.content_hash {
                to_embed.push(chunk);
                continue;
            }

            // Unchanged content: carry the stored position (base coordinates)
            // through the hunks instead of re-embedding.
            let [byte_start, byte_end] = prev.payload.byte_range;
            let prev_range = Range::new(
                prev.payload.lines[0],
                prev.payload.lines[1],
                byte_start,
                byte_end,
            );
            let mut translated = translate(&prev_range, &fd.hunks);
            if translated.relocalize && !base_src.is_empty() {
                let probe = base_src.get(byte_start..byte_end).unwrap_or("");
                if !probe.is_empty() {
                    if let Some((start, end)) = exact_relocate(probe, head_src)
                        .or_else(|| fuzzy_relocate(probe, head_src, FUZZY_WINDOW))
                    {
                        translated = Range {
                            start_line: start,
                            end_line: end,
                            byte_start,
                            byte_end,
                            relocalize: false,
                        };
                    }
                }
            }

            if translated.relocalize {
                // Stale line numbers are never trusted; re-embed instead.
                to_embed.push(chunk);
            } else {
                to_reposition.push((chunk, translated));
            }
        }

        self.embed_and_upsert(&to_embed, commit_sha)?;

        for (chunk, range) in &to_reposition {
            let latest = self.store.scroll_by_logical(&chunk.logical_id, Some(true))?;
            if latest.is_empty() {
                continue;
            }
            let ids: Vec<String> = latest.iter().map(|p| p.id.clone()).collect();
            self.store
                .set_payload(&ids, &json!({ "lines": [range.start_line, range.end_line] }))?;
        }
        Ok(())
    }
}

/// Head chunks keyed by symbol: a later occurrence of the same symbol wins,
/// first-occurrence order is preserved.
fn dedupe_by_symbol(chunks: Vec<Chunk>) -> Vec<Chunk> {
    let mut order: Vec<String> = Vec::new();
    let mut by_symbol: HashMap<String, Chunk> = HashMap::new();
    for chunk in chunks {
        if !by_symbol.contains_key(&chunk.symbol) {
            order.push(chunk.symbol.clone());
        }
        by_symbol.insert(chunk.symbol.clone(), chunk);
    }
    order.into_iter().filter_map(|symbol| by_symbol.remove(&symbol)).collect()
}

/// Drives a full or incremental run on a worker thread, streaming progress
/// events through a channel and persisting run status to the registry on
/// every state transition. Dropping the receiver cancels the run.
pub struct IndexRunner {
    indexer: Indexer,
    registry: Registry,
    state_file: PathBuf,
    repo_id: String,
}

impl IndexRunner {
    pub fn new(indexer: Indexer, registry: Registry, state_file: PathBuf) -> Self {
        let repo_id = indexer.repo_id.clone();
        Self { indexer, registry, state_file, repo_id }
    }

    pub fn stream_full(self) -> Receiver<IndexEvent> {
        let (tx, rx) = unbounded();
        std::thread::spawn(move || self.run_full(tx));
        rx
    }

    pub fn stream_update(self) -> Receiver<IndexEvent> {
        let (tx, rx) = unbounded();
        std::thread::spawn(move || self.run_update(tx));
        rx
    }

    fn run_full(self, tx: Sender<IndexEvent>) {
        let sink = Sink(tx);
        if let Err(err) = self.full_inner(&sink) {
            self.fail("full", &sink, err);
        }
    }

    fn run_update(self, tx: Sender<IndexEvent>) {
        let sink = Sink(tx);
        let mut mode = String::from("update");
        if let Err(err) = self.update_inner(&sink, &mut mode) {
            self.fail(&mode, &sink, err);
        }
    }

    fn fail(&self, mode: &str, sink: &Sink, err: anyhow::Error) {
        let message = format!("{err:#}");
        error!(repo = %self.repo_id, mode, %message, "indexing run failed");
        let _ = self.registry.update_status(&self.repo_id, &StatusPatch::error(mode, &message));
        let cancelled = matches!(IndexError::find_in(&err), Some(IndexError::Cancelled(_)));
        if !cancelled {
            let _ = sink.emit(IndexEvent::Error { message, last_commit: None });
        }
    }

    fn full_inner(&self, sink: &Sink) -> Result<()> {
        let mode = "full";
        let head = self.indexer.head()?;
        let files = self.indexer.git().list_files(Some(&head))?;
        let total = files.len();

        let mut patch = StatusPatch::running(mode);
        patch.total_files = Some(total as i64);
        patch.processed_files = Some(0);
        self.registry.update_status(&self.repo_id, &patch)?;

        sink.emit(IndexEvent::Started {
            message: "Starting full index".into(),
            total_files: total,
            processed_files: 0,
            last_commit: head.clone(),
        })?;

        let mut processed = 0;
        for path in &files {
            let message = match self.indexer.git().show_file(Some(&head), path)? {
                None => format!("Skipped missing file: {path}"),
                Some(src) => {
                    let chunks = self.indexer.chunk_source(&src, path);
                    if chunks.is_empty() {
                        format!("Skipped empty file: {path}")
                    } else {
                        self.indexer
                            .embed_and_upsert(&chunks, &head)
                            .with_context(|| format!("indexing {path}"))?;
                        format!("Processed file: {path}")
                    }
                }
            };
            processed += 1;
            self.registry
                .update_status(&self.repo_id, &StatusPatch::progress(mode, processed, total, path))?;
            sink.emit(IndexEvent::Processing {
                message,
                file: path.clone(),
                total_files: total,
                processed_files: processed,
                last_commit: head.clone(),
            })?;
        }

        let mut state = load_state(&self.state_file)?;
        state.insert(self.repo_id.clone(), head.clone());
        save_state(&self.state_file, &state)?;
        self.registry
            .update_status(&self.repo_id, &StatusPatch::completed(mode, &head, processed, total))?;

        info!(repo = %self.repo_id, commit = %head, files = processed, "full index complete");
        sink.emit(IndexEvent::Completed {
            message: "Full index completed".into(),
            total_files: total,
            processed_files: processed,
            last_commit: head,
        })
    }

    fn update_inner(&self, sink: &Sink, mode_out: &mut String) -> Result<()> {
        let head = self.indexer.head()?;

        if let Some(entry) = self.registry.get(&self.repo_id)? {
            sync_state_with_registry(
                &self.state_file,
                &self.repo_id,
                entry.last_indexed_commit.as_deref(),
            )?;
        }
        let state = load_state(&self.state_file)?;
        let Some(base) = state.get(&self.repo_id).cloned() else {
            let message = "No base commit found; run full index first.";
            self.registry.update_status(&self.repo_id, &StatusPatch::error("update", message))?;
            return sink
                .emit(IndexEvent::Error { message: message.into(), last_commit: Some(head) });
        };

        // Commit mode diffs base..head; when the head commit is already
        // indexed, index working-tree edits against the base instead.
        let (file_diffs, commit_sha, mode) = if base != head {
            let diff_text = self.indexer.git().diff_unified_zero(&base, &head)?;
            let file_diffs = parse_unified_diff(&diff_text);
            if file_diffs.is_empty() {
                if !diff_text.trim().is_empty() {
                    warn!(repo = %self.repo_id, "diff parsing produced no entries");
                }
                return sink.emit(IndexEvent::Noop {
                    message: "No changes detected between commits".into(),
                    last_commit: head,
                });
            }
            (file_diffs, head.clone(), "update")
        } else {
            let changed = self.indexer.git().working_tree_changes()?;
            let file_diffs = if changed.is_empty() {
                Vec::new()
            } else {
                parse_unified_diff(&self.indexer.git().diff_working(&base, &changed)?)
            };
            if file_diffs.is_empty() {
                self.registry.update_status(&self.repo_id, &StatusPatch::noop("working-tree"))?;
                return sink.emit(IndexEvent::Noop {
                    message: "No local changes detected".into(),
                    last_commit: head,
                });
            }
            // Working-tree edits are recorded against the base commit.
            (file_diffs, base.clone(), "working-tree")
        };
        mode_out.clear();
        mode_out.push_str(mode);

        let head_at = if mode == "update" { Some(head.as_str()) } else { None };
        let total = file_diffs.len();

        let mut patch = StatusPatch::running(mode);
        patch.total_files = Some(total as i64);
        patch.processed_files = Some(0);
        self.registry.update_status(&self.repo_id, &patch)?;

        sink.emit(IndexEvent::Started {
            message: "Starting incremental index".into(),
            total_files: total,
            processed_files: 0,
            last_commit: head.clone(),
        })?;

        let mut processed = 0;
        for fd in &file_diffs {
            let message = if fd.is_deleted {
                self.indexer
                    .remove_deleted_file(&base, &fd.path)
                    .with_context(|| format!("removing {}", fd.path))?;
                format!("Removed deleted file: {}", fd.path)
            } else {
                match self.indexer.git().show_file(head_at, &fd.path)? {
                    None => format!("Skipped missing file: {}", fd.path),
                    Some(head_src) => {
                        self.indexer
                            .update_file(fd, &head_src, &base, &commit_sha)
                            .with_context(|| format!("updating {}", fd.path))?;
                        format!("Processed file: {}", fd.path)
                    }
                }
            };
            processed += 1;
            self.registry
                .update_status(&self.repo_id, &StatusPatch::progress(mode, processed, total, &fd.path))?;
            sink.emit(IndexEvent::Processing {
                message,
                file: fd.path.clone(),
                total_files: total,
                processed_files: processed,
                last_commit: head.clone(),
            })?;
        }

        let mut state = load_state(&self.state_file)?;
        state.insert(self.repo_id.clone(), head.clone());
        save_state(&self.state_file, &state)?;
        self.registry
            .update_status(&self.repo_id, &StatusPatch::completed(mode, &head, processed, total))?;

        info!(repo = %self.repo_id, commit = %head, mode, files = processed, "incremental index complete");
        sink.emit(IndexEvent::Completed {
            message: "Incremental index completed".into(),
            total_files: total,
            processed_files: processed,
            last_commit: head,
        })
    }
}
