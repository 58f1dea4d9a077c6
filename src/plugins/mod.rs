pub mod android;
pub mod edges;

use serde_json::{Map, Value};

use crate::index::chunker::Chunk;

/// Hook to customize chunking for specific stacks or file types.
///
/// `supports` must be a pure function of `(path, stack_type)`; the other
/// hooks are only invoked when it returns true.
pub trait ChunkPlugin: Send + Sync {
    fn supports(&self, path: &str, stack_type: Option<&str>) -> bool;

    fn preprocess(&self, src: &str, _path: &str, _repo: &str) -> String {
        src.to_string()
    }

    fn postprocess(&self, chunks: Vec<Chunk>, _path: &str, _repo: &str) -> Vec<Chunk> {
        chunks
    }

    fn extra_chunks(&self, _src: &str, _path: &str, _repo: &str) -> Vec<Chunk> {
        Vec::new()
    }
}

/// Hook to attach stack- or domain-specific fields to a chunk payload.
pub trait PayloadPlugin: Send + Sync {
    fn build_payload(&self, chunk: &Chunk, branch: &str, commit_sha: &str) -> Map<String, Value>;
}

/// The plugin set active for one indexing run.
#[derive(Default)]
pub struct StackPlugins {
    pub chunk: Vec<Box<dyn ChunkPlugin>>,
    pub payload: Vec<Box<dyn PayloadPlugin>>,
    /// Merged into every payload before plugin output.
    pub base_payload: Map<String, Value>,
}

/// Resolve the plugin set for a stack type. Plugins are registered here
/// explicitly; there is no scanning.
pub fn for_stack(stack_type: Option<&str>) -> StackPlugins {
    let mut plugins = StackPlugins::default();
    let Some(stack) = stack_type else {
        return plugins;
    };
    plugins
        .base_payload
        .insert("stack_type".into(), Value::String(stack.to_string()));
    if stack == "android_app" {
        plugins.chunk.push(Box::new(android::AndroidChunkPlugin));
        plugins.payload.push(Box::new(android::AndroidPayloadPlugin::new(stack)));
    }
    plugins
}
