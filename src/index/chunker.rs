use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use tree_sitter::{Language, Node, Parser};

use super::hasher::sha256_hex;
use crate::plugins::ChunkPlugin;

/// Line interval (1-based, inclusive) plus the byte interval `[start, end)`
/// into the file at the indexed revision. `relocalize` marks a range whose
/// line numbers can no longer be trusted because a diff hunk overlapped it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start_line: u32,
    pub end_line: u32,
    pub byte_start: usize,
    pub byte_end: usize,
    pub relocalize: bool,
}

impl Range {
    pub fn new(start_line: u32, end_line: u32, byte_start: usize, byte_end: usize) -> Self {
        Self { start_line, end_line, byte_start, byte_end, relocalize: false }
    }
}

/// The unit of retrieval. `logical_id` (`repo:path#symbol`) is stable across
/// revisions of the same logical symbol; `content_hash` changes with the
/// text, `sig_hash` only with the declaration shape.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub logical_id: String,
    pub symbol: String,
    pub path: String,
    pub language: String,
    pub range: Range,
    pub content: String,
    pub content_hash: String,
    pub sig_hash: String,
    /// Reserved for forward compatibility; nothing populates it yet.
    pub neighbors: Vec<String>,
    pub block_id: Option<String>,
    pub block_range: Option<Range>,
    /// Free-form plugin metadata carried into payload construction.
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkLimits {
    /// Character cap per chunk; oversized chunks split at line boundaries.
    pub max_content_chars: usize,
    /// Window size for the line-based fallback chunker.
    pub lines_per_chunk: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self { max_content_chars: 460, lines_per_chunk: 120 }
    }
}

impl ChunkLimits {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            max_content_chars: config.max_content_chars(),
            lines_per_chunk: config.chunk_lines.max(1),
        }
    }

    fn cap(&self) -> usize {
        self.max_content_chars.max(256)
    }
}

/// Extensions we refuse to chunk at all (binary spreadsheet formats).
const SKIP_EXTENSIONS: &[&str] = &["xlsx", "xls", "xlsm", "xlsb"];

/// Chunk a file. Syntax-aware when the extension maps to a supported
/// grammar, line-window fallback otherwise; any structural failure of the
/// parser also falls back. Plugins that claim the path get to preprocess
/// the source, postprocess the chunk list, and append synthetic chunks.
pub fn chunks(
    src: &str,
    path: &str,
    repo: &str,
    stack_type: Option<&str>,
    plugins: &[Box<dyn ChunkPlugin>],
    limits: &ChunkLimits,
) -> Vec<Chunk> {
    if let Some(ext) = extension(path) {
        if SKIP_EXTENSIONS.contains(&ext.as_str()) {
            debug!(path, "skipping unsupported file type");
            return Vec::new();
        }
    }

    let mut pre = src.to_string();
    for plugin in plugins {
        if plugin.supports(path, stack_type) {
            pre = plugin.preprocess(&pre, path, repo);
        }
    }

    let mut out = match language_for(path) {
        Some(lang) => syntax_chunks(&pre, path, repo, lang, limits)
            .unwrap_or_else(|| generic_chunks(&pre, path, repo, limits)),
        None => generic_chunks(&pre, path, repo, limits),
    };

    for plugin in plugins {
        if plugin.supports(path, stack_type) {
            out = plugin.postprocess(out, path, repo);
            out.extend(plugin.extra_chunks(&pre, path, repo));
        }
    }

    out
}

/// Map a file extension to a syntax-chunkable language name.
pub fn language_for(path: &str) -> Option<&'static str> {
    match extension(path)?.as_str() {
        "py" => Some("python"),
        "js" | "jsx" => Some("javascript"),
        "ts" | "tsx" => Some("typescript"),
        "java" => Some("java"),
        "c" | "h" => Some("c"),
        "cc" | "cpp" | "hpp" => Some("cpp"),
        "go" => Some("go"),
        "rs" => Some("rust"),
        _ => None,
    }
}

fn extension(path: &str) -> Option<String> {
    std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

fn grammar(lang: &str) -> Option<Language> {
    match lang {
        "rust" => Some(tree_sitter_rust::LANGUAGE.into()),
        "python" => Some(tree_sitter_python::LANGUAGE.into()),
        "javascript" => Some(tree_sitter_javascript::LANGUAGE.into()),
        "typescript" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        "java" => Some(tree_sitter_java::LANGUAGE.into()),
        "c" => Some(tree_sitter_c::LANGUAGE.into()),
        "cpp" => Some(tree_sitter_cpp::LANGUAGE.into()),
        "go" => Some(tree_sitter_go::LANGUAGE.into()),
        _ => None,
    }
}

/// Node kinds that become chunks, per language.
fn definition_kinds(lang: &str) -> &'static [&'static str] {
    match lang {
        "javascript" | "typescript" => {
            &["function_declaration", "method_definition", "class_declaration"]
        }
        "java" => &["class_declaration", "interface_declaration", "method_declaration"],
        "go" => &["function_declaration", "method_declaration", "type_declaration"],
        "c" => &["function_definition"],
        "cpp" => &["function_definition", "class_specifier"],
        "rust" => &["function_item", "impl_item", "trait_item", "struct_item", "enum_item"],
        "python" => &["class_definition", "function_definition"],
        _ => &[],
    }
}

/// Kinds that can serve as the enclosing block of a nested definition.
/// Class-like containers only: the climb walks past intervening functions
/// to the nearest class/impl/struct/trait, or finds nothing.
const BLOCK_KINDS: &[&str] = &[
    "class_declaration",
    "class_definition",
    "class_specifier",
    "interface_declaration",
    "impl_item",
    "trait_item",
    "struct_item",
    "enum_item",
];

fn is_class_like(kind: &str) -> bool {
    kind.contains("class")
        || matches!(kind, "struct_item" | "enum_item" | "trait_item" | "interface_declaration")
}

static IDENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap());

fn first_identifier(text: &str) -> Option<String> {
    IDENT_RE.find(text).map(|m| m.as_str().to_string())
}

/// Best-effort name for a definition node: named fields first, then any
/// direct identifier child.
fn node_name(node: &Node, src: &str) -> Option<String> {
    for field in ["name", "declarator", "type", "trait"] {
        if let Some(child) = node.child_by_field_name(field) {
            if let Some(name) = first_identifier(&src[child.byte_range()]) {
                return Some(name);
            }
        }
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if matches!(child.kind(), "identifier" | "type_identifier" | "scoped_identifier") {
            if let Some(name) = first_identifier(&src[child.byte_range()]) {
                return Some(name);
            }
        }
    }
    None
}

fn enclosing_block(node: &Node, src: &str) -> (Option<String>, Option<Range>) {
    let mut parent = node.parent();
    while let Some(p) = parent {
        if BLOCK_KINDS.contains(&p.kind()) {
            let name = node_name(&p, src).unwrap_or_else(|| p.kind().to_string());
            let range = Range::new(
                p.start_position().row as u32 + 1,
                p.end_position().row as u32 + 1,
                p.start_byte(),
                p.end_byte(),
            );
            return (Some(format!("block:{}:{}", p.kind(), name)), Some(range));
        }
        parent = p.parent();
    }
    (None, None)
}

/// Walk the parse tree emitting a chunk per definition node. Returns None
/// when the parser cannot be driven or found nothing, so the caller can
/// fall back to the line-window chunker.
fn syntax_chunks(
    src: &str,
    path: &str,
    repo: &str,
    lang: &str,
    limits: &ChunkLimits,
) -> Option<Vec<Chunk>> {
    let language = grammar(lang)?;
    let mut parser = Parser::new();
    parser.set_language(&language).ok()?;
    let tree = parser.parse(src, None)?;

    let kinds = definition_kinds(lang);
    let mut out = Vec::new();
    collect(tree.root_node(), src, path, repo, lang, kinds, limits, &mut out);
    if out.is_empty() { None } else { Some(out) }
}

#[allow(clippy::too_many_arguments)]
fn collect(
    node: Node,
    src: &str,
    path: &str,
    repo: &str,
    lang: &str,
    kinds: &[&str],
    limits: &ChunkLimits,
    out: &mut Vec<Chunk>,
) {
    if kinds.contains(&node.kind()) {
        emit(&node, src, path, repo, lang, limits, out);
    }
    // Definitions nest (methods in classes, impls around fns), so the walk
    // continues below emitted nodes; members carry the enclosing block.
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect(child, src, path, repo, lang, kinds, limits, out);
    }
}

fn emit(
    node: &Node,
    src: &str,
    path: &str,
    repo: &str,
    lang: &str,
    limits: &ChunkLimits,
    out: &mut Vec<Chunk>,
) {
    let start_line = node.start_position().row as u32 + 1;
    let end_line = node.end_position().row as u32 + 1;
    let byte_start = node.start_byte();
    let byte_end = node.end_byte();
    let text = &src[byte_start..byte_end];

    let name = node_name(node, src).unwrap_or_else(|| node.kind().to_string());
    let prefix = if is_class_like(node.kind()) { "class" } else { "func" };
    let symbol = format!("{prefix}:{name}");
    let logical_id = format!("{repo}:{path}#{symbol}");
    let sig_hash = sha256_hex(format!("{}:{}", node.kind(), name).as_bytes());
    let (block_id, block_range) = enclosing_block(node, src);

    if text.len() > limits.cap() {
        out.extend(split_oversized(
            text,
            start_line,
            byte_start,
            &symbol,
            &logical_id,
            &sig_hash,
            path,
            lang,
            block_id,
            block_range,
            limits.cap(),
        ));
    } else {
        out.push(Chunk {
            logical_id,
            symbol,
            path: path.to_string(),
            language: lang.to_string(),
            range: Range::new(start_line, end_line, byte_start, byte_end),
            content: text.to_string(),
            content_hash: sha256_hex(text.as_bytes()),
            sig_hash,
            neighbors: Vec::new(),
            block_id,
            block_range,
            meta: Map::new(),
        });
    }
}

/// Slide a fixed line window over the file; every window becomes a chunk
/// whose symbol encodes its line interval, so the logical id shifts with
/// the window and still compares equal to itself at the same lines.
pub fn generic_chunks(src: &str, path: &str, repo: &str, limits: &ChunkLimits) -> Vec<Chunk> {
    let lines: Vec<&str> = src.split_inclusive('\n').collect();
    let window = limits.lines_per_chunk.max(1);
    let mut out = Vec::new();
    let mut i = 0;
    let mut line_no: u32 = 1;
    let mut offset: usize = 0;

    while i < lines.len() {
        let segment = &lines[i..(i + window).min(lines.len())];
        let text: String = segment.concat();
        let start = line_no;
        let end = line_no + segment.len() as u32 - 1;
        let byte_start = offset;
        let byte_end = offset + text.len();

        let symbol = format!("range:{start:04}-{end:04}");
        let logical_id = format!("{repo}:{path}#{symbol}");
        let sig_hash = sha256_hex(symbol.as_bytes());

        if text.len() > limits.cap() {
            out.extend(split_oversized(
                &text,
                start,
                byte_start,
                &symbol,
                &logical_id,
                &sig_hash,
                path,
                "generic",
                None,
                None,
                limits.cap(),
            ));
        } else {
            out.push(Chunk {
                logical_id,
                symbol,
                path: path.to_string(),
                language: "generic".to_string(),
                range: Range::new(start, end, byte_start, byte_end),
                content: text.clone(),
                content_hash: sha256_hex(text.as_bytes()),
                sig_hash,
                neighbors: Vec::new(),
                block_id: None,
                block_range: None,
                meta: Map::new(),
            });
        }

        i += window;
        line_no += segment.len() as u32;
        offset = byte_end;
    }

    out
}

/// Split an oversized chunk at line boundaries into ordered `_partN` chunks.
/// Parts get their own content hash and share the parent's sig_hash.
#[allow(clippy::too_many_arguments)]
fn split_oversized(
    text: &str,
    start_line: u32,
    byte_start: usize,
    symbol: &str,
    logical_id: &str,
    sig_hash: &str,
    path: &str,
    lang: &str,
    block_id: Option<String>,
    block_range: Option<Range>,
    cap: usize,
) -> Vec<Chunk> {
    let mut out = Vec::new();
    let mut pos = 0;
    let mut part = 1;
    let mut cur_line = start_line;

    while pos < text.len() {
        let mut end = (pos + cap).min(text.len());
        if end < text.len() {
            match text[pos..end].rfind('\n') {
                // Cut right after the last newline that fits.
                Some(nl) if nl > 0 => end = pos + nl + 1,
                // Single line longer than the cap: cut at the next char boundary.
                _ => {
                    while end < text.len() && !text.is_char_boundary(end) {
                        end += 1;
                    }
                }
            }
        }

        let sub = &text[pos..end];
        let sub_newlines = sub.bytes().filter(|b| *b == b'\n').count() as u32;

        out.push(Chunk {
            logical_id: format!("{logical_id}_part{part}"),
            symbol: format!("{symbol}_part{part}"),
            path: path.to_string(),
            language: lang.to_string(),
            range: Range::new(cur_line, cur_line + sub_newlines, byte_start + pos, byte_start + end),
            content: sub.to_string(),
            content_hash: sha256_hex(sub.as_bytes()),
            sig_hash: sig_hash.to_string(),
            neighbors: Vec::new(),
            block_id: block_id.clone(),
            block_range,
            meta: Map::new(),
        });

        cur_line += sub_newlines;
        pos = end;
        part += 1;
    }

    if out.len() > 1 {
        warn!(path, parts = out.len(), "split oversized chunk at line boundaries");
    }
    out
}
