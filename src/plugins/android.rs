use std::sync::LazyLock;

use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;
use serde_json::{Map, Value, json};
use tracing::debug;

use super::edges::{Edge, EdgeType, dedupe_edges, normalize_id, normalize_layout_target};
use super::{ChunkPlugin, PayloadPlugin};
use crate::index::chunker::{Chunk, Range};
use crate::index::hasher::sha256_hex;

/// Minimal XML tree for attribute/structure extraction. Attribute and
/// element lookups match on the local name so `android:`/`app:` prefixes
/// and unprefixed attributes are treated alike.
struct XmlNode {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<XmlNode>,
}

impl XmlNode {
    fn local_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }

    fn attr(&self, local: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.rsplit(':').next().unwrap_or(k) == local)
            .map(|(_, v)| v.as_str())
    }

    fn descendants(&self) -> Vec<&XmlNode> {
        fn visit<'a>(node: &'a XmlNode, out: &mut Vec<&'a XmlNode>) {
            for child in &node.children {
                out.push(child);
                visit(child, out);
            }
        }
        let mut out = Vec::new();
        visit(self, &mut out);
        out
    }

    fn find_descendants(&self, local: &str) -> Vec<&XmlNode> {
        self.descendants().into_iter().filter(|n| n.local_name() == local).collect()
    }
}

fn parse_xml(src: &str) -> Option<XmlNode> {
    let mut reader = Reader::from_str(src);
    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    fn node_from(e: &quick_xml::events::BytesStart) -> XmlNode {
        let attrs = e
            .attributes()
            .filter_map(|a| a.ok())
            .map(|a| {
                let key = String::from_utf8_lossy(a.key.as_ref()).to_string();
                let value = a.unescape_value().map(|v| v.to_string()).unwrap_or_default();
                (key, value)
            })
            .collect();
        XmlNode {
            name: String::from_utf8_lossy(e.name().as_ref()).to_string(),
            attrs,
            children: Vec::new(),
        }
    }

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(node_from(&e)),
            Ok(Event::Empty(e)) => {
                let node = node_from(&e);
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None if root.is_none() => root = Some(node),
                    None => {}
                }
            }
            Ok(Event::End(_)) => {
                let node = stack.pop()?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None if root.is_none() => root = Some(node),
                    None => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(%err, "unparseable xml");
                return None;
            }
        }
    }

    if stack.is_empty() { root } else { None }
}

fn file_stem(path: &str) -> String {
    std::path::Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
        .to_string()
}

fn file_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
        .to_string()
}

fn sorted_set(values: Vec<String>) -> Vec<String> {
    let mut values = values;
    values.sort();
    values.dedup();
    values
}

/// Android-aware chunk plugin: emits one synthetic summary chunk per
/// manifest, layout and navigation XML so those files are searchable as a
/// whole and carry structured metadata into the payload stage.
pub struct AndroidChunkPlugin;

impl ChunkPlugin for AndroidChunkPlugin {
    fn supports(&self, path: &str, stack_type: Option<&str>) -> bool {
        if let Some(stack) = stack_type {
            if stack != "android_app" {
                return false;
            }
        }
        let is_xml = path.to_lowercase().ends_with(".xml");
        is_xml
            && (path.contains("/res/layout/")
                || path.contains("/res/navigation/")
                || path.ends_with("AndroidManifest.xml"))
    }

    fn extra_chunks(&self, src: &str, path: &str, repo: &str) -> Vec<Chunk> {
        let Some(meta) = extract_meta(src, path) else {
            return Vec::new();
        };
        let content = meta.get("summary").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let kind = meta.get("kind").and_then(|v| v.as_str()).unwrap_or("xml");
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| file_name(path));

        let symbol = format!("android:{kind}:{name}");
        let logical_id = format!("{repo}:{path}#{symbol}");
        let lines = content.matches('\n').count() as u32 + 1;

        vec![Chunk {
            logical_id,
            sig_hash: sha256_hex(symbol.as_bytes()),
            symbol,
            path: path.to_string(),
            language: "xml".to_string(),
            range: Range::new(1, lines, 0, content.len()),
            content_hash: sha256_hex(content.as_bytes()),
            content,
            neighbors: Vec::new(),
            block_id: None,
            block_range: None,
            meta,
        }]
    }
}

/// Pull structured metadata out of an Android XML file. Returns None when
/// the document doesn't parse; the file then simply gets no summary chunk.
fn extract_meta(src: &str, path: &str) -> Option<Map<String, Value>> {
    let root = parse_xml(src)?;

    let mut meta = Map::new();
    let mut edges: Vec<Edge> = Vec::new();
    let mut summary_lines: Vec<String> = vec![format!("<{} ... />", root.name)];
    let mut kind = "xml";
    let mut name = file_name(path);

    if path.ends_with("AndroidManifest.xml") {
        kind = "manifest";
        name = root
            .attr("package")
            .or_else(|| root.attr("name"))
            .unwrap_or("app")
            .to_string();
        let mut components: Vec<Value> = Vec::new();
        for tag in ["activity", "activity-alias", "service", "receiver", "provider"] {
            for node in root.find_descendants(tag) {
                let Some(comp_name) = node.attr("name") else { continue };
                let mut comp = Map::new();
                comp.insert("type".into(), json!(tag));
                comp.insert("name".into(), json!(comp_name));
                if let Some(label) = node.attr("label") {
                    comp.insert("label".into(), json!(label));
                }
                let actions: Vec<&str> = node
                    .find_descendants("intent-filter")
                    .iter()
                    .flat_map(|f| f.find_descendants("action"))
                    .filter_map(|a| a.attr("name"))
                    .collect();
                let categories: Vec<&str> = node
                    .find_descendants("intent-filter")
                    .iter()
                    .flat_map(|f| f.find_descendants("category"))
                    .filter_map(|c| c.attr("name"))
                    .collect();
                if !actions.is_empty() {
                    comp.insert("actions".into(), json!(actions));
                }
                if !categories.is_empty() {
                    comp.insert("categories".into(), json!(categories));
                }
                components.push(Value::Object(comp));
            }
        }
        summary_lines = vec![format!("manifest package={name}")];
        for comp in &components {
            let ctype = comp["type"].as_str().unwrap_or_default();
            let cname = comp["name"].as_str().unwrap_or_default();
            let actions = comp
                .get("actions")
                .and_then(|a| a.as_array())
                .map(|a| {
                    let joined: Vec<&str> = a.iter().filter_map(|v| v.as_str()).collect();
                    format!(" actions={}", joined.join(","))
                })
                .unwrap_or_default();
            summary_lines.push(format!("{ctype} {cname}{actions}"));
        }
        meta.insert("components".into(), Value::Array(components));
    } else if path.contains("/res/layout/") {
        kind = "layout";
        name = file_stem(path);
        let mut view_ids: Vec<String> = Vec::new();
        let mut fragment_tags: Vec<String> = Vec::new();
        for node in root.descendants() {
            if let Some(id) = node.attr("id").and_then(normalize_attr_id) {
                view_ids.push(id);
            }
            if node.local_name() == "fragment" {
                if let Some(frag) = node.attr("name") {
                    fragment_tags.push(frag.to_string());
                }
                if let Some(id) = node.attr("id").and_then(normalize_attr_id) {
                    fragment_tags.push(id);
                }
            }
        }
        let viewmodel = root
            .find_descendants("variable")
            .into_iter()
            .find_map(|v| v.attr("type"))
            .map(str::to_string);

        let view_ids = sorted_set(view_ids);
        let fragment_tags = sorted_set(fragment_tags);
        summary_lines = vec![format!("layout {name}")];
        if !view_ids.is_empty() {
            summary_lines.push(format!("ids: {}", view_ids.join(", ")));
        }
        if !fragment_tags.is_empty() {
            summary_lines.push(format!("fragments: {}", fragment_tags.join(", ")));
        }
        if let Some(vm) = &viewmodel {
            summary_lines.push(format!("viewmodel: {vm}"));
            edges.push(Edge::new(EdgeType::UsesViewmodel, vm.clone()));
        }
        meta.insert("layout_file".into(), json!(name));
        meta.insert("view_ids".into(), json!(view_ids));
        meta.insert("fragment_tags".into(), json!(fragment_tags));
        if let Some(vm) = viewmodel {
            meta.insert("viewmodel_class".into(), json!(vm));
        }
    } else if path.contains("/res/navigation/") {
        kind = "navgraph";
        name = file_stem(path);
        let nav_id = root.attr("id").and_then(normalize_attr_id).unwrap_or_else(|| name.clone());
        let start_dest = root.attr("startDestination").and_then(normalize_attr_id);
        let mut destinations: Vec<String> = Vec::new();
        let mut actions: Vec<Value> = Vec::new();
        for node in &root.children {
            let dest_id = node.attr("id").and_then(normalize_attr_id);
            if let Some(dest) = &dest_id {
                destinations.push(dest.clone());
                edges.push(Edge::new(EdgeType::NavDestination, dest.clone()));
            }
            for action in node.find_descendants("action") {
                let Some(target) = action.attr("destination").and_then(normalize_attr_id) else {
                    continue;
                };
                let act_id = action.attr("id").and_then(normalize_attr_id);
                let source = dest_id.clone().unwrap_or_else(|| node.local_name().to_string());
                actions.push(json!({ "id": act_id, "from": source, "to": target }));
                let mut edge_meta = Map::new();
                edge_meta.insert("source".into(), json!(source));
                edge_meta.insert("id".into(), json!(act_id));
                edges.push(Edge::with_meta(EdgeType::NavAction, target, edge_meta));
            }
        }
        summary_lines = vec![format!("navgraph {nav_id}")];
        if let Some(start) = &start_dest {
            summary_lines.push(format!("start: {start}"));
        }
        let destinations = sorted_set(destinations);
        if !destinations.is_empty() {
            summary_lines.push(format!("destinations: {}", destinations.join(", ")));
        }
        if !actions.is_empty() {
            let pairs: Vec<String> = actions
                .iter()
                .map(|a| {
                    format!(
                        "{}->{}",
                        a["from"].as_str().unwrap_or_default(),
                        a["to"].as_str().unwrap_or_default()
                    )
                })
                .collect();
            summary_lines.push(format!("actions: {}", pairs.join(", ")));
        }
        meta.insert("nav_graph_id".into(), json!(nav_id));
        meta.insert("destinations".into(), json!(destinations));
        meta.insert("actions".into(), Value::Array(actions));
        if let Some(start) = start_dest {
            meta.insert("start_destination".into(), json!(start));
        }
    }

    meta.insert("kind".into(), json!(kind));
    meta.insert("name".into(), json!(name));
    meta.insert("summary".into(), json!(summary_lines.join("\n")));
    if !edges.is_empty() {
        meta.insert("edges".into(), serde_json::to_value(dedupe_edges(edges)).unwrap_or_default());
    }
    Some(meta)
}

fn normalize_attr_id(value: &str) -> Option<String> {
    normalize_id(value)
}

static RE_LAYOUT_BIND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"R\.layout\.([A-Za-z0-9_]+)").unwrap());
static RE_NAVIGATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"navigate\(\s*R\.id\.([A-Za-z0-9_]+)").unwrap());
static RE_START_ACTIVITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"startActivity\([^)]*?([A-Za-z0-9_]+Activity)").unwrap());
static RE_API_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z0-9_]+(?:Api|Service))\.([A-Za-z0-9_]+)\(").unwrap());

/// Attaches Android-specific payload fields and structural edges: component
/// classification, screen/layout/navgraph names, tags, and edges extracted
/// from plugin metadata plus regex heuristics over Kotlin/Java sources.
pub struct AndroidPayloadPlugin {
    stack_type: String,
}

impl AndroidPayloadPlugin {
    pub fn new(stack_type: impl Into<String>) -> Self {
        Self { stack_type: stack_type.into() }
    }
}

fn set_if_absent(payload: &mut Map<String, Value>, key: &str, value: String) {
    if !payload.contains_key(key) {
        payload.insert(key.to_string(), Value::String(value));
    }
}

impl PayloadPlugin for AndroidPayloadPlugin {
    fn build_payload(&self, chunk: &Chunk, _branch: &str, _commit_sha: &str) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("stack_type".into(), json!(self.stack_type));
        let mut stack_meta = Map::new();
        let mut tags: Vec<String> = Vec::new();
        let mut edges: Vec<Edge> = Vec::new();

        let meta = &chunk.meta;
        let kind = meta.get("kind").and_then(|v| v.as_str());

        if kind == Some("manifest") {
            payload.insert("component_type".into(), json!("manifest"));
            tags.push("manifest".into());
            if let Some(components) = meta.get("components") {
                stack_meta.insert("components".into(), components.clone());
            }
        }
        if kind == Some("layout") {
            set_if_absent(&mut payload, "component_type", "layout".into());
            let layout_name = meta
                .get("layout_file")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| file_stem(&chunk.path));
            payload.insert("layout_file".into(), json!(layout_name));
            set_if_absent(&mut payload, "screen_name", layout_name);
            tags.push("layout".into());
            for key in ["view_ids", "fragment_tags", "viewmodel_class"] {
                if let Some(value) = meta.get(key) {
                    stack_meta.insert(key.into(), value.clone());
                }
            }
        }
        if kind == Some("navgraph") {
            set_if_absent(&mut payload, "component_type", "navgraph".into());
            if let Some(nav_id) = meta.get("nav_graph_id").and_then(|v| v.as_str()) {
                payload.insert("nav_graph_id".into(), json!(nav_id));
                set_if_absent(&mut payload, "screen_name", nav_id.to_string());
            }
            tags.push("navgraph".into());
            if let Some(dests) = meta.get("destinations") {
                stack_meta.insert("destinations".into(), dests.clone());
            }
            if let Some(actions) = meta.get("actions") {
                stack_meta.insert("nav_actions".into(), actions.clone());
            }
            if let Some(start) = meta.get("start_destination") {
                stack_meta.insert("start_destination".into(), start.clone());
            }
        }

        // Path-based fallbacks for chunks that carry no plugin metadata
        // (e.g. generic-chunked XML bodies).
        let path = chunk.path.as_str();
        if path.ends_with("AndroidManifest.xml") {
            set_if_absent(&mut payload, "component_type", "manifest".into());
            tags.push("manifest".into());
        }
        if path.contains("/res/layout/") && !payload.contains_key("layout_file") {
            let layout_name = file_stem(path);
            payload.insert("layout_file".into(), json!(layout_name));
            set_if_absent(&mut payload, "screen_name", layout_name);
            set_if_absent(&mut payload, "component_type", "layout".into());
            tags.push("layout".into());
        }
        if path.contains("/res/navigation/") && !payload.contains_key("nav_graph_id") {
            let nav_id = file_stem(path);
            payload.insert("nav_graph_id".into(), json!(nav_id));
            set_if_absent(&mut payload, "screen_name", nav_id);
            set_if_absent(&mut payload, "component_type", "navgraph".into());
            tags.push("navgraph".into());
        }

        let symbol = chunk.symbol.to_lowercase();
        if let Some(class_name) = symbol.strip_prefix("class:") {
            if class_name.ends_with("activity") {
                set_if_absent(&mut payload, "component_type", "activity".into());
            }
            if class_name.ends_with("fragment") {
                set_if_absent(&mut payload, "component_type", "fragment".into());
            }
            set_if_absent(&mut payload, "screen_name", class_name.to_string());
        }

        // Heuristic edge extraction from source content.
        let is_code = path.ends_with(".kt") || path.ends_with(".java");
        if !chunk.content.is_empty() && (is_code || kind.is_none() || kind == Some("xml")) {
            for caps in RE_LAYOUT_BIND.captures_iter(&chunk.content) {
                if let Some(target) = normalize_layout_target(&caps[1]) {
                    edges.push(Edge::new(EdgeType::BindsLayout, target));
                }
            }
            for caps in RE_NAVIGATE.captures_iter(&chunk.content) {
                if let Some(target) = normalize_id(&caps[1]) {
                    edges.push(Edge::new(EdgeType::NavigatesTo, target));
                }
            }
            for caps in RE_START_ACTIVITY.captures_iter(&chunk.content) {
                if let Some(target) = normalize_id(&caps[1]) {
                    edges.push(Edge::new(EdgeType::NavigatesTo, target));
                }
            }
            for caps in RE_API_CALL.captures_iter(&chunk.content) {
                edges.push(Edge::new(EdgeType::CallsApi, format!("{}.{}", &caps[1], &caps[2])));
            }
        }

        if let Some(summary) = meta.get("summary").and_then(|v| v.as_str()) {
            payload.insert("stack_text".into(), json!(summary));
        }
        if let Some(meta_edges) = meta.get("edges") {
            if let Ok(parsed) = serde_json::from_value::<Vec<Edge>>(meta_edges.clone()) {
                edges.extend(parsed);
            }
        }
        if !edges.is_empty() {
            payload.insert(
                "edges".into(),
                serde_json::to_value(dedupe_edges(edges)).unwrap_or_default(),
            );
        }
        if !stack_meta.is_empty() {
            payload.insert("stack_meta".into(), Value::Object(stack_meta));
        }
        if !tags.is_empty() {
            payload.insert("tags".into(), json!(sorted_set(tags)));
        }

        // screen_name filters are case-insensitive by construction.
        if let Some(Value::String(screen)) = payload.get_mut("screen_name") {
            *screen = screen.to_lowercase();
        }

        payload
    }
}
