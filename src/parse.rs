//! Pipeline description parsing
//!
//! Splits a GStreamer-style launch string on `!` into segments, classifies
//! each segment as a caps constraint or a processing element, and builds the
//! editable graph. Caps detection is explicit: a segment is caps
//! iff it contains a comma and every part after the first is a well-formed
//! `key=value`. Segments without commas are always elements, regardless of
//! slashes or parentheses in the name.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::ParseError;
use crate::graph::{Edge, Graph, Node, PropertyMap};
use crate::resources::{DirectoryResources, MediaLibrary, ModelCatalog, Resources};

/// Branch element: fans its input out to multiple downstream chains.
pub(crate) const TEE_ELEMENT: &str = "tee";

/// Elements whose `labels`/`labels-file` properties reference label files.
pub(crate) const INFERENCE_ELEMENTS: [&str; 2] = ["gvadetect", "gvaclassify"];

/// Element whose `module` property references a script file.
pub(crate) const SCRIPT_ELEMENT: &str = "gvapython";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    /// Element type token, e.g. `filesrc`.
    Type,
    /// `key=value` property.
    Property,
    /// Branch endpoint reference, e.g. `t.`.
    BranchEnd,
    /// Anything unrecognized; aborts parsing.
    Mismatch,
}

#[derive(Debug)]
struct Token {
    kind: TokenKind,
    value: String,
}

// Alternation order matters: properties before branch endpoints before the
// bare-word catch-all. Whitespace is consumed and filtered out.
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?P<property>\S+\s*=\s*\S+)",
        r"|(?P<branch_end>\S+\.(?:\s|$))",
        r"|(?P<element_type>\S+)",
        r"|(?P<skip>\s+)",
        r"|(?P<mismatch>.)",
    ))
    .expect("token pattern is valid")
});

static PROPERTY_SPLIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*=\s*").expect("property split pattern is valid"));

/// Tokenize a non-caps segment into TYPE/PROPERTY/BRANCH_END tokens.
fn tokenize(segment: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for caps in TOKEN_RE.captures_iter(segment) {
        let (kind, m) = if let Some(m) = caps.name("property") {
            (TokenKind::Property, m)
        } else if let Some(m) = caps.name("branch_end") {
            (TokenKind::BranchEnd, m)
        } else if let Some(m) = caps.name("element_type") {
            (TokenKind::Type, m)
        } else if caps.name("skip").is_some() {
            continue;
        } else {
            let m = caps.name("mismatch").expect("one alternative matches");
            (TokenKind::Mismatch, m)
        };

        tokens.push(Token {
            kind,
            value: m.as_str().trim().to_string(),
        });
    }
    tokens
}

/// Try to read a whole segment as a caps constraint.
///
/// Returns `Ok(None)` for segments that are not caps; a comma-bearing segment
/// that fails the `base,key=value,...` shape is a hard error, never silently
/// coerced into an element.
fn classify_caps_segment(segment: &str) -> Result<Option<(String, PropertyMap)>, ParseError> {
    let text = segment.trim();
    if text.is_empty() || !text.contains(',') {
        return Ok(None);
    }

    let parts: Vec<&str> = text.split(',').map(str::trim).collect();
    if parts[0].is_empty() {
        return Err(ParseError::CapsEmptyBase {
            segment: segment.to_string(),
        });
    }

    let base = parts[0].to_string();
    let mut props = PropertyMap::new();

    for raw_prop in &parts[1..] {
        if raw_prop.is_empty() {
            return Err(ParseError::CapsEmptyProperty {
                segment: segment.to_string(),
            });
        }
        let Some((key, value)) = raw_prop.split_once('=') else {
            return Err(ParseError::CapsMissingEquals {
                segment: segment.to_string(),
                property: raw_prop.to_string(),
            });
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            return Err(ParseError::CapsEmptyKeyOrValue {
                segment: segment.to_string(),
                property: raw_prop.to_string(),
            });
        }
        props.insert(key, value);
    }

    Ok(Some((base, props)))
}

/// Token context carried across segments; edge-source selection needs to know
/// whether the previous token was a branch endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrevToken {
    Caps,
    Type,
    Property,
    BranchEnd,
}

#[derive(Default)]
struct GraphBuilder {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    /// Branch-origin node ids awaiting their endpoint references.
    tee_stack: Vec<String>,
    /// Independent of node ids; unique across the whole graph.
    next_edge_id: usize,
}

impl GraphBuilder {
    /// Shared edge-source rule: the first node gets no incoming edge; every
    /// later node connects from its predecessor unless the previous token was
    /// a branch endpoint, in which case the source is popped off the tee
    /// stack. An empty stack there is a malformed pipeline.
    fn connect(&mut self, node_id: usize, prev: Option<PrevToken>) -> Result<(), ParseError> {
        if node_id == 0 {
            return Ok(());
        }

        let source_id = if prev == Some(PrevToken::BranchEnd) {
            self.tee_stack
                .pop()
                .ok_or(ParseError::DanglingBranchEndpoint)?
        } else {
            (node_id - 1).to_string()
        };

        let target_id = node_id.to_string();
        debug!(edge = self.next_edge_id, %source_id, %target_id, "adding edge");
        self.edges.push(Edge::new(
            self.next_edge_id.to_string(),
            source_id,
            target_id,
        ));
        self.next_edge_id += 1;
        Ok(())
    }

    fn add_caps_node(
        &mut self,
        node_id: usize,
        base: String,
        props: PropertyMap,
        prev: Option<PrevToken>,
    ) -> Result<(), ParseError> {
        debug!(node = node_id, %base, "adding caps node");
        self.nodes.push(Node::caps(node_id.to_string(), base, props));
        self.connect(node_id, prev)
    }

    fn add_element_node(
        &mut self,
        node_id: usize,
        element_type: &str,
        prev: Option<PrevToken>,
    ) -> Result<(), ParseError> {
        debug!(node = node_id, %element_type, "adding node");
        self.nodes
            .push(Node::element(node_id.to_string(), element_type));
        self.connect(node_id, prev)?;

        if element_type == TEE_ELEMENT {
            self.tee_stack.push(node_id.to_string());
        }
        Ok(())
    }

    /// Attach a `key=value` property token to the most recently added node.
    fn add_property(&mut self, raw: &str) {
        let Some(node) = self.nodes.last_mut() else {
            warn!("attempted to add property but no nodes exist");
            return;
        };
        let mut parts = PROPERTY_SPLIT_RE.splitn(raw, 2);
        let key = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default();
        node.data.insert(key, value);
    }
}

/// Parses pipeline descriptions into graphs, translating filesystem paths to
/// display names through the injected resource lookups.
pub struct Parser<'r> {
    resources: &'r Resources,
}

impl<'r> Parser<'r> {
    pub fn new(resources: &'r Resources) -> Self {
        Self { resources }
    }

    /// Parse a pipeline description string into a [`Graph`].
    ///
    /// Node ids are assigned sequentially from 0 in segment order; edge ids
    /// come from an independent counter. Tee elements push their id onto a
    /// stack so later `name.` endpoints can fan out from them, nested
    /// branches included.
    pub fn parse(&self, description: &str) -> Result<Graph, ParseError> {
        debug!(%description, "parsing pipeline description");

        let mut builder = GraphBuilder::default();
        let mut prev: Option<PrevToken> = None;
        let mut node_id: usize = 0;

        for raw_segment in description.split('!') {
            let segment = raw_segment.trim();
            if segment.is_empty() {
                // Trailing or duplicate '!' separators.
                continue;
            }

            if let Some((base, props)) = classify_caps_segment(segment)? {
                builder.add_caps_node(node_id, base, props, prev)?;
                prev = Some(PrevToken::Caps);
                node_id += 1;
                continue;
            }

            for token in tokenize(segment) {
                match token.kind {
                    TokenKind::Type => {
                        builder.add_element_node(node_id, &token.value, prev)?;
                        prev = Some(PrevToken::Type);
                    }
                    TokenKind::Property => {
                        builder.add_property(&token.value);
                        prev = Some(PrevToken::Property);
                    }
                    TokenKind::BranchEnd => {
                        // Only affects edge-source selection for the next node.
                        prev = Some(PrevToken::BranchEnd);
                    }
                    TokenKind::Mismatch => {
                        return Err(ParseError::UnrecognizedToken {
                            token: token.value,
                            segment: segment.to_string(),
                        });
                    }
                }
            }

            node_id += 1;
        }

        let mut nodes = builder.nodes;
        model_paths_to_display_names(&mut nodes, self.resources.models.as_ref());
        video_paths_to_filenames(&mut nodes, self.resources.videos.as_ref());
        labels_paths_to_filenames(&mut nodes, &self.resources.labels);
        script_paths_to_filenames(&mut nodes, &self.resources.scripts);

        Ok(Graph::new(nodes, builder.edges))
    }
}

/// Replace model file paths with display names so stored graphs reference
/// logical model identifiers. Unresolved models become empty strings; the
/// `model-proc` path is consulted for the lookup and then dropped to keep
/// the filesystem layout out of stored graphs.
fn model_paths_to_display_names(nodes: &mut [Node], models: &dyn ModelCatalog) {
    for node in nodes {
        let Some(model_path) = node.data.get("model").map(str::to_string) else {
            continue;
        };
        let proc_path = node.data.get("model-proc").map(str::to_string);

        match models.find_by_path_and_proc(&model_path, proc_path.as_deref()) {
            Some(model) => {
                debug!(from = %model_path, to = %model.display_name, "model path resolved");
                node.data.insert("model", model.display_name);
            }
            None => {
                debug!(path = %model_path, "model not found in installed models");
                node.data.insert("model", "");
            }
        }

        node.data.remove("model-proc");
    }
}

/// Replace absolute video paths with filenames for all non-sink nodes.
/// Sinks are skipped so their output paths survive untouched.
fn video_paths_to_filenames(nodes: &mut [Node], videos: &dyn MediaLibrary) {
    for node in nodes {
        if node.is_sink() {
            continue;
        }
        for key in ["source", "location"] {
            let Some(path) = node.data.get(key).map(str::to_string) else {
                continue;
            };
            match videos.filename_for_path(&path) {
                Some(filename) => {
                    debug!(from = %path, to = %filename, "video path resolved");
                    node.data.insert(key, filename);
                }
                None => {
                    debug!(%path, "video path not found");
                    node.data.insert(key, "");
                }
            }
        }
    }
}

fn labels_paths_to_filenames(nodes: &mut [Node], labels: &DirectoryResources) {
    for node in nodes {
        if !INFERENCE_ELEMENTS.contains(&node.node_type.as_str()) {
            continue;
        }
        for key in ["labels", "labels-file"] {
            let Some(path) = node.data.get(key).map(str::to_string) else {
                continue;
            };
            node.data.insert(key, labels.filename_for_path(&path));
        }
    }
}

fn script_paths_to_filenames(nodes: &mut [Node], scripts: &DirectoryResources) {
    for node in nodes {
        if node.node_type != SCRIPT_ELEMENT {
            continue;
        }
        let Some(path) = node.data.get("module").map(str::to_string) else {
            continue;
        };
        node.data.insert("module", scripts.filename_for_path(&path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeKind;
    use crate::resources::{DisplayModel, StaticMediaLibrary, StaticModelCatalog};
    use std::sync::Arc;

    fn parse(description: &str) -> Result<Graph, ParseError> {
        let resources = Resources::empty();
        Parser::new(&resources).parse(description)
    }

    #[test]
    fn linear_pipeline_nodes_and_edges() {
        let graph = parse("videotestsrc num-buffers=10 ! videoconvert ! fakesink").unwrap();

        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.nodes[0].node_type, "videotestsrc");
        assert_eq!(graph.nodes[0].data.get("num-buffers"), Some("10"));
        assert_eq!(graph.nodes[1].node_type, "videoconvert");
        assert_eq!(graph.nodes[2].node_type, "fakesink");

        assert_eq!(graph.edges.len(), 2);
        assert_eq!((graph.edges[0].source.as_str(), graph.edges[0].target.as_str()), ("0", "1"));
        assert_eq!((graph.edges[1].source.as_str(), graph.edges[1].target.as_str()), ("1", "2"));
    }

    #[test]
    fn caps_segment_with_memory_feature() {
        let graph = parse(
            "videotestsrc ! video/x-raw(memory:VAMemory),width=320,height=240 ! fakesink",
        )
        .unwrap();

        let caps = &graph.nodes[1];
        assert_eq!(caps.kind(), NodeKind::Caps);
        assert_eq!(caps.node_type, "video/x-raw(memory:VAMemory)");
        let props: Vec<(&str, &str)> = caps.visible_properties().collect();
        assert_eq!(props, vec![("width", "320"), ("height", "240")]);
    }

    #[test]
    fn caps_with_typed_values() {
        let graph =
            parse("videotestsrc ! video/x-raw,format=(string)UYVY,width=(int)2592 ! fakesink")
                .unwrap();
        let caps = &graph.nodes[1];
        assert_eq!(caps.data.get("format"), Some("(string)UYVY"));
        assert_eq!(caps.data.get("width"), Some("(int)2592"));
    }

    #[test]
    fn segment_without_comma_is_never_caps() {
        let graph = parse("videotestsrc ! video/x-raw(memory:NVMM) ! fakesink").unwrap();
        assert_eq!(graph.nodes[1].kind(), NodeKind::Element);
        assert_eq!(graph.nodes[1].node_type, "video/x-raw(memory:NVMM)");
    }

    #[test]
    fn malformed_caps_name_the_segment() {
        for description in [
            "videotestsrc ! ,width=320 ! fakesink",
            "videotestsrc ! video/x-raw,width ! fakesink",
            "videotestsrc ! video/x-raw,=320 ! fakesink",
            "videotestsrc ! video/x-raw,width= ! fakesink",
        ] {
            let err = parse(description).unwrap_err();
            assert!(
                err.to_string().contains("caps"),
                "expected caps error for {description}, got: {err}"
            );
        }
    }

    #[test]
    fn tee_fans_out_two_edges() {
        let graph =
            parse("filesrc ! tee name=t ! queue ! fakesink t. ! queue ! filesink").unwrap();

        assert_eq!(graph.nodes.len(), 6);
        let tee_id = &graph.nodes[1].id;
        let outgoing: Vec<&Edge> = graph.edges.iter().filter(|e| &e.source == tee_id).collect();
        assert_eq!(outgoing.len(), 2);
        assert_eq!(outgoing[0].target, "2");
        assert_eq!(outgoing[1].target, "4");

        // Edge ids stay unique and sequential across both branches.
        let ids: Vec<&str> = graph.edges.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2", "3", "4"]);
    }

    #[test]
    fn nested_tees_resolve_innermost_first() {
        let graph = parse(
            "filesrc ! tee name=a ! tee name=b ! fakesink b. ! fakesink a. ! fakesink",
        )
        .unwrap();

        // b. pops the inner tee (id 2), a. then pops the outer tee (id 1).
        let b_edge = graph.edges.iter().find(|e| e.target == "4").unwrap();
        assert_eq!(b_edge.source, "2");
        let a_edge = graph.edges.iter().find(|e| e.target == "5").unwrap();
        assert_eq!(a_edge.source, "1");
    }

    #[test]
    fn branch_endpoint_without_tee_is_an_error() {
        let err = parse("filesrc ! fakesink t. ! fakesink").unwrap_err();
        assert!(matches!(err, ParseError::DanglingBranchEndpoint));
    }

    #[test]
    fn consecutive_caps_get_unique_edge_ids() {
        let graph = parse(
            "videotestsrc ! video/x-raw,width=320 ! video/x-raw,width=640 ! fakesink",
        )
        .unwrap();
        assert_eq!(graph.edges.len(), 3);
        let ids: Vec<&str> = graph.edges.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
    }

    #[test]
    fn property_order_is_preserved() {
        let graph = parse("gvadetect model=a device=GPU batch-size=4 ! fakesink").unwrap();
        let keys: Vec<&str> = graph.nodes[0].data.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["model", "device", "batch-size"]);
    }

    #[test]
    fn model_path_translates_to_display_name() {
        let models = StaticModelCatalog::new().with_model(DisplayModel {
            display_name: "YOLOv8 Detector".to_string(),
            path: "/models/yolov8.xml".to_string(),
            proc_path: Some("/models/yolov8.json".to_string()),
        });
        let resources = Resources::new(
            Arc::new(models),
            Arc::new(StaticMediaLibrary::new()),
            DirectoryResources::new("/nonexistent"),
            DirectoryResources::new("/nonexistent"),
        );

        let graph = Parser::new(&resources)
            .parse("gvadetect model=/models/yolov8.xml model-proc=/models/yolov8.json device=GPU ! fakesink")
            .unwrap();

        let detect = &graph.nodes[0];
        assert_eq!(detect.data.get("model"), Some("YOLOv8 Detector"));
        // model-proc never leaks into stored graphs.
        assert_eq!(detect.data.get("model-proc"), None);
    }

    #[test]
    fn unknown_model_becomes_empty_string() {
        let graph = parse("gvadetect model=/models/unknown.xml ! fakesink").unwrap();
        assert_eq!(graph.nodes[0].data.get("model"), Some(""));
    }

    #[test]
    fn video_path_translates_to_filename() {
        let videos = StaticMediaLibrary::new().with_file("sample.mp4", "/videos/input/sample.mp4");
        let resources = Resources::new(
            Arc::new(StaticModelCatalog::new()),
            Arc::new(videos),
            DirectoryResources::new("/nonexistent"),
            DirectoryResources::new("/nonexistent"),
        );

        let graph = Parser::new(&resources)
            .parse("filesrc location=/videos/input/sample.mp4 ! filesink location=/out/result.mp4")
            .unwrap();

        assert_eq!(graph.nodes[0].data.get("location"), Some("sample.mp4"));
        // Sink locations stay untouched.
        assert_eq!(graph.nodes[1].data.get("location"), Some("/out/result.mp4"));
    }

    #[test]
    fn labels_and_script_paths_reduce_to_filenames() {
        let graph = parse(
            "gvadetect labels=/labels/coco.txt ! gvapython module=/scripts/post.py ! fakesink",
        )
        .unwrap();
        assert_eq!(graph.nodes[0].data.get("labels"), Some("coco.txt"));
        assert_eq!(graph.nodes[1].data.get("module"), Some("post.py"));
    }

    #[test]
    fn empty_segments_are_skipped() {
        let graph = parse("videotestsrc !! fakesink !").unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges.len(), 1);
    }
}
