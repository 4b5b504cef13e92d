//! Simple/advanced graph views
//!
//! The simple view shows only "meaningful" elements (sources, inference,
//! outputs) and hides technical plumbing (queues, converters, caps).
//! Hidden nodes are bridged: if A → hidden → hidden → B, the simple view
//! carries a direct edge A → B. Edits made on the simple view are merged
//! back strictly: only property changes on retained nodes are accepted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::env;

use regex::Regex;
use tracing::debug;

use crate::error::MergeError;
use crate::graph::{Edge, Graph, Node};

/// Environment override for the visible-element patterns, comma-separated.
pub const VISIBLE_ELEMENTS_ENV: &str = "SIMPLE_VIEW_VISIBLE_ELEMENTS";

const DEFAULT_VISIBLE_ELEMENTS: &str = "*src,urisourcebin,gva*,*sink";

/// Wildcard visibility rules for the simple view.
///
/// `*` matches any run of characters; matches are anchored to the full
/// element type. Caps nodes are always hidden regardless of the patterns.
#[derive(Debug, Clone)]
pub struct ViewConfig {
    regexes: Vec<Regex>,
}

impl ViewConfig {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let regexes = patterns
            .into_iter()
            .filter_map(|p| compile_wildcard(p.as_ref().trim()))
            .collect();
        Self { regexes }
    }

    /// Read patterns from `SIMPLE_VIEW_VISIBLE_ELEMENTS`, falling back to the
    /// built-in defaults.
    pub fn from_env() -> Self {
        let raw = env::var(VISIBLE_ELEMENTS_ENV)
            .unwrap_or_else(|_| DEFAULT_VISIBLE_ELEMENTS.to_string());
        Self::new(raw.split(','))
    }

    fn is_visible(&self, node: &Node) -> bool {
        if node.is_caps() {
            return false;
        }
        self.regexes.iter().any(|re| re.is_match(&node.node_type))
    }
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self::new(DEFAULT_VISIBLE_ELEMENTS.split(','))
    }
}

/// Anchored regex for a `*` wildcard pattern; literal parts are escaped.
fn compile_wildcard(pattern: &str) -> Option<Regex> {
    if pattern.is_empty() {
        return None;
    }
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$")).ok()
}

fn numeric_id(id: &str) -> u64 {
    id.parse().unwrap_or(u64::MAX)
}

/// Derive the simple view of `graph`.
///
/// Visible node ids are preserved; edge ids are reassigned sequentially from
/// 0, sources in ascending numeric node-id order and targets within each
/// source likewise.
pub fn to_simple_view(graph: &Graph, config: &ViewConfig) -> Graph {
    let visible_ids: HashSet<&str> = graph
        .nodes
        .iter()
        .filter(|n| config.is_visible(n))
        .map(|n| n.id.as_str())
        .collect();
    debug!(visible = visible_ids.len(), total = graph.nodes.len(), "computed visibility");

    let mut edges_from: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &graph.edges {
        edges_from
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    let mut simple_nodes: Vec<Node> = graph
        .nodes
        .iter()
        .filter(|n| visible_ids.contains(n.id.as_str()))
        .cloned()
        .collect();
    simple_nodes.sort_by_key(|n| numeric_id(&n.id));

    let mut sorted_visible: Vec<&str> = visible_ids.iter().copied().collect();
    sorted_visible.sort_by_key(|id| numeric_id(id));

    let mut simple_edges: Vec<Edge> = Vec::new();
    let mut edge_id = 0usize;

    for source_id in sorted_visible {
        let mut targets: Vec<&str> =
            find_visible_targets(source_id, &edges_from, &visible_ids).into_iter().collect();
        targets.sort_by_key(|id| numeric_id(id));

        for target_id in targets {
            debug!(%source_id, %target_id, edge = edge_id, "created simple view edge");
            simple_edges.push(Edge::new(edge_id.to_string(), source_id, target_id));
            edge_id += 1;
        }
    }

    Graph::new(simple_nodes, simple_edges)
}

/// Breadth-first search from `source_id` that skips, but continues through,
/// hidden nodes, collecting the first visible node on every path. Cycle-safe
/// via a per-search visited set.
fn find_visible_targets<'a>(
    source_id: &str,
    edges_from: &HashMap<&str, Vec<&'a str>>,
    visible_ids: &HashSet<&str>,
) -> HashSet<&'a str> {
    let mut found: HashSet<&str> = HashSet::new();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = edges_from
        .get(source_id)
        .map(|targets| targets.iter().copied().collect())
        .unwrap_or_default();

    while let Some(current) = queue.pop_front() {
        if !visited.insert(current) {
            continue;
        }
        if visible_ids.contains(current) {
            found.insert(current);
        } else if let Some(next) = edges_from.get(current) {
            queue.extend(next.iter().copied());
        }
    }

    found
}

/// Merge simple-view edits back into the advanced graph.
///
/// Structural changes are rejected in root-cause order: node additions, node
/// removals (checked before edges, since removing a node always removes its
/// edges), edge additions, edge removals, edge retargets, node type changes.
/// Surviving property diffs are copied wholesale onto a copy of
/// `original_advanced`; no input is mutated.
pub fn apply_simple_view_changes(
    modified_simple: &Graph,
    original_simple: &Graph,
    original_advanced: &Graph,
) -> Result<Graph, MergeError> {
    let original_node_ids: HashSet<&str> =
        original_simple.nodes.iter().map(|n| n.id.as_str()).collect();
    let modified_node_ids: HashSet<&str> =
        modified_simple.nodes.iter().map(|n| n.id.as_str()).collect();

    let added: Vec<&str> = sorted_difference(&modified_node_ids, &original_node_ids);
    if !added.is_empty() {
        return Err(MergeError::NodesAdded {
            ids: added.join(", "),
        });
    }

    let removed: Vec<&str> = sorted_difference(&original_node_ids, &modified_node_ids);
    if !removed.is_empty() {
        return Err(MergeError::NodesRemoved {
            ids: removed.join(", "),
        });
    }

    let original_edges: HashMap<&str, &Edge> = original_simple
        .edges
        .iter()
        .map(|e| (e.id.as_str(), e))
        .collect();
    let modified_edges: HashMap<&str, &Edge> = modified_simple
        .edges
        .iter()
        .map(|e| (e.id.as_str(), e))
        .collect();

    let original_edge_ids: HashSet<&str> = original_edges.keys().copied().collect();
    let modified_edge_ids: HashSet<&str> = modified_edges.keys().copied().collect();

    let added_edges = sorted_difference(&modified_edge_ids, &original_edge_ids);
    if !added_edges.is_empty() {
        let details: Vec<String> = added_edges
            .iter()
            .map(|id| {
                let e = modified_edges[id];
                format!("id={id} ({} -> {})", e.source, e.target)
            })
            .collect();
        return Err(MergeError::EdgesAdded {
            details: details.join(", "),
        });
    }

    let removed_edges = sorted_difference(&original_edge_ids, &modified_edge_ids);
    if !removed_edges.is_empty() {
        let details: Vec<String> = removed_edges
            .iter()
            .map(|id| {
                let e = original_edges[id];
                format!("id={id} ({} -> {})", e.source, e.target)
            })
            .collect();
        return Err(MergeError::EdgesRemoved {
            details: details.join(", "),
        });
    }

    let mut retarget_details: Vec<String> = Vec::new();
    let mut sorted_edge_ids: Vec<&str> = original_edge_ids.iter().copied().collect();
    sorted_edge_ids.sort_unstable();
    for id in sorted_edge_ids {
        let original = original_edges[id];
        let modified = modified_edges[id];
        if original.source != modified.source || original.target != modified.target {
            retarget_details.push(format!(
                "id={id} changed from ({} -> {}) to ({} -> {})",
                original.source, original.target, modified.source, modified.target
            ));
        }
    }
    if !retarget_details.is_empty() {
        return Err(MergeError::EdgesModified {
            details: retarget_details.join(", "),
        });
    }

    let original_nodes: HashMap<&str, &Node> = original_simple
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), n))
        .collect();
    let modified_nodes: HashMap<&str, &Node> = modified_simple
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), n))
        .collect();

    let mut changed_ids: Vec<&str> = Vec::new();
    let mut sorted_node_ids: Vec<&str> = modified_node_ids.iter().copied().collect();
    sorted_node_ids.sort_unstable();
    for id in sorted_node_ids {
        let original = original_nodes[id];
        let modified = modified_nodes[id];

        if original.node_type != modified.node_type {
            return Err(MergeError::NodeTypeChanged {
                id: id.to_string(),
                original: original.node_type.clone(),
                modified: modified.node_type.clone(),
            });
        }
        if original.data != modified.data {
            debug!(node = id, "property changes detected");
            changed_ids.push(id);
        }
    }

    let mut result = original_advanced.clone();
    for id in changed_ids {
        let Some(node) = result.nodes.iter_mut().find(|n| n.id == id) else {
            return Err(MergeError::NodeMissingInAdvanced { id: id.to_string() });
        };
        node.data = modified_nodes[id].data.clone();
        debug!(node = id, "applied property changes to advanced node");
    }

    Ok(result)
}

fn sorted_difference<'a>(left: &HashSet<&'a str>, right: &HashSet<&'a str>) -> Vec<&'a str> {
    let mut diff: Vec<&str> = left.difference(right).copied().collect();
    diff.sort_unstable();
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::Parser;
    use crate::resources::Resources;

    fn parse(description: &str) -> Graph {
        let resources = Resources::empty();
        Parser::new(&resources).parse(description).unwrap()
    }

    fn edge_pairs(graph: &Graph) -> Vec<(String, String)> {
        graph
            .edges
            .iter()
            .map(|e| (e.source.clone(), e.target.clone()))
            .collect()
    }

    #[test]
    fn wildcard_patterns_anchor_to_full_type() {
        let config = ViewConfig::new(["*src", "gva*"]);
        assert!(config.is_visible(&Node::element("0", "filesrc")));
        assert!(config.is_visible(&Node::element("0", "gvadetect")));
        assert!(!config.is_visible(&Node::element("0", "filesrc0extra")));
        assert!(!config.is_visible(&Node::element("0", "queue")));
    }

    #[test]
    fn caps_nodes_are_always_hidden() {
        let config = ViewConfig::new(["*"]);
        let caps = Node::caps("0", "video/x-raw", crate::graph::PropertyMap::new());
        assert!(!config.is_visible(&caps));
    }

    #[test]
    fn hidden_chain_is_bridged_with_direct_edge() {
        let graph = parse("filesrc ! decodebin ! queue ! gvadetect ! queue ! fakesink");
        let simple = to_simple_view(&graph, &ViewConfig::default());

        let types: Vec<&str> = simple.nodes.iter().map(|n| n.node_type.as_str()).collect();
        assert_eq!(types, vec!["filesrc", "gvadetect", "fakesink"]);
        // Visible ids preserved from the advanced graph.
        let ids: Vec<&str> = simple.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "3", "5"]);

        assert_eq!(
            edge_pairs(&simple),
            vec![
                ("0".to_string(), "3".to_string()),
                ("3".to_string(), "5".to_string())
            ]
        );
        let edge_ids: Vec<&str> = simple.edges.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(edge_ids, vec!["0", "1"]);
    }

    #[test]
    fn caps_between_elements_are_bridged() {
        let graph = parse("videotestsrc ! video/x-raw,width=320 ! fakesink");
        let simple = to_simple_view(&graph, &ViewConfig::default());
        assert_eq!(simple.nodes.len(), 2);
        assert_eq!(edge_pairs(&simple), vec![("0".to_string(), "2".to_string())]);
    }

    #[test]
    fn hidden_tee_preserves_fanout() {
        let graph = parse("filesrc ! tee name=t ! queue ! fakesink t. ! queue ! filesink");
        let simple = to_simple_view(&graph, &ViewConfig::default());

        // The tee and queues vanish but the source still reaches both sinks.
        assert_eq!(
            edge_pairs(&simple),
            vec![
                ("0".to_string(), "3".to_string()),
                ("0".to_string(), "5".to_string())
            ]
        );
    }

    #[test]
    fn already_simple_graph_is_stable_modulo_edge_ids() {
        let graph = parse("filesrc ! gvadetect ! fakesink");
        let simple = to_simple_view(&graph, &ViewConfig::default());
        assert_eq!(simple.nodes, graph.nodes);
        assert_eq!(edge_pairs(&simple), edge_pairs(&graph));

        let again = to_simple_view(&simple, &ViewConfig::default());
        assert_eq!(again, simple);
    }

    #[test]
    fn fully_hidden_path_drops_the_edge() {
        let graph = parse("filesrc ! queue ! queue");
        let simple = to_simple_view(&graph, &ViewConfig::default());
        assert_eq!(simple.nodes.len(), 1);
        assert!(simple.edges.is_empty());
    }

    fn merge_fixture() -> (Graph, Graph) {
        let advanced = parse("filesrc location=a ! decodebin ! gvadetect model=m ! fakesink");
        let simple = to_simple_view(&advanced, &ViewConfig::default());
        (advanced, simple)
    }

    #[test]
    fn identical_views_return_the_advanced_graph_unchanged() {
        let (advanced, simple) = merge_fixture();
        let merged = apply_simple_view_changes(&simple, &simple, &advanced).unwrap();
        assert_eq!(merged, advanced);
    }

    #[test]
    fn property_edits_are_applied_to_the_advanced_graph() {
        let (advanced, simple) = merge_fixture();
        let mut edited = simple.clone();
        edited
            .nodes
            .iter_mut()
            .find(|n| n.node_type == "gvadetect")
            .unwrap()
            .data
            .insert("model", "other");

        let merged = apply_simple_view_changes(&edited, &simple, &advanced).unwrap();
        let detect = merged.nodes.iter().find(|n| n.node_type == "gvadetect").unwrap();
        assert_eq!(detect.data.get("model"), Some("other"));
        // Untouched nodes keep their data.
        assert_eq!(merged.nodes[0].data.get("location"), advanced.nodes[0].data.get("location"));
    }

    #[test]
    fn node_addition_is_rejected() {
        let (advanced, simple) = merge_fixture();
        let mut edited = simple.clone();
        edited.nodes.push(Node::element("99", "fakesink"));

        let err = apply_simple_view_changes(&edited, &simple, &advanced).unwrap_err();
        assert!(err.to_string().contains("Node additions"));
        assert!(err.to_string().contains("99"));
    }

    #[test]
    fn node_removal_is_reported_before_edge_removal() {
        let (advanced, simple) = merge_fixture();
        let mut edited = simple.clone();
        let removed_id = edited.nodes.pop().unwrap().id;
        edited.edges.retain(|e| e.target != removed_id);

        let err = apply_simple_view_changes(&edited, &simple, &advanced).unwrap_err();
        assert!(err.to_string().contains("Node removals"));
    }

    #[test]
    fn edge_addition_is_rejected_with_endpoints() {
        let (advanced, simple) = merge_fixture();
        let mut edited = simple.clone();
        edited.edges.push(Edge::new("50", "0", "3"));

        let err = apply_simple_view_changes(&edited, &simple, &advanced).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Edge additions"));
        assert!(msg.contains("id=50"));
    }

    #[test]
    fn edge_retarget_is_rejected() {
        let (advanced, simple) = merge_fixture();
        let mut edited = simple.clone();
        edited.edges[0].target = edited.nodes.last().unwrap().id.clone();

        let err = apply_simple_view_changes(&edited, &simple, &advanced).unwrap_err();
        assert!(err.to_string().contains("Edge modifications"));
    }

    #[test]
    fn node_type_change_is_rejected() {
        let (advanced, simple) = merge_fixture();
        let mut edited = simple.clone();
        edited.nodes[0].node_type = "urisourcebin".to_string();

        let err = apply_simple_view_changes(&edited, &simple, &advanced).unwrap_err();
        assert!(err.to_string().contains("Node type changes"));
    }

    #[test]
    fn inputs_are_never_mutated() {
        let (advanced, simple) = merge_fixture();
        let mut edited = simple.clone();
        edited.nodes[0].data.insert("location", "b");

        let advanced_before = advanced.clone();
        let simple_before = simple.clone();
        let edited_before = edited.clone();

        apply_simple_view_changes(&edited, &simple, &advanced).unwrap();

        assert_eq!(advanced, advanced_before);
        assert_eq!(simple, simple_before);
        assert_eq!(edited, edited_before);
    }
}
