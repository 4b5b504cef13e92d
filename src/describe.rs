//! Graph serialization back into a pipeline description
//!
//! The inverse of [`Parser`](crate::parse::Parser): validates the graph,
//! translates display names back into filesystem paths, then walks each chain
//! from its start node, re-expanding tee branches into `name.` notation.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::DescribeError;
use crate::graph::{Graph, Node, NodeKind};
use crate::parse::{INFERENCE_ELEMENTS, SCRIPT_ELEMENT, TEE_ELEMENT};
use crate::resources::Resources;

/// Serializes graphs into runnable pipeline descriptions, resolving display
/// names through the injected resource lookups.
pub struct Describer<'r> {
    resources: &'r Resources,
}

impl<'r> Describer<'r> {
    pub fn new(resources: &'r Resources) -> Self {
        Self { resources }
    }

    /// Convert `graph` into a pipeline description string.
    ///
    /// The input graph is never mutated; all path translations happen on a
    /// copy of the nodes. Multiple independent chains are emitted in
    /// ascending start-node-id order, joined by a single space.
    pub fn describe(&self, graph: &Graph) -> Result<String, DescribeError> {
        if graph.nodes.is_empty() {
            return Err(DescribeError::EmptyGraph);
        }

        debug!(nodes = graph.nodes.len(), edges = graph.edges.len(), "describing graph");

        let mut nodes = graph.nodes.clone();
        self.validate_models_supported(&nodes)?;
        self.model_display_names_to_paths(&mut nodes)?;
        self.video_filenames_to_paths(&mut nodes)?;
        self.labels_filenames_to_paths(&mut nodes)?;
        self.script_filenames_to_paths(&mut nodes)?;

        let nodes_by_id: HashMap<&str, &Node> =
            nodes.iter().map(|n| (n.id.as_str(), n)).collect();

        let mut edges_from: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &graph.edges {
            edges_from
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
        }

        // Branch names for re-expanding fan-outs into "name." notation.
        let tee_names: HashMap<&str, &str> = nodes
            .iter()
            .filter(|n| n.node_type == TEE_ELEMENT)
            .filter_map(|n| n.data.get("name").map(|name| (n.id.as_str(), name)))
            .collect();

        let target_ids: HashSet<&str> = graph.edges.iter().map(|e| e.target.as_str()).collect();
        let mut start_ids: Vec<&str> = nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| !target_ids.contains(id))
            .collect();
        if start_ids.is_empty() {
            return Err(DescribeError::NoStartNodes);
        }
        start_ids.sort_by_key(|id| numeric_id(id));

        let mut parts: Vec<String> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();

        for start_id in start_ids {
            if !visited.contains(start_id) {
                build_chain(start_id, &nodes_by_id, &edges_from, &tee_names, &mut visited, &mut parts);
            }
        }

        let description = parts.join(" ");
        debug!(%description, "generated pipeline description");
        Ok(description)
    }

    /// Fail early when a node pairs a model with a device it cannot run on,
    /// or references no model at all.
    fn validate_models_supported(&self, nodes: &[Node]) -> Result<(), DescribeError> {
        for node in nodes {
            let Some(name) = node.data.get("model") else {
                continue;
            };
            let Some(device) = node.data.get("device") else {
                continue;
            };

            if name.is_empty() {
                return Err(DescribeError::ModelNotSelected {
                    element: node.node_type.clone(),
                });
            }
            if !self.resources.models.is_supported_on_device(name, device) {
                return Err(DescribeError::ModelNotSupportedOnDevice {
                    element: node.node_type.clone(),
                    name: name.to_string(),
                    device: device.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Translate model display names back into full paths, re-injecting
    /// `model-proc` immediately after `model` so the resulting description
    /// is runnable.
    fn model_display_names_to_paths(&self, nodes: &mut [Node]) -> Result<(), DescribeError> {
        for node in nodes {
            let Some(name) = node.data.get("model").map(str::to_string) else {
                continue;
            };

            let Some(model) = self.resources.models.find_by_display_name(&name) else {
                return Err(DescribeError::ModelNotFound {
                    name,
                    element: node.node_type.clone(),
                });
            };

            node.data.insert("model", model.path.clone());
            if let Some(proc_path) = &model.proc_path {
                node.data.insert_after("model", "model-proc", proc_path.clone());
            }
            debug!(%name, path = %model.path, "model display name resolved");
        }
        Ok(())
    }

    fn video_filenames_to_paths(&self, nodes: &mut [Node]) -> Result<(), DescribeError> {
        for node in nodes {
            if node.is_sink() {
                // Sink locations are owned by the caller.
                continue;
            }
            for key in ["source", "location"] {
                let Some(name) = node.data.get(key).map(str::to_string) else {
                    continue;
                };
                let Some(path) = self.resources.videos.path_for_filename(&name) else {
                    return Err(DescribeError::VideoNotFound {
                        node_id: node.id.clone(),
                        element: node.node_type.clone(),
                        key: key.to_string(),
                        name,
                    });
                };
                node.data.insert(key, path);
            }
        }
        Ok(())
    }

    fn labels_filenames_to_paths(&self, nodes: &mut [Node]) -> Result<(), DescribeError> {
        for node in nodes {
            if !INFERENCE_ELEMENTS.contains(&node.node_type.as_str()) {
                continue;
            }
            for key in ["labels", "labels-file"] {
                let Some(name) = node.data.get(key).map(str::to_string) else {
                    continue;
                };
                let Some(path) = self.resources.labels.path_for_filename(&name) else {
                    return Err(DescribeError::LabelsNotFound {
                        name,
                        element: node.node_type.clone(),
                    });
                };
                node.data.insert(key, path);
            }
        }
        Ok(())
    }

    fn script_filenames_to_paths(&self, nodes: &mut [Node]) -> Result<(), DescribeError> {
        for node in nodes {
            if node.node_type != SCRIPT_ELEMENT {
                continue;
            }
            let Some(name) = node.data.get("module").map(str::to_string) else {
                continue;
            };
            let Some(path) = self.resources.scripts.path_for_filename(&name) else {
                return Err(DescribeError::ScriptNotFound {
                    name,
                    element: node.node_type.clone(),
                });
            };
            node.data.insert("module", path);
        }
        Ok(())
    }
}

fn numeric_id(id: &str) -> u64 {
    id.parse().unwrap_or(u64::MAX)
}

/// Emit the textual fragments for one node.
fn push_node_text(node: &Node, parts: &mut Vec<String>) {
    match node.kind() {
        NodeKind::Caps => {
            // Single comma-joined caps string, discriminator excluded.
            let props: Vec<String> = node
                .visible_properties()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            if props.is_empty() {
                parts.push(node.node_type.clone());
            } else {
                parts.push(format!("{},{}", node.node_type, props.join(",")));
            }
        }
        NodeKind::Element => {
            parts.push(node.node_type.clone());
            for (key, value) in node.data.iter() {
                parts.push(format!("{key}={value}"));
            }
        }
    }
}

/// Work queued while flattening chains: either a chain to walk or a branch
/// endpoint reference to emit before it.
enum WorkItem<'a> {
    Chain(&'a str),
    BranchRef(&'a str),
}

/// Walk forward from `start_id`, appending fragments to `parts`.
///
/// Linear successors are followed in place. At a fan-out the first successor
/// continues inline and each remaining successor is queued behind a
/// `name. !` reference, which reproduces the standard tee notation:
///
/// ```text
/// tee name=t ! queue ! ... t. ! queue ! ...
/// ```
///
/// The `visited` set guards against graphs with redundant back-references.
fn build_chain(
    start_id: &str,
    nodes_by_id: &HashMap<&str, &Node>,
    edges_from: &HashMap<&str, Vec<&str>>,
    tee_names: &HashMap<&str, &str>,
    visited: &mut HashSet<String>,
    parts: &mut Vec<String>,
) {
    let mut work: Vec<WorkItem> = vec![WorkItem::Chain(start_id)];

    while let Some(item) = work.pop() {
        let mut current_id = match item {
            WorkItem::BranchRef(name) => {
                parts.push(format!("{name}."));
                parts.push("!".to_string());
                continue;
            }
            WorkItem::Chain(id) => id,
        };

        loop {
            if visited.contains(current_id) {
                break;
            }
            visited.insert(current_id.to_string());

            let Some(node) = nodes_by_id.get(current_id).copied() else {
                break;
            };
            push_node_text(node, parts);

            let targets = match edges_from.get(current_id) {
                Some(targets) if !targets.is_empty() => targets,
                _ => break,
            };

            parts.push("!".to_string());

            if targets.len() == 1 {
                current_id = targets[0];
                continue;
            }

            // Queue the remaining branches in reverse so they pop in order,
            // each preceded by its endpoint reference.
            let branch_name = tee_names.get(current_id).copied().unwrap_or("t");
            for &target in targets[1..].iter().rev() {
                work.push(WorkItem::Chain(target));
                work.push(WorkItem::BranchRef(branch_name));
            }
            current_id = targets[0];
        }
    }
}
