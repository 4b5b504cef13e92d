//! In-memory pipeline graph model and its JSON wire shape
//!
//! The wire format is shared with the visual editor:
//!
//! ```json
//! {"nodes": [{"id": "0", "type": "filesrc", "data": {"location": "a.mp4"}}],
//!  "edges": [{"id": "0", "source": "0", "target": "1"}]}
//! ```
//!
//! Round-trips through this shape are lossless, including the internal
//! `__node_kind` discriminator inside `data`. The discriminator is stripped
//! only when a description string is produced.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

/// Reserved key inside [`Node::data`] used to mark special node kinds.
///
/// The public node schema cannot grow a new top-level field, so the
/// discriminator travels as a synthetic property the editor treats specially.
/// All in-crate logic goes through [`Node::kind`]; the raw key appears only
/// in this module.
pub const NODE_KIND_KEY: &str = "__node_kind";

const NODE_KIND_CAPS: &str = "caps";

/// Insertion-ordered string-to-string map.
///
/// Property order is significant for description round-trips. Serialized as
/// a JSON object in entry order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyMap {
    entries: Vec<(String, String)>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace. Replacement keeps the key's original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Insert `key` immediately after `anchor`, dropping any existing entry
    /// for `key` so that both its position and value are refreshed. Appends
    /// at the end when the anchor is absent.
    pub fn insert_after(&mut self, anchor: &str, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        self.entries.retain(|(k, _)| *k != key);
        match self.entries.iter().position(|(k, _)| k == anchor) {
            Some(idx) => self.entries.insert(idx + 1, (key, value)),
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for PropertyMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut map = PropertyMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<const N: usize> From<[(&str, &str); N]> for PropertyMap {
    fn from(entries: [(&str, &str); N]) -> Self {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

impl Serialize for PropertyMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PropertyMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PropertyMapVisitor;

        impl<'de> Visitor<'de> for PropertyMapVisitor {
            type Value = PropertyMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of string keys to string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut map = PropertyMap::new();
                while let Some((key, value)) = access.next_entry::<String, String>()? {
                    map.insert(key, value);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(PropertyMapVisitor)
    }
}

/// Discriminated view over a node's role in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A regular processing element (e.g. `filesrc`, `gvadetect`).
    Element,
    /// A caps constraint (e.g. `video/x-raw,width=320,height=240`).
    Caps,
}

/// Single node in a pipeline graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique within a graph; numeric-valued, assigned sequentially from 0
    /// in segment order during parsing.
    pub id: String,
    /// Element type name, or the caps base string for caps nodes.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Key/value properties in insertion order.
    pub data: PropertyMap,
}

impl Node {
    /// Create a regular element node with no properties.
    pub fn element(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            data: PropertyMap::new(),
        }
    }

    /// Create a caps node. The discriminator is injected ahead of the caps
    /// properties so serialized data keeps it first, matching how the editor
    /// has always seen these nodes.
    pub fn caps(id: impl Into<String>, base: impl Into<String>, props: PropertyMap) -> Self {
        let mut data = PropertyMap::new();
        data.insert(NODE_KIND_KEY, NODE_KIND_CAPS);
        for (k, v) in props.iter() {
            data.insert(k, v);
        }
        Self {
            id: id.into(),
            node_type: base.into(),
            data,
        }
    }

    pub fn kind(&self) -> NodeKind {
        if self.data.get(NODE_KIND_KEY) == Some(NODE_KIND_CAPS) {
            NodeKind::Caps
        } else {
            NodeKind::Element
        }
    }

    pub fn is_caps(&self) -> bool {
        self.kind() == NodeKind::Caps
    }

    /// Properties without the internal discriminator.
    pub fn visible_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.data.iter().filter(|(k, _)| *k != NODE_KIND_KEY)
    }

    pub fn is_sink(&self) -> bool {
        self.node_type.ends_with("sink")
    }
}

/// Directed connection between two nodes.
///
/// Edge ids are assigned from a counter independent of node ids; they are
/// unique across the whole graph and carry no positional meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
}

impl Edge {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Recommended encoder placement derived from the pipeline's caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderDevice {
    Cpu,
    Gpu,
}

/// An ordered collection of nodes and edges.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    pub fn node_by_id(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Rewrite `location` on every sink node to a unique filename under
    /// `output_dir`, returning the collected output paths.
    ///
    /// Used only while preparing a run; the stored graph is not affected
    /// because callers operate on a copy.
    pub fn prepare_output_sinks(&mut self, output_dir: &Path) -> Vec<String> {
        let mut output_paths = Vec::new();

        for node in &mut self.nodes {
            if !node.is_sink() {
                continue;
            }
            let Some(location) = node.data.get("location") else {
                continue;
            };
            if location.is_empty() {
                continue;
            }

            let new_filename = unique_filename(location);
            let new_path = output_dir.join(new_filename).to_string_lossy().into_owned();

            debug!(node = %node.id, from = %location, to = %new_path, "updated sink location");
            node.data.insert("location", new_path.clone());
            output_paths.push(new_path);
        }

        output_paths
    }

    /// Collect `source`/`location` values from non-sink nodes.
    ///
    /// Sinks are skipped so output paths are never mistaken for inputs.
    pub fn input_video_filenames(&self) -> Vec<String> {
        let mut filenames = Vec::new();
        for node in &self.nodes {
            if node.is_sink() {
                continue;
            }
            for key in ["source", "location"] {
                if let Some(value) = node.data.get(key) {
                    filenames.push(value.to_string());
                }
            }
        }
        filenames
    }

    /// Walk nodes backwards to the last `video/x-raw*` caps base and pick the
    /// encoder device from its memory annotation. NPU variants are not
    /// considered: NPUs expose no dedicated memory usable for pipeline
    /// buffering and always go through system or shared memory.
    pub fn recommended_encoder_device(&self) -> EncoderDevice {
        for node in self.nodes.iter().rev() {
            if !node.node_type.starts_with("video/x-raw") {
                continue;
            }
            if node.node_type.contains("memory:VAMemory") {
                return EncoderDevice::Gpu;
            }
            return EncoderDevice::Cpu;
        }
        EncoderDevice::Cpu
    }
}

/// Derive a collision-free filename from `location`: stem, epoch seconds and
/// a short random suffix, original extension preserved.
fn unique_filename(location: &str) -> String {
    let path = PathBuf::from(location);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let epoch_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let suffix = uuid::Uuid::new_v4().simple().to_string();

    format!("{stem}_{epoch_secs}_{}{ext}", &suffix[..8])
}
