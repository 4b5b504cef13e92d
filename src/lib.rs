//! Pipelens - graph editing and execution backend for a visual pipeline editor
//!
//! Converts GStreamer-style launch descriptions to and from an editable
//! node/edge graph, derives a simplified view for non-expert users, merges
//! simple-view edits back onto the full graph, and supervises pipeline
//! execution (validation jobs and metered normal runs).

pub mod describe;
pub mod engine;
pub mod error;
pub mod exec;
pub mod graph;
pub mod jobs;
pub mod orchestrator;
pub mod parse;
pub mod resources;
pub mod view;

pub use describe::Describer;
pub use error::{DescribeError, JobError, MergeError, ParseError, RunnerError};
pub use exec::{RunMode, RunOutcome, StopReason};
pub use graph::{Edge, EncoderDevice, Graph, Node, NodeKind, PropertyMap};
pub use jobs::{JobState, ValidationJobManager, ValidationRequest};
pub use orchestrator::{PipelineRunner, RunMetrics, ValidationOutcome};
pub use parse::Parser;
pub use resources::{
    DirectoryResources, DisplayModel, MediaLibrary, ModelCatalog, Resources, StaticMediaLibrary,
    StaticModelCatalog,
};
pub use view::ViewConfig;
