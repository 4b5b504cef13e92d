//! Error types for pipeline parsing, serialization, view merging and execution

use thiserror::Error;

/// Failures while turning a pipeline description string into a graph.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Invalid caps segment (empty base): '{segment}'")]
    CapsEmptyBase { segment: String },

    #[error("Invalid caps segment (empty property) in: '{segment}'")]
    CapsEmptyProperty { segment: String },

    #[error("Invalid caps property (missing '=') in segment '{segment}': '{property}'")]
    CapsMissingEquals { segment: String, property: String },

    #[error("Invalid caps property (empty key or value) in segment '{segment}': '{property}'")]
    CapsEmptyKeyOrValue { segment: String, property: String },

    #[error("Unrecognized token in pipeline description: '{token}' (segment: '{segment}')")]
    UnrecognizedToken { token: String, segment: String },

    #[error("Branch endpoint without corresponding tee element in pipeline description")]
    DanglingBranchEndpoint,
}

/// Failures while turning a graph back into a pipeline description.
#[derive(Error, Debug)]
pub enum DescribeError {
    #[error("Empty graph, cannot convert to pipeline description")]
    EmptyGraph,

    #[error(
        "Cannot convert graph to pipeline description: \
         circular graph detected or no start nodes found"
    )]
    NoStartNodes,

    #[error("Model name is required for {element}. Select a model to continue.")]
    ModelNotSelected { element: String },

    #[error("Can't find model '{name}' for {element}. Choose an installed model or install it first.")]
    ModelNotFound { name: String, element: String },

    #[error("Node {element}: model '{name}' is not supported on the '{device}' device")]
    ModelNotSupportedOnDevice {
        element: String,
        name: String,
        device: String,
    },

    #[error("Node {node_id}. {element}: can't map '{key}={name}' to video path")]
    VideoNotFound {
        node_id: String,
        element: String,
        key: String,
        name: String,
    },

    #[error(
        "Labels file '{name}' not found for {element} element. \
         Please ensure the labels file name is correct."
    )]
    LabelsNotFound { name: String, element: String },

    #[error(
        "Module file '{name}' not found for {element} element. \
         Please verify the file name is correct and the file exists in the scripts directory."
    )]
    ScriptNotFound { name: String, element: String },
}

/// Structural edits rejected when merging simple-view changes back onto the
/// advanced graph. Only property modifications of retained nodes are allowed.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error(
        "Node additions are not supported in simple view. Added nodes: {ids}. \
         Please use advanced view to add new nodes."
    )]
    NodesAdded { ids: String },

    #[error(
        "Node removals are not supported in simple view. Removed nodes: {ids}. \
         Please use advanced view to remove nodes."
    )]
    NodesRemoved { ids: String },

    #[error(
        "Edge additions are not supported in simple view. Added edges: {details}. \
         Please use advanced view to modify graph structure."
    )]
    EdgesAdded { details: String },

    #[error(
        "Edge removals are not supported in simple view. Removed edges: {details}. \
         Please use advanced view to modify graph structure."
    )]
    EdgesRemoved { details: String },

    #[error(
        "Edge modifications are not supported in simple view. Modified edges: {details}. \
         Please use advanced view to modify graph structure."
    )]
    EdgesModified { details: String },

    #[error(
        "Node type changes are not supported in simple view. \
         Node {id} type changed from '{original}' to '{modified}'. \
         Please use advanced view to modify node types."
    )]
    NodeTypeChanged {
        id: String,
        original: String,
        modified: String,
    },

    #[error(
        "Internal error: Node {id} from simple view not found in advanced view. \
         This indicates a mismatch between the simple and advanced graph representations."
    )]
    NodeMissingInAdvanced { id: String },
}

/// Failures raised by the process orchestrator.
///
/// Failed runs (non-zero exit, inactivity hangs) surface here; a pipeline
/// that runs to completion but is invalid is reported through
/// [`ValidationOutcome`](crate::orchestrator::ValidationOutcome) instead.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Invalid mode '{mode}'. Must be 'normal' or 'validation'.")]
    InvalidMode { mode: String },

    #[error(
        "Invalid max-runtime value {value}. Negative values are not allowed. \
         If you need a pipeline to run indefinitely, use mode 'normal' with max-runtime=0."
    )]
    NegativeMaxRuntime { value: f64 },

    #[error("Validation mode requires max_runtime > 0. Received max_runtime={value}.")]
    InvalidMaxRuntime { value: f64 },

    #[error("Failed to spawn pipeline runner: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(
        "Pipeline execution terminated due to inactivity timeout \
         ({seconds} seconds without stdout/stderr logs)."
    )]
    InactivityTimeout { seconds: u64 },

    #[error("Pipeline execution failed: {stderr}")]
    ExecutionFailed { stderr: String },

    #[error("Internal runner error: {0}")]
    Internal(String),
}

/// Request-validation failures in the job manager, reported synchronously
/// before any job is created.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Parameter 'max-runtime' must be an integer.")]
    MaxRuntimeNotInteger,

    #[error("Parameter 'max-runtime' must be greater than or equal to 1.")]
    MaxRuntimeTooSmall,

    #[error(transparent)]
    Describe(#[from] DescribeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_error_names_offending_nodes() {
        let err = MergeError::NodesAdded {
            ids: "7, 9".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Node additions"));
        assert!(msg.contains("7, 9"));
    }

    #[test]
    fn describe_error_mentions_device() {
        let err = DescribeError::ModelNotSupportedOnDevice {
            element: "gvadetect".to_string(),
            name: "yolo".to_string(),
            device: "NPU".to_string(),
        };
        assert!(err.to_string().contains("'NPU'"));
    }

    #[test]
    fn runner_error_reports_inactivity_window() {
        let err = RunnerError::InactivityTimeout { seconds: 120 };
        assert!(err.to_string().contains("120 seconds"));
    }
}
