//! Resource lookup collaborators
//!
//! The parser and serializer translate absolute filesystem paths into display
//! names (and back) so stored graphs stay independent of the machine layout.
//! The lookups are injected explicitly; there is no process-wide registry.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

/// Default directories, overridable through the environment.
const DEFAULT_LABELS_DIR: &str = "/opt/pipelens/labels";
const DEFAULT_SCRIPTS_DIR: &str = "/opt/pipelens/scripts";

/// An installed model as shown to the editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayModel {
    pub display_name: String,
    /// Full filesystem path of the model file.
    pub path: String,
    /// Optional pre/post-processing description file next to the model.
    pub proc_path: Option<String>,
}

/// Lookup over the installed model inventory.
pub trait ModelCatalog: Send + Sync {
    /// Resolve a model by its file path and optional proc path, as found in
    /// a pipeline description.
    fn find_by_path_and_proc(&self, path: &str, proc_path: Option<&str>) -> Option<DisplayModel>;

    /// Resolve a model by the display name stored in a graph.
    fn find_by_display_name(&self, name: &str) -> Option<DisplayModel>;

    /// Whether `name` can run on `device` (e.g. "CPU", "GPU").
    fn is_supported_on_device(&self, name: &str, device: &str) -> bool;
}

/// Lookup between media file paths and their display filenames.
pub trait MediaLibrary: Send + Sync {
    fn filename_for_path(&self, path: &str) -> Option<String>;
    fn path_for_filename(&self, name: &str) -> Option<String>;
}

/// Directory-backed lookup for flat resource files (labels, scripts).
///
/// Resolution criterion is plain filesystem existence inside the managed
/// directory.
#[derive(Debug, Clone)]
pub struct DirectoryResources {
    directory: PathBuf,
}

impl DirectoryResources {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Extract the filename component of `path`. Never fails; an empty or
    /// separator-terminated path yields an empty string.
    pub fn filename_for_path(&self, path: &str) -> String {
        Path::new(path)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Full path for `filename` if it exists in the managed directory.
    pub fn path_for_filename(&self, filename: &str) -> Option<String> {
        let candidate = self.directory.join(filename);
        if candidate.is_file() {
            Some(candidate.to_string_lossy().into_owned())
        } else {
            None
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

/// In-memory model catalog. Serves tests and deployments that feed the
/// inventory from configuration rather than a filesystem scan.
#[derive(Debug, Default)]
pub struct StaticModelCatalog {
    models: Vec<DisplayModel>,
    /// (display_name, device) pairs known to work.
    supported: HashSet<(String, String)>,
}

impl StaticModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: DisplayModel) -> Self {
        self.models.push(model);
        self
    }

    pub fn with_support(mut self, name: impl Into<String>, device: impl Into<String>) -> Self {
        self.supported.insert((name.into(), device.into()));
        self
    }
}

impl ModelCatalog for StaticModelCatalog {
    fn find_by_path_and_proc(&self, path: &str, proc_path: Option<&str>) -> Option<DisplayModel> {
        self.models
            .iter()
            .find(|m| m.path == path && m.proc_path.as_deref() == proc_path)
            .cloned()
    }

    fn find_by_display_name(&self, name: &str) -> Option<DisplayModel> {
        self.models.iter().find(|m| m.display_name == name).cloned()
    }

    fn is_supported_on_device(&self, name: &str, device: &str) -> bool {
        self.supported
            .contains(&(name.to_string(), device.to_string()))
    }
}

/// In-memory media library mapping filenames to full paths.
#[derive(Debug, Default)]
pub struct StaticMediaLibrary {
    files: Vec<(String, String)>,
}

impl StaticMediaLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, filename: impl Into<String>, path: impl Into<String>) -> Self {
        self.files.push((filename.into(), path.into()));
        self
    }
}

impl MediaLibrary for StaticMediaLibrary {
    fn filename_for_path(&self, path: &str) -> Option<String> {
        self.files
            .iter()
            .find(|(_, p)| p == path)
            .map(|(f, _)| f.clone())
    }

    fn path_for_filename(&self, name: &str) -> Option<String> {
        self.files
            .iter()
            .find(|(f, _)| f == name)
            .map(|(_, p)| p.clone())
    }
}

/// Bundle of lookup collaborators handed to the parser and serializer.
#[derive(Clone)]
pub struct Resources {
    pub models: Arc<dyn ModelCatalog>,
    pub videos: Arc<dyn MediaLibrary>,
    pub labels: DirectoryResources,
    pub scripts: DirectoryResources,
}

impl Resources {
    pub fn new(
        models: Arc<dyn ModelCatalog>,
        videos: Arc<dyn MediaLibrary>,
        labels: DirectoryResources,
        scripts: DirectoryResources,
    ) -> Self {
        Self {
            models,
            videos,
            labels,
            scripts,
        }
    }

    /// Build from the environment: `LABELS_PATH` and `SCRIPTS_PATH` select
    /// the directory lookups; model and video inventories are supplied by
    /// the caller.
    pub fn from_env(models: Arc<dyn ModelCatalog>, videos: Arc<dyn MediaLibrary>) -> Self {
        let labels_dir = env::var("LABELS_PATH").unwrap_or_else(|_| DEFAULT_LABELS_DIR.to_string());
        let scripts_dir =
            env::var("SCRIPTS_PATH").unwrap_or_else(|_| DEFAULT_SCRIPTS_DIR.to_string());
        debug!(%labels_dir, %scripts_dir, "resource directories resolved");

        Self::new(
            models,
            videos,
            DirectoryResources::new(labels_dir),
            DirectoryResources::new(scripts_dir),
        )
    }

    /// Empty lookups. Paths found in descriptions will translate to empty
    /// display names; reverse translation fails for anything non-empty.
    pub fn empty() -> Self {
        Self::new(
            Arc::new(StaticModelCatalog::new()),
            Arc::new(StaticMediaLibrary::new()),
            DirectoryResources::new(DEFAULT_LABELS_DIR),
            DirectoryResources::new(DEFAULT_SCRIPTS_DIR),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn directory_resources_resolve_existing_files_only() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("coco.txt"), "person\ncar\n").unwrap();

        let resources = DirectoryResources::new(dir.path());
        assert_eq!(resources.filename_for_path("/somewhere/else/coco.txt"), "coco.txt");

        let resolved = resources.path_for_filename("coco.txt").unwrap();
        assert!(resolved.ends_with("coco.txt"));
        assert_eq!(resources.path_for_filename("missing.txt"), None);
    }

    #[test]
    fn static_catalog_matches_path_and_proc_together() {
        let catalog = StaticModelCatalog::new().with_model(DisplayModel {
            display_name: "YOLOv8 Detector".to_string(),
            path: "/models/yolov8.xml".to_string(),
            proc_path: Some("/models/yolov8.json".to_string()),
        });

        assert!(catalog
            .find_by_path_and_proc("/models/yolov8.xml", Some("/models/yolov8.json"))
            .is_some());
        // Same model file with a different proc file is a different install.
        assert!(catalog
            .find_by_path_and_proc("/models/yolov8.xml", None)
            .is_none());
        assert!(catalog.find_by_display_name("YOLOv8 Detector").is_some());
    }

    #[test]
    fn static_catalog_device_support() {
        let catalog = StaticModelCatalog::new().with_support("YOLOv8 Detector", "GPU");
        assert!(catalog.is_supported_on_device("YOLOv8 Detector", "GPU"));
        assert!(!catalog.is_supported_on_device("YOLOv8 Detector", "NPU"));
    }

    #[test]
    fn static_media_library_roundtrip() {
        let videos = StaticMediaLibrary::new().with_file("sample.mp4", "/videos/input/sample.mp4");
        assert_eq!(
            videos.filename_for_path("/videos/input/sample.mp4"),
            Some("sample.mp4".to_string())
        );
        assert_eq!(
            videos.path_for_filename("sample.mp4"),
            Some("/videos/input/sample.mp4".to_string())
        );
        assert_eq!(videos.path_for_filename("other.mp4"), None);
    }
}
