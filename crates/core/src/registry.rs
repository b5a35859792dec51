// crates/core/src/registry.rs
//
// Explicit dataset registry. One instance per worker, passed by reference
// into the trainer/evaluator instead of living in process-global state.
//
use anyhow::{bail, ensure, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// A registered COCO dataset: name plus its data-source descriptor.
#[derive(Debug, Clone)]
pub struct DatasetRecord {
    pub name: String,
    pub metadata: BTreeMap<String, String>,
    pub annotation_json: PathBuf,
    pub image_root: PathBuf,
}

/// Name → data-source descriptor store with registry-lifetime entries.
#[derive(Debug, Default)]
pub struct DatasetRegistry {
    entries: BTreeMap<String, DatasetRecord>,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a COCO-format dataset under `name`.
    ///
    /// Registering the same name twice is an error, and both paths are
    /// checked up front so a bad registration fails before any training or
    /// evaluation work starts.
    pub fn register(
        &mut self,
        name: &str,
        metadata: BTreeMap<String, String>,
        annotation_json: &Path,
        image_root: &Path,
    ) -> Result<()> {
        ensure!(!name.is_empty(), "Dataset name must not be empty");
        if self.entries.contains_key(name) {
            bail!("Dataset '{}' is already registered", name);
        }
        ensure!(
            annotation_json.is_file(),
            "Annotation file {:?} for dataset '{}' does not exist",
            annotation_json,
            name
        );
        ensure!(
            image_root.is_dir(),
            "Image directory {:?} for dataset '{}' does not exist",
            image_root,
            name
        );

        info!(dataset = name, annotations = ?annotation_json, images = ?image_root, "registered dataset");
        self.entries.insert(
            name.to_string(),
            DatasetRecord {
                name: name.to_string(),
                metadata,
                annotation_json: annotation_json.to_path_buf(),
                image_root: image_root.to_path_buf(),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&DatasetRecord> {
        match self.entries.get(name) {
            Some(record) => Ok(record),
            None => bail!(
                "Dataset '{}' is not registered (known: {:?})",
                name,
                self.names()
            ),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("instances.json");
        std::fs::write(&json, "{}").unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir(&images).unwrap();
        (dir, json, images)
    }

    #[test]
    fn test_register_then_lookup_round_trips_paths() {
        let (_dir, json, images) = fixture();
        let mut registry = DatasetRegistry::new();
        registry
            .register("data_train", BTreeMap::new(), &json, &images)
            .unwrap();

        let record = registry.get("data_train").unwrap();
        assert_eq!(record.annotation_json, json);
        assert_eq!(record.image_root, images);
        assert!(record.metadata.is_empty());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let (_dir, json, images) = fixture();
        let mut registry = DatasetRegistry::new();
        registry
            .register("data_train", BTreeMap::new(), &json, &images)
            .unwrap();
        let err = registry
            .register("data_train", BTreeMap::new(), &json, &images)
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_invalid_paths_fail_at_registration() {
        let (_dir, json, images) = fixture();
        let mut registry = DatasetRegistry::new();
        let err = registry
            .register(
                "bad",
                BTreeMap::new(),
                Path::new("/nonexistent/instances.json"),
                &images,
            )
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));

        let err = registry
            .register("bad", BTreeMap::new(), &json, Path::new("/nonexistent/images"))
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_unknown_lookup_lists_known_names() {
        let registry = DatasetRegistry::new();
        let err = registry.get("missing").unwrap_err();
        assert!(err.to_string().contains("not registered"));
    }
}
