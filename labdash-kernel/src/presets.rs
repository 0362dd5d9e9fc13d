//! Durable target -> preset assignments (`{"assignments": {...}}` JSON file).
//!
//! Targets without an explicit entry use the default preset; assigning the
//! default removes the entry. Every mutation is written through immediately.

use crate::scheduler::PresetLookup;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum PresetStoreError {
    #[error("cannot write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot encode assignments: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AssignmentsFile {
    #[serde(default)]
    assignments: BTreeMap<String, String>,
}

struct Inner {
    default_preset: String,
    assignments: BTreeMap<String, String>,
}

pub struct PresetStore {
    path: PathBuf,
    inner: RwLock<Inner>,
}

impl PresetStore {
    /// Loads the file, creating it empty when missing. An unreadable file
    /// starts the store empty.
    pub fn open(path: impl AsRef<Path>, default_preset: &str) -> Self {
        let path = path.as_ref().to_path_buf();
        let store = Self {
            path,
            inner: RwLock::new(Inner {
                default_preset: default_preset.to_string(),
                assignments: BTreeMap::new(),
            }),
        };
        store.reload();
        store
    }

    pub fn reload(&self) {
        let assignments = if self.path.exists() {
            match std::fs::read_to_string(&self.path)
                .map_err(|e| e.to_string())
                .and_then(|txt| {
                    serde_json::from_str::<AssignmentsFile>(&txt).map_err(|e| e.to_string())
                }) {
                Ok(file) => {
                    info!(
                        "loaded {} preset assignments from {}",
                        file.assignments.len(),
                        self.path.display()
                    );
                    file.assignments
                }
                Err(e) => {
                    error!("failed to load {}: {e}", self.path.display());
                    BTreeMap::new()
                }
            }
        } else {
            info!("presets file not found, creating {}", self.path.display());
            BTreeMap::new()
        };

        let missing = !self.path.exists();
        self.inner.write().assignments = assignments;
        if missing {
            if let Err(e) = self.save() {
                error!("{e}");
            }
        }
    }

    pub fn default_preset(&self) -> String {
        self.inner.read().default_preset.clone()
    }

    pub fn set_default_preset(&self, preset: &str) {
        self.inner.write().default_preset = preset.to_string();
    }

    pub fn get_assignment(&self, target: &str) -> String {
        let inner = self.inner.read();
        inner
            .assignments
            .get(target)
            .cloned()
            .unwrap_or_else(|| inner.default_preset.clone())
    }

    pub fn set_assignment(&self, target: &str, preset: &str) -> Result<(), PresetStoreError> {
        {
            let mut inner = self.inner.write();
            if preset == inner.default_preset {
                inner.assignments.remove(target);
            } else {
                inner.assignments.insert(target.to_string(), preset.to_string());
            }
        }
        debug!("{target} -> preset {preset}");
        self.save()
    }

    /// Returns whether an explicit entry existed.
    pub fn remove_assignment(&self, target: &str) -> Result<bool, PresetStoreError> {
        let existed = self.inner.write().assignments.remove(target).is_some();
        if existed {
            self.save()?;
        }
        Ok(existed)
    }

    pub fn all_assignments(&self) -> BTreeMap<String, String> {
        self.inner.read().assignments.clone()
    }

    fn save(&self) -> Result<(), PresetStoreError> {
        let file = AssignmentsFile { assignments: self.all_assignments() };
        let body = serde_json::to_string_pretty(&file)?;
        let io_err = |source| PresetStoreError::Io {
            path: self.path.display().to_string(),
            source,
        };
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }
        std::fs::write(&self.path, body).map_err(io_err)?;
        Ok(())
    }
}

impl PresetLookup for PresetStore {
    fn preset_for(&self, target: &str) -> String {
        self.get_assignment(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_created_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/presets.json");
        let store = PresetStore::open(&path, "basic");
        assert!(path.exists());
        assert!(store.all_assignments().is_empty());
        assert_eq!(store.get_assignment("dut-1"), "basic");
    }

    #[test]
    fn test_write_through_and_default_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presets.json");
        let store = PresetStore::open(&path, "basic");

        store.set_assignment("dut-1", "advanced").unwrap();
        let reopened = PresetStore::open(&path, "basic");
        assert_eq!(reopened.get_assignment("dut-1"), "advanced");

        store.set_assignment("dut-1", "basic").unwrap();
        assert!(store.all_assignments().is_empty());
        let reopened = PresetStore::open(&path, "basic");
        assert_eq!(reopened.get_assignment("dut-1"), "basic");
    }

    #[test]
    fn test_remove_assignment() {
        let dir = tempfile::tempdir().unwrap();
        let store = PresetStore::open(dir.path().join("presets.json"), "basic");
        store.set_assignment("dut-2", "advanced").unwrap();
        assert!(store.remove_assignment("dut-2").unwrap());
        assert!(!store.remove_assignment("dut-2").unwrap());
        assert_eq!(store.preset_for("dut-2"), "basic");
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presets.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = PresetStore::open(&path, "basic");
        assert!(store.all_assignments().is_empty());
        // existing file left alone until the next write
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }
}
