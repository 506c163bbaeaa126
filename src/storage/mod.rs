use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::config::StorageConfig;
use crate::error::StorageError;

const BACKUP_PREFIX: &str = "data_backup_";

/// On-disk shape: `{ "layers": [ { "price", "quantity", "time" } ] }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionDocument {
    #[serde(default)]
    pub layers: Vec<LayerRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub price: f64,
    pub quantity: i64,
    pub time: String,
}

/// JSON file store with timestamped backups next to it.
#[derive(Debug, Clone)]
pub struct DataStore {
    data_file: PathBuf,
    backup_dir: PathBuf,
    backup_keep: usize,
}

impl DataStore {
    pub fn new(data_file: impl Into<PathBuf>, backup_keep: usize) -> Result<Self, StorageError> {
        let data_file = data_file.into();
        let parent = data_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let backup_dir = parent.join("backup");
        fs::create_dir_all(&backup_dir)?;

        Ok(Self {
            data_file,
            backup_dir,
            backup_keep,
        })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        Self::new(&config.data_file, config.backup_keep)
    }

    /// Loads the document. Never fails: a corrupt file falls back to the
    /// newest backup, then to an empty document.
    pub fn load(&self) -> PositionDocument {
        if !self.data_file.exists() {
            warn!("Data file not found: {}, starting empty", self.data_file.display());
            return PositionDocument::default();
        }

        match read_document(&self.data_file) {
            Ok(doc) => {
                info!("Loaded {} layers from {}", doc.layers.len(), self.data_file.display());
                doc
            }
            Err(e) => {
                error!("Error loading {}: {}", self.data_file.display(), e);
                self.restore_from_backup()
            }
        }
    }

    pub fn save(&self, document: &PositionDocument) -> Result<(), StorageError> {
        if self.data_file.exists() {
            self.create_backup();
        }

        let json = serde_json::to_string_pretty(document)?;
        fs::write(&self.data_file, json)?;
        info!("Saved {} layers to {}", document.layers.len(), self.data_file.display());
        Ok(())
    }

    pub fn backups(&self) -> Vec<PathBuf> {
        let mut backups: Vec<PathBuf> = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with(BACKUP_PREFIX) && n.ends_with(".json"))
                        .unwrap_or(false)
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        // Timestamped names sort chronologically; newest first.
        backups.sort();
        backups.reverse();
        backups
    }

    fn create_backup(&self) {
        let stamp = Local::now().format("%Y%m%d_%H%M%S%.3f");
        let backup_file = self.backup_dir.join(format!("{}{}.json", BACKUP_PREFIX, stamp));

        match fs::copy(&self.data_file, &backup_file) {
            Ok(_) => {
                debug!("Created backup: {}", backup_file.display());
                self.cleanup_old_backups();
            }
            Err(e) => warn!("Failed to create backup: {}", e),
        }
    }

    fn cleanup_old_backups(&self) {
        for old in self.backups().into_iter().skip(self.backup_keep) {
            match fs::remove_file(&old) {
                Ok(_) => debug!("Removed old backup: {}", old.display()),
                Err(e) => warn!("Error removing backup {}: {}", old.display(), e),
            }
        }
    }

    fn restore_from_backup(&self) -> PositionDocument {
        let Some(newest) = self.backups().into_iter().next() else {
            error!("No backup files found, starting empty");
            return PositionDocument::default();
        };

        match read_document(&newest) {
            Ok(doc) => {
                warn!("Restored data from backup: {}", newest.display());
                doc
            }
            Err(e) => {
                error!("Error restoring from backup {}: {}", newest.display(), e);
                PositionDocument::default()
            }
        }
    }
}

fn read_document(path: &Path) -> Result<PositionDocument, StorageError> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(price: f64, quantity: i64) -> LayerRecord {
        LayerRecord {
            price,
            quantity,
            time: "2026-01-20T10:15:00+07:00".to_string(),
        }
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::new(dir.path().join("data.json"), 10).unwrap();
        assert_eq!(store.load(), PositionDocument::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::new(dir.path().join("data.json"), 10).unwrap();
        let doc = PositionDocument {
            layers: vec![record(15.5, 1000), record(15.0, 500)],
        };
        store.save(&doc).unwrap();
        assert_eq!(store.load(), doc);
    }

    #[test]
    fn test_unknown_fields_and_missing_layers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        let store = DataStore::new(&path, 10).unwrap();

        fs::write(&path, r#"{"owner": "me"}"#).unwrap();
        assert!(store.load().layers.is_empty());

        fs::write(
            &path,
            r#"{"layers": [{"price": 16.0, "quantity": 10, "time": "2026-01-20T10:15:00", "note": "x"}], "v": 2}"#,
        )
        .unwrap();
        assert_eq!(store.load().layers.len(), 1);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        let store = DataStore::new(&path, 10).unwrap();

        let first = PositionDocument {
            layers: vec![record(15.5, 1000)],
        };
        store.save(&first).unwrap();
        // Second save backs up the first document.
        store
            .save(&PositionDocument {
                layers: vec![record(15.5, 1000), record(15.0, 500)],
            })
            .unwrap();
        assert_eq!(store.backups().len(), 1);

        fs::write(&path, "{ not json").unwrap();
        assert_eq!(store.load(), first);
    }

    #[test]
    fn test_corrupt_file_without_backup_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        let store = DataStore::new(&path, 10).unwrap();
        fs::write(&path, "[]").unwrap();
        assert!(store.load().layers.is_empty());
    }

    #[test]
    fn test_backups_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::new(dir.path().join("data.json"), 2).unwrap();
        for i in 0..6 {
            store
                .save(&PositionDocument {
                    layers: vec![record(10.0 + i as f64, 1)],
                })
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(store.backups().len() <= 2);
    }
}
