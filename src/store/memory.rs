//! In-process image store.
//!
//! Holds a complete inventory (instances, images, snapshots) behind a mutex.
//! Loaded from and saved to a JSON file for offline drills with
//! `ami-keeper run --inventory`, and used directly by tests. Failures can be
//! injected per instance or per image to exercise the error paths.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::model::{Backup, SourceEntity};
use super::{naming, ImageStore, StoreError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub entities: Vec<SourceEntity>,
    #[serde(default)]
    pub backups: Vec<Backup>,
    /// image id -> storage snapshot ids
    #[serde(default)]
    pub snapshots: BTreeMap<String, Vec<String>>,

    /// instance ids whose image creation fails
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub fail_create: BTreeSet<String>,
    /// image ids whose deletion fails
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub fail_delete: BTreeSet<String>,
    /// makes every listing call fail
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fail_listing: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryFileError {
    #[error("failed to access inventory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid inventory {path}: {source}")]
    Format {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub struct MemoryStore {
    inner: Mutex<State>,
}

struct State {
    inventory: Inventory,
    next_id: u64,
}

impl MemoryStore {
    pub fn new(inventory: Inventory) -> Self {
        MemoryStore {
            inner: Mutex::new(State { inventory, next_id: 1 }),
        }
    }

    pub fn load(path: &Path) -> Result<Self, InventoryFileError> {
        let raw = fs::read_to_string(path).map_err(|source| InventoryFileError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let inventory = serde_json::from_str(&raw).map_err(|source| InventoryFileError::Format {
            path: path.display().to_string(),
            source,
        })?;
        Ok(MemoryStore::new(inventory))
    }

    pub fn save(&self, path: &Path) -> Result<(), InventoryFileError> {
        let json = serde_json::to_string_pretty(&self.inventory()).map_err(|source| {
            InventoryFileError::Format {
                path: path.display().to_string(),
                source,
            }
        })?;
        fs::write(path, json).map_err(|source| InventoryFileError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Copy of the current inventory.
    pub fn inventory(&self) -> Inventory {
        self.state().inventory.clone()
    }

    pub fn backups_of(&self, entity_name: &str) -> Vec<Backup> {
        self.state()
            .inventory
            .backups
            .iter()
            .filter(|b| b.entity_name == entity_name)
            .cloned()
            .collect()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // a panicked worker cannot leave the inventory half-written
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ImageStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn list_source_entities(&self) -> Result<Vec<SourceEntity>, StoreError> {
        let state = self.state();
        if state.inventory.fail_listing {
            return Err(StoreError::Rejected("instance listing unavailable".to_string()));
        }
        Ok(state.inventory.entities.clone())
    }

    fn list_backups(&self, entity: &SourceEntity) -> Result<Vec<Backup>, StoreError> {
        let state = self.state();
        if state.inventory.fail_listing {
            return Err(StoreError::Rejected("image listing unavailable".to_string()));
        }
        Ok(state
            .inventory
            .backups
            .iter()
            .filter(|b| b.entity_name == entity.name)
            .cloned()
            .collect())
    }

    fn create_backup(&self, entity: &SourceEntity, today: NaiveDate) -> Result<Backup, StoreError> {
        let mut state = self.state();
        if state.inventory.fail_create.contains(&entity.id) {
            return Err(StoreError::Rejected(format!("create-image refused for {}", entity.id)));
        }

        // loaded inventories may already use low ids
        let mut id = format!("ami-{:08x}", state.next_id);
        while state.inventory.backups.iter().any(|b| b.id == id) {
            state.next_id += 1;
            id = format!("ami-{:08x}", state.next_id);
        }
        let snapshot = format!("snap-{:08x}", state.next_id);
        state.next_id += 1;

        let backup = Backup {
            id: id.clone(),
            entity_name: entity.name.clone(),
            name: naming::image_name(&entity.name, today),
            created_on: today,
        };
        state.inventory.backups.push(backup.clone());
        state.inventory.snapshots.insert(id, vec![snapshot]);
        Ok(backup)
    }

    fn delete_backup(&self, backup: &Backup) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.inventory.fail_delete.contains(&backup.id) {
            return Err(StoreError::Rejected(format!("deregister-image refused for {}", backup.id)));
        }

        let before = state.inventory.backups.len();
        state.inventory.backups.retain(|b| b.id != backup.id);
        if state.inventory.backups.len() == before {
            return Err(StoreError::NotFound(backup.id.clone()));
        }
        state.inventory.snapshots.remove(&backup.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str, name: &str) -> SourceEntity {
        SourceEntity {
            id: id.to_string(),
            name: name.to_string(),
            state: "running".to_string(),
            tags: BTreeMap::new(),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
    }

    #[test]
    fn create_then_delete_removes_snapshots() {
        let store = MemoryStore::new(Inventory {
            entities: vec![entity("i-1", "web")],
            ..Default::default()
        });

        let web = entity("i-1", "web");
        let backup = store.create_backup(&web, today()).unwrap();
        assert_eq!(backup.name, "web-031024");
        assert_eq!(store.list_backups(&web).unwrap().len(), 1);
        assert_eq!(store.inventory().snapshots.len(), 1);

        store.delete_backup(&backup).unwrap();
        assert!(store.list_backups(&web).unwrap().is_empty());
        assert!(store.inventory().snapshots.is_empty());
    }

    #[test]
    fn deleting_unknown_image_is_not_found() {
        let store = MemoryStore::new(Inventory::default());
        let ghost = Backup {
            id: "ami-ghost".to_string(),
            entity_name: "web".to_string(),
            name: "web-010124".to_string(),
            created_on: today(),
        };
        assert!(matches!(store.delete_backup(&ghost), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn injected_failures() {
        let mut inventory = Inventory::default();
        inventory.fail_create.insert("i-1".to_string());
        inventory.fail_listing = true;
        let store = MemoryStore::new(inventory);

        assert!(store.create_backup(&entity("i-1", "web"), today()).is_err());
        assert!(store.list_source_entities().is_err());
    }

    #[test]
    fn inventory_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        fs::write(
            &path,
            r#"{
                "entities": [{"id": "i-1", "name": "web", "tags": {"Name": "web"}}],
                "backups": [{"id": "ami-1", "entity_name": "web", "name": "web-030924", "created_on": "2024-03-09"}],
                "fail_delete": ["ami-1"]
            }"#,
        )
        .unwrap();

        let store = MemoryStore::load(&path).unwrap();
        let entities = store.list_source_entities().unwrap();
        assert_eq!(entities[0].state, "running");
        assert_eq!(store.backups_of("web").len(), 1);

        store.save(&path).unwrap();
        let reloaded = MemoryStore::load(&path).unwrap();
        assert!(reloaded.inventory().fail_delete.contains("ami-1"));
    }

    #[test]
    fn save_reports_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("inventory.json");

        let store = MemoryStore::new(Inventory::default());
        let err = store.save(&path).unwrap_err();
        assert!(matches!(err, InventoryFileError::Io { .. }));
        assert!(err.to_string().contains("inventory.json"));
    }
}
