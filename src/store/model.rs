use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A backup-able instance as reported by the image store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntity {
    pub id: String,
    /// Value of the name tag, falls back to the id when the tag is missing.
    pub name: String,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_state() -> String {
    "running".to_string()
}

impl SourceEntity {
    pub fn has_tag(&self, key: &str) -> bool {
        self.tags.contains_key(key)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// One machine image of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub entity_name: String,
    pub name: String,
    pub created_on: NaiveDate,
}
