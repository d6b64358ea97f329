//! Image store capabilities.
//!
//! The planner never talks to a cloud API directly. Everything it needs goes
//! through [`ImageStore`]:
//! - enumerate instances and their existing images
//! - create today's image for an instance
//! - delete an image together with the storage snapshots behind it
//!
//! Implementations:
//! - `aws`: drives the `aws ec2` command line
//! - `memory`: in-process inventory used for drills and tests

pub mod aws;
pub mod memory;
pub mod model;
pub mod naming;

use std::time::Duration;

use chrono::NaiveDate;
use thiserror::Error;

use model::{Backup, SourceEntity};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("`{command}` timed out after {}", humantime::format_duration(*.timeout))]
    Timeout { command: String, timeout: Duration },

    #[error("unexpected response from `{command}`: {source}")]
    Parse {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Rejected(String),

    #[error("store call panicked: {0}")]
    Panicked(String),
}

/// External collaborator that owns the actual images.
///
/// Must be `Sync`: the runner fans out over instances on a worker pool and
/// shares one store across all workers.
pub trait ImageStore: Sync {
    fn name(&self) -> &'static str;

    /// All instances visible to the store, excluded categories included.
    fn list_source_entities(&self) -> Result<Vec<SourceEntity>, StoreError>;

    fn list_backups(&self, entity: &SourceEntity) -> Result<Vec<Backup>, StoreError>;

    fn create_backup(&self, entity: &SourceEntity, today: NaiveDate) -> Result<Backup, StoreError>;

    /// Removes the image and every storage snapshot it references.
    fn delete_backup(&self, backup: &Backup) -> Result<(), StoreError>;
}
