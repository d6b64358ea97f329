//! Daily backup run.
//!
//! One run does, in order:
//! - enumerate instances and the existing images of every non-excluded one
//! - plan keep/delete per instance with the retention policy
//! - fan out over instances on a worker pool: create today's image, delete stale ones
//!
//! Only enumeration failures abort a run. Creation and deletion failures are
//! captured per instance, logged, and returned in the report; every other
//! instance and every other image is still processed.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Instant;

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

use crate::config::Config;
use crate::retention::{AgedBackup, EntityPlan};
use crate::store::model::SourceEntity;
use crate::store::{ImageStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    DryRun,
    Execute,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to enumerate {what}: {source}")]
    Enumeration {
        what: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Creation,
    Deletion,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Creation => "creation",
            FailureKind::Deletion => "deletion",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub entity: String,
    /// instance id for creation failures, image id for deletion failures
    pub target: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "image", rename_all = "snake_case")]
pub enum Creation {
    Created(String),
    /// an image dated today already exists
    AlreadyFresh,
    /// dry run: would have been created
    Planned,
    Failed,
    /// instance is excluded from backups
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityOutcome {
    pub entity_id: String,
    pub name: String,
    pub state: String,
    pub excluded: bool,
    pub creation: Creation,
    pub kept: Vec<AgedBackup>,
    /// removed images, or the ones that would be removed in a dry run
    pub deleted: Vec<AgedBackup>,
    pub failures: Vec<Failure>,
}

impl EntityOutcome {
    fn excluded(entity: &SourceEntity) -> Self {
        EntityOutcome {
            entity_id: entity.id.clone(),
            name: entity.name.clone(),
            state: entity.state.clone(),
            excluded: true,
            creation: Creation::Skipped,
            kept: Vec::new(),
            deleted: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn name_clash(entity: &SourceEntity, owner: &str) -> Self {
        EntityOutcome {
            excluded: false,
            creation: Creation::Failed,
            failures: vec![Failure {
                kind: FailureKind::Creation,
                entity: entity.name.clone(),
                target: entity.id.clone(),
                message: format!("instance name `{}` is already used by {owner}", entity.name),
            }],
            ..EntityOutcome::excluded(entity)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub today: NaiveDate,
    pub mode: RunMode,
    pub store: String,
    pub entities: Vec<EntityOutcome>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn failures(&self) -> impl Iterator<Item = &Failure> {
        self.entities.iter().flat_map(|e| &e.failures)
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }

    pub fn created_count(&self) -> usize {
        self.entities
            .iter()
            .filter(|e| matches!(e.creation, Creation::Created(_) | Creation::Planned))
            .count()
    }

    pub fn deleted_count(&self) -> usize {
        self.entities.iter().map(|e| e.deleted.len()).sum()
    }

    pub fn excluded_count(&self) -> usize {
        self.entities.iter().filter(|e| e.excluded).count()
    }

    pub fn entity(&self, name: &str) -> Option<&EntityOutcome> {
        self.entities.iter().find(|e| e.name == name)
    }
}

struct Job {
    entity: SourceEntity,
    plan: EntityPlan,
}

pub fn run(
    store: &dyn ImageStore,
    config: &Config,
    today: NaiveDate,
    mode: RunMode,
) -> Result<RunReport, RunError> {
    let start = Instant::now();

    let entities = store
        .list_source_entities()
        .map_err(|source| RunError::Enumeration {
            what: "instances".to_string(),
            source,
        })?;

    tracing::info!(store = store.name(), instances = entities.len(), today = %today, "starting backup run");

    let mut outcomes = Vec::with_capacity(entities.len());
    let mut jobs = Vec::new();
    // images are matched to instances by name, so one name means one image list
    let mut claimed: BTreeMap<String, String> = BTreeMap::new();

    for entity in entities {
        if entity.has_tag(&config.exclude_tag) {
            tracing::info!(instance = %entity.id, name = %entity.name, tag = %config.exclude_tag, "excluded, ignoring");
            outcomes.push(EntityOutcome::excluded(&entity));
            continue;
        }

        if let Some(owner) = claimed.get(&entity.name) {
            tracing::error!(instance = %entity.id, name = %entity.name, owner = %owner, "name already used by another instance, skipping");
            outcomes.push(EntityOutcome::name_clash(&entity, owner));
            continue;
        }
        claimed.insert(entity.name.clone(), entity.id.clone());

        let backups = store
            .list_backups(&entity)
            .map_err(|source| RunError::Enumeration {
                what: format!("images of {}", entity.name),
                source,
            })?;

        match (backups.iter().map(|b| b.created_on).min(), backups.iter().map(|b| b.created_on).max()) {
            (Some(first), Some(last)) => tracing::info!(
                name = %entity.name,
                state = %entity.state,
                images = backups.len(),
                since = %first,
                till = %last,
                "found images"
            ),
            _ => tracing::info!(name = %entity.name, state = %entity.state, "no backup images found"),
        }

        let plan = config.policy.plan(today, &backups);
        jobs.push(Job { entity, plan });
    }

    outcomes.extend(execute(store, jobs, today, mode, config.workers));
    outcomes.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.entity_id.cmp(&b.entity_id)));

    let report = RunReport {
        today,
        mode,
        store: store.name().to_string(),
        entities: outcomes,
        duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
    };

    tracing::info!(
        created = report.created_count(),
        deleted = report.deleted_count(),
        excluded = report.excluded_count(),
        failures = report.failures().count(),
        duration_ms = report.duration_ms,
        "backup run complete"
    );

    Ok(report)
}

/// Runs every job on a pool of `workers` threads. Each job's failures stay
/// inside its own outcome.
fn execute(
    store: &dyn ImageStore,
    jobs: Vec<Job>,
    today: NaiveDate,
    mode: RunMode,
    workers: usize,
) -> Vec<EntityOutcome> {
    if jobs.is_empty() {
        return Vec::new();
    }

    let workers = workers.clamp(1, jobs.len());
    let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
    let (out_tx, out_rx) = crossbeam_channel::unbounded::<EntityOutcome>();

    for job in jobs {
        // receiver is alive until the scope below ends
        let _ = job_tx.send(job);
    }
    drop(job_tx);

    thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let out_tx = out_tx.clone();
            scope.spawn(move || {
                for job in job_rx.iter() {
                    let _ = out_tx.send(process_entity(store, job, today, mode));
                }
            });
        }
    });
    drop(out_tx);

    out_rx.iter().collect()
}

/// Runs one store call, turning a panic inside it into an error so the
/// outcome still reflects whatever the store already did for the instance.
fn guarded<T>(call: impl FnOnce() -> Result<T, StoreError>) -> Result<T, StoreError> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(StoreError::Panicked(message))
        }
    }
}

fn process_entity(store: &dyn ImageStore, job: Job, today: NaiveDate, mode: RunMode) -> EntityOutcome {
    let Job { entity, plan } = job;
    let mut failures = Vec::new();

    for kept in &plan.keep {
        tracing::info!(
            image = %kept.backup.id,
            name = %entity.name,
            created_on = %kept.backup.created_on,
            age_days = kept.age_days,
            "keeping image"
        );
    }

    let creation = if plan.has_backup_from_today() {
        tracing::info!(name = %entity.name, instance = %entity.id, "fresh image already exists, skipping create");
        Creation::AlreadyFresh
    } else {
        match mode {
            RunMode::DryRun => {
                tracing::info!(name = %entity.name, instance = %entity.id, "would create image");
                Creation::Planned
            }
            RunMode::Execute => match guarded(|| store.create_backup(&entity, today)) {
                Ok(backup) => {
                    tracing::info!(name = %entity.name, instance = %entity.id, image = %backup.id, "created image");
                    Creation::Created(backup.id)
                }
                Err(e) => {
                    tracing::error!(name = %entity.name, instance = %entity.id, error = %e, "image creation failed");
                    failures.push(Failure {
                        kind: FailureKind::Creation,
                        entity: entity.name.clone(),
                        target: entity.id.clone(),
                        message: e.to_string(),
                    });
                    Creation::Failed
                }
            },
        }
    };

    let mut kept = plan.keep;
    let mut deleted = Vec::with_capacity(plan.delete.len());

    for stale in plan.delete {
        match mode {
            RunMode::DryRun => {
                tracing::info!(
                    image = %stale.backup.id,
                    name = %entity.name,
                    age_days = stale.age_days,
                    "would remove image"
                );
                deleted.push(stale);
            }
            RunMode::Execute => match guarded(|| store.delete_backup(&stale.backup)) {
                Ok(()) => {
                    tracing::info!(
                        image = %stale.backup.id,
                        name = %entity.name,
                        created_on = %stale.backup.created_on,
                        age_days = stale.age_days,
                        "removed image"
                    );
                    deleted.push(stale);
                }
                Err(e) => {
                    tracing::error!(image = %stale.backup.id, name = %entity.name, error = %e, "image removal failed");
                    failures.push(Failure {
                        kind: FailureKind::Deletion,
                        entity: entity.name.clone(),
                        target: stale.backup.id.clone(),
                        message: e.to_string(),
                    });
                    // still there, the next run will reconsider it
                    kept.push(stale);
                }
            },
        }
    }

    EntityOutcome {
        entity_id: entity.id,
        name: entity.name,
        state: entity.state,
        excluded: false,
        creation,
        kept,
        deleted,
        failures,
    }
}
