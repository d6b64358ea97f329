//! EC2 image store backed by the `aws` command line.
//!
//! Runs `aws ec2 <operation> --output json` and parses the responses:
//! - describe-instances: instances (optionally filtered from config)
//! - describe-images: private, available EBS machine images named `<instance>-<MMDDYY>`,
//!   listed once and grouped by the instance name in front of the date suffix
//! - create-image: today's image, `--no-reboot` for running instances
//! - deregister-image + delete-snapshot: image removal with its snapshots
//!
//! Credentials and profiles are whatever the CLI resolves on its own.
//! Every invocation is bounded by the configured command timeout; a hung
//! CLI process is killed.

use std::collections::BTreeMap;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::model::{Backup, SourceEntity};
use super::{naming, ImageStore, StoreError};
use crate::config::AwsConfig;

pub struct AwsCliStore {
    config: AwsConfig,
    /// Own images keyed by owner name, filled on the first listing and kept
    /// in step with creates and deletes made through this store.
    images: Mutex<Option<BTreeMap<String, Vec<Backup>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstances {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Instance {
    instance_id: String,
    state: InstanceState,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceState {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Tag {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeImages {
    #[serde(default)]
    images: Vec<Image>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Image {
    image_id: String,
    name: String,
    creation_date: String,
    #[serde(default)]
    public: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateImage {
    image_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSnapshots {
    #[serde(default)]
    snapshots: Vec<Snapshot>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Snapshot {
    snapshot_id: String,
    #[serde(default)]
    description: String,
}

impl AwsCliStore {
    pub fn new(config: AwsConfig) -> Self {
        AwsCliStore {
            config,
            images: Mutex::new(None),
        }
    }

    fn images(&self) -> MutexGuard<'_, Option<BTreeMap<String, Vec<Backup>>>> {
        self.images.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_json<T: DeserializeOwned>(&self, args: &[String]) -> Result<T, StoreError> {
        let stdout = self.run(args)?;
        serde_json::from_str(&stdout).map_err(|source| StoreError::Parse {
            command: command_label(args),
            source,
        })
    }

    fn run(&self, args: &[String]) -> Result<String, StoreError> {
        let command = command_label(args);
        tracing::debug!(command = %command, "invoking aws cli");

        let mut child = Command::new(&self.config.cli)
            .arg("ec2")
            .args(args)
            .args(["--region", self.config.region.as_str(), "--output", "json"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| StoreError::Spawn {
                command: command.clone(),
                source,
            })?;

        // drain pipes on their own threads so a large response can't fill
        // the pipe buffer while we poll
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let timeout = self.config.command_timeout;
        let start = Instant::now();

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if start.elapsed() > timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(StoreError::Timeout { command, timeout });
                    }
                    thread::sleep(Duration::from_millis(100));
                }
                Err(source) => return Err(StoreError::Spawn { command, source }),
            }
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            return Err(StoreError::CommandFailed {
                command,
                status: status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(stdout)
    }

    fn snapshots_of(&self, image_id: &str) -> Result<Vec<String>, StoreError> {
        let owner = self.config.owner_id.as_deref().unwrap_or("self");
        let response: DescribeSnapshots = self.run_json(&args([
            "describe-snapshots",
            "--owner-ids",
            owner,
            "--filters",
            "Name=status,Values=completed",
            format!("Name=description,Values=*{image_id}*").as_str(),
        ]))?;
        Ok(linked_snapshots(response, image_id))
    }
}

impl ImageStore for AwsCliStore {
    fn name(&self) -> &'static str {
        "aws"
    }

    fn list_source_entities(&self) -> Result<Vec<SourceEntity>, StoreError> {
        let mut cmd = args(["describe-instances"]);
        if !self.config.instance_filters.is_empty() {
            cmd.push("--filters".to_string());
            cmd.extend(self.config.instance_filters.iter().map(|f| f.to_cli_arg()));
        }

        let response: DescribeInstances = self.run_json(&cmd)?;
        Ok(parse_instances(response, &self.config.name_tag))
    }

    fn list_backups(&self, entity: &SourceEntity) -> Result<Vec<Backup>, StoreError> {
        let mut images = self.images();
        if images.is_none() {
            // names can hold commas and globs, so no per-instance name filter
            let response: DescribeImages = self.run_json(&args([
                "describe-images",
                "--owners",
                "self",
                "--filters",
                "Name=image-type,Values=machine",
                "Name=root-device-type,Values=ebs",
                "Name=state,Values=available",
            ]))?;
            *images = Some(group_images(response));
        }

        Ok(images
            .as_ref()
            .and_then(|by_owner| by_owner.get(&entity.name))
            .cloned()
            .unwrap_or_default())
    }

    fn create_backup(&self, entity: &SourceEntity, today: NaiveDate) -> Result<Backup, StoreError> {
        let name = naming::image_name(&entity.name, today);
        let description = naming::image_description(entity, &self.config.descriptions, today);

        let mut cmd = args([
            "create-image",
            "--instance-id",
            entity.id.as_str(),
            "--name",
            name.as_str(),
            "--description",
            description.as_str(),
        ]);
        if entity.is_running() {
            cmd.push("--no-reboot".to_string());
        }

        tracing::info!(
            instance = %entity.id,
            name = %name,
            description = %description,
            no_reboot = entity.is_running(),
            "calling create-image"
        );
        let response: CreateImage = self.run_json(&cmd)?;

        let backup = Backup {
            id: response.image_id,
            entity_name: entity.name.clone(),
            name,
            created_on: today,
        };
        if let Some(by_owner) = self.images().as_mut() {
            by_owner.entry(backup.entity_name.clone()).or_default().push(backup.clone());
        }
        Ok(backup)
    }

    fn delete_backup(&self, backup: &Backup) -> Result<(), StoreError> {
        // snapshots stay locked while the image is registered, so look them
        // up first and remove them after deregistering
        let snapshots = self.snapshots_of(&backup.id)?;

        self.run(&args(["deregister-image", "--image-id", backup.id.as_str()]))?;
        if let Some(images) = self.images().as_mut().and_then(|by_owner| by_owner.get_mut(&backup.entity_name)) {
            images.retain(|image| image.id != backup.id);
        }

        for snapshot in snapshots {
            tracing::info!(image = %backup.id, snapshot = %snapshot, "removing snapshot");
            self.run(&args(["delete-snapshot", "--snapshot-id", snapshot.as_str()]))
                .map_err(|e| StoreError::Rejected(format!(
                    "image {} deregistered but snapshot {snapshot} remains: {e}",
                    backup.id
                )))?;
        }

        Ok(())
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn command_label(args: &[String]) -> String {
    match args.first() {
        Some(op) => format!("aws ec2 {op}"),
        None => "aws ec2".to_string(),
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut out = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut out);
        }
        out
    })
}

fn parse_instances(response: DescribeInstances, name_tag: &str) -> Vec<SourceEntity> {
    response
        .reservations
        .into_iter()
        .flat_map(|r| r.instances)
        .map(|instance| {
            let tags: BTreeMap<String, String> = instance
                .tags
                .into_iter()
                .map(|t| (t.key, t.value))
                .collect();
            let name = tags
                .get(name_tag)
                .cloned()
                .unwrap_or_else(|| instance.instance_id.clone());

            SourceEntity {
                id: instance.instance_id,
                name,
                state: instance.state.name,
                tags,
            }
        })
        .collect()
}

/// Groups own images by the instance name they were taken from. Images
/// that don't follow the `<name>-<digits>` scheme are not ours to prune.
fn group_images(response: DescribeImages) -> BTreeMap<String, Vec<Backup>> {
    let mut by_owner: BTreeMap<String, Vec<Backup>> = BTreeMap::new();

    for image in response.images.into_iter().filter(|image| !image.public) {
        let Some(owner) = naming::owner_of_image(&image.name) else {
            tracing::debug!(image = %image.image_id, name = %image.name, "skipping image without date suffix");
            continue;
        };

        let date = image.creation_date.split('T').next().unwrap_or_default();
        let created_on = match NaiveDate::parse_from_str(date, "%Y-%m-%d") {
            Ok(created_on) => created_on,
            Err(e) => {
                tracing::warn!(
                    image = %image.image_id,
                    creation_date = %image.creation_date,
                    error = %e,
                    "skipping image with unreadable creation date"
                );
                continue;
            }
        };

        by_owner.entry(owner.to_string()).or_default().push(Backup {
            id: image.image_id,
            entity_name: owner.to_string(),
            name: image.name,
            created_on,
        });
    }

    by_owner
}

fn linked_snapshots(response: DescribeSnapshots, image_id: &str) -> Vec<String> {
    response
        .snapshots
        .into_iter()
        .filter(|s| {
            let linked = naming::snapshot_image_id(&s.description) == Some(image_id);
            if !linked {
                tracing::debug!(snapshot = %s.snapshot_id, description = %s.description, "skipping unrelated snapshot");
            }
            linked
        })
        .map(|s| s.snapshot_id)
        .collect()
}
