use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cli::RunArgs;
use crate::platform;
use crate::retention::RetentionPolicy;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid duration for `{field}`: {source}")]
    Duration {
        field: &'static str,
        #[source]
        source: humantime::DurationError,
    },

    #[error("`{field}` must be {expected}")]
    Invalid {
        field: &'static str,
        expected: &'static str,
    },
}

/// `--filters` entry passed to describe-instances.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstanceFilter {
    pub name: String,
    pub values: Vec<String>,
}

impl InstanceFilter {
    pub fn to_cli_arg(&self) -> String {
        format!("Name={},Values={}", self.name, self.values.join(","))
    }
}

#[derive(Debug, Clone)]
pub struct AwsConfig {
    pub cli: String,
    pub region: String,
    pub owner_id: Option<String>,
    pub name_tag: String,
    pub instance_filters: Vec<InstanceFilter>,
    pub descriptions: BTreeMap<String, String>,
    pub command_timeout: Duration,
}

impl Default for AwsConfig {
    fn default() -> Self {
        AwsConfig {
            cli: "aws".to_string(),
            region: "us-east-1".to_string(),
            owner_id: None,
            name_tag: "Name".to_string(),
            instance_filters: Vec::new(),
            descriptions: BTreeMap::new(),
            command_timeout: Duration::from_secs(120),
        }
    }
}

pub struct Config {
    pub aws: AwsConfig,
    /// Instances carrying this tag are never backed up.
    pub exclude_tag: String,
    pub workers: usize,
    pub policy: RetentionPolicy,
    pub dry_run: bool,
    pub json_output: bool,
    pub verbose: bool,
    pub history: bool,
    pub inventory: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            aws: AwsConfig::default(),
            exclude_tag: "opsworks:stack".to_string(),
            workers: 4,
            policy: RetentionPolicy::default(),
            dry_run: false,
            json_output: false,
            verbose: false,
            history: true,
            inventory: None,
        }
    }
}

/// On-disk layout of config.toml. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    region: Option<String>,
    owner_id: Option<String>,
    aws_cli: Option<String>,
    command_timeout: Option<String>,
    name_tag: Option<String>,
    exclude_tag: Option<String>,
    workers: Option<usize>,
    min_backups: Option<usize>,
    max_age: Option<String>,
    history: Option<bool>,
    #[serde(default)]
    descriptions: BTreeMap<String, String>,
    #[serde(default)]
    instance_filters: Vec<InstanceFilter>,
}

impl Config {
    /// Builds the run configuration: defaults, then config file, then flags.
    pub fn from_run_args(args: &RunArgs) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => Some(read_file(path)?),
            None => match default_path() {
                Some(path) if path.exists() => Some(read_file(&path)?),
                _ => None,
            },
        };

        let mut config = match file {
            Some(file) => Config::from_file(file)?,
            None => Config::default(),
        };

        if let Some(workers) = args.workers {
            config.workers = workers;
        }
        if config.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "workers",
                expected: "at least 1",
            });
        }

        config.dry_run = args.dry_run;
        config.json_output = args.json;
        config.verbose = args.verbose;
        config.history = config.history && !args.no_history;
        config.inventory = args.inventory.clone();

        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        Config::from_file(file)
    }

    fn from_file(file: FileConfig) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let command_timeout = match file.command_timeout {
            Some(raw) => parse_duration("command_timeout", &raw)?,
            None => defaults.aws.command_timeout,
        };

        let max_age_days = match file.max_age {
            Some(raw) => {
                let days = parse_duration("max_age", &raw)?.as_secs() / SECONDS_PER_DAY;
                if days == 0 {
                    return Err(ConfigError::Invalid {
                        field: "max_age",
                        expected: "at least one day",
                    });
                }
                Some(days)
            }
            None => None,
        };

        Ok(Config {
            aws: AwsConfig {
                cli: file.aws_cli.unwrap_or(defaults.aws.cli),
                region: file.region.unwrap_or(defaults.aws.region),
                owner_id: file.owner_id,
                name_tag: file.name_tag.unwrap_or(defaults.aws.name_tag),
                instance_filters: file.instance_filters,
                descriptions: file.descriptions,
                command_timeout,
            },
            exclude_tag: file.exclude_tag.unwrap_or(defaults.exclude_tag),
            workers: file.workers.unwrap_or(defaults.workers),
            policy: RetentionPolicy {
                min_backups: file.min_backups.unwrap_or(0),
                max_age_days,
            },
            history: file.history.unwrap_or(defaults.history),
            ..defaults
        })
    }
}

/// ~/.config/ami-keeper/config.toml or the platform equivalent.
pub fn default_path() -> Option<PathBuf> {
    platform::config_dir().map(|dir| dir.join("config.toml"))
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn parse_duration(field: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(raw).map_err(|source| ConfigError::Duration { field, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(config: Option<PathBuf>) -> RunArgs {
        RunArgs {
            config,
            dry_run: true,
            today: None,
            workers: None,
            inventory: None,
            json: false,
            verbose: false,
            no_history: true,
        }
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.aws.region, "us-east-1");
        assert_eq!(config.exclude_tag, "opsworks:stack");
        assert_eq!(config.workers, 4);
        assert_eq!(config.policy, RetentionPolicy::default());
        assert_eq!(config.aws.command_timeout, Duration::from_secs(120));
    }

    #[test]
    fn full_file_is_applied() {
        let config = Config::from_toml(
            r#"
            region = "eu-west-1"
            owner_id = "123456789012"
            command_timeout = "30s"
            workers = 8
            min_backups = 6
            max_age = "365d"
            history = false

            [descriptions]
            infosrv = "Informational Server"

            [[instance_filters]]
            name = "tag:Backup"
            values = ["Yes"]
            "#,
        )
        .unwrap();

        assert_eq!(config.aws.region, "eu-west-1");
        assert_eq!(config.aws.owner_id.as_deref(), Some("123456789012"));
        assert_eq!(config.aws.command_timeout, Duration::from_secs(30));
        assert_eq!(config.workers, 8);
        assert_eq!(config.policy.min_backups, 6);
        assert_eq!(config.policy.max_age_days, Some(365));
        assert!(!config.history);
        assert_eq!(config.aws.descriptions["infosrv"], "Informational Server");
        assert_eq!(config.aws.instance_filters[0].to_cli_arg(), "Name=tag:Backup,Values=Yes");
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(matches!(
            Config::from_toml("max_age = \"soon\""),
            Err(ConfigError::Duration { field: "max_age", .. })
        ));
        assert!(matches!(
            Config::from_toml("max_age = \"2h\""),
            Err(ConfigError::Invalid { field: "max_age", .. })
        ));
        assert!(matches!(Config::from_toml("regoin = \"x\""), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "workers = 2\nhistory = true\n").unwrap();

        let mut args = run_args(Some(path));
        args.workers = Some(16);
        let config = Config::from_run_args(&args).unwrap();

        assert_eq!(config.workers, 16);
        assert!(config.dry_run);
        assert!(!config.history);
    }

    #[test]
    fn zero_workers_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "workers = 0\n").unwrap();

        assert!(matches!(
            Config::from_run_args(&run_args(Some(path))),
            Err(ConfigError::Invalid { field: "workers", .. })
        ));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let args = run_args(Some(PathBuf::from("/nonexistent/ami-keeper.toml")));
        assert!(matches!(Config::from_run_args(&args), Err(ConfigError::Read { .. })));
    }
}
