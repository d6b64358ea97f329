use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ami-keeper")]
#[command(about = "Daily machine-image backups with exponential retention")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create today's images and prune old ones
    Run(RunArgs),

    /// Show which backup ages the retention policy keeps
    Plan(PlanArgs),

    /// List past runs or the failures of one run
    History(HistoryArgs),
}

#[derive(Parser)]
pub struct RunArgs {
    /// Config file (defaults to the platform config directory)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Compute and print the plan without creating or deleting anything
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Date to plan for, YYYY-MM-DD (defaults to the local date)
    #[arg(long)]
    pub today: Option<NaiveDate>,

    /// Number of instances processed in parallel
    #[arg(long)]
    pub workers: Option<usize>,

    /// Use a JSON inventory file instead of the aws cli
    #[arg(long)]
    pub inventory: Option<PathBuf>,

    /// Output as JSON instead of table
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Debug logging and per-backup detail in the report
    #[arg(long, short = 'v', default_value_t = false)]
    pub verbose: bool,

    /// Don't record this run in the history database
    #[arg(long, default_value_t = false)]
    pub no_history: bool,
}

#[derive(Parser)]
pub struct PlanArgs {
    /// Backup ages in days (0 = today)
    #[arg(long, value_delimiter = ',', required = true)]
    pub ages: Vec<u64>,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Parser)]
pub struct HistoryArgs {
    /// Show the failures recorded for a specific run
    #[arg(long)]
    pub id: Option<i64>,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}
