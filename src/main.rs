use ami_keeper::cli::{Cli, Command, HistoryArgs, PlanArgs, RunArgs};
use ami_keeper::config::Config;
use ami_keeper::history::History;
use ami_keeper::platform;
use ami_keeper::report;
use ami_keeper::retention;
use ami_keeper::run::{self, RunError, RunMode, RunReport};
use ami_keeper::store::aws::AwsCliStore;
use ami_keeper::store::memory::MemoryStore;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Exit code for a run that finished with recovered failures.
const EXIT_PARTIAL: i32 = 2;

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn format_timestamp(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn run_command(args: RunArgs) {
    init_tracing(args.verbose);

    let config = match Config::from_run_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config: {e}");
            std::process::exit(1);
        }
    };

    let today = args.today.unwrap_or_else(|| chrono::Local::now().date_naive());
    let mode = if config.dry_run { RunMode::DryRun } else { RunMode::Execute };

    // a drill whose inventory could not be written back has lost its changes
    let mut unsaved = None;

    let result: Result<RunReport, RunError> = match &config.inventory {
        Some(path) => {
            let store = match MemoryStore::load(path) {
                Ok(store) => store,
                Err(e) => {
                    eprintln!("Error loading inventory: {e}");
                    std::process::exit(1);
                }
            };

            let result = run::run(&store, &config, today, mode);
            if result.is_ok() && mode == RunMode::Execute {
                if let Err(e) = store.save(path) {
                    tracing::error!(error = %e, "failed to write inventory back");
                    unsaved = Some(e);
                }
            }
            result
        }
        None => {
            if !platform::aws_cli_available(&config.aws.cli) {
                eprintln!("`{}` not found or not working. Install the AWS CLI or pass --inventory.", config.aws.cli);
                std::process::exit(1);
            }
            let store = AwsCliStore::new(config.aws.clone());
            run::run(&store, &config, today, mode)
        }
    };

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, "backup run aborted");
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if config.history {
        match History::open().and_then(|mut history| history.record(&report)) {
            Ok(id) => tracing::debug!(run_id = id, "recorded run in history"),
            Err(e) => tracing::warn!(error = %e, "failed to record run history"),
        }
    }

    report::print(&report, &config);

    if let Some(e) = &unsaved {
        eprintln!("Error saving inventory: {e}");
    }

    let code = exit_code(&report, unsaved.is_none());
    if code != 0 {
        std::process::exit(code);
    }
}

/// 1 when the drill inventory was not written back, 2 for recovered
/// failures, 0 otherwise.
fn exit_code(report: &RunReport, inventory_saved: bool) -> i32 {
    if !inventory_saved {
        1
    } else if report.has_failures() {
        EXIT_PARTIAL
    } else {
        0
    }
}

fn plan_command(args: PlanArgs) {
    let retained = retention::compute_retain_set(args.ages.iter().copied());

    if args.json {
        println!("{}", report::json::render_plan(&args.ages, &retained));
    } else {
        print!("{}", report::table::render_plan(&args.ages, &retained));
        println!(
            "\nkeep {} of {} backups",
            args.ages.iter().filter(|a| retained.contains(a)).count(),
            args.ages.len()
        );
    }
}

fn history_command(args: HistoryArgs) {
    let history = match History::open() {
        Ok(history) => history,
        Err(e) => {
            eprintln!("Error opening history: {e}");
            std::process::exit(1);
        }
    };

    let Some(id) = args.id else {
        let runs = match history.list_runs() {
            Ok(runs) => runs,
            Err(e) => {
                eprintln!("Error listing runs: {e}");
                std::process::exit(1);
            }
        };

        if args.json {
            println!("{}", serde_json::to_string_pretty(&runs).unwrap_or_default());
        } else if runs.is_empty() {
            println!("No runs recorded. Run 'ami-keeper run' to create one.");
        } else {
            println!(
                "{:<6} {:<20} {:<11} {:<8} {:>9} {:>8} {:>8} {:>9}",
                "ID", "Started", "Date", "Mode", "Instances", "Created", "Deleted", "Failures"
            );
            println!("{}", "-".repeat(86));

            for run in runs {
                println!(
                    "{:<6} {:<20} {:<11} {:<8} {:>9} {:>8} {:>8} {:>9}",
                    run.id,
                    format_timestamp(run.started_at),
                    run.run_date,
                    run.mode,
                    run.instances,
                    run.created,
                    run.deleted,
                    run.failures
                );
            }
        }
        return;
    };

    let run = match history.get_run(id) {
        Ok(Some(run)) => run,
        Ok(None) => {
            eprintln!("Run {id} not found");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error loading run {id}: {e}");
            std::process::exit(1);
        }
    };

    let failures = match history.load_failures(id) {
        Ok(failures) => failures,
        Err(e) => {
            eprintln!("Error loading failures for run {id}: {e}");
            std::process::exit(1);
        }
    };

    if args.json {
        let value = serde_json::json!({ "run": run, "failures": failures });
        println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
        return;
    }

    println!("Run #{} ({}), {} for {}", run.id, format_timestamp(run.started_at), run.mode, run.run_date);
    println!(
        "  {} instances, {} created, {} deleted, {:.2}s",
        run.instances,
        run.created,
        run.deleted,
        run.duration_ms as f64 / 1000.0
    );

    if failures.is_empty() {
        println!("\nNo failures.");
    } else {
        println!("\nFailures:");
        for failure in failures {
            println!("  [{}] {} ({}): {}", failure.kind, failure.entity, failure.target, failure.message);
        }
    }
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run_command(args),
        Command::Plan(args) => plan_command(args),
        Command::History(args) => history_command(args),
    }
}
