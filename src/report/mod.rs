pub mod json;
pub mod table;

use crate::config::Config;
use crate::run::RunReport;

pub fn print(report: &RunReport, config: &Config) {
    if config.json_output {
        println!("{}", json::render(report));
    } else {
        print!("{}", table::render(report, config.verbose));
        print_run_info(report);
        print_failures(report);
    }
}

fn print_run_info(report: &RunReport) {
    let duration_sec = report.duration_ms as f64 / 1000.0;
    println!("run for {} via {} completed in {duration_sec:.2}s", report.today, report.store);
}

fn print_failures(report: &RunReport) {
    if !report.has_failures() {
        return;
    }

    println!();
    println!("Failures:");
    println!("{}", "-".repeat(40));
    for failure in report.failures() {
        println!(
            "  [{}] {} ({}): {}",
            failure.kind.as_str(),
            failure.entity,
            failure.target,
            failure.message
        );
    }
}
