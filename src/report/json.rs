//! JSON output for run reports and age plans.
//!
//! For scripting and alerting pipelines.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::run::RunReport;

#[derive(Serialize)]
struct AgePlan<'a> {
    retain: &'a BTreeSet<u64>,
    delete: Vec<u64>,
}

pub fn render(report: &RunReport) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
}

pub fn render_plan(ages: &[u64], retained: &BTreeSet<u64>) -> String {
    let mut delete: Vec<u64> = ages.iter().copied().filter(|a| !retained.contains(a)).collect();
    delete.sort_unstable();

    let plan = AgePlan { retain: retained, delete };
    serde_json::to_string_pretty(&plan).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
}
