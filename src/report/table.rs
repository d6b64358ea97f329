//! Plain text rendering of run reports.
//!
//! One row per instance, sorted by name:
//! - what happened to today's image
//! - how many images were kept and removed
//! - failure count
//!
//! Verbose mode lists every kept and removed image under its instance.

use std::collections::BTreeSet;

use crate::run::{Creation, RunMode, RunReport};

pub fn render(report: &RunReport, verbose: bool) -> String {
    if report.entities.is_empty() {
        return String::from("No instances found.\n");
    }

    let mut output = String::new();
    let removed_label = match report.mode {
        RunMode::DryRun => "Would remove",
        RunMode::Execute => "Removed",
    };

    output.push_str(&format!(
        "\n{:<30} {:<20} {:>6} {:>13} {:>9}\n",
        "Instance", "Today", "Kept", removed_label, "Failures"
    ));
    output.push_str(&"-".repeat(82));
    output.push('\n');

    for entity in &report.entities {
        output.push_str(&format!(
            "{:<30} {:<20} {:>6} {:>13} {:>9}\n",
            truncate(&entity.name, 30),
            creation_label(&entity.creation),
            entity.kept.len(),
            entity.deleted.len(),
            entity.failures.len()
        ));

        if verbose {
            for kept in &entity.kept {
                output.push_str(&format!(
                    "    keep   {} {} ({}d)\n",
                    kept.backup.id, kept.backup.created_on, kept.age_days
                ));
            }
            for deleted in &entity.deleted {
                output.push_str(&format!(
                    "    remove {} {} ({}d)\n",
                    deleted.backup.id, deleted.backup.created_on, deleted.age_days
                ));
            }
        }
    }

    output.push_str(&format!(
        "\n{} instances, {} excluded, {} images {}, {} {}\n",
        report.entities.len(),
        report.excluded_count(),
        report.created_count(),
        if report.mode == RunMode::DryRun { "to create" } else { "created" },
        report.deleted_count(),
        if report.mode == RunMode::DryRun { "to remove" } else { "removed" },
    ));

    output
}

/// Keep/delete split for a bare list of ages.
pub fn render_plan(ages: &[u64], retained: &BTreeSet<u64>) -> String {
    let mut sorted = ages.to_vec();
    sorted.sort_unstable();

    let mut output = String::new();
    for age in sorted {
        let verdict = if retained.contains(&age) { "keep" } else { "delete" };
        output.push_str(&format!("{age:>8}d  {verdict}\n"));
    }
    output
}

fn creation_label(creation: &Creation) -> String {
    match creation {
        Creation::Created(id) => id.clone(),
        Creation::AlreadyFresh => "already fresh".to_string(),
        Creation::Planned => "would create".to_string(),
        Creation::Failed => "FAILED".to_string(),
        Creation::Skipped => "excluded".to_string(),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{truncated}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retention::compute_retain_set;
    use crate::run::EntityOutcome;
    use chrono::NaiveDate;

    fn outcome(name: &str, creation: Creation) -> EntityOutcome {
        EntityOutcome {
            entity_id: format!("i-{name}"),
            name: name.to_string(),
            state: "running".to_string(),
            excluded: matches!(creation, Creation::Skipped),
            creation,
            kept: Vec::new(),
            deleted: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn report(mode: RunMode, entities: Vec<EntityOutcome>) -> RunReport {
        RunReport {
            today: NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
            mode,
            store: "memory".to_string(),
            entities,
            duration_ms: 3,
        }
    }

    #[test]
    fn empty_report() {
        assert_eq!(render(&report(RunMode::Execute, vec![]), false), "No instances found.\n");
    }

    #[test]
    fn rows_and_summary() {
        let text = render(
            &report(
                RunMode::Execute,
                vec![
                    outcome("web", Creation::Created("ami-00000001".to_string())),
                    outcome("ops", Creation::Skipped),
                ],
            ),
            false,
        );

        assert!(text.contains("ami-00000001"));
        assert!(text.contains("excluded"));
        assert!(text.contains("Removed"));
        assert!(text.contains("2 instances, 1 excluded, 1 images created, 0 removed"));
    }

    #[test]
    fn dry_run_wording() {
        let text = render(&report(RunMode::DryRun, vec![outcome("web", Creation::Planned)]), false);
        assert!(text.contains("Would remove"));
        assert!(text.contains("1 images to create"));
    }

    #[test]
    fn long_names_truncated() {
        assert_eq!(truncate("short", 30), "short");
        assert_eq!(truncate(&"x".repeat(40), 10), "xxxxxxx...");
    }

    #[test]
    fn plan_lines_sorted() {
        let ages = [3, 0, 2];
        let text = render_plan(&ages, &compute_retain_set(ages));
        assert_eq!(text, "       0d  keep\n       2d  delete\n       3d  keep\n");
    }
}
