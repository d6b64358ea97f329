//! Exponential retention planner.
//!
//! Decides which existing backups of one instance survive a run:
//! - Ages 0 (today) and 1 (yesterday) are always kept
//! - Every older age falls into bucket n = floor(log2(age)), covering [2^n, 2^(n+1))
//! - Only the oldest backup of each non-empty bucket is kept
//!
//! Empty buckets are simply skipped, so gaps in history (first deployment,
//! downtime) are tolerated. The number of kept backups grows with the log of
//! the oldest backup's age.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::Serialize;

use crate::store::model::Backup;

/// Bucket an age belongs to. Ages 0 and 1 are outside every bucket.
pub fn bucket_index(age: u64) -> Option<u32> {
    if age < 2 {
        None
    } else {
        Some(age.ilog2())
    }
}

/// Computes the ages to keep. Everything not returned is to be deleted.
pub fn compute_retain_set<I>(ages: I) -> BTreeSet<u64>
where
    I: IntoIterator<Item = u64>,
{
    let mut retained = BTreeSet::new();
    let mut oldest_per_bucket: BTreeMap<u32, u64> = BTreeMap::new();

    for age in ages {
        match bucket_index(age) {
            None => {
                retained.insert(age);
            }
            Some(bucket) => {
                let oldest = oldest_per_bucket.entry(bucket).or_insert(age);
                if age > *oldest {
                    *oldest = age;
                }
            }
        }
    }

    retained.extend(oldest_per_bucket.into_values());
    retained
}

/// Whole days between a backup's creation and `today`. Future dates count as 0.
pub fn age_in_days(today: NaiveDate, created_on: NaiveDate) -> u64 {
    u64::try_from((today - created_on).num_days()).unwrap_or(0)
}

#[derive(Debug, Clone, Serialize)]
pub struct AgedBackup {
    pub backup: Backup,
    pub age_days: u64,
}

/// Keep/delete split for one instance. Each backup is in exactly one side.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EntityPlan {
    pub keep: Vec<AgedBackup>,
    pub delete: Vec<AgedBackup>,
}

impl EntityPlan {
    pub fn has_backup_from_today(&self) -> bool {
        self.keep.iter().chain(&self.delete).any(|b| b.age_days == 0)
    }
}

/// Knobs layered on top of the bucket scheme.
///
/// `min_backups` leaves small histories alone entirely, `max_age_days`
/// expires kept backups past a hard horizon. Both are off by default, in
/// which case `plan` is exactly `compute_retain_set` applied to backups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub min_backups: usize,
    pub max_age_days: Option<u64>,
}

impl RetentionPolicy {
    pub fn plan(&self, today: NaiveDate, backups: &[Backup]) -> EntityPlan {
        let mut aged: Vec<AgedBackup> = backups
            .iter()
            .map(|b| AgedBackup {
                age_days: age_in_days(today, b.created_on),
                backup: b.clone(),
            })
            .collect();

        // oldest first, ties broken by id so output is stable
        aged.sort_by(|a, b| {
            b.age_days
                .cmp(&a.age_days)
                .then_with(|| a.backup.id.cmp(&b.backup.id))
        });

        if aged.len() < self.min_backups {
            return EntityPlan { keep: aged, delete: Vec::new() };
        }

        let retain = compute_retain_set(aged.iter().map(|b| b.age_days));
        let (mut keep, mut delete): (Vec<_>, Vec<_>) =
            aged.into_iter().partition(|b| retain.contains(&b.age_days));

        if let Some(max_age) = self.max_age_days {
            // keep is oldest first, so expire from the front
            let floor = self.min_backups.max(1);
            while keep.len() > floor && keep[0].age_days > max_age {
                delete.push(keep.remove(0));
            }
        }

        EntityPlan { keep, delete }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ages: &[u64]) -> BTreeSet<u64> {
        ages.iter().copied().collect()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn backup(id: &str, created_on: NaiveDate) -> Backup {
        Backup {
            id: id.to_string(),
            entity_name: "web".to_string(),
            name: format!("web-{}", created_on.format("%m%d%y")),
            created_on,
        }
    }

    #[test]
    fn scenario_mixed_history() {
        let ages = [0, 1, 2, 3, 5, 9, 20, 40, 100];
        let retained = compute_retain_set(ages);
        assert_eq!(retained, set(&[0, 1, 3, 5, 9, 20, 40, 100]));

        let deleted: Vec<u64> = ages.iter().copied().filter(|a| !retained.contains(a)).collect();
        assert_eq!(deleted, vec![2]);
    }

    #[test]
    fn today_and_yesterday_only() {
        assert_eq!(compute_retain_set([0, 1]), set(&[0, 1]));
    }

    #[test]
    fn day_before_yesterday_alone_in_its_bucket() {
        assert_eq!(compute_retain_set([0, 1, 2]), set(&[0, 1, 2]));
    }

    #[test]
    fn empty_input_retains_nothing() {
        assert!(compute_retain_set(Vec::<u64>::new()).is_empty());
    }

    #[test]
    fn bucket_boundaries_have_no_gaps_or_overlap() {
        assert_eq!(bucket_index(0), None);
        assert_eq!(bucket_index(1), None);
        assert_eq!(bucket_index(2), Some(1));
        assert_eq!(bucket_index(3), Some(1));
        assert_eq!(bucket_index(4), Some(2));
        assert_eq!(bucket_index(7), Some(2));
        assert_eq!(bucket_index(8), Some(3));
        assert_eq!(bucket_index(u64::MAX), Some(63));

        for age in 2..4096u64 {
            let n = bucket_index(age).unwrap();
            assert!(1u64 << n <= age && age < 1u64 << (n + 1), "age {age} in bucket {n}");
        }
    }

    #[test]
    fn keeps_oldest_in_each_bucket() {
        // bucket 3 = [8, 16)
        assert_eq!(compute_retain_set([8, 9, 12, 15]), set(&[15]));
        // bucket 4 = [16, 32) and bucket 5 = [32, 64)
        assert_eq!(compute_retain_set([16, 31, 32, 63]), set(&[31, 63]));
    }

    #[test]
    fn daily_history_is_logarithmic() {
        for days in [10u64, 100, 1000, 10_000] {
            let retained = compute_retain_set(0..=days);
            let bound = 2 + u64::from(days.ilog2());
            assert!(retained.len() as u64 <= bound, "{days} days kept {}", retained.len());
        }
    }

    #[test]
    fn rerun_on_pruned_state_deletes_nothing() {
        let first = compute_retain_set(0..=400);
        let second = compute_retain_set(first.iter().copied());
        assert_eq!(first, second);
    }

    #[test]
    fn duplicates_at_retained_age_are_kept() {
        assert_eq!(compute_retain_set([5, 5, 4, 1, 1]), set(&[1, 5]));
    }

    #[test]
    fn large_ages_are_handled() {
        let retained = compute_retain_set([u64::MAX, u64::MAX - 1, 1 << 40]);
        assert_eq!(retained, set(&[u64::MAX, 1 << 40]));
    }

    #[test]
    fn age_in_days_clamps_future_dates() {
        let today = day(2024, 3, 10);
        assert_eq!(age_in_days(today, day(2024, 3, 10)), 0);
        assert_eq!(age_in_days(today, day(2024, 3, 1)), 9);
        assert_eq!(age_in_days(today, day(2024, 3, 12)), 0);
    }

    #[test]
    fn plan_partitions_every_backup() {
        let today = day(2024, 3, 10);
        let backups: Vec<Backup> = (0..30)
            .map(|i| backup(&format!("ami-{i:04}"), today - chrono::Duration::days(i)))
            .collect();

        let plan = RetentionPolicy::default().plan(today, &backups);
        assert_eq!(plan.keep.len() + plan.delete.len(), backups.len());

        let kept: BTreeSet<u64> = plan.keep.iter().map(|b| b.age_days).collect();
        assert_eq!(kept, compute_retain_set(0..30));
        assert!(plan.has_backup_from_today());
    }

    #[test]
    fn plan_skips_small_histories() {
        let today = day(2024, 3, 10);
        let backups = vec![
            backup("ami-a", day(2024, 3, 8)),
            backup("ami-b", day(2024, 3, 7)),
        ];
        let policy = RetentionPolicy { min_backups: 6, max_age_days: None };

        let plan = policy.plan(today, &backups);
        assert_eq!(plan.keep.len(), 2);
        assert!(plan.delete.is_empty());
        assert!(!plan.has_backup_from_today());
    }

    #[test]
    fn plan_expires_beyond_max_age() {
        let today = day(2024, 3, 10);
        let backups = vec![
            backup("ami-old", today - chrono::Duration::days(500)),
            backup("ami-mid", today - chrono::Duration::days(200)),
            backup("ami-new", today - chrono::Duration::days(1)),
        ];
        let policy = RetentionPolicy { min_backups: 0, max_age_days: Some(365) };

        let plan = policy.plan(today, &backups);
        let deleted: Vec<&str> = plan.delete.iter().map(|b| b.backup.id.as_str()).collect();
        assert_eq!(deleted, vec!["ami-old"]);
        assert_eq!(plan.keep.len(), 2);
    }

    #[test]
    fn max_age_never_expires_last_backup() {
        let today = day(2024, 3, 10);
        let backups = vec![backup("ami-only", today - chrono::Duration::days(900))];
        let policy = RetentionPolicy { min_backups: 0, max_age_days: Some(365) };

        let plan = policy.plan(today, &backups);
        assert_eq!(plan.keep.len(), 1);
        assert!(plan.delete.is_empty());
    }
}
