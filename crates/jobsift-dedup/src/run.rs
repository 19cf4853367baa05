//! Fetch → group → merge orchestration for one duplicate detection run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use jobsift_core::{DuplicateGroup, DuplicateGroups, JobId, JobRecord, MergeResult};
use jobsift_storage::JobRepository;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::grouping::{detect_duplicate_groups_with_report, GroupingReport};
use crate::locations::{merge_locations, new_location_count};
use crate::{CancellationToken, DedupError};

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.98;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DedupOptions {
    pub limit: Option<usize>,
    pub similarity_threshold: f32,
    pub dry_run: bool,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            limit: None,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            dry_run: false,
        }
    }
}

impl DedupOptions {
    pub fn validate(&self) -> Result<(), DedupError> {
        let t = self.similarity_threshold;
        if !t.is_finite() || !(-1.0..=1.0).contains(&t) {
            return Err(DedupError::InvalidThreshold(t));
        }
        Ok(())
    }
}

/// The write one canonical group needs, computed from the fetched snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupMerge {
    #[serde(flatten)]
    pub group: DuplicateGroup,
    pub merged_locations: Vec<String>,
    pub merged_cities: Vec<String>,
    pub new_locations: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GroupOutcome {
    Planned,
    Committed,
    Declined,
    Failed { error: String },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupReport {
    #[serde(flatten)]
    pub merge: GroupMerge,
    pub outcome: GroupOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupRunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub options: DedupOptions,
    pub grouping: GroupingReport,
    pub result: MergeResult,
    pub groups: Vec<GroupReport>,
}

impl DedupRunReport {
    /// Writes `dedup_report.json` and `dedup_brief.md` under `<reports_root>/<run_id>/`.
    pub async fn write_to(&self, reports_root: &Path) -> anyhow::Result<PathBuf> {
        let run_dir = reports_root.join(self.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let json = serde_json::to_vec_pretty(self).context("serializing dedup report")?;
        let report_path = run_dir.join("dedup_report.json");
        fs::write(&report_path, json)
            .await
            .with_context(|| format!("writing {}", report_path.display()))?;

        fs::write(run_dir.join("dedup_brief.md"), self.brief_markdown())
            .await
            .context("writing dedup_brief.md")?;

        Ok(report_path)
    }

    pub fn brief_markdown(&self) -> String {
        let r = &self.result;
        let reduction = r
            .reduction_pct()
            .map(|pct| format!("{pct:.2}%"))
            .unwrap_or_else(|| "n/a".to_string());
        let groups = self
            .groups
            .iter()
            .map(|g| {
                format!(
                    "- {} <- {:?} ({:?})",
                    g.merge.group.canonical_id, g.merge.group.duplicate_ids, g.outcome
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            concat!(
                "# JobSift Dedup Brief\n\n",
                "- Run ID: `{}`\n- Started: {}\n- Finished: {}\n",
                "- Dry run: {}\n- Threshold: {}\n",
                "- Jobs analyzed: {}\n- Duplicate groups: {}\n- Duplicates merged: {}\n",
                "- Locations merged: {}\n- Groups failed: {}\n- Reduction: {}\n\n",
                "## Groups\n{}\n",
            ),
            self.run_id,
            self.started_at,
            self.finished_at,
            r.dry_run,
            self.options.similarity_threshold,
            r.jobs_analyzed,
            r.duplicate_groups,
            r.duplicates_merged,
            r.locations_merged,
            r.groups_failed,
            reduction,
            groups
        )
    }
}

/// Resolves every group against the already-fetched jobs.
pub fn plan_merges(jobs: &[JobRecord], groups: &DuplicateGroups) -> Vec<GroupMerge> {
    let by_id: HashMap<JobId, &JobRecord> = jobs.iter().map(|job| (job.id, job)).collect();
    let mut plans = Vec::with_capacity(groups.len());

    for group in DuplicateGroup::from_groups(groups) {
        let canonical_id = group.canonical_id;
        let Some(canonical) = by_id.get(&canonical_id).copied() else {
            warn!(canonical_id, "canonical missing from fetched jobs; skipping group");
            continue;
        };
        let duplicates: Vec<&JobRecord> = group
            .duplicate_ids
            .iter()
            .filter_map(|id| by_id.get(id).copied())
            .collect();
        if duplicates.is_empty() {
            continue;
        }
        let (merged_locations, merged_cities) = merge_locations(canonical, &duplicates);
        plans.push(GroupMerge {
            group: DuplicateGroup {
                canonical_id,
                duplicate_ids: duplicates.iter().map(|job| job.id).collect(),
            },
            new_locations: new_location_count(canonical, &merged_locations),
            merged_locations,
            merged_cities,
        });
    }

    plans
}

/// Folds per-group outcomes into the run summary. Only committed groups count.
pub fn summarize(jobs_analyzed: usize, dry_run: bool, groups: &[GroupReport]) -> MergeResult {
    groups.iter().fold(
        MergeResult {
            jobs_analyzed,
            duplicate_groups: groups.len(),
            dry_run,
            ..Default::default()
        },
        |mut acc, group| {
            match &group.outcome {
                GroupOutcome::Committed => {
                    acc.duplicates_merged += group.merge.group.duplicate_ids.len();
                    acc.locations_merged += group.merge.new_locations;
                }
                GroupOutcome::Declined | GroupOutcome::Failed { .. } => acc.groups_failed += 1,
                GroupOutcome::Skipped => acc.cancelled = true,
                GroupOutcome::Planned => {}
            }
            acc
        },
    )
}

async fn commit_group<R>(repository: &R, merge: &GroupMerge) -> GroupOutcome
where
    R: JobRepository + ?Sized,
{
    let DuplicateGroup {
        canonical_id,
        duplicate_ids,
    } = &merge.group;
    match repository
        .commit_merge(
            *canonical_id,
            duplicate_ids,
            &merge.merged_locations,
            &merge.merged_cities,
        )
        .await
    {
        Ok(true) => {
            info!(
                canonical_id,
                duplicates = duplicate_ids.len(),
                "merged duplicate group"
            );
            GroupOutcome::Committed
        }
        Ok(false) => {
            warn!(canonical_id, "repository declined merge");
            GroupOutcome::Declined
        }
        Err(err) => {
            warn!(canonical_id, error = %err, "merge failed; continuing");
            GroupOutcome::Failed {
                error: err.to_string(),
            }
        }
    }
}

pub async fn run_duplicate_detection<R>(
    repository: &R,
    options: &DedupOptions,
) -> Result<MergeResult, DedupError>
where
    R: JobRepository + ?Sized,
{
    let report = run_with_report(repository, options, &CancellationToken::new()).await?;
    Ok(report.result)
}

/// One full run. Writes are issued one group at a time and stop once `cancel` trips;
/// dry runs never touch the repository after the fetch.
pub async fn run_with_report<R>(
    repository: &R,
    options: &DedupOptions,
    cancel: &CancellationToken,
) -> Result<DedupRunReport, DedupError>
where
    R: JobRepository + ?Sized,
{
    options.validate()?;
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();

    let jobs = repository
        .fetch_candidates(options.limit)
        .await
        .map_err(DedupError::Fetch)?;
    info!(%run_id, jobs = jobs.len(), dry_run = options.dry_run, "fetched duplicate candidates");

    let (groups, grouping) =
        detect_duplicate_groups_with_report(&jobs, options.similarity_threshold);
    let plans = plan_merges(&jobs, &groups);
    info!(
        %run_id,
        groups = plans.len(),
        failed_partitions = grouping.failed_partitions.len(),
        "detected duplicate groups"
    );

    let mut group_reports = Vec::with_capacity(plans.len());
    for merge in plans {
        let outcome = if options.dry_run {
            info!(
                canonical_id = merge.group.canonical_id,
                duplicates = ?merge.group.duplicate_ids,
                locations = ?merge.merged_locations,
                "dry run: would merge"
            );
            GroupOutcome::Planned
        } else if cancel.is_cancelled() {
            GroupOutcome::Skipped
        } else {
            commit_group(repository, &merge).await
        };
        group_reports.push(GroupReport { merge, outcome });
    }

    let result = summarize(jobs.len(), options.dry_run, &group_reports);
    if result.cancelled {
        warn!(%run_id, "run cancelled; remaining groups were not written");
    }
    info!(
        %run_id,
        jobs_analyzed = result.jobs_analyzed,
        duplicate_groups = result.duplicate_groups,
        duplicates_merged = result.duplicates_merged,
        locations_merged = result.locations_merged,
        groups_failed = result.groups_failed,
        "duplicate detection finished"
    );

    Ok(DedupRunReport {
        run_id,
        started_at,
        finished_at: Utc::now(),
        options: *options,
        grouping,
        result,
        groups: group_reports,
    })
}
