//! Employer-scoped clustering of postings by title-embedding similarity.

use std::collections::{BTreeMap, BTreeSet};

use jobsift_core::{DuplicateGroups, JobId, JobRecord};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Partitions above this size still run, but O(m^2) starts to hurt.
pub const LARGE_PARTITION_WARN: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupingError {
    #[error("job {job_id} at {company:?} has a {found}-dim title embedding, expected {expected}")]
    DimensionMismatch {
        company: String,
        job_id: JobId,
        expected: usize,
        found: usize,
    },
}

/// What the grouper did with its input, for the run log and report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupingReport {
    pub ineligible_jobs: usize,
    pub partitions_considered: usize,
    pub partitions_skipped_small: usize,
    pub failed_partitions: Vec<String>,
}

/// Cosine similarity; 0.0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    cosine_with_norms(a, b, norm(a), norm(b))
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine_with_norms(a: &[f32], b: &[f32], norm_a: f32, norm_b: f32) -> f32 {
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot / (norm_a * norm_b)
}

/// Dense symmetric pairwise similarity matrix over one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityMatrix {
    size: usize,
    values: Vec<f32>,
    clusterable: Vec<bool>,
}

impl SimilarityMatrix {
    /// Callers must pass vectors of equal length.
    pub fn from_embeddings(embeddings: &[&[f32]]) -> Self {
        let size = embeddings.len();
        let norms: Vec<f32> = embeddings.iter().map(|e| norm(e)).collect();
        let mut values = vec![0.0f32; size * size];

        for i in 0..size {
            values[i * size + i] = if norms[i] > 0.0 { 1.0 } else { 0.0 };
            for j in (i + 1)..size {
                let sim = cosine_with_norms(embeddings[i], embeddings[j], norms[i], norms[j]);
                values[i * size + j] = sim;
                values[j * size + i] = sim;
            }
        }

        // NaN norms fail the comparison too.
        let clusterable = norms.iter().map(|n| *n > 0.0 && n.is_finite()).collect();
        Self {
            size,
            values,
            clusterable,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn get(&self, i: usize, j: usize) -> f32 {
        self.values[i * self.size + j]
    }

    /// Zero-norm rows carry no direction and never join or start a cluster.
    pub fn is_clusterable(&self, i: usize) -> bool {
        self.clusterable[i]
    }
}

/// Single pass in index order: an unclaimed `i` claims every unclaimed `j > i`
/// with `sim(i, j) >= threshold`. Not a transitive closure, and not monotonic in the
/// threshold: a chain can merge more postings at a stricter threshold.
pub fn greedy_clusters(matrix: &SimilarityMatrix, threshold: f32) -> Vec<(usize, Vec<usize>)> {
    let n = matrix.len();
    let mut claimed = vec![false; n];
    let mut clusters = Vec::new();

    for i in 0..n {
        if claimed[i] || !matrix.is_clusterable(i) {
            continue;
        }
        let mut members = Vec::new();
        for j in (i + 1)..n {
            if !claimed[j] && matrix.is_clusterable(j) && matrix.get(i, j) >= threshold {
                claimed[j] = true;
                members.push(j);
            }
        }
        if !members.is_empty() {
            claimed[i] = true;
            clusters.push((i, members));
        }
    }

    clusters
}

/// Eligible jobs keyed by employer; members keep input order.
pub fn partition_by_company(jobs: &[JobRecord]) -> BTreeMap<&str, Vec<&JobRecord>> {
    let mut partitions: BTreeMap<&str, Vec<&JobRecord>> = BTreeMap::new();
    for job in jobs.iter().filter(|job| job.is_eligible()) {
        if let Some(company) = job.company_key() {
            partitions.entry(company).or_default().push(job);
        }
    }
    partitions
}

fn partition_embeddings<'a>(
    company: &str,
    members: &[&'a JobRecord],
) -> Result<Vec<(JobId, &'a [f32])>, GroupingError> {
    let mut out = Vec::with_capacity(members.len());
    let mut expected = None;
    for &job in members {
        let Some(embedding) = job.title_embedding.as_deref() else {
            continue;
        };
        match expected {
            None => expected = Some(embedding.len()),
            Some(dim) if dim != embedding.len() => {
                return Err(GroupingError::DimensionMismatch {
                    company: company.to_string(),
                    job_id: job.id,
                    expected: dim,
                    found: embedding.len(),
                });
            }
            Some(_) => {}
        }
        out.push((job.id, embedding));
    }
    Ok(out)
}

/// Groups for a single employer partition.
pub fn group_partition(
    company: &str,
    members: &[&JobRecord],
    similarity_threshold: f32,
) -> Result<DuplicateGroups, GroupingError> {
    let rows = partition_embeddings(company, members)?;
    if rows.len() >= LARGE_PARTITION_WARN {
        warn!(
            company,
            postings = rows.len(),
            "large employer partition; pairwise similarity is quadratic, consider blocking or ANN"
        );
    }

    let embeddings: Vec<&[f32]> = rows.iter().map(|(_, embedding)| *embedding).collect();
    let matrix = SimilarityMatrix::from_embeddings(&embeddings);
    let groups = greedy_clusters(&matrix, similarity_threshold)
        .into_iter()
        .map(|(canonical, duplicates)| {
            let duplicate_ids: BTreeSet<JobId> =
                duplicates.into_iter().map(|j| rows[j].0).collect();
            (rows[canonical].0, duplicate_ids)
        })
        .collect();
    Ok(groups)
}

pub fn detect_duplicate_groups(jobs: &[JobRecord], similarity_threshold: f32) -> DuplicateGroups {
    detect_duplicate_groups_with_report(jobs, similarity_threshold).0
}

/// Input order decides which posting becomes canonical, so callers should pass jobs
/// sorted by ascending id.
pub fn detect_duplicate_groups_with_report(
    jobs: &[JobRecord],
    similarity_threshold: f32,
) -> (DuplicateGroups, GroupingReport) {
    let mut report = GroupingReport {
        ineligible_jobs: jobs.iter().filter(|job| !job.is_eligible()).count(),
        ..Default::default()
    };
    let mut groups = DuplicateGroups::new();

    for (company, members) in partition_by_company(jobs) {
        if members.len() < 2 {
            report.partitions_skipped_small += 1;
            continue;
        }
        report.partitions_considered += 1;

        match group_partition(company, &members, similarity_threshold) {
            Ok(partition_groups) => {
                debug!(
                    company,
                    postings = members.len(),
                    groups = partition_groups.len(),
                    "grouped employer partition"
                );
                groups.extend(partition_groups);
            }
            Err(err) => {
                warn!(company, error = %err, "skipping employer partition");
                report.failed_partitions.push(company.to_string());
            }
        }
    }

    (groups, report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_angle(degrees: f32) -> Vec<f32> {
        let r = degrees.to_radians();
        vec![r.cos(), r.sin()]
    }

    fn job(id: JobId, company: &str, embedding: Vec<f32>) -> JobRecord {
        JobRecord::new(id, company, format!("posting {id}")).with_embedding(embedding)
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 3.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn matrix_is_symmetric_and_matches_pairwise() {
        let a = at_angle(0.0);
        let b = at_angle(30.0);
        let c = vec![0.0, 0.0];
        let matrix = SimilarityMatrix::from_embeddings(&[&a, &b, &c]);

        assert_eq!(matrix.len(), 3);
        assert_eq!(matrix.get(0, 1), matrix.get(1, 0));
        assert!((matrix.get(0, 1) - cosine_similarity(&a, &b)).abs() < 1e-6);
        assert_eq!(matrix.get(2, 0), 0.0);
        assert_eq!(matrix.get(2, 2), 0.0);
    }

    #[test]
    fn greedy_pass_is_not_transitive() {
        // 0-1 above threshold, 1-2 above threshold, 0-2 below.
        let jobs = vec![
            job(1, "Acme", at_angle(0.0)),
            job(2, "Acme", at_angle(10.0)),
            job(3, "Acme", at_angle(20.0)),
        ];
        let groups = detect_duplicate_groups(&jobs, 0.98);

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[&1], BTreeSet::from([2]));
        assert!(!groups.contains_key(&2));
        assert!(!groups.contains_key(&3));
    }

    #[test]
    fn zero_norm_embeddings_never_cluster_at_any_threshold() {
        let jobs = vec![
            job(1, "Acme", vec![0.0, 0.0]),
            job(2, "Acme", vec![1.0, 0.0]),
            job(3, "Acme", vec![0.0, 0.0]),
            job(4, "Acme", vec![0.0, 1.0]),
        ];
        for threshold in [-1.0, 0.0] {
            let groups = detect_duplicate_groups(&jobs, threshold);
            assert_eq!(groups.len(), 1, "threshold {threshold}");
            assert_eq!(groups[&2], BTreeSet::from([4]));
        }
    }

    #[test]
    fn matrix_marks_zero_norm_rows_unclusterable() {
        let a = at_angle(0.0);
        let z = vec![0.0, 0.0];
        let matrix = SimilarityMatrix::from_embeddings(&[&a, &z]);
        assert!(matrix.is_clusterable(0));
        assert!(!matrix.is_clusterable(1));
    }

    #[test]
    fn claimed_postings_do_not_start_their_own_cluster() {
        let jobs = vec![
            job(1, "Acme", at_angle(0.0)),
            job(2, "Acme", at_angle(1.0)),
            job(3, "Acme", at_angle(2.0)),
            job(4, "Acme", at_angle(60.0)),
            job(5, "Acme", at_angle(61.0)),
        ];
        let groups = detect_duplicate_groups(&jobs, 0.98);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&1], BTreeSet::from([2, 3]));
        assert_eq!(groups[&4], BTreeSet::from([5]));
    }

    #[test]
    fn input_order_decides_the_canonical() {
        let jobs = vec![job(9, "Acme", at_angle(0.0)), job(3, "Acme", at_angle(1.0))];
        let groups = detect_duplicate_groups(&jobs, 0.98);
        assert_eq!(groups[&9], BTreeSet::from([3]));
    }

    #[test]
    fn dimension_mismatch_fails_only_that_partition() {
        let jobs = vec![
            job(1, "Broken", vec![1.0, 0.0]),
            job(2, "Broken", vec![1.0, 0.0, 0.0]),
            job(3, "Fine", at_angle(0.0)),
            job(4, "Fine", at_angle(1.0)),
        ];
        let (groups, report) = detect_duplicate_groups_with_report(&jobs, 0.98);

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[&3], BTreeSet::from([4]));
        assert_eq!(report.failed_partitions, vec!["Broken".to_string()]);
        assert_eq!(report.partitions_considered, 2);
    }

    #[test]
    fn group_partition_reports_the_offending_job() {
        let a = job(1, "Broken", vec![1.0, 0.0]);
        let b = job(2, "Broken", vec![1.0]);
        let err = group_partition("Broken", &[&a, &b], 0.98).expect_err("mismatch");
        assert_eq!(
            err,
            GroupingError::DimensionMismatch {
                company: "Broken".into(),
                job_id: 2,
                expected: 2,
                found: 1,
            }
        );
    }

    #[test]
    fn partitions_use_trimmed_case_sensitive_company() {
        let jobs = vec![
            job(1, "Acme ", at_angle(0.0)),
            job(2, " Acme", at_angle(0.5)),
            job(3, "acme", at_angle(0.0)),
        ];
        let partitions = partition_by_company(&jobs);
        assert_eq!(partitions["Acme"].len(), 2);
        assert_eq!(partitions["acme"].len(), 1);

        let (groups, report) = detect_duplicate_groups_with_report(&jobs, 0.98);
        assert_eq!(groups[&1], BTreeSet::from([2]));
        assert_eq!(report.partitions_skipped_small, 1);
    }

    #[test]
    fn ineligible_jobs_are_counted_and_ignored() {
        let mut no_embedding = JobRecord::new(2, "Acme", "posting 2");
        no_embedding.title_embedding = None;
        let mut no_company = job(3, "Acme", at_angle(0.0));
        no_company.company = None;
        let jobs = vec![job(1, "Acme", at_angle(0.0)), no_embedding, no_company];

        let (groups, report) = detect_duplicate_groups_with_report(&jobs, 0.5);
        assert!(groups.is_empty());
        assert_eq!(report.ineligible_jobs, 2);
    }
}
