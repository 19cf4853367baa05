//! Core domain model for JobSift duplicate detection.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jobsift-core";

pub type JobId = i64;

/// Canonical id -> ids of the postings folded into it, both ascending.
pub type DuplicateGroups = BTreeMap<JobId, BTreeSet<JobId>>;

/// One job posting as handed over by the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub locations_derived: Vec<String>,
    #[serde(default)]
    pub cities_derived: Vec<String>,
    #[serde(default)]
    pub title_embedding: Option<Vec<f32>>,
}

impl JobRecord {
    pub fn new(id: JobId, company: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id,
            company: Some(company.into()),
            title: title.into(),
            location: None,
            locations_derived: Vec::new(),
            cities_derived: Vec::new(),
            title_embedding: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.title_embedding = Some(embedding);
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_locations_derived<I, S>(mut self, locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locations_derived = locations.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cities_derived<I, S>(mut self, cities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cities_derived = cities.into_iter().map(Into::into).collect();
        self
    }

    /// Employer partition key: trimmed, case-sensitive. `None` when missing or blank.
    pub fn company_key(&self) -> Option<&str> {
        self.company
            .as_deref()
            .map(str::trim)
            .filter(|company| !company.is_empty())
    }

    /// Only records with an employer and a title embedding take part in clustering.
    pub fn is_eligible(&self) -> bool {
        self.company_key().is_some() && self.title_embedding.is_some()
    }
}

/// A canonical posting and the postings judged to be copies of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub canonical_id: JobId,
    pub duplicate_ids: Vec<JobId>,
}

impl DuplicateGroup {
    pub fn from_groups(groups: &DuplicateGroups) -> Vec<Self> {
        groups
            .iter()
            .map(|(canonical_id, duplicate_ids)| Self {
                canonical_id: *canonical_id,
                duplicate_ids: duplicate_ids.iter().copied().collect(),
            })
            .collect()
    }
}

/// Summary of one engine invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub jobs_analyzed: usize,
    pub duplicate_groups: usize,
    pub duplicates_merged: usize,
    pub locations_merged: usize,
    pub groups_failed: usize,
    pub dry_run: bool,
    pub cancelled: bool,
}

impl MergeResult {
    /// Share of analyzed postings hidden by this run, in percent.
    pub fn reduction_pct(&self) -> Option<f64> {
        if self.jobs_analyzed == 0 {
            return None;
        }
        Some(self.duplicates_merged as f64 / self.jobs_analyzed as f64 * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligibility_requires_company_and_embedding() {
        let job = JobRecord::new(1, "Acme", "Engineer");
        assert!(!job.is_eligible());

        let job = job.with_embedding(vec![1.0, 0.0]);
        assert!(job.is_eligible());

        let mut blank = JobRecord::new(2, "   ", "Engineer").with_embedding(vec![1.0]);
        assert!(!blank.is_eligible());
        blank.company = None;
        assert!(!blank.is_eligible());
    }

    #[test]
    fn company_key_trims_but_keeps_case() {
        let job = JobRecord::new(1, "  Acme GmbH ", "Engineer");
        assert_eq!(job.company_key(), Some("Acme GmbH"));
        assert_ne!(
            JobRecord::new(2, "acme gmbh", "Engineer").company_key(),
            job.company_key()
        );
    }

    #[test]
    fn reduction_pct_handles_empty_runs() {
        assert_eq!(MergeResult::default().reduction_pct(), None);

        let result = MergeResult {
            jobs_analyzed: 8,
            duplicates_merged: 2,
            ..Default::default()
        };
        assert_eq!(result.reduction_pct(), Some(25.0));
    }

    #[test]
    fn job_record_deserializes_with_missing_optional_fields() {
        let job: JobRecord =
            serde_json::from_str(r#"{"id": 7, "company": "Acme", "title": "Engineer"}"#)
                .expect("parse job");
        assert_eq!(job.id, 7);
        assert!(job.locations_derived.is_empty());
        assert!(job.title_embedding.is_none());
    }

    #[test]
    fn duplicate_groups_flatten_in_canonical_order() {
        let mut groups = DuplicateGroups::new();
        groups.insert(5, [9, 6].into_iter().collect());
        groups.insert(1, [2].into_iter().collect());

        let flat = DuplicateGroup::from_groups(&groups);
        assert_eq!(flat[0].canonical_id, 1);
        assert_eq!(flat[1].duplicate_ids, vec![6, 9]);
    }
}
