//! Job repository contract + Postgres and in-memory implementations for JobSift.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use jobsift_core::{JobId, JobRecord};
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobsift-storage";

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("snapshot {path}: {message}")]
    Snapshot { path: PathBuf, message: String },
    #[error("merge into job {canonical_id} rejected: {reason}")]
    Commit { canonical_id: JobId, reason: String },
}

/// Storage seam the duplicate engine reads from and writes back to.
///
/// `fetch_candidates` returns only visible records that carry a title embedding and
/// an employer, ordered by ascending id. The first posting seen in that order becomes
/// the canonical of its cluster, so implementations must keep the ordering stable.
///
/// `commit_merge` is all-or-nothing: it overwrites the canonical's derived locations
/// and cities and hides every duplicate in one step. Hidden records never come back
/// from `fetch_candidates`. Re-hiding an already hidden record is a no-op.
/// `Ok(false)` means the canonical no longer exists or is itself hidden.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn fetch_candidates(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<JobRecord>, RepositoryError>;

    async fn commit_merge(
        &self,
        canonical_id: JobId,
        duplicate_ids: &[JobId],
        merged_locations: &[String],
        merged_cities: &[String],
    ) -> Result<bool, RepositoryError>;
}

fn limit_to_sql(limit: Option<usize>) -> Option<i64> {
    limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX))
}

/// A merge only commits when every requested duplicate row was hidden.
fn ensure_all_hidden(
    canonical_id: JobId,
    hidden: u64,
    requested: usize,
) -> Result<(), RepositoryError> {
    if hidden == requested as u64 {
        return Ok(());
    }
    Err(RepositoryError::Commit {
        canonical_id,
        reason: format!("{hidden} of {requested} duplicates found"),
    })
}

#[derive(Debug, Clone)]
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn fetch_candidates(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<JobRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, company, title, location, locations_derived, cities_derived, title_embedding
              FROM jobs
             WHERE is_duplicate = false
               AND title_embedding IS NOT NULL
               AND company IS NOT NULL
               AND btrim(company) <> ''
             ORDER BY id ASC
             LIMIT $1
            "#,
        )
        .bind(limit_to_sql(limit))
        .fetch_all(&self.pool)
        .instrument(info_span!("fetch_candidates", limit = ?limit))
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let title: Option<String> = row.try_get("title")?;
            let locations_derived: Option<Vec<String>> = row.try_get("locations_derived")?;
            let cities_derived: Option<Vec<String>> = row.try_get("cities_derived")?;
            let embedding: Option<Vector> = row.try_get("title_embedding")?;
            out.push(JobRecord {
                id: row.try_get("id")?,
                company: row.try_get("company")?,
                title: title.unwrap_or_default(),
                location: row.try_get("location")?,
                locations_derived: locations_derived.unwrap_or_default(),
                cities_derived: cities_derived.unwrap_or_default(),
                title_embedding: embedding.map(|v| v.to_vec()),
            });
        }
        debug!(fetched = out.len(), "fetched duplicate candidates");
        Ok(out)
    }

    async fn commit_merge(
        &self,
        canonical_id: JobId,
        duplicate_ids: &[JobId],
        merged_locations: &[String],
        merged_cities: &[String],
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE jobs
               SET locations_derived = $2,
                   cities_derived = $3,
                   updated_at = now()
             WHERE id = $1
               AND is_duplicate = false
            "#,
        )
        .bind(canonical_id)
        .bind(merged_locations)
        .bind(merged_cities)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let hidden = sqlx::query(
            r#"
            UPDATE jobs
               SET is_duplicate = true,
                   duplicate_of = $1,
                   updated_at = now()
             WHERE id = ANY($2)
               AND id <> $1
            "#,
        )
        .bind(canonical_id)
        .bind(duplicate_ids)
        .execute(&mut *tx)
        .await?;

        let requested = duplicate_ids.len();
        if let Err(err) = ensure_all_hidden(canonical_id, hidden.rows_affected(), requested) {
            tx.rollback().await?;
            return Err(err);
        }

        tx.commit().await?;
        Ok(true)
    }
}

/// Snapshot row: a job plus its visibility state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredJob {
    #[serde(flatten)]
    pub record: JobRecord,
    #[serde(default)]
    pub is_duplicate: bool,
    #[serde(default)]
    pub duplicate_of: Option<JobId>,
}

impl From<JobRecord> for StoredJob {
    fn from(record: JobRecord) -> Self {
        Self {
            record,
            is_duplicate: false,
            duplicate_of: None,
        }
    }
}

/// Repository over an in-process job table, optionally loaded from a JSON snapshot.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: Mutex<BTreeMap<JobId, StoredJob>>,
}

impl InMemoryJobRepository {
    pub fn new(records: impl IntoIterator<Item = JobRecord>) -> Self {
        Self::from_stored(records.into_iter().map(StoredJob::from))
    }

    pub fn from_stored(rows: impl IntoIterator<Item = StoredJob>) -> Self {
        let jobs = rows.into_iter().map(|row| (row.record.id, row)).collect();
        Self {
            jobs: Mutex::new(jobs),
        }
    }

    pub async fn load_snapshot(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .map_err(|err| snapshot_error(path, err))?;
        let rows: Vec<StoredJob> =
            serde_json::from_str(&text).map_err(|err| snapshot_error(path, err))?;
        Ok(Self::from_stored(rows))
    }

    /// Write the current table back as a snapshot using a temp-file rename.
    pub async fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<(), RepositoryError> {
        let path = path.as_ref();
        let rows = self.rows().await;
        let bytes = serde_json::to_vec_pretty(&rows).map_err(|err| snapshot_error(path, err))?;

        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let temp_path = parent.join(format!(".{}.snapshot.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| snapshot_error(&temp_path, err))?;
        file.write_all(&bytes)
            .await
            .map_err(|err| snapshot_error(&temp_path, err))?;
        file.flush()
            .await
            .map_err(|err| snapshot_error(&temp_path, err))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(snapshot_error(path, err));
        }
        Ok(())
    }

    pub async fn rows(&self) -> Vec<StoredJob> {
        self.jobs.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, id: JobId) -> Option<StoredJob> {
        self.jobs.lock().await.get(&id).cloned()
    }
}

fn snapshot_error(path: &Path, err: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Snapshot {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn fetch_candidates(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<JobRecord>, RepositoryError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|row| !row.is_duplicate && row.record.is_eligible())
            .map(|row| row.record.clone())
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn commit_merge(
        &self,
        canonical_id: JobId,
        duplicate_ids: &[JobId],
        merged_locations: &[String],
        merged_cities: &[String],
    ) -> Result<bool, RepositoryError> {
        let mut jobs = self.jobs.lock().await;

        match jobs.get(&canonical_id) {
            Some(row) if !row.is_duplicate => {}
            _ => return Ok(false),
        }
        if let Some(missing) = duplicate_ids
            .iter()
            .find(|id| **id == canonical_id || !jobs.contains_key(id))
        {
            return Err(RepositoryError::Commit {
                canonical_id,
                reason: format!("duplicate {missing} is unknown or the canonical itself"),
            });
        }

        for id in duplicate_ids {
            if let Some(row) = jobs.get_mut(id) {
                row.is_duplicate = true;
                row.duplicate_of = Some(canonical_id);
            }
        }
        if let Some(canonical) = jobs.get_mut(&canonical_id) {
            canonical.record.locations_derived = merged_locations.to_vec();
            canonical.record.cities_derived = merged_cities.to_vec();
        }
        Ok(true)
    }
}
