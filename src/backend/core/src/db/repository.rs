//! Persistence of image jobs and stacked images.
//!
//! The same queries run on every backend. Each pool type implements
//! [`Repository`] through `impl_repository!`, which only varies the
//! placeholder dialect and the embedded migrations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, PgPool, SqlitePool};

use super::dialect::Dialect;
use super::health::PoolStats;
use crate::error::{ErrorCode, Result, StackerError};
use crate::jobs::{
    check_stacked_update, check_update, now, store_time, ImageJob, JobId, JobStatus,
    NewStackedImage, StackedImage, StackedImageId,
};
use crate::telemetry::JobMetrics;

/// Operations every application backend provides.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Apply the embedded migrations. Safe to run repeatedly.
    async fn migrate(&self) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    fn pool_stats(&self) -> PoolStats;

    async fn close(&self);

    async fn create_job(&self, acquired_image_id: i64) -> Result<ImageJob>;

    async fn get_job(&self, id: JobId) -> Result<ImageJob>;

    async fn list_jobs(&self) -> Result<Vec<ImageJob>>;

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<ImageJob>>;

    /// Persist `job` if it is one legal transition away from the stored row
    /// and was read at the stored revision.
    async fn update_job(&self, job: &ImageJob) -> Result<ImageJob>;

    async fn create_stacked_image(&self, new: &NewStackedImage) -> Result<StackedImage>;

    async fn get_stacked_image(&self, id: StackedImageId) -> Result<StackedImage>;

    async fn find_stacked_image(
        &self,
        target_id: i64,
        filter_name: &str,
    ) -> Result<Option<StackedImage>>;

    async fn update_stacked_image(&self, image: &StackedImage) -> Result<StackedImage>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rows
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    acquired_image_id: i64,
    status: String,
    file_path: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    downloaded_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
    stacked_image_id: Option<i64>,
    revision: i64,
}

impl TryFrom<JobRow> for ImageJob {
    type Error = StackerError;

    fn try_from(row: JobRow) -> Result<Self> {
        let status = row.status.parse::<JobStatus>().map_err(|_| {
            StackerError::with_internal(
                ErrorCode::DatabaseError,
                "Stored job has an unreadable status",
                format!("job {} has status {:?}", row.id, row.status),
            )
        })?;

        Ok(ImageJob {
            id: JobId(row.id),
            acquired_image_id: row.acquired_image_id,
            status,
            file_path: row.file_path,
            error: row.error,
            created_at: row.created_at,
            downloaded_at: row.downloaded_at,
            processed_at: row.processed_at,
            stacked_image_id: row.stacked_image_id.map(StackedImageId),
            revision: row.revision,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StackedRow {
    id: i64,
    target_id: i64,
    filter_name: String,
    image_count: i64,
    file_path: String,
    thumbnail_path: String,
    file_size: i64,
    processed_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
}

impl From<StackedRow> for StackedImage {
    fn from(row: StackedRow) -> Self {
        StackedImage {
            id: StackedImageId(row.id),
            target_id: row.target_id,
            filter_name: row.filter_name,
            image_count: row.image_count,
            file_path: row.file_path,
            thumbnail_path: row.thumbnail_path,
            file_size: row.file_size,
            processed_at: row.processed_at,
            last_updated_at: row.last_updated_at,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queries
// ═══════════════════════════════════════════════════════════════════════════════

macro_rules! job_columns {
    () => {
        "id, acquired_image_id, status, file_path, error, created_at, downloaded_at, \
         processed_at, stacked_image_id, revision"
    };
}

macro_rules! stacked_columns {
    () => {
        "id, target_id, filter_name, image_count, file_path, thumbnail_path, file_size, \
         processed_at, last_updated_at"
    };
}

const INSERT_JOB: &str =
    "INSERT INTO image_jobs (acquired_image_id, status, created_at, revision) VALUES (?, ?, ?, 0)";
const SELECT_JOB_BY_ID: &str = concat!("SELECT ", job_columns!(), " FROM image_jobs WHERE id = ?");
const SELECT_JOB_BY_ACQUISITION: &str = concat!(
    "SELECT ",
    job_columns!(),
    " FROM image_jobs WHERE acquired_image_id = ?"
);
const SELECT_JOBS: &str = concat!("SELECT ", job_columns!(), " FROM image_jobs ORDER BY id");
const SELECT_JOBS_BY_STATUS: &str = concat!(
    "SELECT ",
    job_columns!(),
    " FROM image_jobs WHERE status = ? ORDER BY id"
);
const UPDATE_JOB: &str = "UPDATE image_jobs \
     SET status = ?, file_path = ?, error = ?, downloaded_at = ?, processed_at = ?, \
         stacked_image_id = ?, revision = revision + 1 \
     WHERE id = ? AND revision = ?";

const INSERT_STACKED: &str = "INSERT INTO stacked_images \
     (target_id, filter_name, image_count, file_path, thumbnail_path, file_size, processed_at, last_updated_at) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?)";
const SELECT_STACKED_BY_ID: &str = concat!(
    "SELECT ",
    stacked_columns!(),
    " FROM stacked_images WHERE id = ?"
);
const SELECT_STACKED_BY_KEY: &str = concat!(
    "SELECT ",
    stacked_columns!(),
    " FROM stacked_images WHERE target_id = ? AND filter_name = ?"
);
const UPDATE_STACKED: &str = "UPDATE stacked_images \
     SET image_count = ?, file_path = ?, thumbnail_path = ?, file_size = ?, \
         processed_at = ?, last_updated_at = ? \
     WHERE id = ? AND image_count <= ?";

fn job_conflict(id: JobId, reason: &str) -> StackerError {
    JobMetrics::record_conflict("image_job");
    StackerError::conflict(format!("job {} was modified concurrently: {}", id, reason))
        .with_context("job_id", id.0)
}

fn stacked_conflict(id: StackedImageId) -> StackerError {
    JobMetrics::record_conflict("stacked_image");
    StackerError::conflict(format!(
        "stacked image {} was modified concurrently",
        id
    ))
    .with_context("stacked_image_id", id.0)
}

/// Count store-level contention (SQLite busy/locked) alongside revision conflicts.
fn note_conflict(err: StackerError, entity: &'static str) -> StackerError {
    if err.code() == ErrorCode::Conflict {
        JobMetrics::record_conflict(entity);
    }
    err
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backend Implementations
// ═══════════════════════════════════════════════════════════════════════════════

macro_rules! impl_repository {
    ($pool:ty, $dialect:expr, $backend:literal, $migrations:tt) => {
        #[async_trait]
        impl Repository for $pool {
            async fn migrate(&self) -> Result<()> {
                sqlx::migrate!($migrations).run(self).await?;
                Ok(())
            }

            async fn ping(&self) -> Result<()> {
                sqlx::query("SELECT 1").execute(self).await?;
                Ok(())
            }

            fn pool_stats(&self) -> PoolStats {
                PoolStats::of($backend, self)
            }

            async fn close(&self) {
                <$pool>::close(self).await;
            }

            async fn create_job(&self, acquired_image_id: i64) -> Result<ImageJob> {
                let mut tx = self.begin().await?;

                sqlx::query(&$dialect.sql(INSERT_JOB))
                    .bind(acquired_image_id)
                    .bind(JobStatus::Pending.as_str())
                    .bind(now())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        StackerError::from(e).with_context("acquired_image_id", acquired_image_id)
                    })?;

                let row: JobRow = sqlx::query_as(&$dialect.sql(SELECT_JOB_BY_ACQUISITION))
                    .bind(acquired_image_id)
                    .fetch_one(&mut *tx)
                    .await?;

                tx.commit().await?;
                ImageJob::try_from(row)
            }

            async fn get_job(&self, id: JobId) -> Result<ImageJob> {
                let row: Option<JobRow> = sqlx::query_as(&$dialect.sql(SELECT_JOB_BY_ID))
                    .bind(id.0)
                    .fetch_optional(self)
                    .await?;

                row.ok_or_else(|| StackerError::not_found("job", id))?
                    .try_into()
            }

            async fn list_jobs(&self) -> Result<Vec<ImageJob>> {
                let rows: Vec<JobRow> = sqlx::query_as(&$dialect.sql(SELECT_JOBS))
                    .fetch_all(self)
                    .await?;

                rows.into_iter().map(ImageJob::try_from).collect()
            }

            async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<ImageJob>> {
                let rows: Vec<JobRow> = sqlx::query_as(&$dialect.sql(SELECT_JOBS_BY_STATUS))
                    .bind(status.as_str())
                    .fetch_all(self)
                    .await?;

                rows.into_iter().map(ImageJob::try_from).collect()
            }

            async fn update_job(&self, job: &ImageJob) -> Result<ImageJob> {
                let mut tx = self
                    .begin()
                    .await
                    .map_err(|e| note_conflict(e.into(), "image_job"))?;

                let persisted: ImageJob = sqlx::query_as::<_, JobRow>(&$dialect.sql(SELECT_JOB_BY_ID))
                    .bind(job.id.0)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| note_conflict(e.into(), "image_job"))?
                    .ok_or_else(|| StackerError::not_found("job", job.id))?
                    .try_into()?;

                if persisted.revision != job.revision {
                    return Err(job_conflict(
                        job.id,
                        &format!(
                            "read at revision {}, stored revision is {}",
                            job.revision, persisted.revision
                        ),
                    ));
                }
                check_update(&persisted, job)?;

                let result = sqlx::query(&$dialect.sql(UPDATE_JOB))
                    .bind(job.status.as_str())
                    .bind(job.file_path.as_deref())
                    .bind(job.error.as_deref())
                    .bind(job.downloaded_at)
                    .bind(job.processed_at)
                    .bind(job.stacked_image_id.map(|id| id.0))
                    .bind(job.id.0)
                    .bind(job.revision)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| note_conflict(e.into(), "image_job"))?;

                if result.rows_affected() == 0 {
                    return Err(job_conflict(job.id, "revision guard matched no row"));
                }

                let row: JobRow = sqlx::query_as(&$dialect.sql(SELECT_JOB_BY_ID))
                    .bind(job.id.0)
                    .fetch_one(&mut *tx)
                    .await?;
                tx.commit()
                    .await
                    .map_err(|e| note_conflict(e.into(), "image_job"))?;

                let updated = ImageJob::try_from(row)?;
                JobMetrics::record_transition(persisted.status, updated.status);
                tracing::info!(
                    job_id = %updated.id,
                    from = %persisted.status,
                    to = %updated.status,
                    revision = updated.revision,
                    "job updated"
                );
                Ok(updated)
            }

            async fn create_stacked_image(&self, new: &NewStackedImage) -> Result<StackedImage> {
                let last_updated_at = now();
                let processed_at = store_time(new.processed_at);
                new.validate(last_updated_at)?;

                let mut tx = self.begin().await?;

                sqlx::query(&$dialect.sql(INSERT_STACKED))
                    .bind(new.target_id)
                    .bind(new.filter_name.as_str())
                    .bind(new.image_count)
                    .bind(new.file_path.as_str())
                    .bind(new.thumbnail_path.as_str())
                    .bind(new.file_size)
                    .bind(processed_at)
                    .bind(last_updated_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        StackerError::from(e)
                            .with_context("target_id", new.target_id)
                            .with_context("filter_name", new.filter_name.as_str())
                    })?;

                let row: StackedRow = sqlx::query_as(&$dialect.sql(SELECT_STACKED_BY_KEY))
                    .bind(new.target_id)
                    .bind(new.filter_name.as_str())
                    .fetch_one(&mut *tx)
                    .await?;

                tx.commit().await?;
                Ok(row.into())
            }

            async fn get_stacked_image(&self, id: StackedImageId) -> Result<StackedImage> {
                let row: Option<StackedRow> = sqlx::query_as(&$dialect.sql(SELECT_STACKED_BY_ID))
                    .bind(id.0)
                    .fetch_optional(self)
                    .await?;

                row.map(StackedImage::from)
                    .ok_or_else(|| StackerError::not_found("stacked image", id))
            }

            async fn find_stacked_image(
                &self,
                target_id: i64,
                filter_name: &str,
            ) -> Result<Option<StackedImage>> {
                let row: Option<StackedRow> = sqlx::query_as(&$dialect.sql(SELECT_STACKED_BY_KEY))
                    .bind(target_id)
                    .bind(filter_name)
                    .fetch_optional(self)
                    .await?;

                Ok(row.map(StackedImage::from))
            }

            async fn update_stacked_image(&self, image: &StackedImage) -> Result<StackedImage> {
                let mut proposed = image.clone();
                proposed.processed_at = store_time(image.processed_at);
                proposed.last_updated_at = now();

                let mut tx = self
                    .begin()
                    .await
                    .map_err(|e| note_conflict(e.into(), "stacked_image"))?;

                let persisted: StackedImage = sqlx::query_as::<_, StackedRow>(
                    &$dialect.sql(SELECT_STACKED_BY_ID),
                )
                .bind(image.id.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| note_conflict(e.into(), "stacked_image"))?
                .ok_or_else(|| StackerError::not_found("stacked image", image.id))?
                .into();

                check_stacked_update(&persisted, &proposed)?;

                let result = sqlx::query(&$dialect.sql(UPDATE_STACKED))
                    .bind(proposed.image_count)
                    .bind(proposed.file_path.as_str())
                    .bind(proposed.thumbnail_path.as_str())
                    .bind(proposed.file_size)
                    .bind(proposed.processed_at)
                    .bind(proposed.last_updated_at)
                    .bind(proposed.id.0)
                    .bind(proposed.image_count)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| note_conflict(e.into(), "stacked_image"))?;

                if result.rows_affected() == 0 {
                    return Err(stacked_conflict(proposed.id));
                }

                let row: StackedRow = sqlx::query_as(&$dialect.sql(SELECT_STACKED_BY_ID))
                    .bind(proposed.id.0)
                    .fetch_one(&mut *tx)
                    .await?;
                tx.commit()
                    .await
                    .map_err(|e| note_conflict(e.into(), "stacked_image"))?;

                let updated = StackedImage::from(row);
                tracing::info!(
                    stacked_image_id = %updated.id,
                    target_id = updated.target_id,
                    filter_name = %updated.filter_name,
                    image_count = updated.image_count,
                    "stacked image superseded"
                );
                Ok(updated)
            }
        }
    };
}

impl_repository!(SqlitePool, Dialect::Sqlite, "sqlite", "./migrations/sqlite");
impl_repository!(PgPool, Dialect::Postgres, "postgres", "./migrations/postgres");
impl_repository!(MySqlPool, Dialect::MySql, "mysql", "./migrations/mysql");
