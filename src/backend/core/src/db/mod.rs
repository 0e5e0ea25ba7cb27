//! Database layer for Stacker.
//!
//! One relational store holds image jobs and stacked images. SQLite,
//! PostgreSQL and MySQL are supported through sqlx; the backend is chosen
//! once from configuration and every handle shares its pool.
//!
//! Handles are bound to a [`Scope`]. Cancelling the scope, or letting its
//! deadline pass, abandons the operation in flight and rolls back its
//! transaction.

pub mod dialect;
pub mod health;
pub mod repository;
pub mod scheduler;
pub mod scope;

pub use health::{PingReport, PoolStats};
pub use repository::Repository;
pub use scheduler::{Epoch, SchedulerStore, Target, TargetRepository};
pub use scope::Scope;

use std::str::FromStr;
use std::time::{Duration, Instant};

use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{MySqlPool, PgPool, SqlitePool};

use crate::config::{StorageConfig, StorageKind};
use crate::error::{Result, StackerError};
use crate::jobs::{ImageJob, JobId, JobStatus, NewStackedImage, StackedImage, StackedImageId};

/// Pool settings shared by every backend.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&StorageConfig> for StoreOptions {
    fn from(config: &StorageConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            ..Self::default()
        }
    }
}

/// Connection pool for the configured backend.
#[derive(Debug, Clone)]
pub enum Backend {
    Sqlite(SqlitePool),
    Postgres(PgPool),
    MySql(MySqlPool),
}

impl Backend {
    /// Open a pool. Nothing is migrated here.
    pub async fn connect(
        kind: StorageKind,
        dsn: &str,
        options: &StoreOptions,
    ) -> std::result::Result<Self, sqlx::Error> {
        match kind {
            StorageKind::Sqlite => {
                let in_memory = is_in_memory(dsn);
                let mut connect = SqliteConnectOptions::from_str(dsn)?
                    .create_if_missing(true)
                    .foreign_keys(true);
                if !in_memory {
                    connect = connect.journal_mode(SqliteJournalMode::Wal);
                }

                // An in-memory database lives and dies with its connection,
                // so keep exactly one and never recycle it.
                let pool_options = if in_memory {
                    SqlitePoolOptions::new()
                        .max_connections(1)
                        .min_connections(1)
                        .idle_timeout(None::<Duration>)
                        .max_lifetime(None::<Duration>)
                } else {
                    SqlitePoolOptions::new().max_connections(options.max_connections)
                };

                let pool = pool_options
                    .acquire_timeout(options.acquire_timeout)
                    .connect_with(connect)
                    .await?;
                Ok(Self::Sqlite(pool))
            }
            StorageKind::Postgres => {
                let pool = PgPoolOptions::new()
                    .max_connections(options.max_connections)
                    .acquire_timeout(options.acquire_timeout)
                    .connect_with(PgConnectOptions::from_str(dsn)?)
                    .await?;
                Ok(Self::Postgres(pool))
            }
            StorageKind::Mysql => {
                let pool = MySqlPoolOptions::new()
                    .max_connections(options.max_connections)
                    .acquire_timeout(options.acquire_timeout)
                    .connect_with(MySqlConnectOptions::from_str(dsn)?)
                    .await?;
                Ok(Self::MySql(pool))
            }
        }
    }

    pub fn kind(&self) -> StorageKind {
        match self {
            Self::Sqlite(_) => StorageKind::Sqlite,
            Self::Postgres(_) => StorageKind::Postgres,
            Self::MySql(_) => StorageKind::Mysql,
        }
    }

    fn repository(&self) -> &dyn Repository {
        match self {
            Self::Sqlite(pool) => pool,
            Self::Postgres(pool) => pool,
            Self::MySql(pool) => pool,
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.repository().pool_stats()
    }

    pub async fn close(&self) {
        self.repository().close().await;
    }
}

fn is_in_memory(dsn: &str) -> bool {
    dsn.contains(":memory:") || dsn.contains("mode=memory")
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle to the application database.
///
/// Cloning is cheap. [`Store::with_scope`] returns a handle bound to one
/// request's cancellation and deadline; the original is left untouched.
#[derive(Debug, Clone)]
pub struct Store {
    backend: Backend,
    scope: Scope,
}

impl Store {
    /// Open the pool and apply the embedded migrations.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the database cannot be reached or migrated.
    pub async fn connect(kind: StorageKind, dsn: &str, options: &StoreOptions) -> Result<Self> {
        let backend = Backend::connect(kind, dsn, options)
            .await
            .map_err(|e| StackerError::store_unavailable("application", e))?;

        let started = Instant::now();
        backend.repository().migrate().await?;
        tracing::info!(
            backend = kind.as_str(),
            duration_ms = started.elapsed().as_millis() as u64,
            "application store migrated"
        );

        Ok(Self {
            backend,
            scope: Scope::background(),
        })
    }

    /// A handle sharing this pool whose operations are bound to `scope`.
    pub fn with_scope(&self, scope: Scope) -> Self {
        Self {
            backend: self.backend.clone(),
            scope,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn kind(&self) -> StorageKind {
        self.backend.kind()
    }

    fn repo(&self) -> &dyn Repository {
        self.backend.repository()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Job Operations
    // ═══════════════════════════════════════════════════════════════════════════

    /// Create a pending job for an acquisition.
    ///
    /// A second job for the same acquisition fails with `DuplicateRecord`.
    pub async fn create_job(&self, acquired_image_id: i64) -> Result<ImageJob> {
        let job = self.scope.run(self.repo().create_job(acquired_image_id)).await?;
        tracing::info!(job_id = %job.id, acquired_image_id, "job created");
        Ok(job)
    }

    pub async fn get_job(&self, id: JobId) -> Result<ImageJob> {
        self.scope.run(self.repo().get_job(id)).await
    }

    /// Every job, ordered by id, read in a single query.
    pub async fn list_jobs(&self) -> Result<Vec<ImageJob>> {
        self.scope.run(self.repo().list_jobs()).await
    }

    /// Jobs in `status`, ordered by id.
    pub async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<ImageJob>> {
        self.scope.run(self.repo().list_jobs_by_status(status)).await
    }

    /// Persist a transitioned job.
    ///
    /// `job` must carry the revision it was read at. A stale revision, or a
    /// concurrent writer winning the race, fails with `Conflict`; the caller
    /// re-reads and decides whether to retry.
    pub async fn update_job(&self, job: &ImageJob) -> Result<ImageJob> {
        self.scope.run(self.repo().update_job(job)).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Stacked Image Operations
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn create_stacked_image(&self, new: &NewStackedImage) -> Result<StackedImage> {
        self.scope.run(self.repo().create_stacked_image(new)).await
    }

    pub async fn get_stacked_image(&self, id: StackedImageId) -> Result<StackedImage> {
        self.scope.run(self.repo().get_stacked_image(id)).await
    }

    pub async fn find_stacked_image(
        &self,
        target_id: i64,
        filter_name: &str,
    ) -> Result<Option<StackedImage>> {
        self.scope
            .run(self.repo().find_stacked_image(target_id, filter_name))
            .await
    }

    /// Supersede a stacked image in place. `image_count` may only grow.
    pub async fn update_stacked_image(&self, image: &StackedImage) -> Result<StackedImage> {
        self.scope.run(self.repo().update_stacked_image(image)).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Health
    // ═══════════════════════════════════════════════════════════════════════════

    /// Round-trip a trivial query and report the latency.
    pub async fn ping(&self) -> PingReport {
        let started = Instant::now();
        let result = self.scope.run(self.repo().ping()).await;
        let latency = started.elapsed();
        if latency > health::SLOW_PING {
            tracing::warn!(latency_ms = latency.as_millis() as u64, "store ping is slow");
        }

        PingReport {
            ok: result.is_ok(),
            latency,
            error: result.err().map(|e| e.user_message().to_string()),
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.backend.pool_stats()
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.backend.close().await;
    }
}
