//! Read-only access to the external scheduler database.
//!
//! The scheduler owns its schema; this crate never migrates it.

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use sqlx::{MySqlPool, PgPool, SqlitePool};
use std::fmt;

use super::dialect::Dialect;
use super::health::PoolStats;
use super::scope::Scope;
use super::{Backend, StoreOptions};
use crate::config::StorageKind;
use crate::error::{Result, StackerError};

/// Reference frame of a target's coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Epoch {
    Jnow,
    B1950,
    J2000,
    J2050,
    /// A code the scheduler wrote that has no known frame
    Unknown(i64),
}

impl Epoch {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Jnow,
            1 => Self::B1950,
            2 => Self::J2000,
            3 => Self::J2050,
            other => Self::Unknown(other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jnow => "JNOW",
            Self::B1950 => "B1950",
            Self::J2000 => "J2000",
            Self::J2050 => "J2050",
            Self::Unknown(_) => "Unknown",
        }
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Epoch {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// An imaging target planned by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    pub id: i64,
    pub name: String,
    pub active: bool,
    /// Right ascension in hours
    pub ra: Option<f64>,
    /// Declination in degrees
    pub dec: Option<f64>,
    pub epoch: Epoch,
    pub rotation: f64,
    pub region_of_interest: f64,
    pub project_id: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct TargetRow {
    id: i64,
    name: String,
    active: i64,
    ra: Option<f64>,
    dec: Option<f64>,
    epochcode: i64,
    rotation: Option<f64>,
    roi: Option<f64>,
    projectid: Option<i64>,
}

impl From<TargetRow> for Target {
    fn from(row: TargetRow) -> Self {
        Target {
            id: row.id,
            name: row.name,
            active: row.active != 0,
            ra: row.ra,
            dec: row.dec,
            epoch: Epoch::from_code(row.epochcode),
            rotation: row.rotation.unwrap_or_default(),
            region_of_interest: row.roi.unwrap_or_default(),
            project_id: row.projectid,
        }
    }
}

fn select_targets(dialect: Dialect, filter: &str) -> String {
    format!(
        "SELECT id, name, active, ra, {dec}, epochcode, rotation, roi, projectid \
         FROM target {filter} ORDER BY id",
        dec = dialect.quote("dec"),
        filter = filter,
    )
}

/// Queries against the scheduler schema.
#[async_trait]
pub trait TargetRepository: Send + Sync {
    async fn get_target(&self, id: i64) -> Result<Target>;

    async fn list_targets(&self, active_only: bool) -> Result<Vec<Target>>;
}

macro_rules! impl_target_repository {
    ($pool:ty, $dialect:expr) => {
        #[async_trait]
        impl TargetRepository for $pool {
            async fn get_target(&self, id: i64) -> Result<Target> {
                let sql = select_targets($dialect, "WHERE id = ?");
                let row: Option<TargetRow> = sqlx::query_as(&$dialect.sql(&sql))
                    .bind(id)
                    .fetch_optional(self)
                    .await?;

                row.map(Target::from)
                    .ok_or_else(|| StackerError::not_found("target", id))
            }

            async fn list_targets(&self, active_only: bool) -> Result<Vec<Target>> {
                let filter = if active_only { "WHERE active <> 0" } else { "" };
                let sql = select_targets($dialect, filter);
                let rows: Vec<TargetRow> = sqlx::query_as(&sql).fetch_all(self).await?;

                Ok(rows.into_iter().map(Target::from).collect())
            }
        }
    };
}

impl_target_repository!(SqlitePool, Dialect::Sqlite);
impl_target_repository!(PgPool, Dialect::Postgres);
impl_target_repository!(MySqlPool, Dialect::MySql);

/// Handle to the scheduler database, optionally bound to a request scope.
#[derive(Debug, Clone)]
pub struct SchedulerStore {
    backend: Backend,
    scope: Scope,
}

impl SchedulerStore {
    /// Open a pool against the scheduler database.
    pub async fn connect(kind: StorageKind, dsn: &str, options: &StoreOptions) -> Result<Self> {
        let backend = Backend::connect(kind, dsn, options)
            .await
            .map_err(|e| StackerError::store_unavailable("scheduler", e))?;
        tracing::info!(backend = kind.as_str(), "scheduler store connected");
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

    fn targets(&self) -> &dyn TargetRepository {
        match &self.backend {
            Backend::Sqlite(pool) => pool,
            Backend::Postgres(pool) => pool,
            Backend::MySql(pool) => pool,
        }
    }

    pub async fn get_target(&self, id: i64) -> Result<Target> {
        self.scope.run(self.targets().get_target(id)).await
    }

    pub async fn list_targets(&self, active_only: bool) -> Result<Vec<Target>> {
        self.scope.run(self.targets().list_targets(active_only)).await
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.backend.pool_stats()
    }

    pub async fn close(&self) {
        self.backend.close().await;
    }
}
