//! Runtime diagnostics served on the diagnostics listener.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::db::{PingReport, PoolStats, SchedulerStore, Store};
use crate::listeners::{GroupMonitor, GroupSnapshot};

/// Version and start time of the running process.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub version: String,
    pub commit: String,
    pub started_at: DateTime<Utc>,
    started: Instant,
}

impl BuildInfo {
    /// Build info of this binary. The commit comes from `STACKER_GIT_COMMIT`
    /// at compile time.
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit: option_env!("STACKER_GIT_COMMIT").unwrap_or("unknown").to_string(),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Clone)]
pub struct DiagnosticsState {
    pub monitor: Arc<GroupMonitor>,
    pub store: Store,
    pub scheduler: SchedulerStore,
    pub config: Arc<Config>,
    pub build: Arc<BuildInfo>,
}

#[derive(Debug, Serialize)]
struct BuildReport {
    version: String,
    commit: String,
    started_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    uptime: Duration,
}

#[derive(Debug, Serialize)]
struct StoreReport {
    backend: &'static str,
    pool: PoolStats,
    ping: PingReport,
    scheduler_pool: PoolStats,
}

pub fn diagnostics_router(state: DiagnosticsState) -> Router {
    Router::new()
        .route("/debug/listeners", get(listeners))
        .route("/debug/store", get(store))
        .route("/debug/build", get(build))
        .route("/debug/config", get(config))
        .with_state(state)
}

async fn listeners(State(state): State<DiagnosticsState>) -> Json<GroupSnapshot> {
    Json(state.monitor.snapshot())
}

async fn store(State(state): State<DiagnosticsState>) -> Json<StoreReport> {
    let ping = state.store.ping().await;
    Json(StoreReport {
        backend: state.store.kind().as_str(),
        pool: state.store.pool_stats(),
        ping,
        scheduler_pool: state.scheduler.pool_stats(),
    })
}

async fn build(State(state): State<DiagnosticsState>) -> Json<BuildReport> {
    Json(BuildReport {
        version: state.build.version.clone(),
        commit: state.build.commit.clone(),
        started_at: state.build.started_at,
        uptime: state.build.uptime(),
    })
}

/// Effective configuration with connection credentials hidden.
async fn config(State(state): State<DiagnosticsState>) -> Json<Config> {
    Json(state.config.redacted())
}
