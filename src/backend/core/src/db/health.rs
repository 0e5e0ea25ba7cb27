//! Connection pool statistics and connectivity checks for diagnostics.

use serde::Serialize;
use std::time::Duration;

/// Snapshot of a connection pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Backend serving the pool
    pub backend: &'static str,
    /// Connections currently open
    pub pool_size: u32,
    /// Open connections not checked out
    pub idle_connections: u32,
    /// Open connections checked out
    pub active_connections: u32,
    /// Maximum configured pool size
    pub max_connections: u32,
    /// Pool utilization percentage
    pub utilization_pct: f64,
    pub closed: bool,
}

impl PoolStats {
    pub fn of<DB: sqlx::Database>(backend: &'static str, pool: &sqlx::Pool<DB>) -> Self {
        let pool_size = pool.size();
        let idle = u32::try_from(pool.num_idle()).unwrap_or(u32::MAX);
        let active = pool_size.saturating_sub(idle);
        let max_connections = pool.options().get_max_connections();
        let utilization_pct = if max_connections > 0 {
            (active as f64 / max_connections as f64) * 100.0
        } else {
            0.0
        };

        Self {
            backend,
            pool_size,
            idle_connections: idle,
            active_connections: active,
            max_connections,
            utilization_pct,
            closed: pool.is_closed(),
        }
    }
}

/// Result of a connectivity check.
#[derive(Debug, Clone, Serialize)]
pub struct PingReport {
    pub ok: bool,
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Latency above which a connectivity check is logged as slow.
pub const SLOW_PING: Duration = Duration::from_millis(100);
