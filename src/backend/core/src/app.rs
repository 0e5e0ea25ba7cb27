//! Process orchestration: stores, listeners and their shutdown.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::{self, AppState, BuildInfo, DiagnosticsState};
use crate::config::Config;
use crate::db::{SchedulerStore, Store, StoreOptions};
use crate::error::{ErrorCode, Result};
use crate::listeners::{GroupMonitor, ListenerGroup};

/// Connected stores and the listener group serving them.
pub struct App {
    store: Store,
    scheduler: SchedulerStore,
    group: ListenerGroup,
}

impl App {
    /// Connect both stores and build the listener group. Nothing is bound yet.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if either database cannot be opened or migrated.
    pub async fn build(config: Config, metrics: PrometheusHandle) -> Result<Self> {
        let config = Arc::new(config);
        let options = StoreOptions::from(&config.storage);

        let store = Store::connect(config.storage.kind, &config.storage.dsn_app, &options).await?;
        let scheduler =
            match SchedulerStore::connect(config.storage.kind, &config.storage.dsn_scheduler, &options).await {
                Ok(scheduler) => scheduler,
                Err(e) => {
                    store.close().await;
                    return Err(e);
                }
            };

        let build = Arc::new(BuildInfo::current());
        let mut group = ListenerGroup::new(config.shutdown_timeout);
        let monitor = group.monitor();

        for descriptor in config.listener_descriptors() {
            let router = match descriptor.name.as_str() {
                "main" => api::main_router(AppState {
                    store: store.clone(),
                    scheduler: scheduler.clone(),
                    config: config.clone(),
                    build: build.clone(),
                }),
                "metrics" => api::metrics_router(metrics.clone()),
                _ => api::diagnostics_router(DiagnosticsState {
                    monitor: monitor.clone(),
                    store: store.clone(),
                    scheduler: scheduler.clone(),
                    config: config.clone(),
                    build: build.clone(),
                }),
            };
            group.add_listener(descriptor, router);
        }

        Ok(Self {
            store,
            scheduler,
            group,
        })
    }

    pub fn monitor(&self) -> Arc<GroupMonitor> {
        self.group.monitor()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Start serving, wait for `shutdown`, then stop and close the stores.
    ///
    /// A shutdown that had to close connections forcibly is logged but still
    /// counts as a clean exit.
    ///
    /// # Errors
    ///
    /// `ListenerBindFailure` if a listener cannot bind.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        if let Err(e) = self.group.start().await {
            self.close_stores().await;
            return Err(e);
        }
        info!(
            version = env!("CARGO_PKG_VERSION"),
            backend = self.store.kind().as_str(),
            "stacker running"
        );

        shutdown.cancelled().await;
        info!("shutdown requested");

        match self.group.stop().await {
            Ok(()) => {}
            Err(e) if e.code() == ErrorCode::ShutdownTimeout => {
                error!(error = %e, "listeners did not drain before the deadline");
            }
            Err(e) => {
                self.close_stores().await;
                return Err(e);
            }
        }

        self.close_stores().await;
        info!("shutdown complete");
        Ok(())
    }

    async fn close_stores(&self) {
        self.store.close().await;
        self.scheduler.close().await;
    }
}

/// Build the application from `config` and run it until `shutdown` is cancelled.
pub async fn run(config: Config, metrics: PrometheusHandle, shutdown: CancellationToken) -> Result<()> {
    App::build(config, metrics).await?.run(shutdown).await
}
