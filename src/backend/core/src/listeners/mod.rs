//! Listener group: several HTTP listeners started and stopped as a unit.
//!
//! # Architecture
//!
//! ```text
//!                 start()                        stop()
//! Created ──▶ Starting ──▶ Running ──▶ Stopping ──▶ Stopped
//!                │  bind failure                    ▲
//!                └──────────────────────────────────┘
//! ```
//!
//! `start` binds every enabled socket before serving any of them, so a bind
//! failure leaves nothing running. `stop` closes every socket, lets open
//! connections finish until a shared deadline, then closes the rest.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut group = ListenerGroup::new(Duration::from_secs(5));
//! group.add_listener(ListenerDescriptor::new("main", "[::]", 8080), router);
//! group.start().await?;
//! shutdown.cancelled().await;
//! group.stop().await?;
//! ```

pub mod descriptor;
pub mod monitor;
mod serve;

pub use descriptor::ListenerDescriptor;
pub use monitor::{GroupMonitor, GroupSnapshot, GroupState, ListenerSnapshot, ListenerState, ListenerStats};

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::Router;
use futures::future::join_all;
use futures::FutureExt;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info, warn};

use crate::error::{Result, StackerError};
use crate::telemetry::ListenerMetrics;
use serve::{BoundSocket, DrainReport};

struct Registration {
    stats: Arc<ListenerStats>,
    router: Router,
}

struct RunningListener {
    name: String,
    handle: JoinHandle<Option<DrainReport>>,
}

/// Several listeners sharing one lifecycle and one shutdown deadline.
pub struct ListenerGroup {
    shutdown_timeout: Duration,
    registrations: Vec<Registration>,
    monitor: Arc<GroupMonitor>,
    shutdown: CancellationToken,
    deadline: Arc<OnceLock<Instant>>,
    /// Serializes `start` and `stop`; holds the serve tasks while running.
    lifecycle: Mutex<Vec<RunningListener>>,
}

impl ListenerGroup {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            shutdown_timeout,
            registrations: Vec::new(),
            monitor: Arc::new(GroupMonitor::new()),
            shutdown: CancellationToken::new(),
            deadline: Arc::new(OnceLock::new()),
            lifecycle: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener. Disabled descriptors are tracked but never bound.
    pub fn add_listener(&mut self, descriptor: ListenerDescriptor, router: Router) -> &mut Self {
        let stats = Arc::new(ListenerStats::new(descriptor));
        self.monitor.register(stats.clone());
        self.registrations.push(Registration { stats, router });
        self
    }

    /// Shared read-only view for diagnostics. Valid before, during and after the run.
    pub fn monitor(&self) -> Arc<GroupMonitor> {
        self.monitor.clone()
    }

    pub fn state(&self) -> GroupState {
        self.monitor.state()
    }

    /// Bind every enabled listener, then serve each on its own task.
    ///
    /// # Errors
    ///
    /// - `AlreadyStarted` if the group has left the created state.
    /// - `ListenerBindFailure` naming the first listener that could not bind.
    ///   Sockets bound before it are closed and the group ends up stopped.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.lifecycle.lock().await;

        let state = self.monitor.state();
        if state != GroupState::Created {
            return Err(StackerError::already_started(state));
        }
        self.monitor.set_state(GroupState::Starting);

        let mut bound = Vec::new();
        for registration in self.registrations.iter().filter(|r| r.stats.descriptor().enabled) {
            let descriptor = registration.stats.descriptor();
            let address = descriptor.address();
            let socket = match TcpListener::bind(&address).await {
                Ok(listener) => BoundSocket::new(listener, registration.stats.clone()),
                Err(e) => Err(e),
            };

            match socket {
                Ok(socket) => bound.push((registration, socket)),
                Err(e) => {
                    error!(listener = %descriptor.name, address = %address, error = %e, "bind failed");
                    for (registration, socket) in bound.drain(..) {
                        drop(socket);
                        registration.stats.set_state(ListenerState::Stopped);
                    }
                    self.monitor.set_state(GroupState::Stopped);
                    return Err(StackerError::listener_bind_failure(&descriptor.name, &address, e));
                }
            }
        }

        for (registration, socket) in bound {
            let stats = registration.stats.clone();
            let name = stats.name().to_string();
            let router = registration
                .router
                .clone()
                .layer(TimeoutLayer::new(stats.descriptor().write_timeout));

            let shutdown = self.shutdown.clone();
            let serve = serve::serve(socket, router, stats.clone(), shutdown.clone(), self.deadline.clone());

            let handle = tokio::spawn(async move {
                let outcome = AssertUnwindSafe(serve).catch_unwind().await;
                let stopped_early = !shutdown.is_cancelled();
                if outcome.is_err() || stopped_early {
                    stats.flag_unexpected_stop();
                    stats.set_state(ListenerState::Stopped);
                    ListenerMetrics::record_unexpected_stop(stats.name());
                    error!(listener = stats.name(), panicked = outcome.is_err(), "listener stopped unexpectedly");
                }
                outcome.ok()
            });

            running.push(RunningListener { name, handle });
        }

        self.monitor.set_state(GroupState::Running);
        info!(listeners = running.len(), "listener group running");
        Ok(())
    }

    /// Stop every listener within the shared deadline.
    ///
    /// Always shuts down every listener. Stopping twice, or stopping a group
    /// that never started, succeeds without doing anything further.
    ///
    /// # Errors
    ///
    /// `ShutdownTimeout` listing each listener that had to have connections
    /// closed forcibly, or whose serve task had already died.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.lifecycle.lock().await;

        match self.monitor.state() {
            GroupState::Stopped => return Ok(()),
            GroupState::Created => {
                self.monitor.set_state(GroupState::Stopped);
                return Ok(());
            }
            _ => {}
        }
        self.monitor.set_state(GroupState::Stopping);

        let deadline = Instant::now() + self.shutdown_timeout;
        let _ = self.deadline.set(deadline);
        self.shutdown.cancel();
        info!(
            listeners = running.len(),
            timeout_ms = self.shutdown_timeout.as_millis() as u64,
            "stopping listener group"
        );

        let outcomes = join_all(running.drain(..).map(|listener| async move {
            (listener.name, listener.handle.await)
        }))
        .await;

        let mut failures = Vec::new();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(Some(report)) if report.forced > 0 => failures.push(format!(
                    "{}: {} connection(s) closed at the deadline",
                    report.listener, report.forced
                )),
                Ok(Some(_)) => {}
                Ok(None) => failures.push(format!("{}: serve task panicked", name)),
                Err(e) => failures.push(format!("{}: serve task failed: {}", name, e)),
            }
        }

        self.monitor.set_state(GroupState::Stopped);
        if failures.is_empty() {
            info!("listener group stopped");
            Ok(())
        } else {
            warn!(failures = ?failures, "listener group stopped with failures");
            Err(StackerError::shutdown_timeout(failures))
        }
    }
}
