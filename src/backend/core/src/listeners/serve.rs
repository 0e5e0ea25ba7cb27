//! Accept loop and connection draining for one listener.
//!
//! Each accepted connection runs in its own task inside a `JoinSet` owned by
//! the loop, so connections still open at the shutdown deadline can be
//! aborted and their sockets closed.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::{body::Body, extract::ConnectInfo, Router};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use super::monitor::{ListenerState, ListenerStats};
use crate::telemetry::ListenerMetrics;

/// Pause after an accept error that is not tied to a single connection,
/// such as running out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A bound socket. Dropping it closes the socket and counts the close.
pub(crate) struct BoundSocket {
    listener: TcpListener,
    stats: Arc<ListenerStats>,
}

impl BoundSocket {
    pub(crate) fn new(listener: TcpListener, stats: Arc<ListenerStats>) -> std::io::Result<Self> {
        let address = listener.local_addr()?;
        stats.set_bound(address);
        Ok(Self { listener, stats })
    }
}

impl Drop for BoundSocket {
    fn drop(&mut self) {
        self.stats.record_socket_closed();
        debug!(listener = self.stats.name(), "listener socket closed");
    }
}

/// How a listener finished draining.
#[derive(Debug, Clone)]
pub(crate) struct DrainReport {
    pub listener: String,
    /// Connections still open at the deadline and closed forcibly
    pub forced: usize,
}

/// Decrements the live connection count however the connection task ends,
/// including when it is aborted at the deadline.
struct ConnectionGuard(Arc<ListenerStats>);

impl ConnectionGuard {
    fn new(stats: Arc<ListenerStats>) -> Self {
        stats.connection_opened();
        ListenerMetrics::connection_opened(stats.name());
        Self(stats)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.connection_closed();
        ListenerMetrics::connection_closed(self.0.name());
    }
}

/// Serve `router` on `socket` until `shutdown` is cancelled, then drain.
///
/// The socket is closed as soon as shutdown begins. Open connections are
/// asked to finish their in-flight request; those still open at `deadline`
/// are aborted.
pub(crate) async fn serve(
    socket: BoundSocket,
    router: Router,
    stats: Arc<ListenerStats>,
    shutdown: CancellationToken,
    deadline: Arc<OnceLock<Instant>>,
) -> DrainReport {
    let name = stats.name().to_string();
    let read_timeout = stats.descriptor().read_timeout;
    let mut connections = JoinSet::new();

    info!(listener = %name, address = ?stats.bound_address(), "listener serving");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(listener = %name, "connection task panicked");
                    }
                }
            }
            accepted = socket.listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let guard = ConnectionGuard::new(stats.clone());
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        router.clone(),
                        read_timeout,
                        shutdown.clone(),
                        guard,
                    ));
                }
                Err(e) if is_connection_error(&e) => {
                    debug!(listener = %name, error = %e, "accept failed for one connection");
                }
                Err(e) => {
                    error!(listener = %name, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    drop(socket);
    stats.set_state(ListenerState::Draining);

    let deadline = deadline.get().copied().unwrap_or_else(Instant::now);
    let drained = tokio::time::timeout_at(deadline, async {
        while connections.join_next().await.is_some() {}
    })
    .await
    .is_ok();

    let forced = connections.len();
    if !drained && forced > 0 {
        warn!(
            listener = %name,
            connections = forced,
            "shutdown deadline passed, closing connections"
        );
        connections.shutdown().await;
        stats.record_forced(forced as u64);
        ListenerMetrics::record_forced_closures(&name, forced as u64);
    }

    stats.set_state(ListenerState::Stopped);
    info!(listener = %name, forced, "listener stopped");
    DrainReport {
        listener: name,
        forced,
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    read_timeout: Duration,
    shutdown: CancellationToken,
    _guard: ConnectionGuard,
) {
    let service = hyper::service::service_fn(move |req: hyper::Request<Incoming>| {
        let mut req = req.map(Body::new);
        req.extensions_mut().insert(ConnectInfo(peer));
        router.clone().oneshot(req)
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(read_timeout);

    let conn = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        res = conn.as_mut() => res,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        debug!(peer = %peer, error = %e, "connection closed with error");
    }
}

fn is_connection_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}
