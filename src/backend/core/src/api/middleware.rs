//! Request middleware for the main listener.
//!
//! - Client IP resolution (`X-Real-IP` honored only from trusted proxies)
//! - Per-request store scope, cancelled when the request is dropped

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use ipnet::IpNet;

use crate::db::Scope;

/// Header a trusted reverse proxy sets to the original client address.
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// Address of the client that issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// Pick the client address for a request.
///
/// The header is only believed when the connecting peer falls in a trusted
/// proxy range; otherwise the peer address is used. IPv4 peers accepted on a
/// dual-stack socket arrive IPv4-mapped and are compared as plain IPv4.
pub fn resolve_client_ip(
    peer: Option<IpAddr>,
    real_ip_header: Option<&str>,
    trusted_proxies: &[IpNet],
) -> Option<IpAddr> {
    let peer = peer?.to_canonical();
    if !trusted_proxies.iter().any(|net| net.contains(&peer)) {
        return Some(peer);
    }
    real_ip_header
        .and_then(|value| value.trim().parse::<IpAddr>().ok())
        .map(|ip| ip.to_canonical())
        .or(Some(peer))
}

/// Middleware that stores the resolved [`ClientIp`] in the request extensions.
pub async fn client_ip(
    State(trusted_proxies): State<Arc<Vec<IpNet>>>,
    mut req: Request,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let header = req
        .headers()
        .get(REAL_IP_HEADER)
        .and_then(|v| v.to_str().ok());

    if let Some(ip) = resolve_client_ip(peer, header, &trusted_proxies) {
        req.extensions_mut().insert(ClientIp(ip));
    }
    next.run(req).await
}

/// Middleware that gives each request its own [`Scope`].
///
/// The scope expires with the request's write timeout and is cancelled as
/// soon as the request future is dropped, so store work started for a
/// client that went away is abandoned.
pub async fn request_scope(State(timeout): State<Duration>, mut req: Request, next: Next) -> Response {
    let scope = Scope::background().with_timeout(timeout);
    let _guard = scope.drop_guard();
    req.extensions_mut().insert(scope);
    next.run(req).await
}
