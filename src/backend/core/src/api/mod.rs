//! HTTP surface of Stacker.
//!
//! Three routers, one per listener:
//!
//! - **main**: `/ping`, `/api/v1/version` and the job, stack and target API
//! - **metrics**: `/metrics` in Prometheus text format
//! - **diagnostics**: `/debug/*` runtime views
//!
//! Handlers get their store handles through axum `State` and bind them to a
//! per-request [`Scope`](crate::db::Scope) inserted by middleware.

mod diagnostics;
mod handlers;
pub mod middleware;

pub use diagnostics::{diagnostics_router, BuildInfo, DiagnosticsState};
pub use middleware::ClientIp;

use std::any::Any;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use crate::config::Config;
use crate::db::{SchedulerStore, Store};
use crate::error::StackerError;

/// Application state shared across main-listener handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub scheduler: SchedulerStore,
    pub config: Arc<Config>,
    pub build: Arc<BuildInfo>,
}

/// Build the main router.
///
/// Layers, outermost first: client IP resolution, request tracing, panic
/// recovery, request scope.
pub fn main_router(state: AppState) -> Router {
    let trusted_proxies = Arc::new(state.config.trusted_proxies());
    let request_timeout = state.config.effective_write_timeout();

    let api = Router::new()
        .route("/version", get(handlers::version))
        .route("/jobs", post(handlers::create_job).get(handlers::list_jobs))
        .route("/jobs/:id", get(handlers::get_job))
        .route("/jobs/:id/transition", post(handlers::transition_job))
        .route("/stacks", post(handlers::create_stack))
        .route("/stacks/:id", get(handlers::get_stack).put(handlers::update_stack))
        .route("/targets", get(handlers::list_targets))
        .route("/targets/:id", get(handlers::get_target));

    Router::new()
        .route("/ping", get(handlers::ping))
        .nest("/api/v1", api)
        .with_state(state)
        .layer(axum_middleware::from_fn_with_state(
            request_timeout,
            middleware::request_scope,
        ))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http().make_span_with(|req: &Request| {
            let client_ip = req
                .extensions()
                .get::<ClientIp>()
                .map(|ClientIp(ip)| ip.to_string())
                .unwrap_or_default();
            tracing::info_span!(
                "request",
                method = %req.method(),
                uri = %req.uri(),
                client_ip = %client_ip,
            )
        }))
        .layer(axum_middleware::from_fn_with_state(
            trusted_proxies,
            middleware::client_ip,
        ))
}

/// Router for the metrics listener.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(handle)
}

async fn render_metrics(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    StackerError::internal(format!("handler panicked: {}", detail)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_panicking_handler_gets_generic_500() {
        async fn boom() -> &'static str {
            panic!("secret detail");
        }
        let router = Router::new()
            .route("/boom", get(boom))
            .layer(CatchPanicLayer::custom(panic_response));

        let request = axum::http::Request::builder().uri("/boom").body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "INTERNAL_ERROR");
        assert!(!body.to_string().contains("secret detail"));
    }
}
