use std::sync::Arc;

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio_util::sync::CancellationToken;

use crate::discovery::Discoverer;
use crate::metrics::Registry;
use crate::translate::{filter_empty_labels, translate, TargetFilter};

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    pub discoverer: Arc<dyn Discoverer>,
    pub filters: Arc<[TargetFilter]>,
    pub registry: Arc<Registry>,
    /// Parent of every per-request discovery context
    pub shutdown: CancellationToken,
}

/// Serve the devices of `discoverer` for HTTP service discovery. Empty labels
/// are always removed before the filters in `with` run.
pub fn export(discoverer: Arc<dyn Discoverer>, with: &[TargetFilter]) -> AppState {
    let filters: Vec<TargetFilter> = std::iter::once(filter_empty_labels as TargetFilter)
        .chain(with.iter().copied())
        .collect();

    AppState {
        discoverer,
        filters: filters.into(),
        registry: Arc::new(Registry::new()),
        shutdown: CancellationToken::new(),
    }
}

impl AppState {
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(discover))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn discover(State(state): State<AppState>) -> Response {
    // dropping the request future cancels the upstream calls
    let ctx = state.shutdown.child_token();
    let _guard = ctx.clone().drop_guard();

    let devices = match state.discoverer.devices(&ctx).await {
        Ok(devices) => devices,
        Err(err) if err.is_stale() => {
            tracing::warn!("Serving potentially stale results: {}", err);
            err.into_devices()
        }
        Err(err) => {
            tracing::error!("Failed to discover Tailscale devices: {}", err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to discover Tailscale devices: {}", err),
            )
                .into_response();
        }
    };

    let targets = translate(&devices, &state.filters);
    match serde_json::to_vec(&targets) {
        Ok(body) => ([(CONTENT_TYPE, JSON_CONTENT_TYPE)], body).into_response(),
        Err(err) => {
            tracing::error!("Failed to encode targets as JSON: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode targets as JSON",
            )
                .into_response()
        }
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    ([(CONTENT_TYPE, METRICS_CONTENT_TYPE)], state.registry.render())
}
