use axum::extract::{DefaultBodyLimit, MatchedPath};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use pool::BackendPool;
use std::sync::Arc;
use store::BuildStore;

mod backends;
mod builds;
mod error;

pub use error::ApiError;

/// Maximum request body: inline source trees can be chunky, anything
/// beyond this belongs in a git source.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

pub struct AppState {
    pub store: Arc<dyn BuildStore>,
    pub pool: Arc<BackendPool>,
    /// Architecture assumed for builds which don't name one.
    pub default_arch: String,
}

/// Build the kilnd API router.
pub fn build_router(app: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_text))
        .route(
            "/api/v1/backends",
            get(backends::list)
                .post(backends::add)
                .delete(backends::remove),
        )
        .route("/api/v1/builds", get(builds::list).post(builds::create))
        .route("/api/v1/builds/:id", get(builds::get))
        .layer(axum::middleware::from_fn(track_requests))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::timeout::TimeoutLayer::new(
            std::time::Duration::from_secs(60),
        ))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(app)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_text() -> axum::response::Response {
    match metrics::gather() {
        Ok(text) => (
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4",
            )],
            text,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = ?err, "failed to gather metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        }
    }
}

// Count every served request under its route template, so build IDs
// don't fan out the label set.
async fn track_requests(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let response = next.run(request).await;
    metrics::API_REQUESTS
        .with_label_values(&[&path, response.status().as_str()])
        .inc();
    response
}
