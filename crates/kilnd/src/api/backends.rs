use super::{ApiError, AppState};
use axum::extract::{Json, Query, State};
use axum::http::StatusCode;
use models::api::{BackendListing, RemoveBackendRequest};
use models::Backend;
use std::sync::Arc;

#[derive(Debug, serde::Deserialize)]
pub struct ListQuery {
    arch: Option<String>,
}

pub async fn list(
    State(app): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Json<BackendListing> {
    let backends = match &query.arch {
        Some(arch) => app.pool.list_by_arch(arch),
        None => app.pool.list(),
    };
    Json(BackendListing {
        backends,
        architectures: app.pool.architectures(),
    })
}

pub async fn add(
    State(app): State<Arc<AppState>>,
    Json(backend): Json<Backend>,
) -> Result<(StatusCode, Json<Backend>), ApiError> {
    app.pool.add(backend.clone())?;
    Ok((StatusCode::CREATED, Json(backend)))
}

pub async fn remove(
    State(app): State<Arc<AppState>>,
    Json(request): Json<RemoveBackendRequest>,
) -> Result<StatusCode, ApiError> {
    app.pool.remove(&request.addr)?;
    Ok(StatusCode::NO_CONTENT)
}
