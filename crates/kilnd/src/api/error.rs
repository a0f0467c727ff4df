use axum::http::StatusCode;
use axum::response::IntoResponse;

/// ApiError maps every failure of a handler onto the API's error
/// contract: known validation problems answer 400/404/409 with a terse
/// message, everything else is a 500 which never leaks internals.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} is not known")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<store::Error> for ApiError {
    fn from(err: store::Error) -> Self {
        match err {
            store::Error::NotFound(id) => ApiError::NotFound(format!("build {id:?}")),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<pool::Error> for ApiError {
    fn from(err: pool::Error) -> Self {
        match err {
            pool::Error::Duplicate(_) | pool::Error::LastBackend => {
                ApiError::Conflict(err.to_string())
            }
            pool::Error::NotFound(addr) => ApiError::NotFound(format!("backend {addr:?}")),
            other => ApiError::Validation(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            ApiError::Validation(message) => (StatusCode::BAD_REQUEST, message.clone()),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message.clone()),
            ApiError::Internal(err) => {
                tracing::error!(error = ?err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, message).into_response()
    }
}
