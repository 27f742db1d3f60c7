use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("provider unreachable: {0}")]
    Unavailable(String),
    #[error("session already attached")]
    SessionBusy,
    /// Non-2xx reply from the provider agent; status and body are relayed
    /// to the client untouched.
    #[error("agent returned {status}")]
    Agent {
        status: StatusCode,
        body: serde_json::Value,
    },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "validation_error", Some(msg)),
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "not_found",
                Some(format!("{what} not found")),
            ),
            ApiError::Unavailable(msg) => (StatusCode::BAD_GATEWAY, "unavailable", Some(msg)),
            ApiError::SessionBusy => (
                StatusCode::CONFLICT,
                "session_busy",
                Some("session already attached".to_string()),
            ),
            ApiError::Agent { status, body } => {
                return (status, Json(body)).into_response();
            }
            ApiError::Internal(err) => {
                tracing::error!("internal error: {err:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None)
            }
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_bad_request() {
        let resp = ApiError::Validation("providerID is required".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn session_busy_maps_to_conflict() {
        let resp = ApiError::SessionBusy.into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn agent_errors_relay_their_status() {
        let resp = ApiError::Agent {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: serde_json::json!({"error": "docker daemon down"}),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
