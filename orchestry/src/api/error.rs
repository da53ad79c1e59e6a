//! Error-to-response mapping.

use axum::{
    http::{header::HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use orchestry_runtime::Error;
use serde_json::json;

pub static CURRENT_LEADER_HEADER: HeaderName = HeaderName::from_static("x-current-leader");

pub type ApiResult<T> = Result<T, ApiError>;

/// Wrapper turning runtime errors into HTTP responses.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<orchestry_store::Error> for ApiError {
    fn from(err: orchestry_store::Error) -> Self {
        Self(Error::Store(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            Error::Validation(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Leadership { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Runtime(_) | Error::Proxy(_) => StatusCode::BAD_GATEWAY,
            Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if let Error::Leadership { leader } = &err {
            let body = Json(json!({
                "error": err.to_string(),
                "leader": leader,
            }));
            let mut response = (status, body).into_response();
            if let Some(leader) = leader {
                if let Ok(value) = HeaderValue::from_str(leader) {
                    response
                        .headers_mut()
                        .insert(CURRENT_LEADER_HEADER.clone(), value);
                }
            }
            return response;
        }

        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        (status, Json(json!({ "error": err.to_string() }))).into_response()
    }
}
