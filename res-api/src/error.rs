use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use res_engine::{CommandError, ErrorKind};
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        match err.kind {
            ErrorKind::InvalidCommand | ErrorKind::ConfigurationNotFound => {
                ApiError::BadRequest(err.message)
            }
            ErrorKind::AuthenticationFailed => ApiError::Forbidden(err.message),
            ErrorKind::BackendFault | ErrorKind::Timeout => ApiError::Internal(err.message),
        }
    }
}
