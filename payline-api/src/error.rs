use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use payline_core::CoreError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    AuthenticationError(String),
    #[error("{0}")]
    ValidationError(String),
    #[error("{0}")]
    NotFoundError(String),
    #[error("{0}")]
    InternalServerError(String),
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::AuthenticationError(_) => StatusCode::UNAUTHORIZED,
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFoundError(_) => StatusCode::NOT_FOUND,
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Core(e) => match e {
                CoreError::ValidationError(_) => StatusCode::BAD_REQUEST,
                CoreError::NotFoundError(_) => StatusCode::NOT_FOUND,
                CoreError::PreconditionError(_) => StatusCode::UNPROCESSABLE_ENTITY,
                CoreError::ConflictError(_) | CoreError::DuplicateOrderNumber(_) => StatusCode::CONFLICT,
                CoreError::ExpiredError(_) => StatusCode::GONE,
                CoreError::ProviderError(_) => StatusCode::BAD_GATEWAY,
                CoreError::TimeoutError(_) => StatusCode::GATEWAY_TIMEOUT,
                CoreError::ConfigurationError(_) | CoreError::StorageError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal Server Error: {}", self);
            "Internal Server Error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}
