use forge_auth::AuthError;
use forge_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A remote forge API answered with an unexpected status.
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ApiError {
    /// HTTP status this error is answered with.
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::InvalidRequest(_) => 400,
            ApiError::NotFound(_) => 404,
            ApiError::Upstream(_) => 502,
            ApiError::Internal(_) => 500,
            ApiError::Auth(AuthError::AuthRequired | AuthError::InvalidCredential(_)) => 401,
            ApiError::Auth(AuthError::InvalidConfig(_)) => 500,
            ApiError::Core(e) => match e {
                CoreError::JobNotFound(_) | CoreError::LogNotFound(_) => 404,
                CoreError::InvalidRequest(_) => 400,
                CoreError::InvalidState { .. }
                | CoreError::InvalidTransition { .. }
                | CoreError::StaleAttempt { .. } => 409,
                CoreError::Publish(_) => 502,
                CoreError::Storage(_) => 503,
            },
        }
    }

    /// Stable machine-readable code of the error body.
    pub fn code(&self) -> &'static str {
        match self.status_code() {
            400 => "invalid_request",
            401 => "unauthorized",
            404 => "not_found",
            409 => "conflict",
            502 => "upstream_error",
            503 => "unavailable",
            _ => "internal",
        }
    }
}

#[cfg(feature = "http")]
mod response {
    use axum::{
        Json,
        http::{HeaderValue, StatusCode, header},
        response::{IntoResponse, Response},
    };
    use tracing::error;

    use super::ApiError;
    use crate::ErrorBody;

    impl IntoResponse for ApiError {
        fn into_response(self) -> Response {
            let status =
                StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if status.is_server_error() {
                error!(error = %self, "request failed");
            }

            let mut response = (
                status,
                Json(ErrorBody {
                    error: self.code().to_string(),
                    message: self.to_string(),
                }),
            )
                .into_response();

            if status == StatusCode::UNAUTHORIZED {
                response.headers_mut().insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("github, oauth"),
                );
            }
            response
        }
    }
}
