use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// AuthFailure
///
/// The specific reason a caller was treated as unauthenticated. Every variant is
/// reported as 401, but each carries its own machine-readable code so clients can
/// tell "never logged in" apart from "your session died".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// No bearer credential was presented on a protected path.
    MissingCredential,
    /// A credential was presented but is malformed, expired, or wrongly signed.
    InvalidToken,
    /// The token is valid but the account is deactivated, deleted, or gone.
    AccountLocked,
    /// The refresh token is not the one currently stored for its device.
    InvalidSession,
    /// Login with an unknown identifier or a wrong password.
    BadCredentials,
}

impl AuthFailure {
    pub fn code(&self) -> &'static str {
        match self {
            AuthFailure::MissingCredential => "error.unauthorized",
            AuthFailure::InvalidToken => "error.token_invalid",
            AuthFailure::AccountLocked => "error.account_locked",
            AuthFailure::InvalidSession => "error.invalid_session",
            AuthFailure::BadCredentials => "error.invalid_credentials",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            AuthFailure::MissingCredential => "Authentication required",
            AuthFailure::InvalidToken => "Invalid or expired token",
            AuthFailure::AccountLocked => "User not found or inactive",
            AuthFailure::InvalidSession => "Invalid session",
            AuthFailure::BadCredentials => "Invalid email or password",
        }
    }
}

/// AppError
///
/// The single error taxonomy of the service. "No access" is never an error at the
/// matcher or cache level; it only becomes `Forbidden` once the middleware decides.
/// `Internal` aborts the request and is never downgraded to allow or deny.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("unauthenticated: {}", .0.message())]
    Unauthenticated(AuthFailure),

    #[error("access denied")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthenticated(failure) => failure.code(),
            AppError::Forbidden => "error.access_denied",
            AppError::NotFound(_) => "error.not_found",
            AppError::Validation(_) => "error.validation",
            AppError::Conflict(_) => "error.conflict",
            AppError::Internal(_) => "error.server_error",
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Internal(format!("database: {err}"))
    }
}

/// Wire shape of every error response.
#[derive(Serialize, utoipa::ToSchema)]
pub struct ErrorBody {
    pub success: bool,
    pub code: String,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = match &self {
            AppError::Unauthenticated(failure) => failure.message().to_string(),
            AppError::Forbidden => "Access denied: Insufficient permissions".to_string(),
            AppError::Internal(detail) => {
                // The detail stays in the logs; clients only see a generic message.
                tracing::error!(error = %detail, "request failed with internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorBody {
            success: false,
            code: self.code().to_string(),
            message,
        };
        (self.status(), Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
