use application::ApplicationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use domain::{DomainError, RepositoryError};
use serde::{Deserialize, Serialize};

/// 错误响应体 `{ statusCode, code, message }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub status_code: u16,
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                status_code: status.as_u16(),
                code: code.to_owned(),
                message: message.into(),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &str {
        &self.body.code
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        use ApplicationError as AppErr;

        match error {
            AppErr::Domain(DomainError::InvalidArgument { field, reason }) => ApiError::new(
                StatusCode::BAD_REQUEST,
                "INVALID_ARGUMENT",
                format!("{field}: {reason}"),
            ),
            AppErr::InvalidToken => {
                ApiError::new(StatusCode::UNAUTHORIZED, "INVALID_TOKEN", "invalid token")
            }
            AppErr::InvalidCredentials => ApiError::new(
                StatusCode::UNAUTHORIZED,
                "INVALID_CREDENTIALS",
                "invalid credentials",
            ),
            AppErr::EmailAlreadyRegistered(email) => ApiError::new(
                StatusCode::CONFLICT,
                "EMAIL_ALREADY_REGISTERED",
                format!("email {email} is already registered"),
            ),
            AppErr::NotFound { resource, id } => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("{resource} {id} not found"),
            ),
            AppErr::InvalidOtp => ApiError::new(StatusCode::BAD_REQUEST, "INVALID_OTP", "invalid otp"),
            AppErr::OtpExpired => {
                ApiError::new(StatusCode::BAD_REQUEST, "OTP_EXPIRED", "otp has expired")
            }
            AppErr::Authorization => ApiError::new(
                StatusCode::FORBIDDEN,
                "AUTHORIZATION_FAILED",
                "authorization failed",
            ),
            AppErr::Repository(RepositoryError::NotFound) => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                "requested resource not found",
            ),
            AppErr::Repository(RepositoryError::Conflict) => {
                ApiError::new(StatusCode::CONFLICT, "CONFLICT", "resource already exists")
            }
            other => {
                tracing::error!(error = %other, "请求处理失败");
                let code = match &other {
                    AppErr::Repository(_) => "DATABASE_ERROR",
                    AppErr::Password(_) => "PASSWORD_ERROR",
                    AppErr::Mail(_) => "MAIL_ERROR",
                    AppErr::Broadcast(_) => "BROADCAST_ERROR",
                    AppErr::Presence(_) => "PRESENCE_ERROR",
                    _ => "INFRASTRUCTURE_ERROR",
                };
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, code, other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
