use domain::{DomainError, RepositoryError};
use thiserror::Error;

use crate::mail::MailError;
use crate::password::PasswordHasherError;
use crate::presence::PresenceStoreError;
use crate::realtime::BroadcastError;
use crate::token::TokenError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
    #[error("password error: {0}")]
    Password(#[from] PasswordHasherError),
    #[error("mail error: {0}")]
    Mail(#[from] MailError),
    #[error("broadcast error: {0}")]
    Broadcast(#[from] BroadcastError),
    #[error("presence store error: {0}")]
    Presence(#[from] PresenceStoreError),
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
    /// 签名错误、已过期或类型不符，对外统一
    #[error("invalid token")]
    InvalidToken,
    /// 用户不存在、未验证、密码错误、刷新失败，对外统一
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("email {0} is already registered")]
    EmailAlreadyRegistered(String),
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },
    #[error("invalid otp")]
    InvalidOtp,
    #[error("otp has expired")]
    OtpExpired,
    #[error("authorization failed")]
    Authorization,
}

impl ApplicationError {
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure(message.into())
    }

    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        ApplicationError::NotFound {
            resource,
            id: id.to_string(),
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Repository(value)
    }
}

impl From<TokenError> for ApplicationError {
    fn from(value: TokenError) -> Self {
        match value {
            TokenError::Encoding(message) => ApplicationError::Infrastructure(message),
            _ => ApplicationError::InvalidToken,
        }
    }
}
