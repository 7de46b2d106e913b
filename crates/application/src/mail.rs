use async_trait::async_trait;
use domain::{OneTimeCode, Timestamp, UserEmail};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail delivery failed: {0}")]
    Delivery(String),
}

impl MailError {
    pub fn delivery(message: impl Into<String>) -> Self {
        Self::Delivery(message.into())
    }
}

/// 外部邮件协作方
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    /// 发送验证码，返回实际发送时间（验证码有效期从该时间起算）
    async fn send_otp(&self, code: OneTimeCode, email: UserEmail) -> Result<Timestamp, MailError>;

    async fn send_greeting(&self, email: UserEmail) -> Result<(), MailError>;
}
