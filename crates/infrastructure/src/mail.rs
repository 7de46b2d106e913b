use std::sync::Arc;

use application::{Clock, MailError, Mailer};
use async_trait::async_trait;
use domain::{OneTimeCode, Timestamp, UserEmail};

/// 只写日志的邮件适配器，真实投递由外部邮件服务负责
pub struct LoggingMailer {
    clock: Arc<dyn Clock>,
}

impl LoggingMailer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl Mailer for LoggingMailer {
    async fn send_otp(&self, code: OneTimeCode, email: UserEmail) -> Result<Timestamp, MailError> {
        let sent_at = self.clock.now();
        tracing::info!(email = %email, "发送邮箱验证码");
        tracing::debug!(email = %email, otp = %code, "验证码内容");
        Ok(sent_at)
    }

    async fn send_greeting(&self, email: UserEmail) -> Result<(), MailError> {
        tracing::info!(email = %email, "发送欢迎邮件");
        Ok(())
    }
}
