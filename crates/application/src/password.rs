//! 密码哈希端口
//!
//! bcrypt 只取明文的前 72 字节，超出部分会被静默截断。注册时按字节长度
//! 拒绝过长密码，登录时过长的输入直接判为凭证无效，不交给哈希器比对。

use async_trait::async_trait;
use domain::{DomainError, PasswordHash};
use thiserror::Error;

/// 哈希算法实际参与计算的最大明文字节数
pub const MAX_PASSWORD_BYTES: usize = 72;

#[derive(Debug, Error)]
pub enum PasswordHasherError {
    #[error("failed to hash password: {0}")]
    Hash(String),
    #[error("failed to verify password: {0}")]
    Verify(String),
}

impl PasswordHasherError {
    pub fn hash_error(message: impl Into<String>) -> Self {
        Self::Hash(message.into())
    }

    pub fn verify_error(message: impl Into<String>) -> Self {
        Self::Verify(message.into())
    }
}

/// 明文能否被完整哈希
pub fn fits_hash_input(plaintext: &str) -> bool {
    !plaintext.is_empty() && plaintext.len() <= MAX_PASSWORD_BYTES
}

/// 注册时校验明文密码，多字节字符按字节计
pub fn check_password(plaintext: &str) -> Result<(), DomainError> {
    if plaintext.is_empty() {
        return Err(DomainError::invalid_argument("password", "cannot be empty"));
    }
    if plaintext.len() > MAX_PASSWORD_BYTES {
        return Err(DomainError::invalid_argument(
            "password",
            format!("must not exceed {MAX_PASSWORD_BYTES} bytes"),
        ));
    }
    Ok(())
}

/// 密码哈希能力，由基础设施层提供具体算法
#[async_trait]
pub trait PasswordHasher: Send + Sync {
    async fn hash(&self, plaintext: &str) -> Result<PasswordHash, PasswordHasherError>;
    async fn verify(
        &self,
        plaintext: &str,
        hashed: &PasswordHash,
    ) -> Result<bool, PasswordHasherError>;
}
