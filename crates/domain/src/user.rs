use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::errors::DomainError;
use crate::value_objects::{OneTimeCode, PasswordHash, Timestamp, UserEmail, UserId, Username};

/// 用户角色，邮箱验证通过后才会分配
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserRole {
    User,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::User => "USER",
            UserRole::Admin => "ADMIN",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(UserRole::User),
            "ADMIN" => Ok(UserRole::Admin),
            other => Err(DomainError::invalid_argument(
                "role",
                format!("unknown role {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: UserEmail,
    pub username: Username,
    #[serde(skip_serializing)] // 密码字段不暴露给客户端
    pub password: PasswordHash,
    pub email_verified: bool,
    pub role: Option<UserRole>,
    #[serde(skip_serializing)]
    pub otp: Option<OneTimeCode>,
    #[serde(skip_serializing)]
    pub otp_sent_at: Option<Timestamp>,
    pub avatar: Option<String>,
}

/// OTP 校验失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpRejection {
    Mismatch,
    Expired,
}

impl User {
    /// 校验邮箱验证码。
    ///
    /// 先比对验证码，再按 `now - otp_sent_at > window` 判断过期，
    /// 所以验证码正确但已过期时返回 `Expired`。
    pub fn check_otp(
        &self,
        code: OneTimeCode,
        now: Timestamp,
        window: Duration,
    ) -> Result<(), OtpRejection> {
        let (Some(expected), Some(sent_at)) = (self.otp, self.otp_sent_at) else {
            return Err(OtpRejection::Mismatch);
        };
        if expected != code {
            return Err(OtpRejection::Mismatch);
        }
        if now - sent_at > window {
            return Err(OtpRejection::Expired);
        }
        Ok(())
    }

    pub fn is_admin(&self) -> bool {
        self.role == Some(UserRole::Admin)
    }
}

/// 注册时写入存储的新用户，id 由存储分配
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub email: UserEmail,
    pub username: Username,
    pub password: PasswordHash,
    pub otp: OneTimeCode,
    pub otp_sent_at: Timestamp,
}

/// 部分字段更新，`None` 表示保持原值
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserUpdate {
    pub username: Option<Username>,
    pub email_verified: Option<bool>,
    pub role: Option<UserRole>,
}

impl UserUpdate {
    pub fn username(username: Username) -> Self {
        Self {
            username: Some(username),
            ..Self::default()
        }
    }

    /// 邮箱验证通过：标记已验证并分配默认角色
    pub fn email_confirmed() -> Self {
        Self {
            email_verified: Some(true),
            role: Some(UserRole::User),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.email_verified.is_none() && self.role.is_none()
    }

    pub fn apply(&self, user: &mut User) {
        if let Some(username) = &self.username {
            user.username = username.clone();
        }
        if let Some(verified) = self.email_verified {
            user.email_verified = verified;
        }
        if let Some(role) = self.role {
            user.role = Some(role);
        }
    }
}
