//! 令牌相关实体
//!
//! 访问令牌与刷新令牌共用同一签名机制，只在 `type` 与 `exp` 上不同。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::user::{User, UserRole};
use crate::value_objects::UserId;

/// 令牌类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenType {
    /// 短期令牌，用于 API 与实时连接
    Access,
    /// 长期令牌，只能用来换取新的令牌对
    Refresh,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenType::Access => f.write_str("ACCESS"),
            TokenType::Refresh => f.write_str("REFRESH"),
        }
    }
}

/// 签发时嵌入令牌的用户信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSubjectClaims {
    pub id: UserId,
    pub role: Option<UserRole>,
}

impl From<&User> for TokenSubjectClaims {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            role: user.role,
        }
    }
}

/// JWT 载荷：`{ sub, id, role, type, iat, exp }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// 主题（用户邮箱）
    pub sub: String,
    pub id: UserId,
    #[serde(default)]
    pub role: Option<UserRole>,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    /// 签发时间 (Unix timestamp)
    pub iat: i64,
    /// 过期时间 (Unix timestamp)
    pub exp: i64,
}

impl Claims {
    pub fn user_id(&self) -> UserId {
        self.id
    }

    pub fn is_admin(&self) -> bool {
        self.role == Some(UserRole::Admin)
    }
}
