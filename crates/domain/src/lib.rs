//! 身份与在线状态子系统的核心领域模型
//!
//! 包含用户、令牌声明、验证码等实体与值对象，以及相关的业务规则。

pub mod auth;
pub mod errors;
pub mod user;
pub mod value_objects;

// 重新导出常用类型
pub use auth::{Claims, TokenSubjectClaims, TokenType};
pub use errors::{DomainError, RepositoryError};
pub use user::{NewUser, OtpRejection, User, UserRole, UserUpdate};
pub use value_objects::{
    ConnectionId, OneTimeCode, PasswordHash, Timestamp, UserEmail, UserId, Username,
};
