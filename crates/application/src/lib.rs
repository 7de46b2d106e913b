//! 应用层实现。
//!
//! 这里提供身份与在线状态的用例服务：令牌签发、注册登录、在线登记
//! 与实时连接绑定，并对外部适配器（用户存储、邮件、密码哈希、共享集合存储）做抽象。

pub mod clock;
pub mod dto;
pub mod error;
pub mod mail;
pub mod otp;
pub mod password;
pub mod presence;
pub mod realtime;
pub mod repository;
pub mod services;
pub mod token;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dto::{LoginResponse, TokenDto, UserDto};
pub use error::ApplicationError;
pub use mail::{MailError, Mailer};
pub use otp::{FixedOtpGenerator, OtpGenerator, RandomOtpGenerator};
pub use password::{PasswordHasher, PasswordHasherError};
pub use presence::{
    connection_count_key, PresenceRegistry, PresenceStore, PresenceStoreError,
    DEFAULT_PRESENCE_KEY,
};
pub use realtime::{
    AcceptedConnection, BroadcastError, LocalRealtimeBroadcaster, RealtimeBroadcaster,
    RealtimeEvent, RealtimeGateway, SocketSessionBinding, ONLINE_USERS_EVENT,
};
pub use repository::UserRepository;
pub use services::{
    ConfirmEmailRequest, CredentialService, CredentialServiceDependencies, LoginRequest,
    RegisterUserRequest,
};
pub use token::{IssuedToken, TokenError, TokenService, TokenSettings};
