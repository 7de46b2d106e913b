//! 基础设施层实现。
//!
//! 提供 Postgres 用户仓储、bcrypt 密码哈希、Redis 在线集合与跨实例广播、
//! 日志邮件等适配器，实现应用层定义的接口。

pub mod broadcast;
pub mod builder;
pub mod mail;
pub mod migrations;
pub mod password;
pub mod presence_store;
pub mod repository;

pub use broadcast::RedisBroadcastRelay;
pub use builder::{Infrastructure, InfrastructureError};
pub use mail::LoggingMailer;
pub use migrations::MIGRATOR;
pub use password::BcryptPasswordHasher;
pub use presence_store::RedisPresenceStore;
pub use repository::{create_pg_pool, PgUserRepository};
