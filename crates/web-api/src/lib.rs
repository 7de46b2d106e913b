//! Web API 层。
//!
//! 提供 Axum 路由，将 HTTP / WebSocket 请求委托给应用层的凭证服务与实时网关。

mod auth;
mod error;
mod extract;
mod routes;
mod state;
mod websocket;

pub use auth::{AdminUser, AuthenticatedUser};
pub use error::{ApiError, ErrorBody};
pub use routes::{router, REFRESH_TOKEN_HEADER};
pub use state::AppState;
