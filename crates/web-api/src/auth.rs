//! 请求鉴权
//!
//! 从 `Authorization: Bearer` 头中取出访问令牌并校验，刷新令牌在这里一律被拒绝。

use application::ApplicationError;
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use domain::{Claims, TokenType, UserId};

use crate::{error::ApiError, state::AppState};

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// 已通过访问令牌鉴权的调用方
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub Claims);

impl AuthenticatedUser {
    pub fn user_id(&self) -> UserId {
        self.0.user_id()
    }

    pub fn is_admin(&self) -> bool {
        self.0.is_admin()
    }

    /// 只能操作自己的账号，管理员例外
    pub fn ensure_self_or_admin(&self, target: UserId) -> Result<(), ApiError> {
        if self.user_id() == target || self.is_admin() {
            return Ok(());
        }
        tracing::debug!(caller = %self.user_id(), target = %target, "拒绝越权操作");
        Err(ApplicationError::Authorization.into())
    }
}

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
        let claims = state
            .token_service
            .verify_token(token, TokenType::Access)
            .map_err(ApplicationError::from)?;
        Ok(Self(claims))
    }
}

/// 角色为 ADMIN 的调用方
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthenticatedUser);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user = AuthenticatedUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(ApplicationError::Authorization.into());
        }
        Ok(Self(user))
    }
}
