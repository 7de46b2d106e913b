//! 令牌签发与校验
//!
//! 访问令牌与刷新令牌使用同一个 HS256 密钥签名，靠载荷中的 `type`
//! 字段区分用途。过期时间按注入的 [`Clock`] 惰性判断，不依赖系统时间。

use std::{collections::HashSet, sync::Arc};

use config::JwtConfig;
use domain::{Claims, Timestamp, TokenSubjectClaims, TokenType};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use thiserror::Error;
use time::Duration;

use crate::clock::Clock;

/// 令牌校验失败的具体原因，仅用于日志，对外统一为无效令牌
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("token expired")]
    Expired,
    #[error("expected {expected} token, got {actual}")]
    WrongType {
        expected: TokenType,
        actual: TokenType,
    },
    #[error("token encoding failed: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub secret: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl From<&JwtConfig> for TokenSettings {
    fn from(config: &JwtConfig) -> Self {
        Self {
            secret: config.secret.clone(),
            access_ttl: Duration::minutes(config.access_token_expire_minutes),
            refresh_ttl: Duration::days(config.refresh_token_expire_days),
        }
    }
}

/// 刚签发的令牌及其过期时间
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: Timestamp,
}

pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenService {
    pub fn new(settings: TokenSettings, clock: Arc<dyn Clock>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // 过期由 verify_token 对照注入时钟判断
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.required_spec_claims =
            HashSet::from(["sub".to_string(), "exp".to_string()]);

        Self {
            encoding_key: EncodingKey::from_secret(settings.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(settings.secret.as_bytes()),
            validation,
            access_ttl: settings.access_ttl,
            refresh_ttl: settings.refresh_ttl,
            clock,
        }
    }

    pub fn from_config(config: &JwtConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(TokenSettings::from(config), clock)
    }

    pub fn lifetime(&self, token_type: TokenType) -> Duration {
        match token_type {
            TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
        }
    }

    /// 以当前时钟签发一个该类型令牌时应携带的过期时间
    pub fn expiration_by_type(&self, token_type: TokenType) -> Timestamp {
        self.clock.now() + self.lifetime(token_type)
    }

    pub fn generate_token(
        &self,
        token_type: TokenType,
        subject: &str,
        claims: TokenSubjectClaims,
    ) -> Result<String, TokenError> {
        self.issue(token_type, subject, claims).map(|issued| issued.token)
    }

    /// 签发令牌，同时返回过期时间供响应体使用
    pub fn issue(
        &self,
        token_type: TokenType,
        subject: &str,
        claims: TokenSubjectClaims,
    ) -> Result<IssuedToken, TokenError> {
        let now = self.clock.now();
        let expires_at = now + self.lifetime(token_type);
        let payload = Claims {
            sub: subject.to_owned(),
            id: claims.id,
            role: claims.role,
            token_type,
            iat: now.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &payload, &self.encoding_key)
            .map_err(|err| TokenError::Encoding(err.to_string()))?;

        Ok(IssuedToken {
            token,
            expires_at: Timestamp::from_unix_timestamp(payload.exp).unwrap_or(expires_at),
        })
    }

    pub fn verify_token(&self, token: &str, expected: TokenType) -> Result<Claims, TokenError> {
        let result = self.decode_and_check(token, expected);
        if let Err(err) = &result {
            tracing::debug!(expected = %expected, error = %err, "令牌校验失败");
        }
        result
    }

    fn decode_and_check(&self, token: &str, expected: TokenType) -> Result<Claims, TokenError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| TokenError::Malformed(err.to_string()))?
            .claims;

        if claims.exp <= self.clock.now().unix_timestamp() {
            return Err(TokenError::Expired);
        }
        if claims.token_type != expected {
            return Err(TokenError::WrongType {
                expected,
                actual: claims.token_type,
            });
        }
        Ok(claims)
    }
}
