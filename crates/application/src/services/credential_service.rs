use std::sync::Arc;

use domain::{
    NewUser, OneTimeCode, OtpRejection, RepositoryError, TokenSubjectClaims, TokenType, User,
    UserEmail, UserId, UserUpdate, Username,
};
use time::Duration;

use crate::{
    clock::Clock,
    dto::{LoginResponse, TokenDto, UserDto},
    error::ApplicationError,
    mail::Mailer,
    otp::OtpGenerator,
    password::{check_password, fits_hash_input, PasswordHasher},
    repository::UserRepository,
    token::TokenService,
};

#[derive(Debug, Clone)]
pub struct RegisterUserRequest {
    pub email: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ConfirmEmailRequest {
    pub email: String,
    pub otp: u32,
}

pub struct CredentialServiceDependencies {
    pub user_repository: Arc<dyn UserRepository>,
    pub password_hasher: Arc<dyn PasswordHasher>,
    pub token_service: Arc<TokenService>,
    pub mailer: Arc<dyn Mailer>,
    pub otp_generator: Arc<dyn OtpGenerator>,
    pub clock: Arc<dyn Clock>,
    /// 验证码有效期
    pub otp_expiration: Duration,
}

/// 注册、邮箱验证、登录与令牌刷新
///
/// 用户状态：未注册 -> 待验证 -> 已验证。
pub struct CredentialService {
    deps: CredentialServiceDependencies,
}

impl CredentialService {
    pub fn new(deps: CredentialServiceDependencies) -> Self {
        Self { deps }
    }

    pub async fn register(&self, request: RegisterUserRequest) -> Result<UserDto, ApplicationError> {
        let email = UserEmail::parse(request.email)?;
        let username = Username::parse(request.username)?;
        check_password(&request.password)?;

        if self
            .deps
            .user_repository
            .find_by_email(&email)
            .await?
            .is_some()
        {
            return Err(ApplicationError::EmailAlreadyRegistered(email.to_string()));
        }

        let otp = self.deps.otp_generator.generate();
        let otp_sent_at = self.deps.mailer.send_otp(otp, email.clone()).await?;
        let password = self.deps.password_hasher.hash(&request.password).await?;

        let created = self
            .deps
            .user_repository
            .create(NewUser {
                email: email.clone(),
                username,
                password,
                otp,
                otp_sent_at,
            })
            .await
            .map_err(|err| match err {
                // 并发注册同一邮箱
                RepositoryError::Conflict => {
                    ApplicationError::EmailAlreadyRegistered(email.to_string())
                }
                other => ApplicationError::from(other),
            })?;

        tracing::info!(user_id = %created.id, email = %created.email, "用户注册成功，等待邮箱验证");
        Ok(UserDto::from(&created))
    }

    pub async fn confirm_email(
        &self,
        request: ConfirmEmailRequest,
    ) -> Result<TokenDto, ApplicationError> {
        let email = UserEmail::parse(request.email)?;
        let otp = OneTimeCode::new(request.otp).map_err(|_| ApplicationError::InvalidOtp)?;

        let user = self
            .deps
            .user_repository
            .find_by_email(&email)
            .await?
            .ok_or_else(|| ApplicationError::not_found("user", &email))?;

        user.check_otp(otp, self.deps.clock.now(), self.deps.otp_expiration)
            .map_err(|rejection| match rejection {
                OtpRejection::Mismatch => ApplicationError::InvalidOtp,
                OtpRejection::Expired => ApplicationError::OtpExpired,
            })?;

        let verified = self
            .deps
            .user_repository
            .update(user.id, UserUpdate::email_confirmed())
            .await
            .map_err(|err| self.map_missing(err, user.id))?;

        self.spawn_greeting(verified.email.clone());
        tracing::info!(user_id = %verified.id, "邮箱验证通过");

        self.generate_tokens(&verified)
    }

    /// 用户不存在、未验证、密码错误对调用方不可区分
    pub async fn login(&self, request: LoginRequest) -> Result<LoginResponse, ApplicationError> {
        let Ok(email) = UserEmail::parse(request.email) else {
            return Err(ApplicationError::InvalidCredentials);
        };

        let Some(user) = self.deps.user_repository.find_by_email(&email).await? else {
            tracing::debug!(email = %email, "登录失败：用户不存在");
            return Err(ApplicationError::InvalidCredentials);
        };

        if !user.email_verified {
            tracing::debug!(user_id = %user.id, "登录失败：邮箱未验证");
            return Err(ApplicationError::InvalidCredentials);
        }

        if !fits_hash_input(&request.password) {
            tracing::debug!(user_id = %user.id, "登录失败：密码长度超出哈希输入");
            return Err(ApplicationError::InvalidCredentials);
        }

        let password_ok = self
            .deps
            .password_hasher
            .verify(&request.password, &user.password)
            .await?;
        if !password_ok {
            tracing::debug!(user_id = %user.id, "登录失败：密码错误");
            return Err(ApplicationError::InvalidCredentials);
        }

        let tokens = self.generate_tokens(&user)?;
        tracing::info!(user_id = %user.id, "用户登录");
        Ok(LoginResponse {
            user: UserDto::from(&user),
            tokens,
        })
    }

    /// 使用刷新令牌轮换令牌对，任何失败都视为凭证无效
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenDto, ApplicationError> {
        let user = self.user_for_refresh(refresh_token).await.map_err(|err| {
            tracing::debug!(error = %err, "刷新令牌失败");
            ApplicationError::InvalidCredentials
        })?;
        self.generate_tokens(&user)
    }

    pub async fn edit_username(
        &self,
        id: UserId,
        username: &str,
    ) -> Result<UserDto, ApplicationError> {
        let username = Username::parse(username)?;
        let user = self
            .deps
            .user_repository
            .update(id, UserUpdate::username(username))
            .await
            .map_err(|err| self.map_missing(err, id))?;
        Ok(UserDto::from(&user))
    }

    pub async fn delete_user(&self, id: UserId) -> Result<(), ApplicationError> {
        self.deps
            .user_repository
            .delete(id)
            .await
            .map_err(|err| self.map_missing(err, id))?;
        tracing::info!(user_id = %id, "用户已删除");
        Ok(())
    }

    pub async fn find_user(&self, id: UserId) -> Result<UserDto, ApplicationError> {
        self.deps
            .user_repository
            .find_by_id(id)
            .await?
            .map(|user| UserDto::from(&user))
            .ok_or_else(|| ApplicationError::not_found("user", id))
    }

    /// 按用户名或邮箱子串联想用户，排除请求者本人；空查询返回空列表
    pub async fn suggest_users(
        &self,
        query: &str,
        current_user_id: UserId,
    ) -> Result<Vec<UserDto>, ApplicationError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let mut users = self
            .deps
            .user_repository
            .search(query, current_user_id)
            .await?;
        users.sort_by_key(|user| user.id);
        users.dedup_by_key(|user| user.id);
        Ok(users.iter().map(UserDto::from).collect())
    }

    pub async fn get_all_users(&self) -> Result<Vec<UserDto>, ApplicationError> {
        let mut users = self.deps.user_repository.list_all().await?;
        users.sort_by_key(|user| user.id);
        Ok(users.iter().map(UserDto::from).collect())
    }

    pub fn generate_tokens(&self, user: &User) -> Result<TokenDto, ApplicationError> {
        let claims = TokenSubjectClaims::from(user);
        let subject = user.email.as_str();
        let access = self
            .deps
            .token_service
            .issue(TokenType::Access, subject, claims)?;
        let refresh = self
            .deps
            .token_service
            .issue(TokenType::Refresh, subject, claims)?;

        Ok(TokenDto {
            access_token: access.token,
            access_token_expiration: access.expires_at,
            refresh_token: refresh.token,
            refresh_token_expiration: refresh.expires_at,
        })
    }

    async fn user_for_refresh(&self, refresh_token: &str) -> Result<User, ApplicationError> {
        let claims = self
            .deps
            .token_service
            .verify_token(refresh_token, TokenType::Refresh)?;
        let email = UserEmail::parse(claims.sub)?;
        self.deps
            .user_repository
            .find_by_email(&email)
            .await?
            .ok_or_else(|| ApplicationError::not_found("user", &email))
    }

    fn spawn_greeting(&self, email: UserEmail) {
        let mailer = Arc::clone(&self.deps.mailer);
        tokio::spawn(async move {
            if let Err(err) = mailer.send_greeting(email.clone()).await {
                tracing::warn!(email = %email, error = %err, "欢迎邮件发送失败");
            }
        });
    }

    fn map_missing(&self, err: RepositoryError, id: UserId) -> ApplicationError {
        match err {
            RepositoryError::NotFound => ApplicationError::not_found("user", id),
            other => ApplicationError::from(other),
        }
    }
}
