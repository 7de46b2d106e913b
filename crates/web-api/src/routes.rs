use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use validator::Validate;

use application::{
    ConfirmEmailRequest, LoginRequest, LoginResponse, RegisterUserRequest, TokenDto, UserDto,
};
use domain::UserId;

use crate::{
    auth::{AdminUser, AuthenticatedUser},
    error::ApiError,
    extract::{ApiPath, ApiQuery, ValidatedJson},
    state::AppState,
    websocket,
};

/// 刷新令牌通过该请求头传递
pub const REFRESH_TOKEN_HEADER: &str = "refresh-token";

#[derive(Debug, Deserialize, Validate)]
struct RegisterPayload {
    #[validate(email)]
    email: String,
    #[validate(length(min = 1, max = 50))]
    username: String,
    #[validate(length(min = 1, max = 72))]
    password: String,
}

#[derive(Debug, Deserialize, Validate)]
struct ConfirmEmailPayload {
    #[validate(email)]
    email: String,
    #[validate(range(min = 100_000, max = 999_999))]
    otp: u32,
}

#[derive(Debug, Deserialize, Validate)]
struct LoginPayload {
    #[validate(length(min = 1))]
    email: String,
    #[validate(length(min = 1))]
    password: String,
}

#[derive(Debug, Deserialize)]
struct EditUsernameQuery {
    username: String,
}

#[derive(Debug, Deserialize)]
struct SuggestQuery {
    #[serde(default)]
    query: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/user", user_routes())
        .route("/ws", get(websocket::upgrade))
}

fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/confirm-email", post(confirm_email))
        .route("/login", post(login))
        .route("/refresh-token", post(refresh_token))
        .route("/admin/all", get(all_users))
        .route("/suggest", get(suggest_users))
        .route("/online", get(online_users))
        .route("/clear-session/{id}", delete(clear_session))
        .route(
            "/{id}",
            get(find_user).patch(edit_username).delete(delete_user),
        )
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn register(
    State(state): State<AppState>,
    ValidatedJson(payload): ValidatedJson<RegisterPayload>,
) -> Result<(StatusCode, Json<UserDto>), ApiError> {
    let dto = state
        .credential_service
        .register(RegisterUserRequest {
            email: payload.email,
            username: payload.username,
            password: payload.password,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(dto)))
}

async fn confirm_email(
    State(state): State<AppState>,
    ValidatedJson(payload): ValidatedJson<ConfirmEmailPayload>,
) -> Result<Json<TokenDto>, ApiError> {
    let tokens = state
        .credential_service
        .confirm_email(ConfirmEmailRequest {
            email: payload.email,
            otp: payload.otp,
        })
        .await?;

    Ok(Json(tokens))
}

async fn login(
    State(state): State<AppState>,
    ValidatedJson(payload): ValidatedJson<LoginPayload>,
) -> Result<Json<LoginResponse>, ApiError> {
    let response = state
        .credential_service
        .login(LoginRequest {
            email: payload.email,
            password: payload.password,
        })
        .await?;

    Ok(Json(response))
}

async fn refresh_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TokenDto>, ApiError> {
    let token = headers
        .get(REFRESH_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing refresh-token header"))?;

    let tokens = state.credential_service.refresh_token(token).await?;
    Ok(Json(tokens))
}

async fn all_users(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<Vec<UserDto>>, ApiError> {
    Ok(Json(state.credential_service.get_all_users().await?))
}

async fn find_user(
    State(state): State<AppState>,
    _caller: AuthenticatedUser,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<UserDto>, ApiError> {
    Ok(Json(state.credential_service.find_user(UserId(id)).await?))
}

async fn edit_username(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    ApiPath(id): ApiPath<i64>,
    ApiQuery(query): ApiQuery<EditUsernameQuery>,
) -> Result<Json<UserDto>, ApiError> {
    let id = UserId(id);
    caller.ensure_self_or_admin(id)?;
    let dto = state
        .credential_service
        .edit_username(id, &query.username)
        .await?;
    Ok(Json(dto))
}

async fn delete_user(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    ApiPath(id): ApiPath<i64>,
) -> Result<StatusCode, ApiError> {
    let id = UserId(id);
    caller.ensure_self_or_admin(id)?;
    state.credential_service.delete_user(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn suggest_users(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    ApiQuery(query): ApiQuery<SuggestQuery>,
) -> Result<Json<Vec<UserDto>>, ApiError> {
    let users = state
        .credential_service
        .suggest_users(&query.query, caller.user_id())
        .await?;
    Ok(Json(users))
}

async fn online_users(
    State(state): State<AppState>,
    _caller: AuthenticatedUser,
) -> Result<Json<Vec<UserId>>, ApiError> {
    Ok(Json(state.gateway.online_users().await?))
}

/// 强制下线：关闭该用户的全部实时连接并广播在线列表
async fn clear_session(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    ApiPath(id): ApiPath<i64>,
) -> Result<StatusCode, ApiError> {
    let id = UserId(id);
    caller.ensure_self_or_admin(id)?;
    let dropped = state.gateway.clear_user_socket(id).await;
    tracing::info!(user_id = %id, caller = %caller.user_id(), dropped, "会话已清除");
    Ok(StatusCode::NO_CONTENT)
}
