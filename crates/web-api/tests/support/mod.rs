#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use application::{
    presence::memory::MemoryPresenceStore, repository::memory::MemoryUserRepository, Clock,
    CredentialService, CredentialServiceDependencies, FixedOtpGenerator, LocalRealtimeBroadcaster,
    PresenceRegistry, RealtimeBroadcaster, RealtimeGateway, SocketSessionBinding, SystemClock,
    TokenService, TokenSettings, UserRepository, DEFAULT_PRESENCE_KEY,
};
use domain::{OneTimeCode, UserEmail, UserRole, UserUpdate};
use infrastructure::{BcryptPasswordHasher, LoggingMailer};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::oneshot, time::sleep};
use web_api::{router, AppState};

pub const TEST_OTP: u32 = 123_456;
pub const PASSWORD: &str = "secret-password";

pub struct TestServer {
    pub base_http: String,
    pub base_ws: String,
    pub client: Client,
    pub users: Arc<MemoryUserRepository>,
    pub presence: Arc<MemoryPresenceStore>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub struct LoggedIn {
    pub id: i64,
    pub access_token: String,
    pub refresh_token: String,
}

pub async fn spawn_server() -> TestServer {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let users = Arc::new(MemoryUserRepository::new());
    let presence = Arc::new(MemoryPresenceStore::new());

    let token_service = Arc::new(TokenService::new(
        TokenSettings {
            secret: "integration-test-secret".to_string(),
            access_ttl: time::Duration::minutes(15),
            refresh_ttl: time::Duration::days(7),
        },
        clock.clone(),
    ));

    let credential_service = Arc::new(CredentialService::new(CredentialServiceDependencies {
        user_repository: users.clone(),
        password_hasher: Arc::new(BcryptPasswordHasher::new(Some(4))),
        token_service: token_service.clone(),
        mailer: Arc::new(LoggingMailer::new(clock.clone())),
        otp_generator: Arc::new(FixedOtpGenerator(
            OneTimeCode::new(TEST_OTP).expect("valid otp"),
        )),
        clock,
        otp_expiration: time::Duration::seconds(180),
    }));

    let registry = Arc::new(PresenceRegistry::new(presence.clone(), DEFAULT_PRESENCE_KEY, 3));
    let broadcaster: Arc<dyn RealtimeBroadcaster> = Arc::new(LocalRealtimeBroadcaster::new(64));
    let binding = Arc::new(SocketSessionBinding::new(registry, broadcaster.clone()));
    let gateway = Arc::new(RealtimeGateway::new(
        token_service.clone(),
        binding,
        broadcaster,
    ));

    let state = AppState::new(credential_service, token_service, gateway);
    let app = router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr: SocketAddr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });

    // 等待服务器启动
    sleep(Duration::from_millis(50)).await;

    TestServer {
        base_http: format!("http://{addr}/api/v1"),
        base_ws: format!("ws://{addr}/api/v1/ws"),
        client: Client::new(),
        users,
        presence,
        shutdown: Some(shutdown_tx),
    }
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_http, path)
    }

    pub fn ws_url(&self, token: &str) -> String {
        format!("{}?token={}", self.base_ws, token)
    }

    pub async fn register(&self, email: &str, username: &str) -> Value {
        let response = self
            .client
            .post(self.url("/user/register"))
            .json(&json!({ "email": email, "username": username, "password": PASSWORD }))
            .send()
            .await
            .expect("register request");
        assert_eq!(response.status(), StatusCode::CREATED);
        response.json().await.expect("register json")
    }

    pub async fn confirm(&self, email: &str) -> Value {
        let response = self
            .client
            .post(self.url("/user/confirm-email"))
            .json(&json!({ "email": email, "otp": TEST_OTP }))
            .send()
            .await
            .expect("confirm request");
        assert_eq!(response.status(), StatusCode::OK);
        response.json().await.expect("confirm json")
    }

    pub async fn login(&self, email: &str) -> LoggedIn {
        let response = self
            .client
            .post(self.url("/user/login"))
            .json(&json!({ "email": email, "password": PASSWORD }))
            .send()
            .await
            .expect("login request");
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.expect("login json");
        LoggedIn {
            id: body["user"]["id"].as_i64().expect("user id"),
            access_token: body["tokens"]["accessToken"]
                .as_str()
                .expect("access token")
                .to_string(),
            refresh_token: body["tokens"]["refreshToken"]
                .as_str()
                .expect("refresh token")
                .to_string(),
        }
    }

    /// 注册、验证并登录
    pub async fn verified_user(&self, email: &str, username: &str) -> LoggedIn {
        self.register(email, username).await;
        self.confirm(email).await;
        self.login(email).await
    }

    /// 直接在存储中提升为管理员，需重新登录才能拿到带角色的令牌
    pub async fn promote_to_admin(&self, email: &str) {
        let email = UserEmail::parse(email).expect("email");
        let user = self
            .users
            .find_by_email(&email)
            .await
            .expect("lookup")
            .expect("user exists");
        self.users
            .update(
                user.id,
                UserUpdate {
                    role: Some(UserRole::Admin),
                    ..UserUpdate::default()
                },
            )
            .await
            .expect("promote");
    }
}
