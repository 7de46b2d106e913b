//! 主应用程序入口
//!
//! 加载配置、连接 Postgres 与 Redis，启动 Axum HTTP / WebSocket 服务。

use std::sync::Arc;

use application::{
    Clock, CredentialService, CredentialServiceDependencies, PresenceRegistry, RandomOtpGenerator,
    RealtimeGateway, SocketSessionBinding, SystemClock, TokenService,
};
use config::AppConfig;
use infrastructure::Infrastructure;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    // 初始化日志，RUST_LOG 优先于配置文件
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.filter.clone()));
    if config.log.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(config = %config.sanitize(), "配置加载完成");
    if config.uses_development_secret() {
        tracing::warn!("正在使用开发环境 JWT 密钥，请勿用于生产环境");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let shutdown = CancellationToken::new();

    let infra = Infrastructure::connect(&config, clock.clone(), shutdown.clone()).await?;

    let token_service = Arc::new(TokenService::from_config(&config.jwt, clock.clone()));

    let registry = Arc::new(PresenceRegistry::new(
        infra.presence_store_trait(),
        config.redis.presence_key.clone(),
        config.presence.failure_alert_threshold,
    ));
    let binding = Arc::new(SocketSessionBinding::new(
        registry,
        infra.broadcaster.clone(),
    ));
    let gateway = Arc::new(RealtimeGateway::new(
        token_service.clone(),
        binding,
        infra.broadcaster.clone(),
    ));

    let credential_service = Arc::new(CredentialService::new(CredentialServiceDependencies {
        user_repository: infra.user_repository_trait(),
        password_hasher: infra.password_hasher_trait(),
        token_service: token_service.clone(),
        mailer: infra.mailer_trait(),
        otp_generator: Arc::new(RandomOtpGenerator),
        clock,
        otp_expiration: time::Duration::seconds(config.otp.expiration_seconds),
    }));

    let state = AppState::new(credential_service, token_service, gateway);
    let app = router(state);

    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!("服务启动在 http://{}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    tracing::info!("服务已停止");
    Ok(())
}

/// 收到 Ctrl+C 后停止接收请求，并通知后台任务退出
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "无法监听退出信号");
    }
    tracing::info!("收到退出信号，开始优雅停机");
    shutdown.cancel();
}
