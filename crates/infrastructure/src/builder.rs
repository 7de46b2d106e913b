use std::sync::Arc;

use application::{
    Clock, LocalRealtimeBroadcaster, Mailer, PasswordHasher, PresenceStore, RealtimeBroadcaster,
    UserRepository,
};
use config::AppConfig;
use sqlx::PgPool;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    broadcast::RedisBroadcastRelay,
    mail::LoggingMailer,
    migrations::MIGRATOR,
    password::BcryptPasswordHasher,
    presence_store::RedisPresenceStore,
    repository::{create_pg_pool, PgUserRepository},
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// 进程内共享的外部适配器
#[derive(Clone)]
pub struct Infrastructure {
    pub pool: PgPool,
    pub user_repository: Arc<PgUserRepository>,
    pub password_hasher: Arc<BcryptPasswordHasher>,
    pub presence_store: Arc<RedisPresenceStore>,
    pub mailer: Arc<LoggingMailer>,
    pub broadcaster: Arc<dyn RealtimeBroadcaster>,
}

impl Infrastructure {
    /// 连接 Postgres 与 Redis 并执行迁移；`shutdown` 用于停止广播订阅循环
    pub async fn connect(
        config: &AppConfig,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Result<Self, InfrastructureError> {
        let pool = create_pg_pool(&config.database.url, config.database.max_connections).await?;
        MIGRATOR.run(&pool).await?;
        tracing::info!("数据库迁移完成");

        let presence_store = Arc::new(RedisPresenceStore::connect(&config.redis.url).await?);

        let local = LocalRealtimeBroadcaster::new(config.realtime.broadcast_capacity);
        let broadcaster: Arc<dyn RealtimeBroadcaster> = if config.redis.relay_enabled {
            tracing::info!(channel = %config.redis.broadcast_channel, "启用 Redis 跨实例广播");
            let relay: Arc<dyn RealtimeBroadcaster> = RedisBroadcastRelay::connect(
                &config.redis.url,
                config.redis.broadcast_channel.clone(),
                local,
                shutdown,
            )
            .await?;
            relay
        } else {
            Arc::new(local)
        };

        Ok(Self {
            user_repository: Arc::new(PgUserRepository::new(pool.clone())),
            password_hasher: Arc::new(BcryptPasswordHasher::new(config.password.bcrypt_cost)),
            presence_store,
            mailer: Arc::new(LoggingMailer::new(clock)),
            broadcaster,
            pool,
        })
    }

    pub fn user_repository_trait(&self) -> Arc<dyn UserRepository> {
        self.user_repository.clone()
    }

    pub fn password_hasher_trait(&self) -> Arc<dyn PasswordHasher> {
        self.password_hasher.clone()
    }

    pub fn presence_store_trait(&self) -> Arc<dyn PresenceStore> {
        self.presence_store.clone()
    }

    pub fn mailer_trait(&self) -> Arc<dyn Mailer> {
        self.mailer.clone()
    }
}
