use std::sync::Arc;

use domain::{Claims, ConnectionId, TokenType, UserId};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::broadcaster::{RealtimeBroadcaster, RealtimeEvent};
use super::session::SocketSessionBinding;
use crate::error::ApplicationError;
use crate::token::TokenService;

/// 握手成功后的连接上下文，交给传输层驱动
pub struct AcceptedConnection {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub events: broadcast::Receiver<RealtimeEvent>,
    /// 用户会话被清除时触发
    pub cancellation: CancellationToken,
}

/// 实时网关：鉴权、绑定与广播的入口，与具体传输协议无关
pub struct RealtimeGateway {
    token_service: Arc<TokenService>,
    binding: Arc<SocketSessionBinding>,
    broadcaster: Arc<dyn RealtimeBroadcaster>,
}

impl RealtimeGateway {
    pub fn new(
        token_service: Arc<TokenService>,
        binding: Arc<SocketSessionBinding>,
        broadcaster: Arc<dyn RealtimeBroadcaster>,
    ) -> Self {
        Self {
            token_service,
            binding,
            broadcaster,
        }
    }

    pub fn binding(&self) -> &Arc<SocketSessionBinding> {
        &self.binding
    }

    /// 只接受访问令牌
    pub fn authenticate(&self, token: &str) -> Result<Claims, ApplicationError> {
        Ok(self.token_service.verify_token(token, TokenType::Access)?)
    }

    pub async fn accept(&self, token: &str) -> Result<AcceptedConnection, ApplicationError> {
        let claims = self.authenticate(token)?;
        // 先订阅再绑定，新连接也能收到自己的上线广播
        let events = self.broadcaster.subscribe();
        let connection_id = ConnectionId::generate();
        let cancellation = self
            .binding
            .bind_connection(claims.user_id(), connection_id)
            .await;

        Ok(AcceptedConnection {
            connection_id,
            user_id: claims.user_id(),
            events,
            cancellation,
        })
    }

    pub async fn disconnect(&self, connection_id: ConnectionId) {
        self.binding.unbind_connection(connection_id).await;
    }

    pub async fn broadcast(
        &self,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), ApplicationError> {
        self.broadcaster
            .broadcast(RealtimeEvent::new(event, payload))
            .await?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.broadcaster.subscribe()
    }

    pub async fn clear_user_socket(&self, user_id: UserId) -> usize {
        self.binding.clear_user_socket(user_id).await
    }

    pub async fn online_users(&self) -> Result<Vec<UserId>, ApplicationError> {
        Ok(self.binding.registry().get_all_online_users().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::presence::{memory::MemoryPresenceStore, PresenceRegistry, DEFAULT_PRESENCE_KEY};
    use crate::realtime::broadcaster::{LocalRealtimeBroadcaster, ONLINE_USERS_EVENT};
    use crate::token::TokenSettings;
    use domain::{TokenSubjectClaims, UserRole};
    use time::{macros::datetime, Duration};

    fn gateway() -> (RealtimeGateway, Arc<TokenService>) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-01-01 00:00 UTC)));
        let tokens = Arc::new(TokenService::new(
            TokenSettings {
                secret: "gateway-test-secret-long-enough!!".into(),
                access_ttl: Duration::minutes(15),
                refresh_ttl: Duration::days(7),
            },
            clock,
        ));
        let registry = Arc::new(PresenceRegistry::new(
            Arc::new(MemoryPresenceStore::new()),
            DEFAULT_PRESENCE_KEY,
            5,
        ));
        let broadcaster: Arc<dyn RealtimeBroadcaster> = Arc::new(LocalRealtimeBroadcaster::new(16));
        let binding = Arc::new(SocketSessionBinding::new(registry, broadcaster.clone()));
        (
            RealtimeGateway::new(tokens.clone(), binding, broadcaster),
            tokens,
        )
    }

    fn token(tokens: &TokenService, token_type: TokenType) -> String {
        tokens
            .generate_token(
                token_type,
                "a@x.com",
                TokenSubjectClaims {
                    id: UserId(7),
                    role: Some(UserRole::User),
                },
            )
            .unwrap()
    }

    #[tokio::test]
    async fn accepted_connection_sees_its_own_presence_broadcast() {
        let (gateway, tokens) = gateway();
        let mut accepted = gateway.accept(&token(&tokens, TokenType::Access)).await.unwrap();

        assert_eq!(accepted.user_id, UserId(7));
        let event = accepted.events.recv().await.unwrap();
        assert_eq!(event.event, ONLINE_USERS_EVENT);
        assert_eq!(event.payload, serde_json::json!([7]));
        assert_eq!(gateway.online_users().await.unwrap(), vec![UserId(7)]);
    }

    #[tokio::test]
    async fn refresh_token_cannot_open_a_connection() {
        let (gateway, tokens) = gateway();
        let err = gateway
            .accept(&token(&tokens, TokenType::Refresh))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ApplicationError::InvalidToken));
        assert_eq!(gateway.binding().connection_count().await, 0);
    }

    #[tokio::test]
    async fn disconnect_takes_user_offline() {
        let (gateway, tokens) = gateway();
        let accepted = gateway.accept(&token(&tokens, TokenType::Access)).await.unwrap();
        gateway.disconnect(accepted.connection_id).await;
        assert!(gateway.online_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn custom_events_reach_subscribers() {
        let (gateway, _) = gateway();
        let mut events = gateway.subscribe();
        gateway
            .broadcast("newMessage", serde_json::json!({ "chatId": 1 }))
            .await
            .unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.event, "newMessage");
        assert_eq!(event.payload["chatId"], 1);
    }
}
