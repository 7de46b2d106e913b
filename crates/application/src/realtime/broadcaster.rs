use async_trait::async_trait;
use domain::UserId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// 在线用户列表变化时推送的事件名
pub const ONLINE_USERS_EVENT: &str = "getOnlineUsers";

/// 推送给所有实时连接的事件，线上格式 `{ "event": ..., "payload": ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub event: String,
    pub payload: serde_json::Value,
}

impl RealtimeEvent {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    pub fn online_users(users: &[UserId]) -> Self {
        let ids: Vec<i64> = users.iter().map(|id| id.value()).collect();
        Self::new(ONLINE_USERS_EVENT, serde_json::json!(ids))
    }
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcast failed: {0}")]
    Failed(String),
}

impl BroadcastError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[async_trait]
pub trait RealtimeBroadcaster: Send + Sync {
    async fn broadcast(&self, event: RealtimeEvent) -> Result<(), BroadcastError>;

    /// 订阅本进程内的事件流
    fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent>;
}

/// 单进程广播，基于 `tokio::sync::broadcast`
#[derive(Clone)]
pub struct LocalRealtimeBroadcaster {
    sender: broadcast::Sender<RealtimeEvent>,
}

impl LocalRealtimeBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 投递到本进程订阅者，返回收到事件的订阅者数量
    pub fn publish_local(&self, event: RealtimeEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                // 当前没有连接
                tracing::trace!("no realtime subscribers, event dropped");
                0
            }
        }
    }
}

impl Default for LocalRealtimeBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl RealtimeBroadcaster for LocalRealtimeBroadcaster {
    async fn broadcast(&self, event: RealtimeEvent) -> Result<(), BroadcastError> {
        self.publish_local(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.sender.subscribe()
    }
}
