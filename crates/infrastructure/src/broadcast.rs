//! 跨实例广播
//!
//! 事件发布到 Redis 频道，各实例的订阅循环收到后再投递给本地连接。
//! 订阅在线时发布者自身也通过订阅收到事件，本地不再重复投递；
//! 发布失败或订阅处于重连间隙时直接投递给本地连接。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use application::{BroadcastError, LocalRealtimeBroadcaster, RealtimeBroadcaster, RealtimeEvent};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

pub struct RedisBroadcastRelay {
    publisher: ConnectionManager,
    channel: String,
    local: LocalRealtimeBroadcaster,
    subscribed: Arc<AtomicBool>,
}

impl RedisBroadcastRelay {
    /// 建立发布连接并启动后台订阅循环，`shutdown` 触发后订阅循环退出
    pub async fn connect(
        redis_url: &str,
        channel: impl Into<String>,
        local: LocalRealtimeBroadcaster,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, redis::RedisError> {
        let client = Client::open(redis_url)?;
        let publisher = client.get_connection_manager().await?;
        let channel = channel.into();
        let subscribed = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_subscription_loop(
            client,
            channel.clone(),
            local.clone(),
            subscribed.clone(),
            shutdown,
        ));

        Ok(Arc::new(Self {
            publisher,
            channel,
            local,
            subscribed,
        }))
    }

    /// 订阅循环当前是否已完成 SUBSCRIBE
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }
}

/// 事件不会经由本实例的订阅回到本地时，需要直接投递
fn needs_local_delivery(published: bool, subscribed: bool) -> bool {
    !(published && subscribed)
}

#[async_trait]
impl RealtimeBroadcaster for RedisBroadcastRelay {
    async fn broadcast(&self, event: RealtimeEvent) -> Result<(), BroadcastError> {
        let encoded =
            serde_json::to_string(&event).map_err(|err| BroadcastError::failed(err.to_string()))?;

        let mut conn = self.publisher.clone();
        let published = match conn.publish::<_, _, ()>(&self.channel, encoded).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(channel = %self.channel, error = %err, "广播发布失败，降级为本地投递");
                false
            }
        };
        let subscribed = self.is_subscribed();
        if needs_local_delivery(published, subscribed) {
            if published {
                tracing::debug!(channel = %self.channel, "订阅重连中，事件直接投递给本地连接");
            }
            self.local.publish_local(event);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.local.subscribe()
    }
}

async fn run_subscription_loop(
    client: Client,
    channel: String,
    local: LocalRealtimeBroadcaster,
    subscribed: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let mut delay = INITIAL_RETRY_DELAY;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                subscribed.store(false, Ordering::Release);
                tracing::info!(channel = %channel, "广播订阅循环已停止");
                return;
            }
            result = listen(&client, &channel, &local, &subscribed) => {
                subscribed.store(false, Ordering::Release);
                match result {
                    Ok(()) => {
                        tracing::warn!(channel = %channel, "广播订阅连接已断开，准备重连");
                        delay = INITIAL_RETRY_DELAY;
                    }
                    Err(err) => {
                        tracing::warn!(
                            channel = %channel,
                            error = %err,
                            retry_delay_ms = delay.as_millis() as u64,
                            "广播订阅失败，稍后重试"
                        );
                    }
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(MAX_RETRY_DELAY);
    }
}

async fn listen(
    client: &Client,
    channel: &str,
    local: &LocalRealtimeBroadcaster,
    subscribed: &AtomicBool,
) -> redis::RedisResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    tracing::info!(channel = %channel, "已订阅广播频道");

    let mut messages = pubsub.on_message();
    subscribed.store(true, Ordering::Release);
    while let Some(message) = messages.next().await {
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "无法读取广播负载");
                continue;
            }
        };
        match decode_event(&payload) {
            Some(event) => {
                local.publish_local(event);
            }
            None => tracing::warn!(payload = %payload, "忽略无法解析的广播事件"),
        }
    }
    Ok(())
}

fn decode_event(payload: &str) -> Option<RealtimeEvent> {
    serde_json::from_str(payload).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_payload_matches_the_socket_frame() {
        let event = RealtimeEvent::new("getOnlineUsers", serde_json::json!([1, 7]));
        let encoded = serde_json::to_string(&event).unwrap();
        assert_eq!(decode_event(&encoded), Some(event));
        assert_eq!(decode_event("{\"event\":1}"), None);
    }

    #[test]
    fn events_reach_local_sockets_while_the_subscriber_is_down() {
        // 正常情况下由订阅投递，避免重复
        assert!(!needs_local_delivery(true, true));
        // 重连间隙
        assert!(needs_local_delivery(true, false));
        // 发布失败
        assert!(needs_local_delivery(false, true));
        assert!(needs_local_delivery(false, false));
    }
}
