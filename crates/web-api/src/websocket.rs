//! WebSocket 传输
//!
//! 握手前校验访问令牌，握手后交给 [`RealtimeGateway`](application::RealtimeGateway)
//! 绑定连接，并把广播事件转发为 JSON 文本帧。

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast::error::RecvError, mpsc};

use application::AcceptedConnection;

use crate::{auth::bearer_token, error::ApiError, extract::ApiQuery, state::AppState};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// WebSocket 写操作命令
enum WsCommand {
    SendPong(Vec<u8>),
}

pub async fn upgrade(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let token = query
        .token
        .filter(|token| !token.is_empty())
        .or_else(|| bearer_token(&headers).map(str::to_owned))
        .ok_or_else(|| ApiError::unauthorized("missing access token"))?;

    // 令牌无效时直接返回 401，不升级连接
    state.gateway.authenticate(&token)?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, token)))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, token: String) {
    let accepted = match state.gateway.accept(&token).await {
        Ok(accepted) => accepted,
        Err(err) => {
            tracing::warn!(error = %err, "实时连接鉴权失败");
            let _ = socket
                .send(WsMessage::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: Utf8Bytes::from_static("unauthorized"),
                })))
                .await;
            return;
        }
    };

    let connection_id = accepted.connection_id;
    let user_id = accepted.user_id;
    tracing::info!(user_id = %user_id, connection_id = %connection_id, "WebSocket 连接已建立");

    run_connection(socket, accepted).await;

    state.gateway.disconnect(connection_id).await;
    tracing::info!(user_id = %user_id, connection_id = %connection_id, "WebSocket 连接已断开");
}

async fn run_connection(socket: WebSocket, accepted: AcceptedConnection) {
    let AcceptedConnection {
        connection_id,
        mut events,
        cancellation,
        ..
    } = accepted;
    let (mut sender, mut incoming) = socket.split();
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

    // 发送任务：所有写操作都在这里完成
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    tracing::info!(connection_id = %connection_id, "会话被清除，关闭连接");
                    let _ = sender
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: Utf8Bytes::from_static("session cleared"),
                        })))
                        .await;
                    break;
                }
                Some(cmd) = cmd_rx.recv() => {
                    match cmd {
                        WsCommand::SendPong(data) => {
                            if sender.send(WsMessage::Pong(data.into())).await.is_err() {
                                tracing::warn!("Failed to send pong message");
                                break;
                            }
                        }
                    }
                }
                event = events.recv() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(connection_id = %connection_id, skipped, "连接消费过慢，丢弃部分事件");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    };
                    let payload = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to serialize websocket payload");
                            continue;
                        }
                    };
                    if sender.send(WsMessage::Text(payload.into())).await.is_err() {
                        tracing::debug!(connection_id = %connection_id, "发送失败，连接已关闭");
                        break;
                    }
                }
            }
        }
    });

    // 接收任务：处理心跳与关闭
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = incoming.next().await {
            match message {
                WsMessage::Close(_) => break,
                WsMessage::Ping(data) => {
                    if cmd_tx.send(WsCommand::SendPong(data.to_vec())).await.is_err() {
                        break;
                    }
                }
                WsMessage::Pong(_) => {}
                WsMessage::Text(_) | WsMessage::Binary(_) => {
                    tracing::debug!("忽略客户端消息");
                }
            }
        }
    });

    // 任意一侧结束即视为连接断开
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}
