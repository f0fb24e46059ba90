use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::error::AppError;
use crate::models::event::Channel;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    pub channel: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let channel: Channel = query.channel.parse().map_err(AppError::Validation)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, channel)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, channel: Channel) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(state.bus.subscribe(channel));

    info!(channel = %channel, "websocket client connected");

    let send_task = tokio::spawn(async move {
        while let Some(next) = events.next().await {
            let envelope = match next {
                Ok(envelope) => envelope,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(channel = %channel, skipped, "websocket client lagged; events dropped");
                    continue;
                }
            };

            let json = match serde_json::to_string(&envelope) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize envelope for ws");
                    continue;
                }
            };

            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!(channel = %channel, "websocket client disconnected");
}
