use crate::api::rest::AppState;
use crate::db::models::{ViolationFilter, ViolationView};
use crate::db::repositories::ViolationStore;
use crate::messaging::TOPIC_ALL;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};

/// Largest page a client may request over the live channel
const MAX_LIVE_LIMIT: i64 = 100;

/// Messages pushed to live subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    NewViolation {
        violation: ViolationView,
    },
    RecentViolations {
        camera_id: String,
        violations: Vec<ViolationView>,
    },
    ViolationList {
        camera_id: String,
        violations: Vec<ViolationView>,
    },
    Error {
        message: String,
    },
}

/// Commands accepted from live subscribers
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    GetViolations {
        /// Camera id or "all"; defaults to the connection's topic
        #[serde(default, alias = "cameraId", alias = "source_id")]
        camera_id: Option<String>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        limit: Option<i64>,
    },
}

/// Newest records for `topic`, as sent right after connecting
pub async fn recent_snapshot(store: &dyn ViolationStore, topic: &str, limit: i64) -> ServerMessage {
    let filter = ViolationFilter::for_topic(topic, None, limit.clamp(1, MAX_LIVE_LIMIT));
    match store.query(&filter).await {
        Ok(records) => ServerMessage::RecentViolations {
            camera_id: topic.to_string(),
            violations: records.iter().map(|r| r.to_view()).collect(),
        },
        Err(e) => {
            error!("Failed to load recent violations for {}: {}", topic, e);
            ServerMessage::Error {
                message: "Failed to load recent violations".to_string(),
            }
        }
    }
}

/// Answer one client command. Bad input produces an `error` message rather
/// than closing the connection.
pub async fn handle_command(
    text: &str,
    topic: &str,
    store: &dyn ViolationStore,
    default_limit: i64,
) -> ServerMessage {
    let command = match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => command,
        Err(e) => {
            debug!("Unparseable live command {:?}: {}", text, e);
            return ServerMessage::Error {
                message: format!("Invalid command: {}", e),
            };
        }
    };

    match command {
        ClientCommand::GetViolations {
            camera_id,
            status,
            limit,
        } => {
            let camera_id = camera_id
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| topic.to_string());
            let limit = limit.unwrap_or(default_limit).clamp(1, MAX_LIVE_LIMIT);
            let filter = ViolationFilter::for_topic(&camera_id, status, limit);

            match store.query(&filter).await {
                Ok(records) => ServerMessage::ViolationList {
                    camera_id,
                    violations: records.iter().map(|r| r.to_view()).collect(),
                },
                Err(e) => {
                    error!("Live query for {} failed: {}", camera_id, e);
                    ServerMessage::Error {
                        message: "Failed to query violations".to_string(),
                    }
                }
            }
        }
    }
}

pub async fn ws_all_violations(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, TOPIC_ALL.to_string()))
}

pub async fn ws_camera_violations(
    ws: WebSocketUpgrade,
    Path(camera_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, camera_id))
}

async fn send(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> bool {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode live message: {}", e);
            return true;
        }
    };

    match sender.send(Message::Text(text)).await {
        Ok(()) => true,
        Err(e) => {
            debug!("Live subscriber send failed: {}", e);
            false
        }
    }
}

// Handle one live subscriber until it disconnects
async fn handle_socket(socket: WebSocket, state: AppState, topic: String) {
    // Subscribe before loading the snapshot so no insert falls in between
    let mut subscription = state.hub.subscribe(topic.clone());
    let (mut sender, mut receiver) = socket.split();
    info!(
        "Live subscriber connected on '{}' ({} total)",
        topic,
        state.hub.subscriber_count()
    );

    let snapshot =
        recent_snapshot(state.store.as_ref(), &topic, state.live.recent_snapshot_size).await;
    if !send(&mut sender, &snapshot).await {
        return;
    }

    loop {
        tokio::select! {
            pushed = subscription.next() => {
                let Some(violation) = pushed else { break };
                if !send(&mut sender, &ServerMessage::NewViolation { violation }).await {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_command(
                            &text,
                            &topic,
                            state.store.as_ref(),
                            state.live.default_list_limit,
                        )
                        .await;
                        if !send(&mut sender, &reply).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(ping))) => {
                        if sender.send(Message::Pong(ping)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Live subscriber receive failed: {}", e);
                        break;
                    }
                }
            }
        }
    }

    info!("Live subscriber on '{}' disconnected", topic);
}
