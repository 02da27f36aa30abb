//! WebSocket handling

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use voicedock_protocol::{ClientMessage, ErrorKind, ServerMessage};

use crate::state::AppState;
use crate::transport::{ClientAddress, OutboundMessage};
use crate::validation::validate_stop_request;

const OUTBOUND_CAPACITY: usize = 100;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Channel for sending messages to this client
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_CAPACITY);
    let client = state.hub.connect(outbound_tx.clone());
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        client = %client,
        connections = state.hub.len(),
        "WebSocket connection opened"
    );

    // Spawn task to forward messages to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            client = %client,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    client = %client,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    send_json(&outbound_tx, welcome(&state, client)).await;

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    client = %client,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    client = %client,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    client = %client,
                    error = %e,
                    payload_bytes = msg.len(),
                    payload_preview = %truncate_for_log(&msg, 240),
                    "Failed to parse client message"
                );
                send_json(
                    &outbound_tx,
                    ServerMessage::Error {
                        kind: ErrorKind::ParseError,
                        detail: e.to_string().into(),
                        channel_name: None,
                    },
                )
                .await;
                continue;
            }
        };

        handle_client_message(client_msg, &outbound_tx, &state, client).await;
    }

    state.hub.disconnect(client);
    let stopped = if state.stop_on_disconnect {
        state.orchestrator.stop_client_sessions(client)
    } else {
        0
    };
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        client = %client,
        stopped_sessions = stopped,
        "WebSocket connection closed"
    );
    send_task.abort();
}

fn welcome(state: &AppState, client: ClientAddress) -> ServerMessage {
    let credentials = match state.welcome_credentials() {
        Some(Ok(credentials)) => Some(credentials),
        Some(Err(e)) => {
            error!(
                component = "websocket",
                event = "ws.welcome.credentials_failed",
                client = %client,
                error = %e,
                "Failed to issue channel credentials"
            );
            None
        }
        None => None,
    };
    ServerMessage::Welcome {
        message: "Hello world".to_string(),
        credentials,
    }
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Send a ServerMessage through the outbound channel
async fn send_json(tx: &mpsc::Sender<OutboundMessage>, msg: ServerMessage) {
    let _ = tx.send(OutboundMessage::Json(msg)).await;
}

async fn handle_client_message(
    msg: ClientMessage,
    client_tx: &mpsc::Sender<OutboundMessage>,
    state: &AppState,
    client: ClientAddress,
) {
    debug!(
        component = "websocket",
        event = "ws.message.received",
        client = %client,
        message_type = msg.event_name(),
        "Received client message"
    );

    match msg {
        ClientMessage::StartAgent { payload } => {
            // agent_started arrives through the session's delivery loop.
            if let Err(e) = state.orchestrator.start_session(client, &payload) {
                send_json(client_tx, e.to_server_message()).await;
            }
        }

        ClientMessage::StopAgent { payload } => {
            let result = validate_stop_request(&payload).and_then(|request| {
                state
                    .orchestrator
                    .stop_session(&request.channel_name)
                    .map(|()| request.channel_name)
            });
            let reply = match result {
                Ok(channel_name) => ServerMessage::AgentStopped {
                    message: format!("Agent in channel {channel_name} stopped."),
                    channel_name,
                },
                Err(e) => e.to_server_message(),
            };
            send_json(client_tx, reply).await;
        }

        ClientMessage::Ping => {
            send_json(client_tx, ServerMessage::Pong).await;
        }
    }
}
