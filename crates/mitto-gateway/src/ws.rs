//! Per-session WebSocket bridge — translates a browser connection to the
//! session's [`RuntimeHandle`], one socket per session resolved from a
//! path segment instead of one shared global socket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use chrono::Utc;
use mitto_runtime::{Observer, ObserverError, RuntimeHandle, ServerEvent};
use mitto_store::SessionId;
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::{keepalive_ack, ClientMessage, ServerMessage};
use crate::{AppState, GatewayError};

pub async fn ws_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

/// Forwards events from a runtime to one socket's outgoing queue.
struct SocketObserver {
    tx: mpsc::Sender<ServerEvent>,
}

#[async_trait::async_trait]
impl Observer for SocketObserver {
    async fn send(&self, event: ServerEvent) -> Result<(), ObserverError> {
        self.tx.send(event).await.map_err(|_| ObserverError)
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState, session_id_raw: String) {
    let session_id = match SessionId::parse(session_id_raw) {
        Ok(id) => id,
        Err(e) => {
            send_err(&mut socket, GatewayError::Store(e)).await;
            return;
        }
    };

    let handle = match state.manager.get_or_resume(&session_id).await {
        Ok(h) => h,
        Err(e) => {
            send_err(&mut socket, GatewayError::Manager(e)).await;
            return;
        }
    };

    let meta = match state.store.read_metadata(&session_id).await {
        Ok(m) => m,
        Err(e) => {
            send_err(&mut socket, GatewayError::Store(e)).await;
            return;
        }
    };

    let client_id = uuid::Uuid::new_v4().to_string();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerEvent>(256);
    let observer: Arc<dyn Observer> = Arc::new(SocketObserver { tx: out_tx });
    let observer_handle = match handle.add_observer(observer, meta.last_seq).await {
        Ok(h) => h,
        Err(e) => {
            send_err(&mut socket, GatewayError::Runtime(e)).await;
            return;
        }
    };

    let status = handle.get_running_status().await.ok();
    send(
        &mut socket,
        &ServerMessage::Connected {
            session_id: session_id.to_string(),
            client_id: client_id.clone(),
            acp_server: meta.agent.clone(),
            is_running: status.as_ref().map_or(false, |s| s.is_running),
            is_prompting: status.as_ref().map_or(false, |s| s.is_prompting),
            last_user_prompt_id: None,
            last_user_prompt_seq: None,
        },
    )
    .await;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(cmd) => {
                                handle_client_message(&handle, &state, &session_id, &client_id, cmd, &mut socket).await;
                            }
                            Err(e) => {
                                send(&mut socket, &ServerMessage::error_coded(
                                    format!("invalid message: {e}"),
                                    "invalid_argument",
                                )).await;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("WebSocket recv error: {e}");
                        break;
                    }
                }
            }
            event = out_rx.recv() => {
                match event {
                    Some(ev) => {
                        let is_prompting = handle.get_running_status().await.map(|s| s.is_prompting).unwrap_or(false);
                        if let Some(msg) = to_server_message(ev, session_id.as_str(), &client_id, is_prompting) {
                            send(&mut socket, &msg).await;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    observer_handle.unregister().await;
    debug!(%session_id, "session socket closed");
}

async fn handle_client_message(
    handle: &RuntimeHandle,
    state: &AppState,
    session_id: &SessionId,
    client_id: &str,
    msg: ClientMessage,
    socket: &mut WebSocket,
) {
    match msg {
        ClientMessage::Prompt { message, image_ids, prompt_id } => {
            match handle.submit_prompt(message, image_ids, client_id.to_string(), prompt_id.clone()).await {
                Ok(_) => send(socket, &ServerMessage::PromptReceived { prompt_id }).await,
                Err(e) => send_err(socket, GatewayError::Runtime(e)).await,
            }
        }
        ClientMessage::Cancel {} => {
            if let Err(e) = handle.cancel().await {
                send_err(socket, GatewayError::Runtime(e)).await;
            }
        }
        ClientMessage::PermissionAnswer { request_id, option_id, cancel } => {
            let selection = if cancel { "cancelled".to_string() } else { option_id };
            if let Err(e) = handle.answer_permission(request_id, selection).await {
                send_err(socket, GatewayError::Runtime(e)).await;
            }
        }
        ClientMessage::LoadEvents { limit, before_seq, after_seq } => {
            match handle.load_events(limit.unwrap_or(50), before_seq, after_seq).await {
                Ok(res) => {
                    let is_prompting = handle.get_running_status().await.map(|s| s.is_prompting).unwrap_or(false);
                    send(
                        socket,
                        &ServerMessage::EventsLoaded {
                            events: res.events,
                            has_more: res.has_more,
                            first_seq: res.first_seq,
                            last_seq: res.last_seq,
                            total_count: res.total_count,
                            prepend: before_seq.is_some(),
                            is_prompting,
                        },
                    )
                    .await;
                }
                Err(e) => send_err(socket, GatewayError::Runtime(e)).await,
            }
        }
        ClientMessage::Keepalive { client_time, last_seen_seq: _ } => {
            match handle.get_running_status().await {
                Ok(status) => {
                    let ack = keepalive_ack(client_time, Utc::now().timestamp_millis(), &status);
                    send(socket, &ack).await;
                }
                Err(e) => send_err(socket, GatewayError::Runtime(e)).await,
            }
        }
        ClientMessage::RenameSession { name } => {
            if let Err(e) = state.manager.rename_session(session_id, name).await {
                send_err(socket, GatewayError::Manager(e)).await;
            }
        }
    }
}

/// `Plan` events are persisted but never pushed to the browser: the
/// message catalog this socket speaks has no `plan` variant, and an agent's
/// plan has no UI consumer yet. `EventsLoaded` never arrives this way
/// either — it is only ever produced directly from `load_events`, never
/// broadcast through the observer fan-out.
fn to_server_message(
    event: ServerEvent,
    session_id: &str,
    client_id: &str,
    is_prompting: bool,
) -> Option<ServerMessage> {
    match event {
        ServerEvent::UserPrompt { seq, sender_id, prompt_id, text, .. } => Some(ServerMessage::UserPrompt {
            seq,
            is_mine: sender_id == client_id,
            sender_id,
            prompt_id,
            message: text,
        }),
        ServerEvent::AgentMessage { seq, html } => Some(ServerMessage::AgentMessage { seq, html, is_prompting }),
        ServerEvent::AgentThought { seq, text } => Some(ServerMessage::AgentThought { seq, text, is_prompting }),
        ServerEvent::ToolCall { seq, id, title, status } => {
            Some(ServerMessage::ToolCall { seq, id, title, status, is_prompting })
        }
        ServerEvent::ToolCallUpdate { seq, id, status } => {
            Some(ServerMessage::ToolUpdate { seq, id, status, is_prompting })
        }
        ServerEvent::Plan { .. } => None,
        ServerEvent::Permission { request_id, title, options, .. } => Some(ServerMessage::Permission {
            request_id,
            title,
            description: String::new(),
            options,
        }),
        ServerEvent::Error { message, .. } => Some(ServerMessage::error(message)),
        ServerEvent::PromptComplete { event_count } => Some(ServerMessage::PromptComplete { event_count }),
        ServerEvent::ActionButtons { buttons } => {
            Some(ServerMessage::ActionButtons { session_id: session_id.to_string(), buttons })
        }
        ServerEvent::QueueUpdated { queue_length } => Some(ServerMessage::QueueUpdated {
            queue_length,
            action: "updated".to_string(),
            message_id: None,
        }),
        ServerEvent::QueueMessageTitled { message_id, title } => {
            Some(ServerMessage::QueueMessageTitled { message_id, title })
        }
        ServerEvent::EventsLoaded { .. } => None,
    }
}

async fn send(socket: &mut WebSocket, msg: &ServerMessage) {
    if let Ok(json) = serde_json::to_string(msg) {
        let _ = socket.send(Message::Text(json)).await;
    }
}

async fn send_err(socket: &mut WebSocket, err: GatewayError) {
    let msg = ServerMessage::error_coded(err.to_string(), err.code());
    send(socket, &msg).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_prompt_marks_is_mine_by_matching_sender() {
        let event = ServerEvent::UserPrompt {
            seq: 1,
            sender_id: "alice".to_string(),
            prompt_id: "p1".to_string(),
            text: "hi".to_string(),
            image_ids: vec![],
        };
        let msg = to_server_message(event, "s1", "alice", false).unwrap();
        assert!(matches!(msg, ServerMessage::UserPrompt { is_mine: true, .. }));

        let event = ServerEvent::UserPrompt {
            seq: 2,
            sender_id: "bob".to_string(),
            prompt_id: "p2".to_string(),
            text: "hi".to_string(),
            image_ids: vec![],
        };
        let msg = to_server_message(event, "s1", "alice", false).unwrap();
        assert!(matches!(msg, ServerMessage::UserPrompt { is_mine: false, .. }));
    }

    #[test]
    fn plan_and_events_loaded_are_not_forwarded_over_the_socket() {
        let plan = ServerEvent::Plan { seq: 1, steps: serde_json::json!([]) };
        assert!(to_server_message(plan, "s1", "alice", false).is_none());

        let loaded = ServerEvent::EventsLoaded {
            events: vec![],
            has_more: false,
            first_seq: None,
            last_seq: 0,
            total_count: 0,
            prepend: false,
        };
        assert!(to_server_message(loaded, "s1", "alice", false).is_none());
    }

    #[test]
    fn action_buttons_are_stamped_with_the_session_id() {
        let event = ServerEvent::ActionButtons { buttons: vec![] };
        let msg = to_server_message(event, "session-123", "alice", false).unwrap();
        match msg {
            ServerMessage::ActionButtons { session_id, .. } => assert_eq!(session_id, "session-123"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
