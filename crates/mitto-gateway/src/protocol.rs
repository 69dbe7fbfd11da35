//! Wire types for the per-session WebSocket and the lifecycle event feed.
//!
//! Both sides speak tagged JSON objects (`{"type": ..., ...fields}`), the
//! same shape the runtime already uses for [`mitto_runtime::ServerEvent`]
//! so a message can be built directly from a runtime value without an
//! intermediate untagged representation.

use mitto_runtime::{ActionButton, RunningStatus};
use mitto_store::Event;
use serde::{Deserialize, Serialize};

/// Something a browser client sends over `/ws/{session_id}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Prompt {
        message: String,
        #[serde(default)]
        image_ids: Vec<String>,
        prompt_id: String,
    },
    Cancel {},
    PermissionAnswer {
        request_id: String,
        option_id: String,
        #[serde(default)]
        cancel: bool,
    },
    LoadEvents {
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        before_seq: Option<i64>,
        #[serde(default)]
        after_seq: Option<i64>,
    },
    Keepalive {
        client_time: i64,
        #[serde(default)]
        last_seen_seq: i64,
    },
    RenameSession {
        name: String,
    },
}

/// Something the gateway sends back over `/ws/{session_id}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        session_id: String,
        client_id: String,
        acp_server: String,
        is_running: bool,
        is_prompting: bool,
        last_user_prompt_id: Option<String>,
        last_user_prompt_seq: Option<i64>,
    },
    /// Durability ack: the prompt was accepted (queued or started), not
    /// that the agent has produced a reply yet.
    PromptReceived {
        prompt_id: String,
    },
    UserPrompt {
        seq: i64,
        sender_id: String,
        prompt_id: String,
        message: String,
        is_mine: bool,
    },
    AgentMessage {
        seq: i64,
        html: String,
        is_prompting: bool,
    },
    AgentThought {
        seq: i64,
        text: String,
        is_prompting: bool,
    },
    ToolCall {
        seq: i64,
        id: String,
        title: String,
        status: String,
        is_prompting: bool,
    },
    ToolUpdate {
        seq: i64,
        id: String,
        status: String,
        is_prompting: bool,
    },
    Permission {
        request_id: String,
        title: String,
        description: String,
        options: serde_json::Value,
    },
    PromptComplete {
        event_count: i64,
    },
    EventsLoaded {
        events: Vec<Event>,
        has_more: bool,
        first_seq: Option<i64>,
        last_seq: i64,
        total_count: usize,
        prepend: bool,
        is_prompting: bool,
    },
    KeepaliveAck {
        client_time: i64,
        server_time: i64,
        server_max_seq: i64,
        is_prompting: bool,
        is_running: bool,
        queue_length: usize,
        status: mitto_store::SessionStatus,
    },
    QueueUpdated {
        queue_length: usize,
        action: String,
        message_id: Option<String>,
    },
    QueueMessageSending,
    QueueMessageSent,
    QueueMessageTitled {
        message_id: String,
        title: String,
    },
    /// An empty `buttons` array means the previous suggestions were
    /// cleared, not that none were ever offered.
    ActionButtons {
        session_id: String,
        buttons: Vec<ActionButton>,
    },
    Error {
        message: String,
        code: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into(), code: None }
    }

    pub fn error_coded(message: impl Into<String>, code: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into(), code: Some(code.into()) }
    }
}

/// Converts a runtime status snapshot plus a `keepalive`'s echoed fields
/// into the ack the client uses to detect it has fallen behind.
pub fn keepalive_ack(client_time: i64, server_time: i64, status: &RunningStatus) -> ServerMessage {
    ServerMessage::KeepaliveAck {
        client_time,
        server_time,
        server_max_seq: status.last_seq,
        is_prompting: status.is_prompting,
        is_running: status.is_running,
        queue_length: status.queue_length,
        status: status.status,
    }
}
