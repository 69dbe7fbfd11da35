//! Per-session state machine and observer fan-out.
//!
//! A [`Runtime`] owns one agent connection, one [`mitto_buffer::StreamBuffer`],
//! one [`mitto_queue::Queue`], and the set of clients currently watching the
//! session. Everything else in this workspace talks to a running session
//! only through the cheap-to-clone [`RuntimeHandle`] it hands back.

mod observer;
mod runtime;
mod state;

pub use mitto_acp::{AcpAdapter, AcpError};
pub use observer::{Observer, ObserverError};
pub use runtime::{Runtime, RuntimeConfig, RuntimeHandle};
pub use state::{RejectReason, RuntimeState, SubmitOutcome};

use serde::{Deserialize, Serialize};

/// Everything an observer can be sent. Tagged so a gateway can serialize
/// one straight onto a websocket frame without an intermediate mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    UserPrompt {
        seq: i64,
        sender_id: String,
        prompt_id: String,
        text: String,
        image_ids: Vec<String>,
    },
    AgentMessage {
        seq: i64,
        html: String,
    },
    AgentThought {
        seq: i64,
        text: String,
    },
    ToolCall {
        seq: i64,
        id: String,
        title: String,
        status: String,
    },
    ToolCallUpdate {
        seq: i64,
        id: String,
        status: String,
    },
    Plan {
        seq: i64,
        steps: serde_json::Value,
    },
    /// Not deduplicated against `last_sent_seq` even though it carries one:
    /// every registered client must see every permission request, since any
    /// one of them may be the one that answers it.
    Permission {
        seq: i64,
        request_id: String,
        title: String,
        options: serde_json::Value,
    },
    Error {
        seq: i64,
        message: String,
    },
    PromptComplete {
        event_count: i64,
    },
    ActionButtons {
        buttons: Vec<ActionButton>,
    },
    QueueUpdated {
        queue_length: usize,
    },
    QueueMessageTitled {
        message_id: String,
        title: String,
    },
    EventsLoaded {
        events: Vec<mitto_store::Event>,
        has_more: bool,
        first_seq: Option<i64>,
        last_seq: i64,
        total_count: usize,
        prepend: bool,
    },
}

impl ServerEvent {
    /// The sequence this event is stamped with, if any. Events without a
    /// `seq` (permissions, queue notices, action buttons) are never
    /// deduplicated and always reach every observer.
    pub fn seq(&self) -> Option<i64> {
        match self {
            ServerEvent::UserPrompt { seq, .. }
            | ServerEvent::AgentMessage { seq, .. }
            | ServerEvent::AgentThought { seq, .. }
            | ServerEvent::ToolCall { seq, .. }
            | ServerEvent::ToolCallUpdate { seq, .. }
            | ServerEvent::Plan { seq, .. }
            | ServerEvent::Error { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    /// Agent text/thought chunks of the same run share one `seq`; a later
    /// chunk at an already-sent `seq` is a continuation, not a repeat.
    pub fn is_coalescing(&self) -> bool {
        matches!(self, ServerEvent::AgentMessage { .. } | ServerEvent::AgentThought { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionButton {
    pub label: String,
    pub response: String,
}

impl ActionButton {
    const MAX_LABEL_LEN: usize = 80;

    /// Trims whitespace and caps the label length; returns `None` for a
    /// label or response that is empty once trimmed.
    pub fn new(label: impl Into<String>, response: impl Into<String>) -> Option<Self> {
        let mut label = label.into().trim().to_string();
        let response = response.into().trim().to_string();
        if label.is_empty() || response.is_empty() {
            return None;
        }
        if label.len() > Self::MAX_LABEL_LEN {
            label.truncate(Self::MAX_LABEL_LEN);
        }
        Some(Self { label, response })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunningStatus {
    pub is_running: bool,
    pub is_prompting: bool,
    pub last_seq: i64,
    pub queue_length: usize,
    pub status: mitto_store::SessionStatus,
}

#[derive(Debug, Clone)]
pub struct LoadEventsResult {
    pub events: Vec<mitto_store::Event>,
    pub has_more: bool,
    pub first_seq: Option<i64>,
    pub last_seq: i64,
    pub total_count: usize,
}

/// Generates up to a handful of quick-reply suggestions from the agent's
/// last message. Implemented by the caller against whatever auxiliary
/// agent session it wants to drive; this crate only knows how to call it
/// once per completed prompt and cache the result.
#[async_trait::async_trait]
pub trait SuggestionGenerator: Send + Sync {
    async fn suggest(&self, last_agent_message: &str) -> anyhow::Result<Vec<ActionButton>>;
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("message {0} not found")]
    MessageNotFound(String),
    #[error("permission request {0} not found")]
    PermissionNotFound(String),
    #[error("runtime is stopped")]
    Stopped,
    #[error(transparent)]
    Store(#[from] mitto_store::StoreError),
    #[error(transparent)]
    Queue(#[from] mitto_queue::QueueError),
    #[error(transparent)]
    Acp(#[from] mitto_acp::AcpError),
}

impl RuntimeError {
    pub fn kind(&self) -> mitto_store::ErrorKind {
        use mitto_store::ErrorKind;
        match self {
            RuntimeError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            RuntimeError::MessageNotFound(_) => ErrorKind::NotFound,
            RuntimeError::PermissionNotFound(_) => ErrorKind::NotFound,
            RuntimeError::Stopped => ErrorKind::Cancelled,
            RuntimeError::Store(e) => e.kind(),
            RuntimeError::Queue(e) => match e {
                mitto_queue::QueueError::Full => ErrorKind::QueueFull,
                mitto_queue::QueueError::Empty => ErrorKind::QueueEmpty,
                mitto_queue::QueueError::NotFound(_) => ErrorKind::NotFound,
                mitto_queue::QueueError::Store(inner) => inner.kind(),
            },
            RuntimeError::Acp(e) => match e {
                mitto_acp::AcpError::Unavailable(_) => ErrorKind::AgentUnavailable,
                mitto_acp::AcpError::Protocol(_) => ErrorKind::AgentProtocol,
                mitto_acp::AcpError::Cancelled => ErrorKind::Cancelled,
            },
        }
    }
}
