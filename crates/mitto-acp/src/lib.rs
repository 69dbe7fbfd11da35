//! Narrow adapter over an Agent Client Protocol subprocess.
//!
//! The runtime talks to an agent only through [`AcpAdapter`]; it never
//! spawns a process or touches `agent_client_protocol` types itself.
//! ACP's connection futures are `!Send`, so every concrete adapter runs
//! its connection on a dedicated thread and exposes a `Send` handle.

pub mod launcher;

mod direct;

#[cfg(feature = "mock")]
pub mod mock;

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use direct::DirectAdapter;
pub use launcher::{AcpLauncher, ContainerizedLauncher, DirectLauncher, SandboxedLauncher};

/// How and where an agent subprocess is launched. Full sandbox/container
/// policy engines are out of scope; `Sandboxed` and `Containerized` only
/// change how the command is wrapped before it is spawned directly.
#[derive(Debug, Clone)]
pub enum RunnerKind {
    Direct,
    Sandboxed { profile: String },
    Containerized { image: String },
}

#[derive(Debug, Clone)]
pub struct AgentSpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub runner: RunnerKind,
}

/// One increment of agent activity during a prompt turn.
#[derive(Debug, Clone)]
pub enum AcpUpdate {
    AgentMessageChunk(String),
    AgentThoughtChunk(String),
    ToolCall {
        id: String,
        title: String,
        status: String,
    },
    ToolCallUpdate {
        id: String,
        status: String,
    },
    Plan(serde_json::Value),
    Permission {
        request_id: String,
        title: String,
        options: serde_json::Value,
    },
    /// Terminal item: the prompt turn is over.
    Done(StopReasonKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReasonKind {
    EndTurn,
    Cancelled,
    MaxTokens,
    Refusal,
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AcpError {
    #[error("agent unavailable: {0}")]
    Unavailable(String),
    #[error("agent protocol error: {0}")]
    Protocol(String),
    #[error("operation cancelled")]
    Cancelled,
}

/// Adapter over a single live agent subprocess and its one ACP session.
#[async_trait]
pub trait AcpAdapter: Send + Sync {
    /// Send a user prompt and receive a channel of updates, terminated
    /// by [`AcpUpdate::Done`].
    async fn prompt(
        &self,
        text: String,
        image_ids: Vec<String>,
    ) -> Result<mpsc::Receiver<AcpUpdate>, AcpError>;

    /// Cancel whatever prompt is currently in flight.
    async fn cancel(&self) -> Result<(), AcpError>;

    /// Answer a pending permission request raised through an
    /// [`AcpUpdate::Permission`].
    async fn answer_permission(&self, request_id: String, selection: String)
        -> Result<(), AcpError>;

    /// Tear down the subprocess and its connection.
    async fn close(&self) -> Result<(), AcpError>;
}
