//! Direct subprocess adapter: spawns the agent command as a child
//! process and drives the ACP handshake over its stdio.
//!
//! ACP's connection futures are `!Send`, so the connection lives on a
//! dedicated OS thread running a single-threaded runtime and a
//! `LocalSet`; this struct only holds a `Send` channel into that
//! thread.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use agent_client_protocol::{
    Agent, AgentNotification, AgentRequest, CancelNotification, ClientCapabilities,
    ClientResponse, ClientSide, ClientSideConnection, ContentBlock, FileSystemCapabilities,
    Implementation, InitializeRequest, MessageHandler, NewSessionRequest, PromptRequest,
    ProtocolVersion, ReadTextFileResponse, RequestPermissionOutcome, RequestPermissionResponse,
    SelectedPermissionOutcome, SessionUpdate, StopReason, TextContent, WriteTextFileResponse,
};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};

use crate::{AcpAdapter, AcpError, AcpUpdate, StopReasonKind};

enum DirectCommand {
    Prompt {
        text: String,
        image_ids: Vec<String>,
        updates: mpsc::Sender<AcpUpdate>,
    },
    Cancel,
    AnswerPermission {
        request_id: String,
        selection: String,
    },
    Close,
}

#[derive(Clone, Default)]
struct SharedState {
    pending_permissions: Arc<Mutex<HashMap<String, oneshot::Sender<String>>>>,
    current_updates: Arc<Mutex<Option<mpsc::Sender<AcpUpdate>>>>,
}

struct Handler {
    state: SharedState,
}

impl MessageHandler<ClientSide> for Handler {
    fn handle_request(
        &self,
        request: AgentRequest,
    ) -> impl std::future::Future<Output = agent_client_protocol::Result<ClientResponse>> {
        let state = self.state.clone();
        async move {
            match request {
                AgentRequest::ReadTextFileRequest(req) => {
                    let content = tokio::fs::read_to_string(&req.path)
                        .await
                        .map_err(|e| agent_client_protocol::Error::new(-32000, e.to_string()))?;
                    Ok(ClientResponse::ReadTextFileResponse(ReadTextFileResponse::new(
                        content,
                    )))
                }
                AgentRequest::WriteTextFileRequest(req) => {
                    tokio::fs::write(&req.path, &req.content)
                        .await
                        .map_err(|e| agent_client_protocol::Error::new(-32000, e.to_string()))?;
                    Ok(ClientResponse::WriteTextFileResponse(WriteTextFileResponse::new()))
                }
                AgentRequest::RequestPermissionRequest(req) => {
                    let request_id = format!("perm-{}", next_id());
                    let (tx, rx) = oneshot::channel();
                    state
                        .pending_permissions
                        .lock()
                        .unwrap()
                        .insert(request_id.clone(), tx);

                    let options = serde_json::to_value(&req.options).unwrap_or(serde_json::Value::Null);
                    let title = format!("Permission requested for session {}", req.session_id);
                    if let Some(sender) = state.current_updates.lock().unwrap().clone() {
                        let _ = sender.try_send(AcpUpdate::Permission {
                            request_id: request_id.clone(),
                            title,
                            options,
                        });
                    }

                    match rx.await {
                        Ok(option_id) => Ok(ClientResponse::RequestPermissionResponse(
                            RequestPermissionResponse::new(RequestPermissionOutcome::Selected(
                                SelectedPermissionOutcome::new(option_id),
                            )),
                        )),
                        Err(_) => Err(agent_client_protocol::Error::new(
                            -32000,
                            "permission request dropped before being answered".to_string(),
                        )),
                    }
                }
                _ => Err(agent_client_protocol::Error::method_not_found()),
            }
        }
    }

    fn handle_notification(
        &self,
        notification: AgentNotification,
    ) -> impl std::future::Future<Output = agent_client_protocol::Result<()>> {
        let state = self.state.clone();
        async move {
            if let AgentNotification::SessionNotification(sn) = notification {
                forward_session_update(&state, sn.update);
            }
            Ok(())
        }
    }
}

fn next_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

fn forward_session_update(state: &SharedState, update: SessionUpdate) {
    let Some(sender) = state.current_updates.lock().unwrap().clone() else {
        return;
    };
    let mapped = match update {
        SessionUpdate::AgentMessageChunk(chunk) => match chunk.content {
            ContentBlock::Text(text) => Some(AcpUpdate::AgentMessageChunk(text.text)),
            _ => None,
        },
        SessionUpdate::AgentThoughtChunk(chunk) => match chunk.content {
            ContentBlock::Text(text) => Some(AcpUpdate::AgentThoughtChunk(text.text)),
            _ => None,
        },
        SessionUpdate::ToolCall(tc) => Some(AcpUpdate::ToolCall {
            id: tc.tool_call_id.to_string(),
            title: tc.title.clone(),
            status: format!("{:?}", tc.status),
        }),
        SessionUpdate::ToolCallUpdate(tc) => Some(AcpUpdate::ToolCallUpdate {
            id: tc.tool_call_id.to_string(),
            status: format!("{:?}", tc.fields.status),
        }),
        SessionUpdate::Plan(plan) => serde_json::to_value(&plan).ok().map(AcpUpdate::Plan),
        _ => None,
    };
    if let Some(update) = mapped {
        let _ = sender.try_send(update);
    }
}

fn map_stop_reason(reason: StopReason) -> StopReasonKind {
    match reason {
        StopReason::EndTurn => StopReasonKind::EndTurn,
        StopReason::Cancelled => StopReasonKind::Cancelled,
        StopReason::MaxTokens => StopReasonKind::MaxTokens,
        StopReason::Refusal => StopReasonKind::Refusal,
        other => StopReasonKind::Other(format!("{other:?}")),
    }
}

pub struct DirectAdapter {
    cmd_tx: mpsc::Sender<DirectCommand>,
}

impl DirectAdapter {
    pub async fn spawn(
        working_dir: PathBuf,
        command: String,
        args: Vec<String>,
    ) -> Result<Arc<dyn AcpAdapter>, AcpError> {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("mitto-acp-connection".to_string())
            .spawn(move || connection_thread_main(working_dir, command, args, cmd_rx, ready_tx))
            .map_err(|e| AcpError::Unavailable(format!("failed to spawn connection thread: {e}")))?;

        ready_rx
            .await
            .map_err(|_| AcpError::Unavailable("connection thread exited before handshake".into()))??;

        Ok(Arc::new(Self { cmd_tx }))
    }
}

#[async_trait]
impl AcpAdapter for DirectAdapter {
    async fn prompt(
        &self,
        text: String,
        image_ids: Vec<String>,
    ) -> Result<mpsc::Receiver<AcpUpdate>, AcpError> {
        let (updates_tx, updates_rx) = mpsc::channel(256);
        self.cmd_tx
            .send(DirectCommand::Prompt {
                text,
                image_ids,
                updates: updates_tx,
            })
            .await
            .map_err(|_| AcpError::Unavailable("agent connection closed".into()))?;
        Ok(updates_rx)
    }

    async fn cancel(&self) -> Result<(), AcpError> {
        self.cmd_tx
            .send(DirectCommand::Cancel)
            .await
            .map_err(|_| AcpError::Unavailable("agent connection closed".into()))
    }

    async fn answer_permission(&self, request_id: String, selection: String) -> Result<(), AcpError> {
        self.cmd_tx
            .send(DirectCommand::AnswerPermission { request_id, selection })
            .await
            .map_err(|_| AcpError::Unavailable("agent connection closed".into()))
    }

    async fn close(&self) -> Result<(), AcpError> {
        let _ = self.cmd_tx.send(DirectCommand::Close).await;
        Ok(())
    }
}

fn connection_thread_main(
    working_dir: PathBuf,
    command: String,
    args: Vec<String>,
    cmd_rx: mpsc::Receiver<DirectCommand>,
    ready_tx: oneshot::Sender<Result<(), AcpError>>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready_tx.send(Err(AcpError::Unavailable(format!(
                "failed to build connection runtime: {e}"
            ))));
            return;
        }
    };
    let local = LocalSet::new();
    local.block_on(&rt, run_connection(working_dir, command, args, cmd_rx, ready_tx));
}

async fn run_connection(
    working_dir: PathBuf,
    command: String,
    args: Vec<String>,
    mut cmd_rx: mpsc::Receiver<DirectCommand>,
    ready_tx: oneshot::Sender<Result<(), AcpError>>,
) {
    let mut child = match tokio::process::Command::new(&command)
        .args(&args)
        .current_dir(&working_dir)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            let _ = ready_tx.send(Err(AcpError::Unavailable(format!(
                "failed to spawn agent '{command}': {e}"
            ))));
            return;
        }
    };

    let stdin = child.stdin.take().expect("stdin piped");
    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    tokio::task::spawn_local(async move {
        use tokio::io::AsyncBufReadExt;
        let mut lines = tokio::io::BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "mitto_acp::stderr", "{line}");
        }
    });

    let state = SharedState::default();
    let handler = Handler { state: state.clone() };

    let (conn, io_fut) = ClientSideConnection::new(handler, stdin.compat_write(), stdout.compat(), |fut| {
        tokio::task::spawn_local(fut);
    });
    tokio::task::spawn_local(async move {
        if let Err(e) = io_fut.await {
            tracing::warn!(error = %e, "acp transport loop ended");
        }
    });

    let caps = ClientCapabilities::new()
        .fs(FileSystemCapabilities::new().read_text_file(true).write_text_file(true))
        .terminal(false);
    let client_info = Implementation::new("mitto", env!("CARGO_PKG_VERSION"));
    let init_req = InitializeRequest::new(ProtocolVersion::LATEST)
        .client_capabilities(caps)
        .client_info(client_info);

    if let Err(e) = conn.initialize(init_req).await {
        let _ = ready_tx.send(Err(AcpError::Protocol(format!("initialize failed: {e}"))));
        return;
    }

    let session = match conn.new_session(NewSessionRequest::new(working_dir.clone())).await {
        Ok(resp) => resp.session_id,
        Err(e) => {
            let _ = ready_tx.send(Err(AcpError::Protocol(format!("new_session failed: {e}"))));
            return;
        }
    };

    let _ = ready_tx.send(Ok(()));

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            DirectCommand::Prompt { text, image_ids, updates } => {
                if !image_ids.is_empty() {
                    tracing::warn!(
                        count = image_ids.len(),
                        "image attachments are not wired into the ACP prompt yet, sending text only"
                    );
                }
                *state.current_updates.lock().unwrap() = Some(updates.clone());
                let req = PromptRequest::new(session.clone(), vec![ContentBlock::Text(TextContent::new(text))]);
                match conn.prompt(req).await {
                    Ok(resp) => {
                        let _ = updates.send(AcpUpdate::Done(map_stop_reason(resp.stop_reason))).await;
                    }
                    Err(e) => {
                        let _ = updates
                            .send(AcpUpdate::Done(StopReasonKind::Other(e.to_string())))
                            .await;
                    }
                }
                *state.current_updates.lock().unwrap() = None;
            }
            DirectCommand::Cancel => {
                let _ = conn.cancel(CancelNotification::new(session.clone())).await;
            }
            DirectCommand::AnswerPermission { request_id, selection } => {
                if let Some(tx) = state.pending_permissions.lock().unwrap().remove(&request_id) {
                    let _ = tx.send(selection);
                }
            }
            DirectCommand::Close => break,
        }
    }

    let _ = child.kill().await;
}
