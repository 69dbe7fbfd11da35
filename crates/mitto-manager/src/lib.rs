//! Registry of live session runtimes.
//!
//! Keeps a `HashMap<SessionId, RuntimeHandle>` plus one resolved
//! [`mitto_acp::AcpLauncher`] per workspace. Needs no actor loop of its
//! own: every session-level operation is already serialized inside its
//! own [`mitto_runtime::RuntimeHandle`], so the manager only has to guard
//! the lifecycle map itself, which a plain async mutex does without a
//! command channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use mitto_acp::{AcpLauncher, AgentSpawnSpec, ContainerizedLauncher, DirectLauncher, SandboxedLauncher};
use mitto_config::{Config, WorkspaceConfig};
use mitto_queue::TitleGenerator;
use mitto_runtime::{Runtime, RuntimeConfig, RuntimeHandle, SuggestionGenerator};
use mitto_store::{Metadata, SessionId, SessionStatus, Store};

/// Builds the launcher used for a workspace's configured runner kind.
/// Pluggable so tests can substitute a mock launcher instead of spawning
/// a real subprocess.
pub type LauncherFactory =
    Arc<dyn Fn(&mitto_config::RunnerKind) -> Arc<dyn AcpLauncher> + Send + Sync>;

fn default_launcher_for(kind: &mitto_config::RunnerKind) -> Arc<dyn AcpLauncher> {
    match kind {
        mitto_config::RunnerKind::Direct => Arc::new(DirectLauncher),
        mitto_config::RunnerKind::Sandboxed { .. } => Arc::new(SandboxedLauncher::default()),
        mitto_config::RunnerKind::Containerized { .. } => Arc::new(ContainerizedLauncher::default()),
    }
}

fn to_acp_runner_kind(kind: &mitto_config::RunnerKind) -> mitto_acp::RunnerKind {
    match kind {
        mitto_config::RunnerKind::Direct => mitto_acp::RunnerKind::Direct,
        mitto_config::RunnerKind::Sandboxed { profile } => {
            mitto_acp::RunnerKind::Sandboxed { profile: profile.clone() }
        }
        mitto_config::RunnerKind::Containerized { image } => {
            mitto_acp::RunnerKind::Containerized { image: image.clone() }
        }
    }
}

fn spawn_spec(ws: &WorkspaceConfig) -> AgentSpawnSpec {
    AgentSpawnSpec {
        command: ws.agent_name.clone(),
        args: Vec::new(),
        working_dir: ws.root.clone(),
        runner: to_acp_runner_kind(&ws.runner),
    }
}

fn runtime_config(cfg: &Config, ws: &WorkspaceConfig) -> RuntimeConfig {
    RuntimeConfig {
        queue_max_size: ws.queue.max_size,
        queue_enabled: ws.queue.enabled,
        permission_timeout: Duration::from_secs(cfg.permission_timeout_secs),
        auto_drain_delay: Duration::from_secs(ws.queue.delay_seconds),
        ..Default::default()
    }
}

/// Broadcast to every subscriber watching session lifecycle, not any one
/// session's event stream. Carried over the same `broadcast` primitive the
/// teacher uses per-session, scoped one level up.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GlobalEvent {
    SessionCreated { session_id: SessionId, workspace: String },
    SessionDeleted { session_id: SessionId },
    SessionRenamed { session_id: SessionId, title: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("workspace {0:?} is not configured")]
    UnknownWorkspace(String),
    #[error(transparent)]
    Store(#[from] mitto_store::StoreError),
    #[error(transparent)]
    Runtime(#[from] mitto_runtime::RuntimeError),
    #[error(transparent)]
    Acp(#[from] mitto_acp::AcpError),
}

pub struct Manager {
    store: Arc<Store>,
    config: Config,
    launcher_factory: LauncherFactory,
    live: Mutex<HashMap<SessionId, RuntimeHandle>>,
    events: broadcast::Sender<GlobalEvent>,
    title_generator: Option<Arc<dyn TitleGenerator>>,
    suggestion_generator: Option<Arc<dyn SuggestionGenerator>>,
}

impl Manager {
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_parts(config, Arc::new(default_launcher_for), None, None)
    }

    pub fn with_generators(
        config: Config,
        title_generator: Option<Arc<dyn TitleGenerator>>,
        suggestion_generator: Option<Arc<dyn SuggestionGenerator>>,
    ) -> Arc<Self> {
        Self::with_parts(config, Arc::new(default_launcher_for), title_generator, suggestion_generator)
    }

    /// Full constructor; lets tests substitute a launcher factory that
    /// never spawns a real subprocess.
    pub fn with_parts(
        config: Config,
        launcher_factory: LauncherFactory,
        title_generator: Option<Arc<dyn TitleGenerator>>,
        suggestion_generator: Option<Arc<dyn SuggestionGenerator>>,
    ) -> Arc<Self> {
        let store = Arc::new(Store::new(config.data_root.clone()));
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            store,
            config,
            launcher_factory,
            live: Mutex::new(HashMap::new()),
            events,
            title_generator,
            suggestion_generator,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GlobalEvent> {
        self.events.subscribe()
    }

    /// The store backing every session this manager knows about. Shared,
    /// not a fresh instance, so a caller reading metadata directly (e.g.
    /// the gateway, before a runtime is live) serializes through the same
    /// per-session locks as every write the manager itself makes.
    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    fn workspace(&self, name: &str) -> Result<&WorkspaceConfig, ManagerError> {
        self.config
            .workspaces
            .get(name)
            .ok_or_else(|| ManagerError::UnknownWorkspace(name.to_string()))
    }

    /// Creates a brand new session under `workspace` and launches its
    /// runtime immediately.
    pub async fn create_session(&self, workspace: &str) -> Result<SessionId, ManagerError> {
        let ws = self.workspace(workspace)?;
        let id = SessionId::generate();
        self.store.create_session_dir(&id).await?;

        let meta = Metadata::new(id.clone(), workspace.to_string(), ws.agent_name.clone());
        self.store.write_metadata(&meta).await?;

        self.launch_and_register(&id, ws).await?;

        info!(%id, workspace, "session created");
        let _ = self.events.send(GlobalEvent::SessionCreated {
            session_id: id.clone(),
            workspace: workspace.to_string(),
        });
        Ok(id)
    }

    /// Launches a runtime for an existing, not-currently-live session,
    /// replaying its persisted state from disk.
    pub async fn resume_session(&self, id: &SessionId) -> Result<RuntimeHandle, ManagerError> {
        if let Some(handle) = self.live.lock().await.get(id) {
            return Ok(handle.clone());
        }
        let meta = self.store.read_metadata(id).await?;
        let ws = self.workspace(&meta.workspace)?;
        self.launch_and_register(id, ws).await
    }

    /// Returns the live handle, resuming the session first if needed.
    pub async fn get_or_resume(&self, id: &SessionId) -> Result<RuntimeHandle, ManagerError> {
        self.resume_session(id).await
    }

    async fn launch_and_register(
        &self,
        id: &SessionId,
        ws: &WorkspaceConfig,
    ) -> Result<RuntimeHandle, ManagerError> {
        let launcher = (self.launcher_factory)(&ws.runner);
        let spec = spawn_spec(ws);
        let adapter = launcher.launch(&spec).await?;

        let title_generator = if ws.queue.titles_enabled {
            self.title_generator
                .clone()
                .map(|g| (g, Duration::from_secs(self.config.queue_title_timeout_secs)))
        } else {
            None
        };

        let handle = Runtime::spawn(
            self.store.clone(),
            id.clone(),
            adapter,
            runtime_config(&self.config, ws),
            title_generator,
            self.suggestion_generator.clone(),
        )
        .await?;

        self.live.lock().await.insert(id.clone(), handle.clone());
        Ok(handle)
    }

    async fn stop_and_remove(&self, id: &SessionId) {
        if let Some(handle) = self.live.lock().await.remove(id) {
            let _ = handle.stop().await;
        }
    }

    /// Stops the runtime (if live) and marks the session archived; the
    /// on-disk log is kept.
    pub async fn archive_session(&self, id: &SessionId) -> Result<(), ManagerError> {
        self.stop_and_remove(id).await;
        let mut meta = self.store.read_metadata(id).await?;
        meta.status = SessionStatus::Archived;
        meta.touch();
        self.store.write_metadata(&meta).await?;
        Ok(())
    }

    /// Stops the runtime (if live) and permanently removes every on-disk
    /// artifact for the session.
    pub async fn delete_session(&self, id: &SessionId) -> Result<(), ManagerError> {
        self.stop_and_remove(id).await;
        self.store.delete_session(id).await?;
        let _ = self.events.send(GlobalEvent::SessionDeleted { session_id: id.clone() });
        Ok(())
    }

    /// Sets a session's display title, recorded in `user_data["title"]`.
    /// Goes through the live runtime when one is registered so a watching
    /// observer sees the change; otherwise patches metadata directly.
    pub async fn rename_session(&self, id: &SessionId, title: String) -> Result<(), ManagerError> {
        let live_handle = self.live.lock().await.get(id).cloned();
        if let Some(handle) = live_handle {
            handle.set_user_data("title".to_string(), title.clone()).await?;
        } else {
            let mut meta = self.store.read_metadata(id).await?;
            meta.user_data.insert("title".to_string(), title.clone());
            meta.touch();
            self.store.write_metadata(&meta).await?;
        }
        let _ = self.events.send(GlobalEvent::SessionRenamed { session_id: id.clone(), title });
        Ok(())
    }

    /// Lists persisted session metadata, optionally filtered to one
    /// workspace. Includes sessions that are not currently live.
    pub async fn list_sessions(&self, workspace: Option<&str>) -> Result<Vec<Metadata>, ManagerError> {
        let ids = self.store.list_session_ids().await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let meta = self.store.read_metadata(&id).await?;
            if workspace.map_or(true, |w| meta.workspace == w) {
                out.push(meta);
            }
        }
        Ok(out)
    }

    /// Resumes every session with a non-empty queue left on disk, e.g.
    /// after a daemon restart. A session with nothing queued is left
    /// unresumed; its runtime is spawned lazily on first need instead.
    /// Sessions whose workspace is no longer configured are skipped and
    /// logged, not resumed or deleted.
    pub async fn startup_recover(&self) -> Result<usize, ManagerError> {
        let ids = self.store.list_session_ids().await?;
        let mut recovered = 0;
        for id in ids {
            let meta = self.store.read_metadata(&id).await?;
            if meta.status != SessionStatus::Active {
                continue;
            }
            let queue: Vec<mitto_queue::QueuedMessage> =
                self.store.read_queue(&id).await?.unwrap_or_default();
            if queue.is_empty() {
                continue;
            }
            if self.workspace(&meta.workspace).is_err() {
                warn!(%id, workspace = %meta.workspace, "skipping recovery: workspace no longer configured");
                continue;
            }
            self.resume_session(&id).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Stops every live runtime in parallel, each bounded by a timeout.
    /// Every runtime flushes its buffered events as a final
    /// batch before stopping (see [`mitto_runtime::Runtime`]'s `Stop`
    /// handling); persisted state is otherwise untouched, so a later
    /// `resume_session` picks it back up.
    pub async fn stop_all(&self) {
        let handles: Vec<RuntimeHandle> = self.live.lock().await.drain().map(|(_, h)| h).collect();
        let stop_timeout = Duration::from_secs(5);
        futures::future::join_all(handles.into_iter().map(|handle| async move {
            if tokio::time::timeout(stop_timeout, handle.stop()).await.is_err() {
                warn!(session_id = %handle.session_id(), "runtime did not stop within timeout");
            }
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mitto_acp::mock::MockAdapter;
    use mitto_acp::{AcpAdapter, AcpError};
    use async_trait::async_trait;

    struct MockLauncher;

    #[async_trait]
    impl AcpLauncher for MockLauncher {
        async fn launch(&self, _spec: &AgentSpawnSpec) -> Result<Arc<dyn AcpAdapter>, AcpError> {
            Ok(MockAdapter::new())
        }
    }

    fn mock_factory() -> LauncherFactory {
        Arc::new(|_kind: &mitto_config::RunnerKind| Arc::new(MockLauncher) as Arc<dyn AcpLauncher>)
    }

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.data_root = dir.to_path_buf();
        config.workspaces.insert(
            "demo".to_string(),
            WorkspaceConfig {
                root: dir.to_path_buf(),
                agent_name: "claude".to_string(),
                runner: mitto_config::RunnerKind::Direct,
                user_data_schema: Vec::new(),
                queue: mitto_config::QueueConfig::default(),
            },
        );
        config
    }

    #[tokio::test]
    async fn create_session_registers_it_as_live_and_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::with_parts(test_config(dir.path()), mock_factory(), None, None);
        let mut events = manager.subscribe();

        let id = manager.create_session("demo").await.unwrap();

        let sessions = manager.list_sessions(None).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, id);

        match events.recv().await.unwrap() {
            GlobalEvent::SessionCreated { session_id, workspace } => {
                assert_eq!(session_id, id);
                assert_eq!(workspace, "demo");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_session_rejects_unknown_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::with_parts(test_config(dir.path()), mock_factory(), None, None);
        let err = manager.create_session("missing").await.unwrap_err();
        assert!(matches!(err, ManagerError::UnknownWorkspace(w) if w == "missing"));
    }

    #[tokio::test]
    async fn resume_session_returns_same_handle_when_already_live() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::with_parts(test_config(dir.path()), mock_factory(), None, None);
        let id = manager.create_session("demo").await.unwrap();

        let a = manager.resume_session(&id).await.unwrap();
        let b = manager.resume_session(&id).await.unwrap();
        assert_eq!(a.session_id(), b.session_id());
    }

    #[tokio::test]
    async fn delete_session_removes_metadata_and_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::with_parts(test_config(dir.path()), mock_factory(), None, None);
        let id = manager.create_session("demo").await.unwrap();
        let mut events = manager.subscribe();

        manager.delete_session(&id).await.unwrap();

        let sessions = manager.list_sessions(None).await.unwrap();
        assert!(sessions.is_empty());
        assert!(matches!(
            events.recv().await.unwrap(),
            GlobalEvent::SessionDeleted { session_id } if session_id == id
        ));
    }

    #[tokio::test]
    async fn archive_session_keeps_metadata_but_stops_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::with_parts(test_config(dir.path()), mock_factory(), None, None);
        let id = manager.create_session("demo").await.unwrap();

        manager.archive_session(&id).await.unwrap();

        let sessions = manager.list_sessions(None).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, SessionStatus::Archived);
    }

    #[tokio::test]
    async fn rename_session_updates_user_data_and_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::with_parts(test_config(dir.path()), mock_factory(), None, None);
        let id = manager.create_session("demo").await.unwrap();
        let mut events = manager.subscribe();
        let _ = events.recv().await.unwrap(); // drain SessionCreated

        manager.rename_session(&id, "My session".to_string()).await.unwrap();

        let sessions = manager.list_sessions(None).await.unwrap();
        assert_eq!(sessions[0].user_data.get("title").map(String::as_str), Some("My session"));
        assert!(matches!(
            events.recv().await.unwrap(),
            GlobalEvent::SessionRenamed { title, .. } if title == "My session"
        ));
    }

    #[tokio::test]
    async fn startup_recover_resumes_only_active_sessions_in_known_workspaces() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::with_parts(test_config(dir.path()), mock_factory(), None, None);
        let active = manager.create_session("demo").await.unwrap();
        let archived = manager.create_session("demo").await.unwrap();
        manager.archive_session(&archived).await.unwrap();

        // A session only gets resumed on recovery if it has something
        // left queued; simulate a message that never got drained before
        // the prior process stopped.
        let queued = vec![mitto_queue::QueuedMessage {
            id: "msg-1".to_string(),
            text: "left over".to_string(),
            image_ids: Vec::new(),
            queued_at: chrono::Utc::now(),
            client_id: None,
            title: None,
        }];
        manager.store().write_queue(&active, &queued).await.unwrap();

        manager.stop_all().await;

        let recovered = manager.startup_recover().await.unwrap();
        assert_eq!(recovered, 1);

        let status = manager.get_or_resume(&active).await.unwrap().get_running_status().await.unwrap();
        assert!(status.is_running);
    }

    #[tokio::test]
    async fn startup_recover_skips_active_session_with_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::with_parts(test_config(dir.path()), mock_factory(), None, None);
        manager.create_session("demo").await.unwrap();
        manager.stop_all().await;

        let recovered = manager.startup_recover().await.unwrap();
        assert_eq!(recovered, 0);
    }

    #[tokio::test]
    async fn list_sessions_filters_by_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.workspaces.insert(
            "other".to_string(),
            WorkspaceConfig {
                root: dir.path().to_path_buf(),
                agent_name: "claude".to_string(),
                runner: mitto_config::RunnerKind::Direct,
                user_data_schema: Vec::new(),
                queue: mitto_config::QueueConfig::default(),
            },
        );
        let manager = Manager::with_parts(config, mock_factory(), None, None);
        manager.create_session("demo").await.unwrap();
        manager.create_session("other").await.unwrap();

        let demo_only = manager.list_sessions(Some("demo")).await.unwrap();
        assert_eq!(demo_only.len(), 1);
        assert_eq!(demo_only[0].workspace, "demo");
    }
}
