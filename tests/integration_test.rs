//! End-to-end coverage across the manager, runtime, and store crates:
//! create a session, drive a prompt through a mock agent, persist and
//! reload its events, then rename and delete it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use mitto_acp::mock::MockAdapter;
use mitto_acp::{AcpAdapter, AcpError, AgentSpawnSpec};
use mitto_config::{Config, QueueConfig, RunnerKind, WorkspaceConfig};
use mitto_manager::{LauncherFactory, Manager};
use mitto_runtime::{Observer, ObserverError, ServerEvent, SubmitOutcome};

struct MockLauncher;

#[async_trait]
impl mitto_acp::AcpLauncher for MockLauncher {
    async fn launch(&self, _spec: &AgentSpawnSpec) -> Result<Arc<dyn AcpAdapter>, AcpError> {
        Ok(MockAdapter::new())
    }
}

fn mock_factory() -> LauncherFactory {
    Arc::new(|_kind: &RunnerKind| Arc::new(MockLauncher) as Arc<dyn mitto_acp::AcpLauncher>)
}

fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.data_root = dir.to_path_buf();
    config.workspaces.insert(
        "demo".to_string(),
        WorkspaceConfig {
            root: dir.to_path_buf(),
            agent_name: "claude".to_string(),
            runner: RunnerKind::Direct,
            user_data_schema: Vec::new(),
            queue: QueueConfig::default(),
        },
    );
    config
}

/// Collects every event handed to it, for assertions after a prompt runs.
struct Recorder(Mutex<Vec<ServerEvent>>);

#[async_trait]
impl Observer for Recorder {
    async fn send(&self, event: ServerEvent) -> Result<(), ObserverError> {
        self.0.lock().unwrap().push(event);
        Ok(())
    }
}

async fn wait_for_completion(recorder: &Recorder) {
    timeout(Duration::from_secs(2), async {
        loop {
            if recorder
                .0
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, ServerEvent::PromptComplete { .. }))
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("prompt did not complete in time");
}

#[tokio::test]
async fn prompt_round_trip_persists_and_replays_events() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Manager::with_parts(test_config(dir.path()), mock_factory(), None, None);

    let id = manager.create_session("demo").await.unwrap();
    let handle = manager.get_or_resume(&id).await.unwrap();

    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    let observer_handle = handle.add_observer(recorder.clone(), 0).await.unwrap();

    let outcome = handle
        .submit_prompt("hello".to_string(), vec![], "tester".to_string(), "p1".to_string())
        .await
        .unwrap();
    assert!(matches!(outcome, SubmitOutcome::Accepted));

    wait_for_completion(&recorder).await;

    let saw_echo = recorder.0.lock().unwrap().iter().any(|e| match e {
        ServerEvent::AgentMessage { html, .. } => html.contains("echo: hello"),
        _ => false,
    });
    assert!(saw_echo, "expected the mock adapter's echoed reply to reach the observer");

    let loaded = handle.load_events(50, None, None).await.unwrap();
    assert!(loaded.events.iter().any(|e| e.field_str("text").map_or(false, |t| t == "hello")));

    observer_handle.unregister().await;

    manager.rename_session(&id, "renamed conversation".to_string()).await.unwrap();
    let sessions = manager.list_sessions(Some("demo")).await.unwrap();
    let meta = sessions.iter().find(|m| m.session_id == id).unwrap();
    assert_eq!(meta.user_data.get("title").map(String::as_str), Some("renamed conversation"));

    manager.delete_session(&id).await.unwrap();
    let sessions = manager.list_sessions(Some("demo")).await.unwrap();
    assert!(sessions.iter().all(|m| m.session_id != id));
}

#[tokio::test]
async fn queue_accepts_second_prompt_while_first_is_running() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Manager::with_parts(test_config(dir.path()), mock_factory(), None, None);

    let id = manager.create_session("demo").await.unwrap();
    let handle = manager.get_or_resume(&id).await.unwrap();

    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    handle.add_observer(recorder.clone(), 0).await.unwrap();

    handle
        .submit_prompt("first".to_string(), vec![], "tester".to_string(), "p1".to_string())
        .await
        .unwrap();
    let second = handle
        .submit_prompt("second".to_string(), vec![], "tester".to_string(), "p2".to_string())
        .await
        .unwrap();

    match second {
        SubmitOutcome::Accepted | SubmitOutcome::Queued { .. } => {}
        other => panic!("expected the second prompt to be accepted or queued, got {other:?}"),
    }

    wait_for_completion(&recorder).await;
}

#[tokio::test]
async fn startup_recover_relaunches_sessions_with_pending_queue() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = mitto_store::Store::new(dir.path());

    let id = {
        let manager = Manager::with_parts(config.clone(), mock_factory(), None, None);
        let id = manager.create_session("demo").await.unwrap();
        manager.stop_all().await;
        id
    };

    // Simulate a message left queued when the process stopped: nothing
    // drained it before shutdown, so on restart it should be resumed.
    let queued = vec![mitto_queue::QueuedMessage {
        id: "msg-1".to_string(),
        text: "left over".to_string(),
        image_ids: Vec::new(),
        queued_at: chrono::Utc::now(),
        client_id: None,
        title: None,
    }];
    store.write_queue(&id, &queued).await.unwrap();

    let manager = Manager::with_parts(config, mock_factory(), None, None);
    let recovered = manager.startup_recover().await.unwrap();
    assert_eq!(recovered, 1);

    let sessions = manager.list_sessions(None).await.unwrap();
    assert!(sessions.iter().any(|m| m.session_id == id));
}

#[tokio::test]
async fn startup_recover_skips_sessions_with_empty_queue() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    {
        let manager = Manager::with_parts(config.clone(), mock_factory(), None, None);
        manager.create_session("demo").await.unwrap();
        manager.stop_all().await;
    }

    let manager = Manager::with_parts(config, mock_factory(), None, None);
    let recovered = manager.startup_recover().await.unwrap();
    assert_eq!(recovered, 0);
}
