use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_bind_address() -> String {
    "127.0.0.1:4000".into()
}

fn default_data_root() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("mitto"))
        .unwrap_or_else(|| PathBuf::from(".mitto-data"))
}

fn default_permission_timeout_secs() -> u64 {
    300
}

fn default_observer_idle_timeout_secs() -> u64 {
    60
}

fn default_queue_title_timeout_secs() -> u64 {
    30
}

/// Root `mitto.yaml` document: daemon-wide settings plus the table of
/// workspaces the manager will resolve sessions against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    /// How long a permission request waits for an answer before the
    /// runtime auto-cancels the prompt.
    #[serde(default = "default_permission_timeout_secs")]
    pub permission_timeout_secs: u64,
    /// How long an idle observer socket is kept registered before the
    /// gateway drops it.
    #[serde(default = "default_observer_idle_timeout_secs")]
    pub observer_idle_timeout_secs: u64,
    /// Timeout applied to a single queue title-generation call.
    #[serde(default = "default_queue_title_timeout_secs")]
    pub queue_title_timeout_secs: u64,
    /// Workspaces keyed by name, referenced from the gateway by the same
    /// name segment used in session creation requests.
    #[serde(default)]
    pub workspaces: HashMap<String, WorkspaceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            data_root: default_data_root(),
            permission_timeout_secs: default_permission_timeout_secs(),
            observer_idle_timeout_secs: default_observer_idle_timeout_secs(),
            queue_title_timeout_secs: default_queue_title_timeout_secs(),
            workspaces: HashMap::new(),
        }
    }
}

/// How an agent subprocess for this workspace is launched. Mirrors
/// `mitto_acp::RunnerKind` field-for-field; kept as a separate type here so
/// this crate has no dependency on the adapter crate, and converted by
/// whoever constructs a launcher from a resolved `WorkspaceConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunnerKind {
    Direct,
    Sandboxed { profile: String },
    Containerized { image: String },
}

impl Default for RunnerKind {
    fn default() -> Self {
        RunnerKind::Direct
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UserDataKind {
    String,
    Bool,
    Int,
    Enum(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDataField {
    pub key: String,
    pub kind: UserDataKind,
}

fn default_queue_max_size() -> usize {
    50
}

fn default_queue_delay_seconds() -> u64 {
    3
}

fn default_titles_enabled() -> bool {
    true
}

fn default_queue_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,
    #[serde(default = "default_queue_delay_seconds")]
    pub delay_seconds: u64,
    #[serde(default = "default_titles_enabled")]
    pub titles_enabled: bool,
    /// When `false`, a prompt submitted while the agent is busy is
    /// rejected instead of queued. Workspaces that want strictly
    /// one-prompt-at-a-time behavior set this instead of `max_size: 1`,
    /// since a disabled queue also skips title generation and the
    /// queued-message event stream entirely.
    #[serde(default = "default_queue_enabled")]
    pub enabled: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_queue_max_size(),
            delay_seconds: default_queue_delay_seconds(),
            titles_enabled: default_titles_enabled(),
            enabled: default_queue_enabled(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub root: PathBuf,
    pub agent_name: String,
    #[serde(default)]
    pub runner: RunnerKind,
    #[serde(default)]
    pub user_data_schema: Vec<UserDataField>,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_bind_address() {
        let c = Config::default();
        assert_eq!(c.bind_address, "127.0.0.1:4000");
    }

    #[test]
    fn config_default_has_no_workspaces() {
        assert!(Config::default().workspaces.is_empty());
    }

    #[test]
    fn workspace_deserializes_with_queue_defaults() {
        let yaml = "root: /tmp/ws\nagent_name: claude\n";
        let ws: WorkspaceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(ws.queue.max_size, 50);
        assert!(matches!(ws.runner, RunnerKind::Direct));
    }

    #[test]
    fn runner_kind_tagged_union_round_trips() {
        let ws = WorkspaceConfig {
            root: "/tmp/ws".into(),
            agent_name: "claude".into(),
            runner: RunnerKind::Sandboxed { profile: "restricted".into() },
            user_data_schema: vec![UserDataField {
                key: "priority".into(),
                kind: UserDataKind::Enum(vec!["low".into(), "high".into()]),
            }],
            queue: QueueConfig::default(),
        };
        let yaml = serde_yaml::to_string(&ws).unwrap();
        let back: WorkspaceConfig = serde_yaml::from_str(&yaml).unwrap();
        assert!(matches!(back.runner, RunnerKind::Sandboxed { ref profile } if profile == "restricted"));
    }
}
