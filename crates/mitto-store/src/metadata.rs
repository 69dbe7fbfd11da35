use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SessionId;

/// Session lifecycle status. `Degraded` is an addition beyond the base
/// four states, used when a store IO failure leaves a session's on-disk
/// state suspect without losing the session outright — see DESIGN.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Error,
    Archived,
    Degraded,
}

fn default_true() -> bool {
    true
}

/// Feature flags gating what a session's agent is permitted to do.
/// `can_prompt_user` defaults to `true`; everything else starts `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    #[serde(default)]
    pub can_send_prompt: bool,
    #[serde(default = "default_true")]
    pub can_prompt_user: bool,
    #[serde(default)]
    pub can_start_conversation: bool,
    #[serde(default)]
    pub can_do_introspection: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            can_send_prompt: false,
            can_prompt_user: true,
            can_start_conversation: false,
            can_do_introspection: false,
        }
    }
}

/// `metadata.json` — rewritten atomically on every update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub session_id: SessionId,
    pub workspace: String,
    pub agent: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seq: i64,
    pub status: SessionStatus,
    #[serde(default)]
    pub flags: Flags,
    #[serde(default)]
    pub user_data: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new(session_id: SessionId, workspace: String, agent: String) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            workspace,
            agent,
            created_at: now,
            updated_at: now,
            last_seq: 0,
            status: SessionStatus::Active,
            flags: Flags::default(),
            user_data: BTreeMap::new(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
