use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tag of an [`Event`]. Unrecognized kinds round-trip as [`EventKind::Other`]
/// so a newer writer's event kinds never corrupt an older reader's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    SessionStart,
    UserPrompt,
    AgentMessage,
    AgentThought,
    ToolCall,
    ToolCallUpdate,
    Plan,
    FileRead,
    FileWrite,
    Permission,
    Error,
    SessionEnd,
    Other(String),
}

impl EventKind {
    fn as_str(&self) -> &str {
        match self {
            EventKind::SessionStart => "session_start",
            EventKind::UserPrompt => "user_prompt",
            EventKind::AgentMessage => "agent_message",
            EventKind::AgentThought => "agent_thought",
            EventKind::ToolCall => "tool_call",
            EventKind::ToolCallUpdate => "tool_call_update",
            EventKind::Plan => "plan",
            EventKind::FileRead => "file_read",
            EventKind::FileWrite => "file_write",
            EventKind::Permission => "permission",
            EventKind::Error => "error",
            EventKind::SessionEnd => "session_end",
            EventKind::Other(s) => s,
        }
    }

    /// Streaming kinds whose chunks coalesce under one `seq`.
    pub fn is_coalescing(&self) -> bool {
        matches!(self, EventKind::AgentMessage | EventKind::AgentThought)
    }
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        match s {
            "session_start" => EventKind::SessionStart,
            "user_prompt" => EventKind::UserPrompt,
            "agent_message" => EventKind::AgentMessage,
            "agent_thought" => EventKind::AgentThought,
            "tool_call" => EventKind::ToolCall,
            "tool_call_update" => EventKind::ToolCallUpdate,
            "plan" => EventKind::Plan,
            "file_read" => EventKind::FileRead,
            "file_write" => EventKind::FileWrite,
            "permission" => EventKind::Permission,
            "error" => EventKind::Error,
            "session_end" => EventKind::SessionEnd,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl Serialize for EventKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(EventKind::from(s.as_str()))
    }
}

/// One record in `events.jsonl`.
///
/// `fields` carries the kind-specific payload, flattened at the top level
/// (`{seq, kind, timestamp, ...}`) rather than nested under a `payload` key.
/// Round-tripping an event you didn't
/// construct (e.g. one with an `Other` kind) preserves every field you
/// didn't touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Event {
    fn new(seq: i64, kind: EventKind, fields: Map<String, Value>) -> Self {
        Self {
            seq,
            kind,
            timestamp: Utc::now(),
            fields,
        }
    }

    pub fn session_start(seq: i64, agent: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("agent".into(), Value::String(agent.to_string()));
        Self::new(seq, EventKind::SessionStart, fields)
    }

    pub fn user_prompt(
        seq: i64,
        sender_id: &str,
        prompt_id: &str,
        text: &str,
        image_ids: &[String],
    ) -> Self {
        let mut fields = Map::new();
        fields.insert("sender_id".into(), Value::String(sender_id.to_string()));
        fields.insert("prompt_id".into(), Value::String(prompt_id.to_string()));
        fields.insert("message".into(), Value::String(text.to_string()));
        fields.insert(
            "image_ids".into(),
            Value::Array(image_ids.iter().cloned().map(Value::String).collect()),
        );
        Self::new(seq, EventKind::UserPrompt, fields)
    }

    pub fn agent_message(seq: i64, html: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("html".into(), Value::String(html.to_string()));
        Self::new(seq, EventKind::AgentMessage, fields)
    }

    pub fn agent_thought(seq: i64, text: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("text".into(), Value::String(text.to_string()));
        Self::new(seq, EventKind::AgentThought, fields)
    }

    pub fn tool_call(seq: i64, id: &str, title: &str, status: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("id".into(), Value::String(id.to_string()));
        fields.insert("title".into(), Value::String(title.to_string()));
        fields.insert("status".into(), Value::String(status.to_string()));
        Self::new(seq, EventKind::ToolCall, fields)
    }

    pub fn tool_call_update(seq: i64, id: &str, status: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("id".into(), Value::String(id.to_string()));
        fields.insert("status".into(), Value::String(status.to_string()));
        Self::new(seq, EventKind::ToolCallUpdate, fields)
    }

    pub fn plan(seq: i64, steps: Value) -> Self {
        let mut fields = Map::new();
        fields.insert("steps".into(), steps);
        Self::new(seq, EventKind::Plan, fields)
    }

    pub fn permission(seq: i64, request_id: &str, title: &str, options: Value) -> Self {
        let mut fields = Map::new();
        fields.insert("request_id".into(), Value::String(request_id.to_string()));
        fields.insert("title".into(), Value::String(title.to_string()));
        fields.insert("options".into(), options);
        Self::new(seq, EventKind::Permission, fields)
    }

    pub fn error(seq: i64, message: &str, code: Option<&str>) -> Self {
        let mut fields = Map::new();
        fields.insert("message".into(), Value::String(message.to_string()));
        if let Some(code) = code {
            fields.insert("code".into(), Value::String(code.to_string()));
        }
        Self::new(seq, EventKind::Error, fields)
    }

    pub fn session_end(seq: i64) -> Self {
        Self::new(seq, EventKind::SessionEnd, Map::new())
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_kind_round_trips_as_snake_case_string() {
        let ev = Event::agent_message(2, "<p>hi</p>");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"], "agent_message");
        assert_eq!(json["html"], "<p>hi</p>");
    }

    #[test]
    fn unknown_kind_preserves_original_string_and_fields() {
        let json = serde_json::json!({
            "seq": 5,
            "kind": "future_kind_v2",
            "timestamp": "2026-01-01T00:00:00Z",
            "some_field": 42
        });
        let ev: Event = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(ev.kind, EventKind::Other("future_kind_v2".to_string()));
        let back = serde_json::to_value(&ev).unwrap();
        assert_eq!(back["kind"], "future_kind_v2");
        assert_eq!(back["some_field"], 42);
    }

    #[test]
    fn coalescing_kinds() {
        assert!(EventKind::AgentMessage.is_coalescing());
        assert!(EventKind::AgentThought.is_coalescing());
        assert!(!EventKind::ToolCall.is_coalescing());
    }
}
