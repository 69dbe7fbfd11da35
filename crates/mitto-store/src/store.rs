use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{Event, Metadata, SessionId, StoreError};

/// Owns every on-disk artifact under `<root>/sessions/<id>/`.
///
/// Concurrent writers to the same session are serialized by a per-session
/// mutex; writers to different sessions proceed fully in parallel.
pub struct Store {
    root: PathBuf,
    locks: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.root.join("sessions").join(id.as_str())
    }

    async fn lock_for(&self, id: &SessionId) -> tokio::sync::OwnedMutexGuard<()> {
        let arc = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        arc.lock_owned().await
    }

    pub async fn create_session_dir(&self, id: &SessionId) -> Result<(), StoreError> {
        fs::create_dir_all(self.session_dir(id)).await?;
        Ok(())
    }

    pub async fn session_exists(&self, id: &SessionId) -> bool {
        self.session_dir(id).is_dir()
    }

    /// Removes a session's entire on-disk directory. Idempotent: a session
    /// that was never created or already deleted is not an error.
    pub async fn delete_session(&self, id: &SessionId) -> Result<(), StoreError> {
        let _guard = self.lock_for(id).await;
        match fs::remove_dir_all(self.session_dir(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_session_ids(&self) -> Result<Vec<SessionId>, StoreError> {
        let sessions_dir = self.root.join("sessions");
        let mut out = Vec::new();
        let mut rd = match fs::read_dir(&sessions_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = rd.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match SessionId::parse(name) {
                Ok(id) => out.push(id),
                Err(_) => continue,
            }
        }
        out.sort();
        Ok(out)
    }

    // ── events.jsonl ──────────────────────────────────────────────────────

    pub async fn append_event(&self, id: &SessionId, event: &Event) -> Result<(), StoreError> {
        let _guard = self.lock_for(id).await;
        self.append_event_locked(id, event).await
    }

    /// Atomically appends a contiguous batch, in order. On failure mid-batch
    /// already-flushed lines remain — crash-consistent, not transactional;
    /// callers detect and recover by reloading `last_seq`.
    pub async fn append_events(&self, id: &SessionId, batch: &[Event]) -> Result<(), StoreError> {
        let _guard = self.lock_for(id).await;
        for event in batch {
            self.append_event_locked(id, event).await?;
        }
        Ok(())
    }

    async fn append_event_locked(&self, id: &SessionId, event: &Event) -> Result<(), StoreError> {
        let path = self.session_dir(id).join("events.jsonl");
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        // Single write syscall for the whole line so a concurrent reader
        // never observes a torn line.
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_all_events(&self, id: &SessionId) -> Result<Vec<Event>, StoreError> {
        let path = self.session_dir(id).join("events.jsonl");
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if content.is_empty() {
            return Ok(Vec::new());
        }

        let ends_complete = content.ends_with('\n');
        let mut lines: Vec<&str> = content.split('\n').collect();
        if lines.last().map(|s| s.is_empty()).unwrap_or(false) {
            lines.pop();
        }
        if !ends_complete && !lines.is_empty() {
            // A trailing partial line means a write was interrupted mid-syscall
            // (or, for this in-process writer, never happens — but a crash
            // between processes could still leave one). Treat as absent.
            warn!(session = %id, "dropping trailing partial line in events.jsonl");
            lines.pop();
        }

        let mut events = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            if line.is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(line)
                .map_err(|e| StoreError::Corrupt(format!("line {}: {e}", idx + 1)))?;
            events.push(event);
        }

        for (idx, event) in events.iter().enumerate() {
            let expected = (idx as i64) + 1;
            if event.seq != expected {
                return Err(StoreError::Corrupt(format!(
                    "seq gap at position {idx}: expected {expected}, found {}",
                    event.seq
                )));
            }
        }

        Ok(events)
    }

    pub async fn read_events_last(
        &self,
        id: &SessionId,
        limit: usize,
        before_seq: Option<i64>,
    ) -> Result<Vec<Event>, StoreError> {
        let _guard = self.lock_for(id).await;
        let all = self.read_all_events(id).await?;
        let filtered: Vec<Event> = match before_seq {
            Some(b) => all.into_iter().filter(|e| e.seq < b).collect(),
            None => all,
        };
        let start = filtered.len().saturating_sub(limit);
        Ok(filtered[start..].to_vec())
    }

    pub async fn read_events_from(
        &self,
        id: &SessionId,
        after_seq: i64,
    ) -> Result<Vec<Event>, StoreError> {
        let _guard = self.lock_for(id).await;
        let all = self.read_all_events(id).await?;
        Ok(all.into_iter().filter(|e| e.seq > after_seq).collect())
    }

    // ── metadata.json / queue.json / action_buttons.json ─────────────────

    pub async fn write_metadata(&self, meta: &Metadata) -> Result<(), StoreError> {
        let _guard = self.lock_for(&meta.session_id).await;
        let path = self.session_dir(&meta.session_id).join("metadata.json");
        atomic_write_json(&path, meta).await
    }

    pub async fn read_metadata(&self, id: &SessionId) -> Result<Metadata, StoreError> {
        let _guard = self.lock_for(id).await;
        let path = self.session_dir(id).join("metadata.json");
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StoreError::NotFound(id.clone()),
                _ => StoreError::Io(e),
            })?;
        serde_json::from_str(&content).map_err(Into::into)
    }

    pub async fn write_queue<T: Serialize>(
        &self,
        id: &SessionId,
        value: &T,
    ) -> Result<(), StoreError> {
        let _guard = self.lock_for(id).await;
        let path = self.session_dir(id).join("queue.json");
        atomic_write_json(&path, value).await
    }

    pub async fn read_queue<T: DeserializeOwned>(
        &self,
        id: &SessionId,
    ) -> Result<Option<T>, StoreError> {
        let _guard = self.lock_for(id).await;
        let path = self.session_dir(id).join("queue.json");
        read_optional_json(&path).await
    }

    pub async fn delete_queue(&self, id: &SessionId) -> Result<(), StoreError> {
        let _guard = self.lock_for(id).await;
        let path = self.session_dir(id).join("queue.json");
        delete_if_present(&path).await
    }

    pub async fn write_action_buttons<T: Serialize>(
        &self,
        id: &SessionId,
        value: &T,
    ) -> Result<(), StoreError> {
        let _guard = self.lock_for(id).await;
        let path = self.session_dir(id).join("action_buttons.json");
        atomic_write_json(&path, value).await
    }

    pub async fn read_action_buttons<T: DeserializeOwned>(
        &self,
        id: &SessionId,
    ) -> Result<Option<T>, StoreError> {
        let _guard = self.lock_for(id).await;
        let path = self.session_dir(id).join("action_buttons.json");
        read_optional_json(&path).await
    }

    pub async fn delete_action_buttons(&self, id: &SessionId) -> Result<(), StoreError> {
        let _guard = self.lock_for(id).await;
        let path = self.session_dir(id).join("action_buttons.json");
        delete_if_present(&path).await
    }
}

async fn read_optional_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn delete_if_present(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// write-to-temp + fsync + rename, so a crash mid-write never leaves a
/// torn metadata/queue/suggestion file behind.
async fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let dir = path.parent().expect("session paths always have a parent");
    fs::create_dir_all(dir).await?;
    let suffix: u32 = rand::thread_rng().gen();
    let file_name = path.file_name().unwrap_or_default().to_string_lossy();
    let tmp_path = dir.join(format!(".{file_name}.tmp.{suffix:08x}"));

    let json = serde_json::to_vec_pretty(value)?;
    {
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
    }
    fs::rename(&tmp_path, path).await.map_err(|e| {
        debug!(?tmp_path, ?path, "atomic rename failed");
        e
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Flags;
    use crate::SessionStatus;

    fn store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (Store::new(dir.path()), dir)
    }

    #[tokio::test]
    async fn append_and_read_events_preserves_order_and_seq() {
        let (store, _dir) = store();
        let id = SessionId::generate();
        store.create_session_dir(&id).await.unwrap();

        store
            .append_event(&id, &Event::user_prompt(1, "c1", "p1", "hi", &[]))
            .await
            .unwrap();
        store
            .append_events(
                &id,
                &[Event::agent_message(2, "<p>a</p>"), Event::session_end(3)],
            )
            .await
            .unwrap();

        let events = store.read_events_from(&id, 0).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn read_events_last_respects_limit_and_before_seq() {
        let (store, _dir) = store();
        let id = SessionId::generate();
        store.create_session_dir(&id).await.unwrap();
        for seq in 1..=5 {
            store
                .append_event(&id, &Event::agent_message(seq, "x"))
                .await
                .unwrap();
        }

        let tail = store.read_events_last(&id, 2, None).await.unwrap();
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);

        let before = store.read_events_last(&id, 10, Some(3)).await.unwrap();
        assert_eq!(before.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn trailing_partial_line_is_treated_as_absent() {
        let (store, dir) = store();
        let id = SessionId::generate();
        store.create_session_dir(&id).await.unwrap();
        store
            .append_event(&id, &Event::agent_message(1, "ok"))
            .await
            .unwrap();

        // Simulate a crash mid-write: append a line with no trailing newline.
        let path = dir.path().join("sessions").join(id.as_str()).join("events.jsonl");
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        use std::io::Write;
        write!(f, "{{\"seq\":2,\"kind\":\"agent_mess").unwrap();

        let events = store.read_events_from(&id, 0).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn seq_gap_is_reported_as_corrupt() {
        let (store, dir) = store();
        let id = SessionId::generate();
        store.create_session_dir(&id).await.unwrap();
        let path = dir.path().join("sessions").join(id.as_str()).join("events.jsonl");
        std::fs::write(
            &path,
            "{\"seq\":1,\"kind\":\"session_start\",\"timestamp\":\"2026-01-01T00:00:00Z\"}\n\
             {\"seq\":3,\"kind\":\"session_end\",\"timestamp\":\"2026-01-01T00:00:01Z\"}\n",
        )
        .unwrap();

        let err = store.read_events_from(&id, 0).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::StoreCorrupt);
    }

    #[tokio::test]
    async fn metadata_round_trips_atomically() {
        let (store, _dir) = store();
        let id = SessionId::generate();
        store.create_session_dir(&id).await.unwrap();
        let mut meta = Metadata::new(id.clone(), "/ws".into(), "claude".into());
        meta.last_seq = 7;
        meta.status = SessionStatus::Completed;
        meta.flags = Flags {
            can_send_prompt: true,
            ..Flags::default()
        };
        store.write_metadata(&meta).await.unwrap();

        let back = store.read_metadata(&id).await.unwrap();
        assert_eq!(back.last_seq, 7);
        assert_eq!(back.status, SessionStatus::Completed);
        assert!(back.flags.can_send_prompt);
    }

    #[tokio::test]
    async fn reading_missing_metadata_is_not_found() {
        let (store, _dir) = store();
        let id = SessionId::generate();
        let err = store.read_metadata(&id).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn queue_file_absent_when_never_written() {
        let (store, _dir) = store();
        let id = SessionId::generate();
        store.create_session_dir(&id).await.unwrap();
        let q: Option<serde_json::Value> = store.read_queue(&id).await.unwrap();
        assert!(q.is_none());
    }

    #[tokio::test]
    async fn queue_round_trips_and_deletes() {
        let (store, _dir) = store();
        let id = SessionId::generate();
        store.create_session_dir(&id).await.unwrap();
        let payload = serde_json::json!({"messages": [{"id": "m1"}]});
        store.write_queue(&id, &payload).await.unwrap();
        let back: Option<serde_json::Value> = store.read_queue(&id).await.unwrap();
        assert_eq!(back.unwrap(), payload);

        store.delete_queue(&id).await.unwrap();
        let gone: Option<serde_json::Value> = store.read_queue(&id).await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn delete_session_removes_directory_and_is_idempotent() {
        let (store, _dir) = store();
        let id = SessionId::generate();
        store.create_session_dir(&id).await.unwrap();
        store
            .append_event(&id, &Event::agent_message(1, "x"))
            .await
            .unwrap();
        assert!(store.session_exists(&id).await);

        store.delete_session(&id).await.unwrap();
        assert!(!store.session_exists(&id).await);

        // Deleting again is a no-op, not an error.
        store.delete_session(&id).await.unwrap();
    }

    #[tokio::test]
    async fn list_session_ids_ignores_non_session_directories() {
        let (store, dir) = store();
        let id = SessionId::generate();
        store.create_session_dir(&id).await.unwrap();
        std::fs::create_dir_all(dir.path().join("sessions").join("not-a-session")).unwrap();

        let ids = store.list_session_ids().await.unwrap();
        assert_eq!(ids, vec![id]);
    }
}
