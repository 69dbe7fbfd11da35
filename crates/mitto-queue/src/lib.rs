//! Per-session FIFO queue of prompts waiting to be sent once a running
//! agent goes idle, with optional background title generation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mitto_store::{SessionId, Store};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

const TITLE_WORKER_CAPACITY: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is empty")]
    Empty,
    #[error("message {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] mitto_store::StoreError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub text: String,
    pub image_ids: Vec<String>,
    pub queued_at: DateTime<Utc>,
    pub client_id: Option<String>,
    pub title: Option<String>,
}

impl QueuedMessage {
    fn new(text: String, image_ids: Vec<String>, client_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text,
            image_ids,
            queued_at: Utc::now(),
            client_id,
            title: None,
        }
    }
}

/// Fired after every mutation that persisted successfully, so a caller
/// (the session runtime) can mirror it to observers without this crate
/// knowing about event or observer types.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Added(QueuedMessage),
    Removed(String),
    Popped(QueuedMessage),
    Cleared,
    Titled { message_id: String, title: String },
}

/// Generates a short title for a queued message's text. Implemented by
/// the caller against whatever auxiliary agent it wants to use; this
/// crate only knows how to call it with a timeout and persist the
/// result.
#[async_trait::async_trait]
pub trait TitleGenerator: Send + Sync {
    async fn generate(&self, text: &str) -> anyhow::Result<String>;
}

struct TitleRequest {
    message_id: String,
    text: String,
}

pub struct Queue {
    store: Arc<Store>,
    session_id: SessionId,
    max_size: usize,
    inner: Mutex<Vec<QueuedMessage>>,
    title_tx: Option<mpsc::Sender<TitleRequest>>,
    on_change: Option<Arc<dyn Fn(QueueEvent) + Send + Sync>>,
}

impl Queue {
    /// Load a session's persisted queue (if any) and, optionally, spawn
    /// a single background worker that generates titles for newly added
    /// messages.
    pub async fn spawn(
        store: Arc<Store>,
        session_id: SessionId,
        max_size: usize,
        titles: Option<(Arc<dyn TitleGenerator>, Duration)>,
        on_change: Option<Arc<dyn Fn(QueueEvent) + Send + Sync>>,
    ) -> Result<Arc<Self>, QueueError> {
        let existing: Vec<QueuedMessage> =
            store.read_queue(&session_id).await?.unwrap_or_default();

        let channel = titles.is_some().then(|| mpsc::channel(TITLE_WORKER_CAPACITY));
        let title_tx = channel.as_ref().map(|(tx, _)| tx.clone());

        let queue = Arc::new(Self {
            store,
            session_id,
            max_size,
            inner: Mutex::new(existing),
            title_tx,
            on_change,
        });

        if let (Some((generator, timeout)), Some((_, rx))) = (titles, channel) {
            let worker_queue = Arc::clone(&queue);
            tokio::spawn(run_title_worker(worker_queue, generator, timeout, rx));
        }

        Ok(queue)
    }

    async fn persist(&self, guard: &[QueuedMessage]) -> Result<(), QueueError> {
        if guard.is_empty() {
            self.store.delete_queue(&self.session_id).await?;
        } else {
            self.store.write_queue(&self.session_id, &guard).await?;
        }
        Ok(())
    }

    fn notify(&self, event: QueueEvent) {
        if let Some(cb) = &self.on_change {
            cb(event);
        }
    }

    pub async fn add(
        &self,
        text: String,
        image_ids: Vec<String>,
        client_id: Option<String>,
    ) -> Result<QueuedMessage, QueueError> {
        let msg = {
            let mut guard = self.inner.lock().await;
            if guard.len() >= self.max_size {
                return Err(QueueError::Full);
            }
            let msg = QueuedMessage::new(text, image_ids, client_id);
            guard.push(msg.clone());
            self.persist(&guard).await?;
            msg
        };

        if let Some(tx) = &self.title_tx {
            let req = TitleRequest {
                message_id: msg.id.clone(),
                text: msg.text.clone(),
            };
            if tx.try_send(req).is_err() {
                tracing::warn!(
                    message_id = %msg.id,
                    "title worker channel full or closed, dropping title request"
                );
            }
        }

        self.notify(QueueEvent::Added(msg.clone()));
        Ok(msg)
    }

    pub async fn list(&self) -> Vec<QueuedMessage> {
        self.inner.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<QueuedMessage> {
        self.inner.lock().await.iter().find(|m| m.id == id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Result<QueuedMessage, QueueError> {
        let removed = {
            let mut guard = self.inner.lock().await;
            let pos = guard
                .iter()
                .position(|m| m.id == id)
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            let removed = guard.remove(pos);
            self.persist(&guard).await?;
            removed
        };
        self.notify(QueueEvent::Removed(removed.id.clone()));
        Ok(removed)
    }

    /// Remove and return the head of the queue.
    pub async fn pop(&self) -> Result<QueuedMessage, QueueError> {
        let popped = {
            let mut guard = self.inner.lock().await;
            if guard.is_empty() {
                return Err(QueueError::Empty);
            }
            let popped = guard.remove(0);
            self.persist(&guard).await?;
            popped
        };
        self.notify(QueueEvent::Popped(popped.clone()));
        Ok(popped)
    }

    pub async fn clear(&self) -> Result<(), QueueError> {
        {
            let mut guard = self.inner.lock().await;
            guard.clear();
            self.persist(&guard).await?;
        }
        self.notify(QueueEvent::Cleared);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn update_title(&self, id: &str, title: String) -> Result<(), QueueError> {
        {
            let mut guard = self.inner.lock().await;
            let msg = guard
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            msg.title = Some(title.clone());
            self.persist(&guard).await?;
        }
        self.notify(QueueEvent::Titled {
            message_id: id.to_string(),
            title,
        });
        Ok(())
    }
}

async fn run_title_worker(
    queue: Arc<Queue>,
    generator: Arc<dyn TitleGenerator>,
    timeout: Duration,
    mut rx: mpsc::Receiver<TitleRequest>,
) {
    while let Some(req) = rx.recv().await {
        match tokio::time::timeout(timeout, generator.generate(&req.text)).await {
            Ok(Ok(title)) => {
                if let Err(err) = queue.update_title(&req.message_id, title).await {
                    tracing::warn!(
                        message_id = %req.message_id,
                        error = %err,
                        "failed to persist generated title, item stays without one"
                    );
                }
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    message_id = %req.message_id,
                    error = %err,
                    "title generation failed, item stays without one"
                );
            }
            Err(_) => {
                tracing::warn!(message_id = %req.message_id, "title generation timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mitto_store::SessionId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn session(store: &Arc<Store>) -> SessionId {
        let id = SessionId::generate();
        store.create_session_dir(&id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn add_respects_max_size_and_reports_full() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path()));
        let id = session(&store).await;
        let q = Queue::spawn(Arc::clone(&store), id, 2, None, None).await.unwrap();

        q.add("one".into(), vec![], None).await.unwrap();
        q.add("two".into(), vec![], None).await.unwrap();
        let err = q.add("three".into(), vec![], None).await.unwrap_err();
        assert!(matches!(err, QueueError::Full));
        assert_eq!(q.len().await, 2);
    }

    #[tokio::test]
    async fn pop_returns_fifo_order_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path()));
        let id = session(&store).await;
        let q = Queue::spawn(Arc::clone(&store), id.clone(), 10, None, None)
            .await
            .unwrap();

        q.add("first".into(), vec![], None).await.unwrap();
        q.add("second".into(), vec![], None).await.unwrap();

        let popped = q.pop().await.unwrap();
        assert_eq!(popped.text, "first");
        assert_eq!(q.len().await, 1);

        // A freshly-loaded queue sees the persisted state.
        let reloaded = Queue::spawn(store, id, 10, None, None).await.unwrap();
        assert_eq!(reloaded.len().await, 1);
        assert_eq!(reloaded.list().await[0].text, "second");
    }

    #[tokio::test]
    async fn pop_on_empty_queue_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path()));
        let id = session(&store).await;
        let q = Queue::spawn(store, id, 10, None, None).await.unwrap();
        assert!(matches!(q.pop().await.unwrap_err(), QueueError::Empty));
    }

    #[tokio::test]
    async fn remove_unknown_id_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path()));
        let id = session(&store).await;
        let q = Queue::spawn(store, id, 10, None, None).await.unwrap();
        assert!(matches!(
            q.remove("nope").await.unwrap_err(),
            QueueError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn clear_empties_queue_and_deletes_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path()));
        let id = session(&store).await;
        let q = Queue::spawn(Arc::clone(&store), id.clone(), 10, None, None)
            .await
            .unwrap();
        q.add("a".into(), vec![], None).await.unwrap();
        q.clear().await.unwrap();
        assert_eq!(q.len().await, 0);
        let fresh = Queue::spawn(store, id, 10, None, None).await.unwrap();
        assert_eq!(fresh.len().await, 0);
    }

    #[tokio::test]
    async fn on_change_callback_fires_for_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path()));
        let id = session(&store).await;
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let q = Queue::spawn(
            store,
            id,
            10,
            None,
            Some(Arc::new(move |_event| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .await
        .unwrap();
        q.add("a".into(), vec![], None).await.unwrap();
        q.pop().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    struct StubGenerator;

    #[async_trait::async_trait]
    impl TitleGenerator for StubGenerator {
        async fn generate(&self, text: &str) -> anyhow::Result<String> {
            Ok(format!("Re: {}", &text[..text.len().min(8)]))
        }
    }

    #[tokio::test]
    async fn title_worker_updates_message_after_add() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path()));
        let id = session(&store).await;
        let q = Queue::spawn(
            store,
            id,
            10,
            Some((Arc::new(StubGenerator), Duration::from_secs(5))),
            None,
        )
        .await
        .unwrap();

        let msg = q.add("please fix the bug".into(), vec![], None).await.unwrap();
        assert!(msg.title.is_none());

        for _ in 0..50 {
            if q.get(&msg.id).await.unwrap().title.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(q.get(&msg.id).await.unwrap().title.is_some());
    }
}
