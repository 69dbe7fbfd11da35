use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::ServerEvent;

/// A client currently watching one session. The runtime owns a list of
/// these and fans every event out to each, deduplicating by sequence
/// number so a client that double-registers (or races a reload against a
/// live stream) never sees the same event twice.
#[async_trait]
pub trait Observer: Send + Sync {
    /// Deliver one event. An error unregisters the observer; the runtime
    /// treats a closed transport the same as an explicit `unregister`.
    async fn send(&self, event: ServerEvent) -> Result<(), ObserverError>;
}

#[derive(Debug, thiserror::Error)]
#[error("observer transport closed")]
pub struct ObserverError;

/// Wraps an [`Observer`] with the sequence bookkeeping the runtime needs
/// to dedupe against. `last_sent_seq` starts at whatever the observer
/// already saw from a prior `load_events` call (0 for a brand new one).
pub(crate) struct ObserverSlot {
    pub id: u64,
    observer: Arc<dyn Observer>,
    last_sent_seq: AtomicI64,
}

impl ObserverSlot {
    pub fn new(id: u64, observer: Arc<dyn Observer>, loaded_last_seq: i64) -> Self {
        Self {
            id,
            observer,
            last_sent_seq: AtomicI64::new(loaded_last_seq),
        }
    }

    /// Apply the dedup rule and deliver if it passes. Returns `false` if
    /// the send failed and the slot should be dropped.
    pub async fn dispatch(&self, event: &ServerEvent) -> bool {
        match event.seq() {
            None => self.observer.send(event.clone()).await.is_ok(),
            Some(seq) => {
                let last = self.last_sent_seq.load(Ordering::SeqCst);
                let same_message_continuation = event.is_coalescing() && seq == last;
                if same_message_continuation {
                    self.observer.send(event.clone()).await.is_ok()
                } else if seq > last {
                    self.last_sent_seq.store(seq, Ordering::SeqCst);
                    self.observer.send(event.clone()).await.is_ok()
                } else {
                    true // already sent, silently dropped
                }
            }
        }
    }

    /// After a fresh registration replays the buffered tail and persisted
    /// backlog, bump the watermark so the live stream doesn't re-deliver
    /// anything the replay already covered.
    pub fn advance_to(&self, seq: i64) {
        let last = self.last_sent_seq.load(Ordering::SeqCst);
        if seq > last {
            self.last_sent_seq.store(seq, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<ServerEvent>>);

    #[async_trait]
    impl Observer for Recorder {
        async fn send(&self, event: ServerEvent) -> Result<(), ObserverError> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn message(seq: i64, html: &str) -> ServerEvent {
        ServerEvent::AgentMessage { seq, html: html.to_string() }
    }

    #[tokio::test]
    async fn lower_or_equal_seq_is_dropped() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let slot = ObserverSlot::new(1, recorder.clone(), 0);

        assert!(slot.dispatch(&message(3, "a")).await);
        assert!(slot.dispatch(&message(2, "stale")).await);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_seq_continuation_of_coalescing_kind_is_allowed() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let slot = ObserverSlot::new(1, recorder.clone(), 0);

        slot.dispatch(&message(5, "partial")).await;
        slot.dispatch(&message(5, "partial more")).await;
        assert_eq!(recorder.0.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn events_without_seq_always_deliver() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let slot = ObserverSlot::new(1, recorder.clone(), 100);

        let event = ServerEvent::Permission {
            seq: 5,
            request_id: "p1".into(),
            title: "allow?".into(),
            options: serde_json::json!([]),
        };
        slot.dispatch(&event).await;
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn advance_to_suppresses_replayed_range() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let slot = ObserverSlot::new(1, recorder.clone(), 0);
        slot.advance_to(10);

        slot.dispatch(&message(7, "old")).await;
        assert!(recorder.0.lock().unwrap().is_empty());
        slot.dispatch(&message(11, "new")).await;
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }
}
