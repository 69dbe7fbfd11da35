//! In-process stand-in for [`AcpAdapter`], used by higher-level crates'
//! tests so they can exercise the runtime without spawning a real agent
//! subprocess.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{AcpAdapter, AcpError, AcpUpdate, StopReasonKind};

pub struct MockTurn {
    pub updates: Vec<AcpUpdate>,
    pub stop: StopReasonKind,
}

impl MockTurn {
    pub fn text(chunks: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            updates: chunks
                .into_iter()
                .map(|c| AcpUpdate::AgentMessageChunk(c.to_string()))
                .collect(),
            stop: StopReasonKind::EndTurn,
        }
    }
}

/// Scripted agent: each call to [`AcpAdapter::prompt`] consumes the next
/// queued [`MockTurn`], or falls back to echoing the prompt text back as
/// a single chunk if the queue is empty.
pub struct MockAdapter {
    turns: Mutex<VecDeque<MockTurn>>,
    cancelled: Arc<AtomicBool>,
}

impl MockAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(VecDeque::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn push_turn(&self, turn: MockTurn) {
        self.turns.lock().unwrap().push_back(turn);
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self {
            turns: Mutex::new(VecDeque::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl AcpAdapter for MockAdapter {
    async fn prompt(
        &self,
        text: String,
        _image_ids: Vec<String>,
    ) -> Result<mpsc::Receiver<AcpUpdate>, AcpError> {
        let (tx, rx) = mpsc::channel(64);
        let turn = self.turns.lock().unwrap().pop_front();
        let cancelled = Arc::clone(&self.cancelled);
        cancelled.store(false, Ordering::SeqCst);

        tokio::spawn(async move {
            let turn = turn.unwrap_or_else(|| MockTurn {
                updates: vec![AcpUpdate::AgentMessageChunk(format!("echo: {text}"))],
                stop: StopReasonKind::EndTurn,
            });
            for update in turn.updates {
                if cancelled.load(Ordering::SeqCst) {
                    let _ = tx.send(AcpUpdate::Done(StopReasonKind::Cancelled)).await;
                    return;
                }
                if tx.send(update).await.is_err() {
                    return;
                }
            }
            let stop = if cancelled.load(Ordering::SeqCst) {
                StopReasonKind::Cancelled
            } else {
                turn.stop
            };
            let _ = tx.send(AcpUpdate::Done(stop)).await;
        });

        Ok(rx)
    }

    async fn cancel(&self) -> Result<(), AcpError> {
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn answer_permission(&self, _request_id: String, _selection: String) -> Result<(), AcpError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), AcpError> {
        Ok(())
    }
}
