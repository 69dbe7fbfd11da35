/// The five states a session runtime moves through. A runtime is created
/// in `Idle` and only ever leaves `Stopped` by being dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Idle,
    Prompting,
    Cancelling,
    Stopping,
    Stopped,
}

impl RuntimeState {
    pub fn is_running(&self) -> bool {
        !matches!(self, RuntimeState::Stopping | RuntimeState::Stopped)
    }

    pub fn is_prompting(&self) -> bool {
        matches!(self, RuntimeState::Prompting | RuntimeState::Cancelling)
    }
}

/// Result of [`crate::RuntimeHandle::submit_prompt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Queued { position: usize },
    Rejected { reason: RejectReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    QueueFull,
    /// The workspace's queue is configured with `queue.enabled: false`:
    /// a prompt sent while the agent is busy has nowhere to wait.
    QueueDisabled,
    Stopped,
}
