use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mitto_acp::{AcpAdapter, AcpUpdate, StopReasonKind};
use mitto_buffer::{BufferConfig, Emission, StreamBuffer};
use mitto_store::{Event, EventKind, Flags, SessionId, Store};
use tokio::sync::{mpsc, oneshot};

use crate::observer::{Observer, ObserverSlot};
use crate::state::{RejectReason, RuntimeState, SubmitOutcome};
use crate::{ActionButton, LoadEventsResult, RunningStatus, RuntimeError, ServerEvent, SuggestionGenerator};

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub queue_max_size: usize,
    pub queue_enabled: bool,
    pub permission_timeout: Duration,
    pub auto_drain_delay: Duration,
    pub buffer: BufferConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_max_size: 50,
            queue_enabled: true,
            permission_timeout: Duration::from_secs(300),
            auto_drain_delay: Duration::from_secs(3),
            buffer: BufferConfig::default(),
        }
    }
}

enum Command {
    SubmitPrompt {
        text: String,
        image_ids: Vec<String>,
        client_id: String,
        prompt_id: String,
        reply: oneshot::Sender<Result<SubmitOutcome, RuntimeError>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
    AddObserver {
        observer: Arc<dyn Observer>,
        loaded_last_seq: i64,
        reply: oneshot::Sender<u64>,
    },
    RemoveObserver {
        id: u64,
    },
    AnswerPermission {
        request_id: String,
        selection: String,
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
    LoadEvents {
        limit: usize,
        before_seq: Option<i64>,
        after_seq: Option<i64>,
        reply: oneshot::Sender<Result<LoadEventsResult, RuntimeError>>,
    },
    GetStatus {
        reply: oneshot::Sender<RunningStatus>,
    },
    SetFlags {
        flags: Flags,
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
    GetFlags {
        reply: oneshot::Sender<Flags>,
    },
    SetUserData {
        key: String,
        value: String,
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Internal(InternalEvent),
}

enum InternalEvent {
    Queue(mitto_queue::QueueEvent),
    Suggestions(Vec<ActionButton>),
}

/// Cheap-to-clone front door to a live session. Every call round-trips
/// through the owning [`Runtime`] task over an internal channel, so two
/// handles calling concurrently never race each other's state.
#[derive(Clone)]
pub struct RuntimeHandle {
    cmd_tx: mpsc::Sender<Command>,
    session_id: SessionId,
}

impl RuntimeHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub async fn submit_prompt(
        &self,
        text: String,
        image_ids: Vec<String>,
        client_id: String,
        prompt_id: String,
    ) -> Result<SubmitOutcome, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SubmitPrompt { text, image_ids, client_id, prompt_id, reply })
            .await
            .map_err(|_| RuntimeError::Stopped)?;
        rx.await.map_err(|_| RuntimeError::Stopped)?
    }

    pub async fn cancel(&self) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Cancel { reply })
            .await
            .map_err(|_| RuntimeError::Stopped)?;
        rx.await.map_err(|_| RuntimeError::Stopped)?
    }

    /// Register a new observer. The returned handle must be kept (or its
    /// `id` remembered) to unregister later; dropping it without calling
    /// [`ObserverHandle::unregister`] leaves the observer registered until
    /// its `send` starts failing.
    pub async fn add_observer(
        &self,
        observer: Arc<dyn Observer>,
        loaded_last_seq: i64,
    ) -> Result<ObserverHandle, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AddObserver { observer, loaded_last_seq, reply })
            .await
            .map_err(|_| RuntimeError::Stopped)?;
        let id = rx.await.map_err(|_| RuntimeError::Stopped)?;
        Ok(ObserverHandle { id, cmd_tx: self.cmd_tx.clone() })
    }

    pub async fn answer_permission(
        &self,
        request_id: String,
        selection: String,
    ) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AnswerPermission { request_id, selection, reply })
            .await
            .map_err(|_| RuntimeError::Stopped)?;
        rx.await.map_err(|_| RuntimeError::Stopped)?
    }

    pub async fn load_events(
        &self,
        limit: usize,
        before_seq: Option<i64>,
        after_seq: Option<i64>,
    ) -> Result<LoadEventsResult, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::LoadEvents { limit, before_seq, after_seq, reply })
            .await
            .map_err(|_| RuntimeError::Stopped)?;
        rx.await.map_err(|_| RuntimeError::Stopped)?
    }

    pub async fn get_running_status(&self) -> Result<RunningStatus, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::GetStatus { reply })
            .await
            .map_err(|_| RuntimeError::Stopped)?;
        rx.await.map_err(|_| RuntimeError::Stopped)
    }

    pub async fn set_flags(&self, flags: Flags) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SetFlags { flags, reply })
            .await
            .map_err(|_| RuntimeError::Stopped)?;
        rx.await.map_err(|_| RuntimeError::Stopped)?
    }

    pub async fn get_flags(&self) -> Result<Flags, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::GetFlags { reply })
            .await
            .map_err(|_| RuntimeError::Stopped)?;
        rx.await.map_err(|_| RuntimeError::Stopped)
    }

    pub async fn set_user_data(&self, key: String, value: String) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SetUserData { key, value, reply })
            .await
            .map_err(|_| RuntimeError::Stopped)?;
        rx.await.map_err(|_| RuntimeError::Stopped)?
    }

    pub async fn stop(&self) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Stop { reply })
            .await
            .map_err(|_| RuntimeError::Stopped)?;
        rx.await.map_err(|_| RuntimeError::Stopped)
    }
}

pub struct ObserverHandle {
    id: u64,
    cmd_tx: mpsc::Sender<Command>,
}

impl ObserverHandle {
    pub async fn unregister(self) {
        let _ = self.cmd_tx.send(Command::RemoveObserver { id: self.id }).await;
    }
}

/// Owns one session's agent connection, buffering, queue, and observer
/// list. Lives entirely inside the task spawned by [`Runtime::spawn`];
/// every other crate talks to it only through [`RuntimeHandle`].
pub struct Runtime {
    store: Arc<Store>,
    session_id: SessionId,
    adapter: Arc<dyn AcpAdapter>,
    queue: Arc<mitto_queue::Queue>,
    queue_enabled: bool,
    metadata: mitto_store::Metadata,

    state: RuntimeState,
    seq_counter: i64,

    message_buffer: StreamBuffer,
    thought_buffer: StreamBuffer,
    message_seq: Option<i64>,
    thought_seq: Option<i64>,
    in_flight: Vec<Event>,
    current_updates: Option<mpsc::Receiver<AcpUpdate>>,

    observers: Vec<Arc<ObserverSlot>>,
    next_observer_id: u64,

    pending_permissions: HashMap<String, Instant>,
    permission_timeout: Duration,

    auto_drain_delay: Duration,
    drain_at: Option<Instant>,

    action_buttons: Vec<ActionButton>,
    last_agent_message: Option<String>,
    suggestion_generator: Option<Arc<dyn SuggestionGenerator>>,

    cmd_rx: mpsc::Receiver<Command>,
    self_tx: mpsc::Sender<Command>,
}

impl Runtime {
    pub async fn spawn(
        store: Arc<Store>,
        session_id: SessionId,
        adapter: Arc<dyn AcpAdapter>,
        config: RuntimeConfig,
        title_generator: Option<(Arc<dyn mitto_queue::TitleGenerator>, Duration)>,
        suggestion_generator: Option<Arc<dyn SuggestionGenerator>>,
    ) -> Result<RuntimeHandle, RuntimeError> {
        let metadata = store.read_metadata(&session_id).await?;
        let action_buttons: Vec<ActionButton> =
            store.read_action_buttons(&session_id).await?.unwrap_or_default();

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let queue_cmd_tx = cmd_tx.clone();
        let on_change: Arc<dyn Fn(mitto_queue::QueueEvent) + Send + Sync> =
            Arc::new(move |event| {
                let _ = queue_cmd_tx.try_send(Command::Internal(InternalEvent::Queue(event)));
            });
        let queue = mitto_queue::Queue::spawn(
            Arc::clone(&store),
            session_id.clone(),
            config.queue_max_size,
            title_generator,
            Some(on_change),
        )
        .await?;

        let runtime = Runtime {
            seq_counter: metadata.last_seq,
            store,
            session_id: session_id.clone(),
            adapter,
            queue,
            queue_enabled: config.queue_enabled,
            metadata,
            state: RuntimeState::Idle,
            message_buffer: StreamBuffer::new(config.buffer),
            thought_buffer: StreamBuffer::new(config.buffer),
            message_seq: None,
            thought_seq: None,
            in_flight: Vec::new(),
            current_updates: None,
            observers: Vec::new(),
            next_observer_id: 1,
            pending_permissions: HashMap::new(),
            permission_timeout: config.permission_timeout,
            auto_drain_delay: config.auto_drain_delay,
            drain_at: None,
            action_buttons,
            last_agent_message: None,
            suggestion_generator,
            cmd_rx,
            self_tx: cmd_tx.clone(),
        };

        tokio::spawn(runtime.run());

        Ok(RuntimeHandle { cmd_tx, session_id })
    }

    async fn run(mut self) {
        if self.queue.len().await > 0 {
            self.drain_at = Some(Instant::now());
        }

        let mut tick = tokio::time::interval(Duration::from_millis(50));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                update = recv_or_pending(&mut self.current_updates) => {
                    match update {
                        Some(update) => self.handle_acp_update(update).await,
                        None => self.handle_acp_channel_closed().await,
                    }
                }
                _ = tick.tick() => {
                    self.handle_tick().await;
                }
            }
            if self.state == RuntimeState::Stopped {
                break;
            }
        }
        let _ = self.adapter.close().await;
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SubmitPrompt { text, image_ids, client_id, prompt_id, reply } => {
                let result = self.try_submit(text, image_ids, client_id, prompt_id).await;
                let _ = reply.send(result);
            }
            Command::Cancel { reply } => {
                let result = self.handle_cancel().await;
                let _ = reply.send(result);
            }
            Command::AddObserver { observer, loaded_last_seq, reply } => {
                self.handle_add_observer(observer, loaded_last_seq, reply).await;
            }
            Command::RemoveObserver { id } => {
                self.observers.retain(|s| s.id != id);
            }
            Command::AnswerPermission { request_id, selection, reply } => {
                let result = self.handle_answer_permission(request_id, selection).await;
                let _ = reply.send(result);
            }
            Command::LoadEvents { limit, before_seq, after_seq, reply } => {
                let result = self.handle_load_events(limit, before_seq, after_seq).await;
                let _ = reply.send(result);
            }
            Command::GetStatus { reply } => {
                let status = self.status().await;
                let _ = reply.send(status);
            }
            Command::SetFlags { flags, reply } => {
                self.metadata.flags = flags;
                self.metadata.touch();
                let result = self.store.write_metadata(&self.metadata).await.map_err(Into::into);
                let _ = reply.send(result);
            }
            Command::GetFlags { reply } => {
                let _ = reply.send(self.metadata.flags);
            }
            Command::SetUserData { key, value, reply } => {
                self.metadata.user_data.insert(key, value);
                self.metadata.touch();
                let result = self.store.write_metadata(&self.metadata).await.map_err(Into::into);
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                if matches!(self.state, RuntimeState::Prompting | RuntimeState::Cancelling) {
                    let _ = self.adapter.cancel().await;
                }
                self.state = RuntimeState::Stopping;
                self.flush_and_persist_buffers().await;
                let _ = self.adapter.close().await;
                self.state = RuntimeState::Stopped;
                let _ = reply.send(());
            }
            Command::Internal(event) => {
                self.handle_internal(event).await;
            }
        }
    }

    async fn try_submit(
        &mut self,
        text: String,
        image_ids: Vec<String>,
        client_id: String,
        prompt_id: String,
    ) -> Result<SubmitOutcome, RuntimeError> {
        match self.state {
            RuntimeState::Idle => {
                self.accept_and_start(text, image_ids, client_id, prompt_id).await?;
                Ok(SubmitOutcome::Accepted)
            }
            RuntimeState::Prompting | RuntimeState::Cancelling => {
                if !self.queue_enabled {
                    return Ok(SubmitOutcome::Rejected { reason: RejectReason::QueueDisabled });
                }
                match self.queue.add(text, image_ids, Some(client_id)).await {
                    Ok(_) => Ok(SubmitOutcome::Queued { position: self.queue.len().await }),
                    Err(mitto_queue::QueueError::Full) => {
                        Ok(SubmitOutcome::Rejected { reason: RejectReason::QueueFull })
                    }
                    Err(e) => Err(e.into()),
                }
            }
            RuntimeState::Stopping | RuntimeState::Stopped => {
                Ok(SubmitOutcome::Rejected { reason: RejectReason::Stopped })
            }
        }
    }

    async fn accept_and_start(
        &mut self,
        text: String,
        image_ids: Vec<String>,
        client_id: String,
        prompt_id: String,
    ) -> Result<(), RuntimeError> {
        self.clear_action_buttons().await;
        let seq = self.next_seq();
        let event = Event::user_prompt(seq, &client_id, &prompt_id, &text, &image_ids);
        self.store.append_event(&self.session_id, &event).await?;
        self.metadata.last_seq = seq;
        self.metadata.touch();
        let _ = self.store.write_metadata(&self.metadata).await;
        self.broadcast(ServerEvent::UserPrompt {
            seq,
            sender_id: client_id,
            prompt_id,
            text: text.clone(),
            image_ids: image_ids.clone(),
        })
        .await;
        self.start_prompt(text, image_ids).await
    }

    async fn start_prompt(&mut self, text: String, image_ids: Vec<String>) -> Result<(), RuntimeError> {
        match self.adapter.prompt(text, image_ids).await {
            Ok(rx) => {
                self.current_updates = Some(rx);
                self.state = RuntimeState::Prompting;
                Ok(())
            }
            Err(e) => {
                self.record_agent_error(&e.to_string()).await;
                Err(e.into())
            }
        }
    }

    async fn handle_cancel(&mut self) -> Result<(), RuntimeError> {
        if self.state == RuntimeState::Prompting {
            self.state = RuntimeState::Cancelling;
            self.adapter.cancel().await?;
        }
        Ok(())
    }

    async fn handle_acp_update(&mut self, update: AcpUpdate) {
        match update {
            AcpUpdate::AgentMessageChunk(text) => {
                let seq = self.take_or_assign_seq(true);
                let emissions = self.message_buffer.write(seq, &text);
                self.handle_emissions(emissions, true).await;
            }
            AcpUpdate::AgentThoughtChunk(text) => {
                let seq = self.take_or_assign_seq(false);
                let emissions = self.thought_buffer.write(seq, &text);
                self.handle_emissions(emissions, false).await;
            }
            AcpUpdate::ToolCall { id, title, status } => {
                let seq = self.next_seq();
                let event = Event::tool_call(seq, &id, &title, &status);
                let emissions = self.message_buffer.submit_discrete(event);
                self.handle_emissions(emissions, true).await;
            }
            AcpUpdate::ToolCallUpdate { id, status } => {
                let seq = self.next_seq();
                let event = Event::tool_call_update(seq, &id, &status);
                let emissions = self.message_buffer.submit_discrete(event);
                self.handle_emissions(emissions, true).await;
            }
            AcpUpdate::Plan(steps) => {
                let seq = self.next_seq();
                let event = Event::plan(seq, steps);
                let emissions = self.message_buffer.submit_discrete(event);
                self.handle_emissions(emissions, true).await;
            }
            AcpUpdate::Permission { request_id, title, options } => {
                self.handle_permission(request_id, title, options).await;
            }
            AcpUpdate::Done(stop) => {
                self.finish_prompt(stop).await;
            }
        }
    }

    async fn handle_acp_channel_closed(&mut self) {
        self.current_updates = None;
        if matches!(self.state, RuntimeState::Prompting | RuntimeState::Cancelling) {
            self.record_agent_error("agent connection closed unexpectedly").await;
            self.schedule_auto_drain();
        }
    }

    fn take_or_assign_seq(&mut self, is_message: bool) -> i64 {
        let slot = if is_message { &mut self.message_seq } else { &mut self.thought_seq };
        if let Some(seq) = *slot {
            seq
        } else {
            self.seq_counter += 1;
            *slot = Some(self.seq_counter);
            self.seq_counter
        }
    }

    fn next_seq(&mut self) -> i64 {
        self.seq_counter += 1;
        self.seq_counter
    }

    async fn handle_emissions(&mut self, emissions: Vec<Emission>, is_message: bool) {
        for emission in emissions {
            self.handle_emission(emission, is_message).await;
        }
    }

    async fn handle_emission(&mut self, emission: Emission, is_message: bool) {
        match emission {
            Emission::Text { seq, html } => {
                if is_message {
                    self.message_seq = None;
                    self.last_agent_message = Some(html.clone());
                    let event = Event::agent_message(seq, &html);
                    self.in_flight.push(event);
                    self.broadcast(ServerEvent::AgentMessage { seq, html }).await;
                } else {
                    self.thought_seq = None;
                    let event = Event::agent_thought(seq, &html);
                    self.in_flight.push(event);
                    self.broadcast(ServerEvent::AgentThought { seq, text: html }).await;
                }
            }
            Emission::Discrete(event) => {
                let server_event = event_to_server_event(&event);
                self.in_flight.push(event);
                self.broadcast(server_event).await;
            }
        }
    }

    async fn handle_permission(&mut self, request_id: String, title: String, options: serde_json::Value) {
        let seq = self.next_seq();
        let event = Event::permission(seq, &request_id, &title, options.clone());
        self.in_flight.push(event);
        self.pending_permissions.insert(request_id.clone(), Instant::now() + self.permission_timeout);
        self.broadcast(ServerEvent::Permission { seq, request_id, title, options }).await;
    }

    async fn handle_answer_permission(
        &mut self,
        request_id: String,
        selection: String,
    ) -> Result<(), RuntimeError> {
        if self.pending_permissions.remove(&request_id).is_none() {
            return Ok(());
        }
        self.adapter.answer_permission(request_id, selection).await?;
        Ok(())
    }

    async fn finish_prompt(&mut self, _stop: StopReasonKind) {
        self.flush_and_persist_buffers().await;

        self.current_updates = None;
        self.state = RuntimeState::Idle;

        self.broadcast(ServerEvent::PromptComplete { event_count: self.seq_counter }).await;

        self.schedule_auto_drain();
        self.spawn_suggestion_task();
    }

    /// Flushes both stream buffers into `in_flight` and persists the
    /// resulting batch plus metadata. Shared by `finish_prompt` and
    /// `Command::Stop` so a stop mid-prompt doesn't drop whatever the
    /// agent already streamed but hadn't reached a markdown boundary on.
    async fn flush_and_persist_buffers(&mut self) {
        let emissions = self.message_buffer.flush();
        self.handle_emissions(emissions, true).await;
        let emissions = self.thought_buffer.flush();
        self.handle_emissions(emissions, false).await;
        self.message_seq = None;
        self.thought_seq = None;

        let batch = std::mem::take(&mut self.in_flight);
        if !batch.is_empty() {
            if let Err(e) = self.store.append_events(&self.session_id, &batch).await {
                tracing::error!(session = %self.session_id, error = %e, "failed to persist prompt batch");
            }
        }

        self.metadata.last_seq = self.seq_counter;
        self.metadata.touch();
        if let Err(e) = self.store.write_metadata(&self.metadata).await {
            tracing::error!(session = %self.session_id, error = %e, "failed to persist metadata");
        }
    }

    async fn record_agent_error(&mut self, message: &str) {
        let seq = self.next_seq();
        let event = Event::error(seq, message, None);
        if let Err(e) = self.store.append_event(&self.session_id, &event).await {
            tracing::error!(session = %self.session_id, error = %e, "failed to persist error event");
        }
        self.metadata.last_seq = seq;
        self.metadata.touch();
        let _ = self.store.write_metadata(&self.metadata).await;
        self.broadcast(ServerEvent::Error { seq, message: message.to_string() }).await;
        self.current_updates = None;
        self.state = RuntimeState::Idle;
    }

    async fn clear_action_buttons(&mut self) {
        if self.action_buttons.is_empty() {
            return;
        }
        self.action_buttons.clear();
        let _ = self.store.delete_action_buttons(&self.session_id).await;
        self.broadcast(ServerEvent::ActionButtons { buttons: Vec::new() }).await;
    }

    fn schedule_auto_drain(&mut self) {
        self.drain_at = Some(Instant::now() + self.auto_drain_delay);
    }

    fn spawn_suggestion_task(&self) {
        let Some(generator) = self.suggestion_generator.clone() else { return };
        let Some(last_message) = self.last_agent_message.clone() else { return };
        let cmd_tx = self.self_tx.clone();
        tokio::spawn(async move {
            match generator.suggest(&last_message).await {
                Ok(buttons) if !buttons.is_empty() => {
                    let _ = cmd_tx.send(Command::Internal(InternalEvent::Suggestions(buttons))).await;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "follow-up suggestion generation failed"),
            }
        });
    }

    async fn handle_tick(&mut self) {
        let now = Instant::now();
        if matches!(self.state, RuntimeState::Prompting | RuntimeState::Cancelling) {
            let emissions = self.message_buffer.check_idle(now);
            self.handle_emissions(emissions, true).await;
            let emissions = self.thought_buffer.check_idle(now);
            self.handle_emissions(emissions, false).await;
        }
        self.expire_permissions(now).await;
        self.maybe_auto_drain().await;
    }

    async fn expire_permissions(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .pending_permissions
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.pending_permissions.remove(&id);
            let _ = self.adapter.answer_permission(id, "cancelled".to_string()).await;
        }
    }

    async fn maybe_auto_drain(&mut self) {
        let Some(at) = self.drain_at else { return };
        if Instant::now() < at {
            return;
        }
        self.drain_at = None;
        if self.state != RuntimeState::Idle {
            return;
        }
        match self.queue.pop().await {
            Ok(msg) => {
                let client_id = msg.client_id.unwrap_or_else(|| "queue".to_string());
                let prompt_id = uuid::Uuid::new_v4().to_string();
                if let Err(e) = self.accept_and_start(msg.text, msg.image_ids, client_id, prompt_id).await {
                    tracing::warn!(session = %self.session_id, error = %e, "auto-drain failed to start prompt");
                }
            }
            Err(mitto_queue::QueueError::Empty) => {}
            Err(e) => tracing::warn!(session = %self.session_id, error = %e, "auto-drain pop failed"),
        }
    }

    async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::Queue(qevent) => match qevent {
                mitto_queue::QueueEvent::Titled { message_id, title } => {
                    self.broadcast(ServerEvent::QueueMessageTitled { message_id, title }).await;
                }
                _ => {
                    let queue_length = self.queue.len().await;
                    self.broadcast(ServerEvent::QueueUpdated { queue_length }).await;
                }
            },
            InternalEvent::Suggestions(buttons) => {
                self.action_buttons = buttons.clone();
                if let Err(e) = self.store.write_action_buttons(&self.session_id, &buttons).await {
                    tracing::warn!(session = %self.session_id, error = %e, "failed to persist action buttons");
                }
                self.broadcast(ServerEvent::ActionButtons { buttons }).await;
            }
        }
    }

    async fn handle_add_observer(
        &mut self,
        observer: Arc<dyn Observer>,
        loaded_last_seq: i64,
        reply: oneshot::Sender<u64>,
    ) {
        let id = self.next_observer_id;
        self.next_observer_id += 1;
        let slot = Arc::new(ObserverSlot::new(id, Arc::clone(&observer), loaded_last_seq));
        self.observers.push(Arc::clone(&slot));

        if let Some((seq, html)) = self.message_buffer.peek() {
            let _ = observer.send(ServerEvent::AgentMessage { seq, html }).await;
        }

        if let Ok(backlog) = self.store.read_events_from(&self.session_id, loaded_last_seq).await {
            for event in &backlog {
                let _ = observer.send(event_to_server_event(event)).await;
            }
            if let Some(last) = backlog.last() {
                slot.advance_to(last.seq);
            }
        }

        if !self.action_buttons.is_empty() {
            let _ = observer.send(ServerEvent::ActionButtons { buttons: self.action_buttons.clone() }).await;
        }

        let _ = reply.send(id);
    }

    async fn handle_load_events(
        &mut self,
        limit: usize,
        before_seq: Option<i64>,
        after_seq: Option<i64>,
    ) -> Result<LoadEventsResult, RuntimeError> {
        if before_seq.is_some() && after_seq.is_some() {
            return Err(RuntimeError::InvalidArgument(
                "before_seq and after_seq are mutually exclusive".into(),
            ));
        }
        let events = if let Some(after) = after_seq {
            self.store.read_events_from(&self.session_id, after).await?
        } else {
            self.store.read_events_last(&self.session_id, limit, before_seq).await?
        };
        let first_seq = events.first().map(|e| e.seq);
        let last_seq = events.last().map(|e| e.seq).unwrap_or(self.seq_counter);
        let has_more = matches!((before_seq, first_seq), (Some(_), Some(first)) if first > 1);
        Ok(LoadEventsResult {
            events,
            has_more,
            first_seq,
            last_seq,
            total_count: self.seq_counter.max(0) as usize,
        })
    }

    async fn status(&self) -> RunningStatus {
        RunningStatus {
            is_running: self.state.is_running(),
            is_prompting: self.state.is_prompting(),
            last_seq: self.seq_counter,
            queue_length: self.queue.len().await,
            status: self.metadata.status,
        }
    }

    async fn broadcast(&mut self, event: ServerEvent) {
        let mut dead = Vec::new();
        for slot in &self.observers {
            if !slot.dispatch(&event).await {
                dead.push(slot.id);
            }
        }
        if !dead.is_empty() {
            self.observers.retain(|s| !dead.contains(&s.id));
        }
    }
}

async fn recv_or_pending(rx: &mut Option<mpsc::Receiver<AcpUpdate>>) -> Option<AcpUpdate> {
    match rx {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}

fn event_to_server_event(event: &Event) -> ServerEvent {
    match &event.kind {
        EventKind::ToolCall => ServerEvent::ToolCall {
            seq: event.seq,
            id: event.field_str("id").unwrap_or_default().to_string(),
            title: event.field_str("title").unwrap_or_default().to_string(),
            status: event.field_str("status").unwrap_or_default().to_string(),
        },
        EventKind::ToolCallUpdate => ServerEvent::ToolCallUpdate {
            seq: event.seq,
            id: event.field_str("id").unwrap_or_default().to_string(),
            status: event.field_str("status").unwrap_or_default().to_string(),
        },
        EventKind::Plan => ServerEvent::Plan {
            seq: event.seq,
            steps: event.fields.get("steps").cloned().unwrap_or(serde_json::Value::Null),
        },
        EventKind::AgentMessage => ServerEvent::AgentMessage {
            seq: event.seq,
            html: event.field_str("html").unwrap_or_default().to_string(),
        },
        EventKind::AgentThought => ServerEvent::AgentThought {
            seq: event.seq,
            text: event.field_str("text").unwrap_or_default().to_string(),
        },
        EventKind::UserPrompt => ServerEvent::UserPrompt {
            seq: event.seq,
            sender_id: event.field_str("sender_id").unwrap_or_default().to_string(),
            prompt_id: event.field_str("prompt_id").unwrap_or_default().to_string(),
            text: event.field_str("message").unwrap_or_default().to_string(),
            image_ids: event
                .fields
                .get("image_ids")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
        },
        EventKind::Permission => ServerEvent::Permission {
            seq: event.seq,
            request_id: event.field_str("request_id").unwrap_or_default().to_string(),
            title: event.field_str("title").unwrap_or_default().to_string(),
            options: event.fields.get("options").cloned().unwrap_or(serde_json::Value::Null),
        },
        EventKind::Error => ServerEvent::Error {
            seq: event.seq,
            message: event.field_str("message").unwrap_or_default().to_string(),
        },
        EventKind::SessionStart | EventKind::SessionEnd | EventKind::FileRead | EventKind::FileWrite
        | EventKind::Other(_) => ServerEvent::Error {
            seq: event.seq,
            message: String::new(),
        },
    }
}
