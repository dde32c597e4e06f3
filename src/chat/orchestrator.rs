//! Conversation orchestrator - drives one request at a time
//!
//! Single owner of the history, the tool-pair buffer, and the keep-alive
//! timer. User sends, tool-result round trips, and keep-alive pings all
//! funnel through one send path guarded by an async mutex, so no two
//! streams are ever in flight together. The orchestrator is a cheap
//! clone-able handle; clones share all state.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use crate::config::Settings;
use crate::error::Result;
use crate::llm::assembler::{AssistantTurn, TurnAssembler};
use crate::llm::provider::Provider;
use crate::llm::request::RequestBuilder;
use crate::llm::types::{
    ContentBlock, LLMError, Message, RequestParams, Role, StreamEvent, ToolDefinition,
};
use crate::store::MessageStore;

use super::buffer::{ExpiredUse, ToolPair, ToolPairBuffer};
use super::events::{self, ChatEvent, EventReceiver, EventSender};
use super::history;
use super::permissions::{permission_denied_payload, PermissionGate, ToolPermission};
use super::timer::{KeepAliveTimer, TimerEvent, TimerState};
use super::tools::{ToolHandler, ToolOutcome, ToolRunner};

/// Keep-alive prompt; the server replies and the cache ttl restarts
pub const KEEP_ALIVE_PROMPT: &str =
    "This is a 'ping' to reset cache ttl, respond with 'ping ack'";

/// Any user text containing this marker is treated as a keep-alive turn
pub const KEEP_ALIVE_MARKER: &str = "This is a 'ping'";

/// Synthesized text when an assistant turn is nothing but tool calls
pub const TOOL_CALLED_MARKER: &str = "[Tool called]";

/// Synthesized leading text on constructed tool-result messages
pub const TOOL_RESULT_MARKER: &str = "[Tool result]";

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Orchestrator configuration, loaded once and passed by value
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub params: RequestParams,
    /// System prompt blocks, in order
    pub system: Vec<String>,
    /// Zero disables keep-alive entirely
    pub keep_alive_interval: Duration,
    pub tool_pair_timeout: Duration,
    pub tool_use_enabled: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            params: RequestParams::default(),
            system: Vec::new(),
            keep_alive_interval: Duration::from_secs(4 * 60),
            tool_pair_timeout: Duration::from_secs(5 * 60),
            tool_use_enabled: true,
        }
    }
}

impl ChatConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            params: RequestParams {
                model: settings.model.clone(),
                ..Default::default()
            },
            system: Vec::new(),
            keep_alive_interval: settings.keep_alive_interval(),
            tool_pair_timeout: settings.tool_pair_timeout(),
            tool_use_enabled: settings.tool_use_enabled,
        }
    }
}

struct Inner {
    provider: Arc<dyn Provider>,
    builder: RequestBuilder,
    system: Vec<String>,
    tool_use_enabled: bool,
    keep_alive_interval: Duration,
    runner: ToolRunner,
    gate: StdMutex<PermissionGate>,
    history: StdMutex<Vec<Message>>,
    buffer: ToolPairBuffer,
    timer: KeepAliveTimer,
    timer_rx: StdMutex<Option<mpsc::UnboundedReceiver<TimerEvent>>>,
    store: Option<Arc<MessageStore>>,
    events: EventSender,
    event_rx: StdMutex<Option<EventReceiver>>,
    cancel_tx: StdMutex<Option<watch::Sender<bool>>>,
    send_lock: AsyncMutex<()>,
}

/// The conversation orchestrator. Clones share all state.
#[derive(Clone)]
pub struct ChatOrchestrator {
    inner: Arc<Inner>,
}

impl ChatOrchestrator {
    pub fn new(provider: Arc<dyn Provider>, config: ChatConfig) -> Self {
        let (events, event_rx) = events::channel();
        let mut timer = KeepAliveTimer::new();
        let timer_rx = timer.take_event_rx();

        Self {
            inner: Arc::new(Inner {
                provider,
                builder: RequestBuilder::new(config.params),
                system: config.system,
                tool_use_enabled: config.tool_use_enabled,
                keep_alive_interval: config.keep_alive_interval,
                runner: ToolRunner::new(),
                gate: StdMutex::new(PermissionGate::new()),
                history: StdMutex::new(Vec::new()),
                buffer: ToolPairBuffer::with_timeout(config.tool_pair_timeout),
                timer,
                timer_rx: StdMutex::new(timer_rx),
                store: None,
                events,
                event_rx: StdMutex::new(Some(event_rx)),
                cancel_tx: StdMutex::new(None),
                send_lock: AsyncMutex::new(()),
            }),
        }
    }

    /// Attach the persistent store. Call before cloning the orchestrator.
    pub fn with_store(mut self, store: Arc<MessageStore>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.store = Some(store),
            None => tracing::error!("with_store called after the orchestrator was cloned"),
        }
        self
    }

    /// Register a tool handler and its permission policy. Call before
    /// cloning the orchestrator.
    pub fn register_tool(&mut self, handler: Arc<dyn ToolHandler>, permission: ToolPermission) {
        let name = handler.definition().name;
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => {
                inner.runner.register(handler);
                lock(&inner.gate).register(name, permission);
            }
            None => tracing::error!("register_tool called after the orchestrator was cloned"),
        }
    }

    /// Take the UI event channel; the first caller wins
    pub fn take_event_rx(&self) -> Option<EventReceiver> {
        lock(&self.inner.event_rx).take()
    }

    pub fn history_snapshot(&self) -> Vec<Message> {
        lock(&self.inner.history).clone()
    }

    pub fn pending_tool_names(&self) -> Vec<String> {
        self.inner.buffer.pending_tool_names()
    }

    pub fn timer_state(&self) -> TimerState {
        self.inner.timer.state()
    }

    /// Install a repaired copy of a persisted history
    pub fn load_history(
        &self,
        persisted: Vec<Message>,
        truncate_chars: Option<usize>,
        max_count: usize,
        include_tools: bool,
    ) {
        let mut messages = persisted;
        if messages.len() > max_count {
            messages = messages.split_off(messages.len() - max_count);
        }
        if !include_tools {
            messages = messages
                .into_iter()
                .filter_map(|mut m| {
                    m.content
                        .retain(|b| !b.is_tool_use() && !b.is_tool_result());
                    if m.content.is_empty() {
                        None
                    } else {
                        Some(m)
                    }
                })
                .collect();
        }
        if let Some(max_chars) = truncate_chars {
            for message in &mut messages {
                crate::store::truncate_message(message, max_chars);
            }
        }
        let repaired = history::normalize(messages);
        tracing::info!("Loaded history with {} messages after repair", repaired.len());
        *lock(&self.inner.history) = repaired;
    }

    /// Main entry point: send a user message and stream the reply
    pub async fn send_user(
        &self,
        text: impl Into<String>,
        display: bool,
        persist: bool,
    ) -> Result<()> {
        let text = text.into();
        let _turn = self.inner.send_lock.lock().await;

        lock(&self.inner.gate).reset_chain();
        self.ensure_keep_alive_loop();
        self.timer_touch();

        let outcome = self.inner.buffer.flush();
        self.report_expired(&outcome.expired);
        for pair in outcome.ready {
            // Pairs that matched while we were idle become context now
            self.commit_message(pair.tool_use, persist).await;
            self.commit_message(pair.tool_result, persist).await;
        }

        let names = self.inner.buffer.pending_tool_names();
        let body = if names.is_empty() {
            text
        } else {
            format!(
                "[NOTE: Tool(s) '{}' are still processing.]\n\n{}",
                names.join(", "),
                text
            )
        };

        self.run_turn(Message::user(body), display, persist).await
    }

    /// Silent cache-refreshing ping
    pub async fn send_keep_alive(&self) -> Result<()> {
        let _turn = self.inner.send_lock.lock().await;
        self.run_turn(Message::user(KEEP_ALIVE_PROMPT), false, false)
            .await
    }

    /// Cooperative cancellation of the in-flight stream
    pub fn request_stop(&self) {
        self.emit(ChatEvent::StopRequested);
        if let Some(tx) = lock(&self.inner.cancel_tx).as_ref() {
            let _ = tx.send(true);
        }
    }

    /// Tool runners deposit finished results here. Each matched pair is
    /// committed (use first) and the result goes out through the normal
    /// send path.
    pub async fn ingest_tool_results(&self, results: Vec<ToolOutcome>) -> Result<()> {
        let mut pairs: Vec<ToolPair> = Vec::new();
        for outcome in results {
            let message = tool_result_message(&outcome);
            if let Some(pair) = self
                .inner
                .buffer
                .buffer_result(outcome.tool_use_id.clone(), message)
            {
                pairs.push(pair);
            }
        }
        let flushed = self.inner.buffer.flush();
        self.report_expired(&flushed.expired);
        pairs.extend(flushed.ready);
        pairs.sort_by(|a, b| a.buffered_at.cmp(&b.buffered_at).then_with(|| a.id.cmp(&b.id)));

        self.complete_pairs(pairs).await
    }

    async fn complete_pairs(&self, pairs: Vec<ToolPair>) -> Result<()> {
        for pair in pairs {
            let _turn = self.inner.send_lock.lock().await;
            self.commit_message(pair.tool_use, true).await;
            self.run_turn(pair.tool_result, false, true).await?;
        }
        Ok(())
    }

    /// One request/response cycle. Callers hold the send lock.
    async fn run_turn(&self, user_message: Message, display: bool, persist: bool) -> Result<()> {
        let is_ping = user_message
            .first_text()
            .map(|t| t.contains(KEEP_ALIVE_MARKER))
            .unwrap_or(false);

        if display {
            if let Some(text) = user_message.first_text() {
                self.emit(ChatEvent::Status(text.to_string()));
            }
        }
        self.commit_message(user_message, persist && !is_ping).await;

        let request = {
            let history = lock(&self.inner.history);
            self.inner
                .builder
                .build(&self.inner.system, &self.request_tools(), &history)?
        };

        let request_id = uuid::Uuid::new_v4();
        tracing::info!(
            "Submitting request {} with {} messages",
            request_id,
            request.messages.len()
        );
        self.emit(ChatEvent::Debug(format!("request {} submitted", request_id)));
        self.timer_touch();

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        *lock(&self.inner.cancel_tx) = Some(cancel_tx);

        let mut stream = match self.inner.provider.stream(request).await {
            Ok(stream) => stream,
            Err(e) => {
                *lock(&self.inner.cancel_tx) = None;
                tracing::error!("Request {} failed: {}", request_id, e);
                self.emit_llm_error(&e);
                return Ok(());
            }
        };

        let mut assembler = TurnAssembler::new().with_event_tx(self.inner.events.clone());
        let mut cancelled = false;
        loop {
            tokio::select! {
                _ = wait_cancelled(&mut cancel_rx) => {
                    cancelled = true;
                    break;
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        let is_stop = matches!(event, StreamEvent::MessageStop);
                        assembler.handle(event);
                        if is_stop {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("Stream {} ended with error: {}", request_id, e);
                        self.emit_llm_error(&e);
                        break;
                    }
                    None => break,
                }
            }
        }
        drop(stream);
        *lock(&self.inner.cancel_tx) = None;

        let turn = assembler.finish(cancelled);
        if cancelled {
            self.emit(ChatEvent::Cancelled);
        }
        self.timer_touch();

        self.commit_turn(turn, persist, is_ping).await;

        self.emit(ChatEvent::InteractionComplete);
        self.timer_touch();
        Ok(())
    }

    /// Commit a completed turn: plain turns go to history whole, tool turns
    /// split into an immediate text portion and buffered tool_use entries.
    fn commit_turn<'a>(
        &'a self,
        turn: AssistantTurn,
        persist: bool,
        preceding_ping: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        if turn.message.content.is_empty() {
            return;
        }
        let persist_turn = persist && !preceding_ping;

        if !turn.message.has_tool_use() {
            self.commit_message(turn.message, persist_turn).await;
            return;
        }

        let mut text_blocks = Vec::new();
        let mut tool_blocks = Vec::new();
        for block in turn.message.content {
            if block.is_tool_use() {
                tool_blocks.push(block);
            } else {
                text_blocks.push(block);
            }
        }
        if text_blocks.is_empty() {
            text_blocks.push(ContentBlock::text(TOOL_CALLED_MARKER));
        }
        self.commit_message(Message::new(Role::Assistant, text_blocks), persist_turn)
            .await;

        let mut instantly_ready = Vec::new();
        for block in &tool_blocks {
            let ContentBlock::ToolUse { id, .. } = block else {
                continue;
            };
            let single = Message::new(Role::Assistant, vec![block.clone()]);
            if let Some(pair) = self.inner.buffer.buffer_use(id.clone(), single) {
                instantly_ready.push(pair);
            }
        }

        for block in tool_blocks {
            if let ContentBlock::ToolUse {
                id, name, input, ..
            } = block
            {
                self.dispatch_tool(id, name, input);
            }
        }

        if !instantly_ready.is_empty() {
            let orch = self.clone();
            tokio::spawn(async move {
                if let Err(e) = orch.complete_pairs(instantly_ready).await {
                    tracing::warn!("Pair completion failed: {}", e);
                }
            });
        }
        })
    }

    /// Gate-check one tool call and run it concurrently with the
    /// conversation. Denials answer immediately with the denial payload.
    fn dispatch_tool(&self, id: String, name: String, input: serde_json::Value) {
        let allowed = lock(&self.inner.gate).is_allowed(&name);
        let orch = self.clone();

        if !allowed {
            tracing::warn!("Tool '{}' denied by the permission gate", name);
            let payload = permission_denied_payload(&name);
            tokio::spawn(async move {
                if let Err(e) = orch
                    .ingest_tool_results(vec![ToolOutcome::error(id, payload)])
                    .await
                {
                    tracing::warn!("Failed to ingest denial result: {}", e);
                }
            });
            return;
        }

        {
            let mut gate = lock(&self.inner.gate);
            if gate.current_initiator().is_none() {
                gate.start_chain(Some(&name));
            }
        }

        self.emit(ChatEvent::Status(format!("running tool '{}'", name)));
        tokio::spawn(async move {
            let outcome = orch.inner.runner.execute(&id, &name, input).await;
            if let Err(e) = orch.ingest_tool_results(vec![outcome]).await {
                tracing::warn!("Failed to ingest result of '{}': {}", name, e);
            }
        });
    }

    async fn commit_message(&self, message: Message, persist: bool) {
        {
            lock(&self.inner.history).push(message.clone());
        }
        if !persist {
            return;
        }
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.append(message.role, &message.content).await {
                tracing::error!("Failed to persist message: {}", e);
                self.emit(ChatEvent::Warning(format!("message not persisted: {}", e)));
            }
        }
    }

    fn request_tools(&self) -> Vec<ToolDefinition> {
        if self.inner.tool_use_enabled {
            self.inner.runner.definitions()
        } else {
            Vec::new()
        }
    }

    fn report_expired(&self, expired: &[ExpiredUse]) {
        for entry in expired {
            tracing::warn!(
                "Tool call {} ({}) expired without a result",
                entry.id,
                entry.tool_names.join(", ")
            );
            self.emit(ChatEvent::Warning(format!(
                "tool call '{}' timed out",
                entry.tool_names.join(", ")
            )));
        }
    }

    /// Start the timer on first use and reset it on every interaction point
    fn timer_touch(&self) {
        if self.inner.keep_alive_interval.is_zero() {
            return;
        }
        if self.inner.timer.state() == TimerState::Stopped {
            if self
                .inner
                .timer
                .set_interval(self.inner.keep_alive_interval, true)
                .is_ok()
            {
                if let Err(e) = self.inner.timer.start() {
                    tracing::warn!("Keep-alive timer start failed: {}", e);
                }
            }
        } else if let Err(e) = self.inner.timer.reset() {
            tracing::warn!("Keep-alive timer reset failed: {}", e);
        }
    }

    /// Drain timer completions into keep-alive sends; spawned once
    fn ensure_keep_alive_loop(&self) {
        if self.inner.keep_alive_interval.is_zero() {
            return;
        }
        let Some(mut rx) = lock(&self.inner.timer_rx).take() else {
            return;
        };
        let orch = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if matches!(event, TimerEvent::Completed) {
                    if let Err(e) = orch.send_keep_alive().await {
                        tracing::warn!("Keep-alive send failed: {}", e);
                    }
                }
            }
        });
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.inner.events.send(event);
    }

    fn emit_llm_error(&self, error: &LLMError) {
        let kind = match error {
            LLMError::Protocol { .. } => "protocol_error".to_string(),
            LLMError::Api { kind, .. } => kind.clone(),
            LLMError::InvalidRequest { .. } => "invalid_request".to_string(),
            LLMError::AuthError { .. } => "authentication_error".to_string(),
            LLMError::Timeout { .. } => "timeout".to_string(),
            LLMError::StreamInterrupted => "stream_interrupted".to_string(),
            LLMError::NetworkError { .. } | LLMError::ProviderError { .. } => {
                "transport_error".to_string()
            }
        };
        self.emit(ChatEvent::Error {
            kind,
            detail: error.to_string(),
        });
    }
}

/// Resolves only once cancellation is requested
async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone; cancellation can never arrive
            futures::future::pending::<()>().await;
        }
    }
}

/// Package a tool outcome as the user message carrying its tool_result
fn tool_result_message(outcome: &ToolOutcome) -> Message {
    Message::new(
        Role::User,
        vec![
            ContentBlock::text(TOOL_RESULT_MARKER),
            ContentBlock::tool_result(
                outcome.tool_use_id.clone(),
                outcome.output.clone(),
                outcome.is_error,
            ),
        ],
    )
}
