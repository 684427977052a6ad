//! Streaming turn lifecycle
//!
//! A [`StreamingSession`] drives one model turn at a time for a
//! conversation:
//!
//! ```text
//! Idle -> Streaming <-> ToolExecution
//!            |  \
//!            |   Finalizing -> Idle
//!            +-> Cancelled | Failed
//! ```
//!
//! The in-flight model message lives in the session until the turn ends.
//! Every mutation is checked against the id of the message the session is
//! currently producing, so a superseded turn can never write into a newer
//! one. Observers follow progress through a `watch` channel of
//! [`SessionSnapshot`]s.

pub mod buffer;
pub mod metrics;
pub mod request;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::conversation::{
    Conversation, FeatureToggles, GenerationParams, MediaRef, Message, ToolCall,
};
use crate::error::{ForkchatError, Result};
use crate::media::{MediaLimits, MediaSideChannel, PersistedMedia};
use crate::providers::{ByteStream, Provider, RequestMessage};
use crate::storage::Persistence;
use crate::stream::{StreamDecoder, StreamEvent};
use crate::tools::ToolRegistry;

use buffer::DeltaBuffer;
use metrics::TurnMetrics;

/// Observable state of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    /// No turn in progress
    #[default]
    Idle,
    /// Receiving deltas from the provider
    Streaming,
    /// Running tool calls requested by the model
    ToolExecution,
    /// Applying the last deltas and saving the reply
    Finalizing,
    /// The last turn was stopped by the caller
    Cancelled,
    /// The last turn ended with an error
    Failed,
}

impl SessionState {
    /// Whether a turn is in progress
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Streaming | Self::ToolExecution | Self::Finalizing
        )
    }

    fn outcome_label(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            _ => "completed",
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    /// Current state
    pub state: SessionState,
    /// Model message being produced, while a turn is active
    pub in_flight: Option<Message>,
    /// Latest error; non-fatal errors are kept here too
    pub error: Option<String>,
    /// Tool rounds executed so far in the current turn
    pub tool_rounds: u32,
}

/// How a turn ended
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// `Idle` for a completed turn, otherwise `Cancelled` or `Failed`
    pub state: SessionState,
    /// The model message as it stood when the turn ended
    pub message: Option<Message>,
    /// Whether the message was written to the store
    pub persisted: bool,
    /// Error recorded during the turn
    pub error: Option<String>,
    /// Tool rounds executed
    pub tool_rounds: u32,
}

/// A turn accepted by [`StreamingSession::start`]
#[derive(Debug, Clone)]
pub struct StartedTurn {
    /// User message created for the turn, if any
    pub user_message: Option<Message>,
    /// Id of the in-flight model message
    pub message_id: String,
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Tool rounds allowed per turn before the reply is finalized as is
    pub max_tool_rounds: u32,
    /// Delta coalescing window
    pub coalesce_window: Duration,
    /// Model used when a user turn carries media
    pub vision_model: String,
    /// Per-mime ceilings for attachments
    pub media_limits: MediaLimits,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_tool_rounds: 5,
            coalesce_window: Duration::from_millis(50),
            vision_model: "gpt-4o".to_string(),
            media_limits: MediaLimits::default(),
        }
    }
}

impl SessionSettings {
    /// Settings taken from the loaded configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_tool_rounds: config.session.max_tool_rounds,
            coalesce_window: config.session.coalesce_window(),
            vision_model: config.provider.vision_model.clone(),
            media_limits: config.media.limits(),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Inner {
    target_id: Option<String>,
    snapshot: SessionSnapshot,
}

/// State shared between the session handle and its turn task
struct Shared {
    inner: Mutex<Inner>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl Shared {
    fn new() -> Self {
        let (snapshots, _) = watch::channel(SessionSnapshot::default());
        Self {
            inner: Mutex::new(Inner {
                target_id: None,
                snapshot: SessionSnapshot::default(),
            }),
            snapshots,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &Inner) {
        self.snapshots.send_replace(inner.snapshot.clone());
    }

    /// Makes `message` the new in-flight target
    fn begin(&self, message: Message, error: Option<String>) {
        let mut inner = self.lock();
        inner.target_id = Some(message.id.clone());
        inner.snapshot = SessionSnapshot {
            state: SessionState::Streaming,
            in_flight: Some(message),
            error,
            tool_rounds: 0,
        };
        self.publish(&inner);
    }

    /// Applies `f` if `message_id` is still the target
    fn update<F>(&self, message_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut SessionSnapshot),
    {
        let mut inner = self.lock();
        if inner.target_id.as_deref() != Some(message_id) {
            debug!(message_id, "Dropping update for superseded message");
            return false;
        }
        f(&mut inner.snapshot);
        self.publish(&inner);
        true
    }

    fn update_message<F>(&self, message_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Message),
    {
        self.update(message_id, |snapshot| {
            if let Some(message) = snapshot.in_flight.as_mut() {
                f(message);
            }
        })
    }

    fn in_flight(&self, message_id: &str) -> Option<Message> {
        let inner = self.lock();
        if inner.target_id.as_deref() != Some(message_id) {
            return None;
        }
        inner.snapshot.in_flight.clone()
    }

    /// Ends the target's turn; returns the error left on the snapshot
    fn finish(
        &self,
        message_id: &str,
        state: SessionState,
        error: Option<String>,
    ) -> Option<String> {
        let mut inner = self.lock();
        if inner.target_id.as_deref() != Some(message_id) {
            return error;
        }
        inner.target_id = None;
        inner.snapshot.state = state;
        inner.snapshot.in_flight = None;
        if error.is_some() {
            inner.snapshot.error = error;
        }
        let effective = inner.snapshot.error.clone();
        self.publish(&inner);
        effective
    }

    fn snapshot(&self) -> SessionSnapshot {
        self.lock().snapshot.clone()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct RunningTurn {
    message_id: String,
    cancel: CancellationToken,
    done: CancellationToken,
    handle: JoinHandle<TurnOutcome>,
}

/// Drives streaming turns for one conversation
///
/// # Examples
///
/// ```ignore
/// use forkchat::session::StreamingSession;
///
/// let session = StreamingSession::new(conversation, provider, store);
/// session.start(&branch, Some("Hello".into())).await?;
/// let outcome = session.wait().await;
/// ```
pub struct StreamingSession {
    conversation: Conversation,
    provider: Arc<dyn Provider>,
    store: Arc<dyn Persistence>,
    tools: Arc<ToolRegistry>,
    media: MediaSideChannel,
    settings: SessionSettings,
    shared: Arc<Shared>,
    running: tokio::sync::Mutex<Option<RunningTurn>>,
}

impl StreamingSession {
    /// Creates an idle session with no tools and inline-only media
    pub fn new(
        conversation: Conversation,
        provider: Arc<dyn Provider>,
        store: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            conversation,
            provider,
            store,
            tools: Arc::new(ToolRegistry::new()),
            media: MediaSideChannel::new(),
            settings: SessionSettings::default(),
            shared: Arc::new(Shared::new()),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Sets the tools offered to the model
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    /// Sets the media side channel
    pub fn with_media(mut self, media: MediaSideChannel) -> Self {
        self.media = media;
        self
    }

    /// Sets the session tuning
    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// The conversation this session produces turns for
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Current snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot()
    }

    /// Subscribes to snapshot changes
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshots.subscribe()
    }

    /// Starts a turn from `branch`
    ///
    /// With `new_user_text`, a user message is created under the last
    /// message of `branch` and saved first. Without it, `branch` must
    /// already end where the reply belongs (regeneration, edited message).
    /// A turn still running is stopped before the new one starts.
    pub async fn start(
        &self,
        branch: &[Message],
        new_user_text: Option<String>,
    ) -> Result<StartedTurn> {
        let user = new_user_text.map(|text| {
            Message::user(
                self.conversation.id.clone(),
                branch.last().map(|m| m.id.clone()),
                text,
            )
        });
        self.start_turn(branch, user).await
    }

    /// Like [`start`](Self::start), with media attached to the new user message
    pub async fn start_with_attachment(
        &self,
        branch: &[Message],
        text: String,
        media: MediaRef,
    ) -> Result<StartedTurn> {
        let user = Message::user(
            self.conversation.id.clone(),
            branch.last().map(|m| m.id.clone()),
            text,
        )
        .with_media(media);
        self.start_turn(branch, Some(user)).await
    }

    async fn start_turn(&self, branch: &[Message], user: Option<Message>) -> Result<StartedTurn> {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            info!(message_id = %previous.message_id, "Stopping previous turn");
            previous.cancel.cancel();
            self.join(previous).await;
        }

        let mut context = branch.to_vec();
        let mut error = None;
        if let Some(user) = &user {
            if let Err(e) = self.store.add_message(user).await {
                warn!(message_id = %user.id, "Failed to save user message: {}", e);
                error = Some(format!("failed to save user message: {}", e));
            }
            context.push(user.clone());
        }

        let Some(last) = context.last() else {
            return Err(ForkchatError::Provider("nothing to send".into()).into());
        };
        let message = Message::model(self.conversation.id.clone(), Some(last.id.clone()));
        let message_id = message.id.clone();
        self.shared.begin(message, error);

        let turn = Turn {
            message_id: message_id.clone(),
            context,
            model: self.conversation.model.clone(),
            params: self.conversation.params,
            features: self.conversation.features,
            provider: Arc::clone(&self.provider),
            store: Arc::clone(&self.store),
            tools: Arc::clone(&self.tools),
            media: self.media.clone(),
            settings: self.settings.clone(),
            shared: Arc::clone(&self.shared),
        };

        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task_done = done.clone();
        let handle = tokio::spawn(async move {
            let _done = task_done.drop_guard();
            turn.run(task_cancel).await
        });

        info!(
            conversation_id = %self.conversation.id,
            message_id = %message_id,
            "Turn started"
        );

        *running = Some(RunningTurn {
            message_id: message_id.clone(),
            cancel,
            done,
            handle,
        });

        Ok(StartedTurn {
            user_message: user,
            message_id,
        })
    }

    /// Stops the running turn
    ///
    /// The network read is abandoned immediately. Whatever the reply had
    /// accumulated is saved if it has persistable content. Returns `None`
    /// when no turn was running.
    pub async fn stop(&self) -> Option<TurnOutcome> {
        let running = self.running.lock().await.take()?;
        running.cancel.cancel();
        Some(self.join(running).await)
    }

    /// Waits for the running turn to end
    ///
    /// Dropping the returned future leaves the turn running.
    pub async fn wait(&self) -> Option<TurnOutcome> {
        let (message_id, done) = {
            let running = self.running.lock().await;
            let turn = running.as_ref()?;
            (turn.message_id.clone(), turn.done.clone())
        };
        done.cancelled().await;

        let mut running = self.running.lock().await;
        if running.as_ref().map(|t| t.message_id.as_str()) != Some(message_id.as_str()) {
            return None;
        }
        let turn = running.take()?;
        drop(running);
        Some(self.join(turn).await)
    }

    async fn join(&self, turn: RunningTurn) -> TurnOutcome {
        match turn.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(message_id = %turn.message_id, "Turn task aborted: {}", e);
                let message = self.shared.in_flight(&turn.message_id);
                let error = self.shared.finish(
                    &turn.message_id,
                    SessionState::Failed,
                    Some(format!("turn task aborted: {}", e)),
                );
                TurnOutcome {
                    state: SessionState::Failed,
                    message,
                    persisted: false,
                    error,
                    tool_rounds: 0,
                }
            }
        }
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.try_lock() {
            if let Some(turn) = running.take() {
                turn.cancel.cancel();
            }
        }
    }
}

impl std::fmt::Debug for StreamingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingSession")
            .field("conversation_id", &self.conversation.id)
            .field("provider", &self.provider.name())
            .field("state", &self.shared.snapshot().state)
            .field("settings", &self.settings)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Turn task
// ---------------------------------------------------------------------------

/// How one provider response ended
enum RoundEnd {
    Done(Vec<ToolCall>),
    Failed(String),
    Cancelled,
}

/// Everything a turn task needs, owned
struct Turn {
    message_id: String,
    context: Vec<Message>,
    model: String,
    params: GenerationParams,
    features: FeatureToggles,
    provider: Arc<dyn Provider>,
    store: Arc<dyn Persistence>,
    tools: Arc<ToolRegistry>,
    media: MediaSideChannel,
    settings: SessionSettings,
    shared: Arc<Shared>,
}

impl Turn {
    async fn run(self, cancel: CancellationToken) -> TurnOutcome {
        let metrics = TurnMetrics::new();
        let mut buffer = DeltaBuffer::new(self.settings.coalesce_window);
        let mut rounds = 0u32;

        let local_store = self.media.local_store().cloned();
        let built = request::build_messages(
            &self.context,
            local_store.as_deref(),
            &self.settings.media_limits,
        )
        .await;
        for warning in &built.warnings {
            self.record_error(format!("attachment skipped: {}", warning));
        }
        let mut messages = built.messages;
        let model =
            request::select_model(&messages, &self.model, &self.settings.vision_model).to_string();
        let tools = self.tools.definitions_for(&self.features);

        let failure = loop {
            let request = request::build_request(&model, messages.clone(), &self.params, &tools);
            debug!(
                model = %request.model,
                messages = request.messages.len(),
                tools = tools.len(),
                round = rounds,
                "Sending request"
            );

            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.conclude(SessionState::Cancelled, None, rounds, &metrics).await;
                }
                result = self.provider.stream_chat(&request) => result,
            };
            let body = match body {
                Ok(body) => body,
                Err(e) => break Some(e.to_string()),
            };

            let calls = match self.consume(body, &mut buffer, &cancel).await {
                RoundEnd::Cancelled => {
                    self.flush(&mut buffer);
                    return self.conclude(SessionState::Cancelled, None, rounds, &metrics).await;
                }
                RoundEnd::Failed(error) => break Some(error),
                RoundEnd::Done(calls) => calls,
            };
            if calls.is_empty() {
                break None;
            }
            // The batch that would exceed the bound is not executed.
            if rounds >= self.settings.max_tool_rounds {
                warn!(
                    "Tool round limit ({}) reached, finalizing reply",
                    self.settings.max_tool_rounds
                );
                break None;
            }
            rounds += 1;

            self.shared.update(&self.message_id, |snapshot| {
                snapshot.state = SessionState::ToolExecution;
                snapshot.tool_rounds = rounds;
                if let Some(message) = snapshot.in_flight.as_mut() {
                    message
                        .tool_calls
                        .get_or_insert_with(Vec::new)
                        .extend(calls.iter().cloned());
                }
            });

            messages.push(RequestMessage::assistant_with_tools(&calls));
            for call in &calls {
                debug!(tool = %call.name, call_id = %call.id, "Executing tool call");
                let output = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return self.conclude(SessionState::Cancelled, None, rounds, &metrics).await;
                    }
                    output = self.tools.execute(&call.name, &call.arguments) => output,
                };
                messages.push(RequestMessage::tool_result(call.id.clone(), output));
            }

            self.shared.update(&self.message_id, |snapshot| {
                snapshot.state = SessionState::Streaming;
            });
        };

        match failure {
            None => {
                self.shared.update(&self.message_id, |snapshot| {
                    snapshot.state = SessionState::Finalizing;
                });
                self.flush(&mut buffer);
                self.conclude(SessionState::Idle, None, rounds, &metrics).await
            }
            Some(error) => {
                warn!(message_id = %self.message_id, "Turn failed: {}", error);
                self.flush(&mut buffer);
                self.conclude(SessionState::Failed, Some(error), rounds, &metrics)
                    .await
            }
        }
    }

    /// Reads one provider response to its end
    async fn consume(
        &self,
        body: ByteStream,
        buffer: &mut DeltaBuffer,
        cancel: &CancellationToken,
    ) -> RoundEnd {
        let mut decoder = StreamDecoder::new(body);
        let mut calls = Vec::new();
        let mut last_error: Option<String> = None;

        loop {
            let deadline = buffer.deadline();
            let flush_at =
                deadline.unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return RoundEnd::Cancelled,
                _ = tokio::time::sleep_until(flush_at), if deadline.is_some() => {
                    self.flush(buffer);
                }
                event = decoder.next_event() => match event {
                    Some(StreamEvent::Text(delta)) => {
                        buffer.push_text(&delta);
                        if buffer.is_due() {
                            self.flush(buffer);
                        }
                    }
                    Some(StreamEvent::Thinking(delta)) => {
                        buffer.push_thinking(&delta);
                        if buffer.is_due() {
                            self.flush(buffer);
                        }
                    }
                    Some(StreamEvent::Media { bytes, mime_type }) => {
                        self.flush(buffer);
                        let persisted = self.media.persist(&bytes, &mime_type).await;
                        debug!(tier = ?persisted.tier, mime_type = %mime_type, "Generated media stored");
                        self.attach_media(persisted);
                    }
                    Some(StreamEvent::ToolCalls(batch)) => calls.extend(batch),
                    Some(StreamEvent::Usage(usage)) => {
                        self.shared
                            .update_message(&self.message_id, |m| m.add_usage(&usage));
                    }
                    Some(StreamEvent::Error(error)) => {
                        warn!(message_id = %self.message_id, "Stream error: {}", error);
                        self.record_error(error.clone());
                        last_error = Some(error);
                    }
                    Some(StreamEvent::Done) => {
                        // Errors before Done are recorded, not fatal.
                        self.flush(buffer);
                        return RoundEnd::Done(calls);
                    }
                    None => {
                        self.flush(buffer);
                        return RoundEnd::Failed(
                            last_error.unwrap_or_else(|| "stream ended unexpectedly".to_string()),
                        );
                    }
                }
            }
        }
    }

    fn flush(&self, buffer: &mut DeltaBuffer) {
        if buffer.is_empty() {
            return;
        }
        let mut applied = false;
        self.shared.update_message(&self.message_id, |message| {
            buffer.flush_into(message);
            applied = true;
        });
        if !applied {
            // Superseded; drop what was buffered for the old message.
            let mut discard = Message::model(String::new(), None);
            buffer.flush_into(&mut discard);
        }
    }

    fn attach_media(&self, persisted: PersistedMedia) {
        self.shared
            .update_message(&self.message_id, |message| match &message.media {
                None => message.media = Some(persisted.media),
                Some(_) => {
                    message.append_text(&format!("\n\n![generated]({})", persisted.media.url));
                }
            });
    }

    fn record_error(&self, error: String) {
        self.shared.update(&self.message_id, |snapshot| {
            snapshot.error = Some(error);
        });
    }

    /// Saves the reply if worth it and publishes the terminal state
    async fn conclude(
        &self,
        state: SessionState,
        error: Option<String>,
        rounds: u32,
        metrics: &TurnMetrics,
    ) -> TurnOutcome {
        let message = self.shared.in_flight(&self.message_id);
        let mut error = error;
        let mut persisted = false;

        match &message {
            Some(message) if message.has_persistable_content() => {
                match self.store.add_message(message).await {
                    Ok(()) => persisted = true,
                    Err(e) => {
                        warn!(message_id = %message.id, "Failed to save reply: {}", e);
                        error.get_or_insert_with(|| format!("failed to save reply: {}", e));
                    }
                }
            }
            Some(message) => debug!(message_id = %message.id, "Reply is empty, not saving"),
            None => debug!(message_id = %self.message_id, "Turn superseded"),
        }

        metrics.record(
            state.outcome_label(),
            rounds,
            message.as_ref().and_then(|m| m.usage.as_ref()),
        );
        let error = self.shared.finish(&self.message_id, state, error);

        info!(
            message_id = %self.message_id,
            outcome = state.outcome_label(),
            persisted,
            tool_rounds = rounds,
            "Turn finished"
        );

        TurnOutcome {
            state,
            message,
            persisted,
            error,
            tool_rounds: rounds,
        }
    }
}
