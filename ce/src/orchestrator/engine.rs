//! Conversation turn state machine.
//!
//! A turn moves through Sending, Streaming (loading until the first
//! non-empty delta), and a terminal Completed / Cancelled / Failed state.
//! One failed turn against a non-local provider is retried once against the
//! configured fallback before the failure surfaces.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use base64::Engine;
use eyre::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::{self, ChatMessage, MessagePart, Role};
use crate::config::{OrchestratorConfig, ProviderConfig};
use crate::error::ChatError;
use crate::gateway::{PersistenceGateway, Retriever, UiEvent};
use crate::session::CancelScope;
use crate::transport::{StreamEvent, StreamTransport};

use super::planner;

/// Suffix appended to partial output when a turn is cancelled mid-stream
pub const CANCEL_MARKER: &str = "[generation stopped]";

/// Hint shown while the first byte is still pending
const SLOW_HINT: &str = "The model is taking a while to answer...";
const HINT_CHAR_DELAY_MS: u64 = 15;

/// Deadline stand-in when a timer is disabled
const FAR_FUTURE: Duration = Duration::from_secs(86_400);

/// Terminal state of one turn
#[derive(Debug, Clone, PartialEq)]
pub enum TurnStatus {
    Completed { text: String },
    Cancelled,
    Failed(ChatError),
}

impl TurnStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, TurnStatus::Completed { .. })
    }
}

/// How a turn originated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnKind {
    /// Typed by the user: retrieval and template augmentation apply
    User,
    /// Issued by the auto-loop planner: sent as-is
    Auto,
}

/// Outcome of `send`, covering the initial turn and any auto-loop tail
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    /// Status of the last dispatched turn
    pub status: TurnStatus,
    /// Auto-loop continuations that ran after the initial turn
    pub continuations: u32,
    /// Whether the fallback provider was engaged
    pub fallback_used: bool,
}

struct StreamOutcome {
    status: TurnStatus,
    /// Accumulated text, kept separately so failure paths can preserve it
    streamed: String,
}

struct DispatchOutcome {
    status: TurnStatus,
    fallback_used: bool,
}

/// Drives conversation turns for one session.
pub struct Orchestrator {
    session_id: String,
    provider: ProviderConfig,
    fallback: Option<ProviderConfig>,
    config: OrchestratorConfig,
    transport: Arc<dyn StreamTransport>,
    gateway: Arc<dyn PersistenceGateway>,
    retriever: Option<Arc<dyn Retriever>>,
    ui_tx: mpsc::Sender<UiEvent>,
    scope: CancelScope,
    history: Vec<ChatMessage>,
    last_user_input: Option<String>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        provider: ProviderConfig,
        fallback: Option<ProviderConfig>,
        config: OrchestratorConfig,
        transport: Arc<dyn StreamTransport>,
        gateway: Arc<dyn PersistenceGateway>,
        retriever: Option<Arc<dyn Retriever>>,
        ui_tx: mpsc::Sender<UiEvent>,
    ) -> Self {
        let scope = CancelScope::new(Arc::clone(&transport));
        Self {
            session_id: session_id.into(),
            provider,
            fallback,
            config,
            transport,
            gateway,
            retriever,
            ui_tx,
            scope,
            history: Vec::new(),
            last_user_input: None,
        }
    }

    /// Share an externally owned cancel scope (e.g. the session's)
    pub fn with_scope(mut self, scope: CancelScope) -> Self {
        self.scope = scope;
        self
    }

    /// Clone of the cancel scope, usable from other tasks
    pub fn scope(&self) -> CancelScope {
        self.scope.clone()
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Run one user turn, then the auto-loop tail if enabled.
    pub async fn send(&mut self, input: &str, images: &[PathBuf]) -> Result<TurnReport> {
        debug!(session_id = %self.session_id, input_len = input.len(), images = images.len(), "send");
        let outcome = self.dispatch_turn(input, images, TurnKind::User, false).await?;

        let mut continuations = 0u32;
        if outcome.status.is_completed() && self.config.auto_loop.enabled {
            while continuations < self.config.auto_loop.max_loops {
                let Some(instruction) =
                    planner::next_instruction(&self.transport, &self.provider, &self.history).await
                else {
                    break;
                };
                debug!(continuation = continuations + 1, %instruction, "auto-loop continuing");
                continuations += 1;
                let auto = self
                    .dispatch_turn(&instruction, &[], TurnKind::Auto, false)
                    .await?;
                if !auto.status.is_completed() {
                    break;
                }
            }
        }

        Ok(TurnReport {
            status: outcome.status,
            continuations,
            fallback_used: outcome.fallback_used,
        })
    }

    /// Re-issue the most recent user turn with the newest assistant reply
    /// dropped from history. Enforces the first-content timeout.
    pub async fn regenerate(&mut self) -> Result<TurnReport> {
        let input = self
            .last_user_input
            .clone()
            .ok_or_else(|| eyre::eyre!("no user turn to regenerate"))?;
        debug!(session_id = %self.session_id, "regenerate");

        if self.history.last().is_some_and(|m| m.role == Role::Assistant) {
            self.history.pop();
            if self.history.last().is_some_and(|m| m.role == Role::User) {
                self.history.pop();
            }
        }

        let outcome = self.dispatch_turn(&input, &[], TurnKind::User, true).await?;
        Ok(TurnReport {
            status: outcome.status,
            continuations: 0,
            fallback_used: outcome.fallback_used,
        })
    }

    /// Cancel whatever turn is in flight for this session
    pub fn cancel(&self) {
        self.scope.cancel();
    }

    async fn dispatch_turn(
        &mut self,
        input: &str,
        images: &[PathBuf],
        kind: TurnKind,
        enforce_timeout: bool,
    ) -> Result<DispatchOutcome> {
        if kind == TurnKind::User {
            self.last_user_input = Some(input.to_string());
        }

        let image_parts = load_image_parts(images).await?;

        let mut history_parts = vec![MessagePart::text(input)];
        history_parts.extend(image_parts.iter().cloned());
        let history_message = ChatMessage {
            role: Role::User,
            parts: history_parts,
        };

        let request_text = self.augment(input, kind).await;
        let mut request_parts = vec![MessagePart::text(request_text)];
        request_parts.extend(image_parts);
        let current = ChatMessage {
            role: Role::User,
            parts: request_parts,
        };

        let _ = self
            .ui_tx
            .send(UiEvent::MessageAdded {
                role: Role::User,
                content: input.to_string(),
            })
            .await;
        let _ = self
            .ui_tx
            .send(UiEvent::MessageAdded {
                role: Role::Assistant,
                content: String::new(),
            })
            .await;
        let _ = self.ui_tx.send(UiEvent::SetLoading(true)).await;
        let _ = self.ui_tx.send(UiEvent::SetGenerating(true)).await;

        let messages = self.assemble(current);
        let provider = self.provider.clone();
        let mut outcome = self.run_stream_turn(&provider, &messages, enforce_timeout).await;

        let mut fallback_used = false;
        if let TurnStatus::Failed(err) = &outcome.status {
            warn!(error = %err, provider = provider.label(), "turn failed");
            if let Some(fb) = self.fallback_target().cloned() {
                fallback_used = true;
                let _ = self
                    .ui_tx
                    .send(UiEvent::MessageAdded {
                        role: Role::System,
                        content: format!("switching to fallback model {}", fb.model()),
                    })
                    .await;
                let _ = self
                    .ui_tx
                    .send(UiEvent::MessageAdded {
                        role: Role::Assistant,
                        content: String::new(),
                    })
                    .await;
                let _ = self.ui_tx.send(UiEvent::SetLoading(true)).await;
                outcome = self.run_stream_turn(&fb, &messages, enforce_timeout).await;
            }
        }

        match &outcome.status {
            TurnStatus::Completed { text } => {
                self.history.push(history_message);
                self.history.push(ChatMessage::assistant(text.clone()));
            }
            TurnStatus::Cancelled => {}
            TurnStatus::Failed(err) => {
                if outcome.streamed.is_empty() {
                    let _ = self.ui_tx.send(UiEvent::ReplaceLastContent(String::new())).await;
                }
                let _ = self.ui_tx.send(UiEvent::SetLoading(false)).await;
                let _ = self
                    .ui_tx
                    .send(UiEvent::MessageAdded {
                        role: Role::System,
                        content: err.user_message().to_string(),
                    })
                    .await;
                let _ = self.ui_tx.send(UiEvent::SetGenerating(false)).await;
            }
        }

        Ok(DispatchOutcome {
            status: outcome.status,
            fallback_used,
        })
    }

    /// Open a stream against `provider` and consume it to a terminal state.
    async fn run_stream_turn(
        &self,
        provider: &ProviderConfig,
        messages: &[ChatMessage],
        enforce_timeout: bool,
    ) -> StreamOutcome {
        let request = codec::build_request(provider, messages);
        let task_id = Uuid::now_v7().to_string();
        debug!(%task_id, provider = provider.label(), model = provider.model(), "opening stream");

        let mut handle = self.transport.open(request, &task_id).await;
        self.scope.register(&task_id, Arc::clone(&handle.cancelled));

        let started = tokio::time::Instant::now();
        let hint_at = started
            + if self.config.slow_hint_after_ms > 0 {
                Duration::from_millis(self.config.slow_hint_after_ms)
            } else {
                FAR_FUTURE
            };
        let deadline = started
            + if enforce_timeout && self.config.response_timeout_ms > 0 {
                Duration::from_millis(self.config.response_timeout_ms)
            } else {
                FAR_FUTURE
            };
        let persist_interval = Duration::from_millis(self.config.persist_interval_ms);

        let mut streamed = String::new();
        let mut first = true;
        let mut hint_shown = false;
        let mut last_persist = std::time::Instant::now();

        let status = loop {
            tokio::select! {
                event = handle.events.recv() => match event {
                    Some(StreamEvent::Payload(payload)) => {
                        let Some(delta) = codec::parse_payload(provider, &payload) else {
                            continue;
                        };
                        if delta.is_empty() {
                            continue;
                        }
                        if first {
                            first = false;
                            let _ = self.ui_tx.send(UiEvent::SetLoading(false)).await;
                            if hint_shown {
                                // Retract the hint before real content lands
                                let _ = self.ui_tx.send(UiEvent::ReplaceLastContent(String::new())).await;
                            }
                        }
                        streamed.push_str(&delta);
                        if self.config.stream_visibly {
                            self.display_delta(&delta).await;
                        }
                        if last_persist.elapsed() >= persist_interval {
                            self.persist(&streamed).await;
                            last_persist = std::time::Instant::now();
                        }
                    }
                    Some(StreamEvent::Done) => break self.finish_completed(&streamed).await,
                    Some(StreamEvent::Cancelled) => break self.finish_cancelled(&streamed).await,
                    Some(StreamEvent::Failed(err)) => break self.finish_failed(err, &streamed).await,
                    // Channel closed without a terminal event: the transport
                    // task was torn down. The flag decides cancel vs failure.
                    None => {
                        if handle.cancelled.load(Ordering::SeqCst) {
                            break self.finish_cancelled(&streamed).await;
                        }
                        break self
                            .finish_failed(
                                ChatError::Unknown("stream ended unexpectedly".to_string()),
                                &streamed,
                            )
                            .await;
                    }
                },
                _ = tokio::time::sleep_until(hint_at), if first && !hint_shown => {
                    hint_shown = true;
                    self.show_hint().await;
                }
                _ = tokio::time::sleep_until(deadline), if first => {
                    let timeout = Duration::from_millis(self.config.response_timeout_ms);
                    warn!(%task_id, ?timeout, "no content before deadline, aborting stream");
                    self.transport.cancel(&task_id);
                    break TurnStatus::Failed(ChatError::Timeout(timeout));
                }
            }
        };

        self.scope.finish(&task_id);
        StreamOutcome { status, streamed }
    }

    async fn finish_completed(&self, streamed: &str) -> TurnStatus {
        let _ = self.ui_tx.send(UiEvent::SetLoading(false)).await;
        if streamed.is_empty() {
            let _ = self.ui_tx.send(UiEvent::ReplaceLastContent(String::new())).await;
        } else {
            if !self.config.stream_visibly {
                let _ = self.ui_tx.send(UiEvent::ReplaceLastContent(streamed.to_string())).await;
            }
            self.persist(streamed).await;
            if let Err(err) = self.gateway.touch_session(&self.session_id).await {
                warn!(error = %err, session_id = %self.session_id, "touch_session failed");
            }
        }
        let _ = self.ui_tx.send(UiEvent::SetGenerating(false)).await;
        TurnStatus::Completed {
            text: streamed.to_string(),
        }
    }

    async fn finish_cancelled(&self, streamed: &str) -> TurnStatus {
        debug!(session_id = %self.session_id, partial_len = streamed.len(), "turn cancelled");
        let _ = self.ui_tx.send(UiEvent::SetLoading(false)).await;
        if streamed.is_empty() {
            // Nothing arrived: remove the placeholder, persist nothing
            let _ = self.ui_tx.send(UiEvent::ReplaceLastContent(String::new())).await;
        } else {
            let marked = format!("{streamed}\n\n{CANCEL_MARKER}");
            let _ = self.ui_tx.send(UiEvent::ReplaceLastContent(marked.clone())).await;
            self.persist(&marked).await;
        }
        let _ = self.ui_tx.send(UiEvent::SetGenerating(false)).await;
        TurnStatus::Cancelled
    }

    async fn finish_failed(&self, err: ChatError, streamed: &str) -> TurnStatus {
        // Keep whatever streamed before the failure
        if !streamed.is_empty() {
            self.persist(streamed).await;
        }
        TurnStatus::Failed(err)
    }

    /// Prompt assembly: system prompt, presets, windowed history, current turn
    fn assemble(&self, current: ChatMessage) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        if let Some(prompt) = &self.config.system_prompt {
            messages.push(ChatMessage::system(prompt.clone()));
        }
        for preset in &self.config.presets {
            messages.push(ChatMessage {
                role: preset.role,
                parts: vec![MessagePart::text(preset.text.clone())],
            });
        }
        let window = self.config.history_window.saturating_mul(2);
        let tail = self.history.len().saturating_sub(window);
        messages.extend(self.history[tail..].iter().cloned());
        messages.push(current);
        messages
    }

    /// Retrieval context then template substitution, user turns only
    async fn augment(&self, input: &str, kind: TurnKind) -> String {
        if kind == TurnKind::Auto {
            return input.to_string();
        }
        let mut text = input.to_string();
        if self.config.retrieval {
            if let Some(retriever) = &self.retriever {
                let context = retriever.retrieve_knowledge(input).await;
                if !context.is_empty() {
                    debug!(context_len = context.len(), "augmenting with retrieved knowledge");
                    text = format!("Relevant knowledge:\n{context}\n\n{text}");
                }
            }
        }
        if let Some(template) = &self.config.template {
            text = template.replace("{{input}}", &text);
        }
        text
    }

    fn fallback_target(&self) -> Option<&ProviderConfig> {
        if self.provider.is_local() {
            return None;
        }
        self.fallback.as_ref().filter(|fb| !fb.model().is_empty())
    }

    async fn display_delta(&self, delta: &str) {
        if self.config.char_delay_ms == 0 {
            let _ = self.ui_tx.send(UiEvent::AppendToLast(delta.to_string())).await;
            return;
        }
        let pause = Duration::from_millis(self.config.char_delay_ms);
        for ch in delta.chars() {
            let _ = self.ui_tx.send(UiEvent::AppendToLast(ch.to_string())).await;
            tokio::time::sleep(pause).await;
        }
    }

    async fn show_hint(&self) {
        debug!(session_id = %self.session_id, "first byte slow, showing hint");
        let pause = Duration::from_millis(HINT_CHAR_DELAY_MS);
        for ch in SLOW_HINT.chars() {
            let _ = self.ui_tx.send(UiEvent::AppendToLast(ch.to_string())).await;
            tokio::time::sleep(pause).await;
        }
    }

    async fn persist(&self, content: &str) {
        if let Err(err) = self
            .gateway
            .replace_last_assistant_message(&self.session_id, Role::Assistant, content)
            .await
        {
            warn!(error = %err, session_id = %self.session_id, "persist failed");
        }
    }
}

async fn load_image_parts(images: &[PathBuf]) -> Result<Vec<MessagePart>> {
    let mut parts = Vec::with_capacity(images.len());
    for path in images {
        let bytes = tokio::fs::read(path)
            .await
            .context(format!("Failed to read image {}", path.display()))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        parts.push(MessagePart::image(format!(
            "data:{};base64,{encoded}",
            mime_for(path)
        )));
    }
    Ok(parts)
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}
