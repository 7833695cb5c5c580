//! Session state cache
//!
//! Bounded LRU of per-session state. Each entry owns a cancellable scope;
//! evicting or removing an entry cancels any in-flight stream task before
//! the entry is dropped, without touching other sessions.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::codec::{ChatMessage, MessagePart};
use crate::gateway::UiEvent;
use crate::transport::StreamTransport;

/// Default cache bound
pub const DEFAULT_CACHE_SIZE: usize = 5;

struct ActiveTask {
    task_id: String,
    cancelled: Arc<AtomicBool>,
}

/// Per-session cancellable scope.
///
/// At most one active stream task per session; registering a new task
/// supersedes (cancels) the previous one. The cancellation flag is set
/// before transport teardown so a race with a natural terminal event cannot
/// misclassify a cancel as a failure.
#[derive(Clone)]
pub struct CancelScope {
    transport: Arc<dyn StreamTransport>,
    active: Arc<Mutex<Option<ActiveTask>>>,
}

impl CancelScope {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        Self {
            transport,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Register a new task as the session's only active task, cancelling any
    /// predecessor
    pub fn register(&self, task_id: &str, cancelled: Arc<AtomicBool>) {
        let previous = {
            let mut active = self.active.lock().expect("scope lock poisoned");
            active.replace(ActiveTask {
                task_id: task_id.to_string(),
                cancelled,
            })
        };
        if let Some(prev) = previous {
            debug!(superseded = %prev.task_id, by = %task_id, "register: superseding active task");
            prev.cancelled.store(true, Ordering::SeqCst);
            self.transport.cancel(&prev.task_id);
        }
    }

    /// Clear the active slot if it still holds this task
    pub fn finish(&self, task_id: &str) {
        let mut active = self.active.lock().expect("scope lock poisoned");
        if active.as_ref().is_some_and(|t| t.task_id == task_id) {
            *active = None;
        }
    }

    /// Cancel whatever is in flight. Idempotent.
    pub fn cancel(&self) {
        let task = self.active.lock().expect("scope lock poisoned").take();
        if let Some(task) = task {
            debug!(task_id = %task.task_id, "cancel: cancelling active task");
            task.cancelled.store(true, Ordering::SeqCst);
            self.transport.cancel(&task.task_id);
        }
    }

    /// True when a task is currently registered
    pub fn has_active(&self) -> bool {
        self.active.lock().expect("scope lock poisoned").is_some()
    }
}

/// Cached per-session state
pub struct SessionState {
    pub session_id: String,
    pub channel_name: String,
    pub messages: Mutex<Vec<ChatMessage>>,
    pub generating: AtomicBool,
    pub loading: AtomicBool,
    pub scope: CancelScope,
    pub created_at: DateTime<Utc>,
    last_active: Mutex<DateTime<Utc>>,
}

impl SessionState {
    fn new(session_id: &str, channel_name: &str, transport: Arc<dyn StreamTransport>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            channel_name: channel_name.to_string(),
            messages: Mutex::new(Vec::new()),
            generating: AtomicBool::new(false),
            loading: AtomicBool::new(false),
            scope: CancelScope::new(transport),
            created_at: now,
            last_active: Mutex::new(now),
        }
    }

    /// Mirror one presentation event into the cached transcript and flags.
    ///
    /// A consumer rendering [`UiEvent`]s feeds the same stream through here,
    /// so a session pulled back out of the cache resumes with the transcript
    /// and generation state it last showed.
    pub fn apply(&self, event: &UiEvent) {
        match event {
            UiEvent::MessageAdded { role, content } => {
                self.messages.lock().expect("session lock poisoned").push(ChatMessage {
                    role: *role,
                    parts: vec![MessagePart::text(content.clone())],
                });
            }
            UiEvent::AppendToLast(delta) => {
                let mut messages = self.messages.lock().expect("session lock poisoned");
                if let Some(last) = messages.last_mut() {
                    let mut text = last.text_content();
                    text.push_str(delta);
                    last.parts = vec![MessagePart::text(text)];
                }
            }
            UiEvent::ReplaceLastContent(content) => {
                let mut messages = self.messages.lock().expect("session lock poisoned");
                if content.is_empty() {
                    // an empty replacement removes a never-filled placeholder
                    if messages.last().is_some_and(|m| m.text_content().is_empty()) {
                        messages.pop();
                    } else if let Some(last) = messages.last_mut() {
                        last.parts = vec![MessagePart::text("")];
                    }
                } else if let Some(last) = messages.last_mut() {
                    last.parts = vec![MessagePart::text(content.clone())];
                }
            }
            UiEvent::SetLoading(on) => self.loading.store(*on, Ordering::SeqCst),
            UiEvent::SetGenerating(on) => self.generating.store(*on, Ordering::SeqCst),
        }
    }

    /// Record activity, for diagnostics and ordering
    pub fn touch(&self) {
        *self.last_active.lock().expect("session lock poisoned") = Utc::now();
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        *self.last_active.lock().expect("session lock poisoned")
    }
}

/// Bounded LRU cache of session state
pub struct SessionCache {
    transport: Arc<dyn StreamTransport>,
    capacity: usize,
    // most-recently-used at the back; eviction and insertion share this lock
    entries: Mutex<Vec<(String, Arc<SessionState>)>>,
}

impl SessionCache {
    pub fn new(transport: Arc<dyn StreamTransport>, capacity: usize) -> Self {
        Self {
            transport,
            capacity: capacity.max(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Return the existing entry or construct one bound to a fresh scope.
    /// Access updates recency; overflow evicts (and cancels) the LRU entry.
    pub fn get_or_create(&self, session_id: &str, channel_name: &str) -> Arc<SessionState> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");

        if let Some(pos) = entries.iter().position(|(id, _)| id == session_id) {
            let entry = entries.remove(pos);
            let state = Arc::clone(&entry.1);
            entries.push(entry);
            state.touch();
            return state;
        }

        let state = Arc::new(SessionState::new(session_id, channel_name, Arc::clone(&self.transport)));
        entries.push((session_id.to_string(), Arc::clone(&state)));

        while entries.len() > self.capacity {
            let (evicted_id, evicted) = entries.remove(0);
            info!(session_id = %evicted_id, "get_or_create: evicting LRU session");
            evicted.scope.cancel();
        }

        state
    }

    /// Force-evict one session, cancelling its scope
    pub fn remove(&self, session_id: &str) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if let Some(pos) = entries.iter().position(|(id, _)| id == session_id) {
            let (_, state) = entries.remove(pos);
            state.scope.cancel();
        }
    }

    /// Force-evict everything, cancelling all scopes
    pub fn clear(&self) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        for (_, state) in entries.drain(..) {
            state.scope.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
