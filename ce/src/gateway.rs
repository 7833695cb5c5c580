//! External collaborator seams
//!
//! The orchestrator talks to persistence, retrieval, and the presentation
//! layer through these interfaces only. Presentation consumes a channel of
//! [`UiEvent`]s; it never shares mutable state with the engine.

use async_trait::async_trait;
use std::sync::Mutex;
use tracing::debug;

use crate::codec::Role;

/// Signals emitted toward the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// A new message was added to the visible list
    MessageAdded { role: Role, content: String },
    /// Append a delta to the last message
    AppendToLast(String),
    /// Replace the last message's content wholesale.
    ///
    /// An empty replacement removes a never-filled placeholder.
    ReplaceLastContent(String),
    SetLoading(bool),
    SetGenerating(bool),
}

/// Opaque persistence gateway reachable by session id
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Idempotent upsert of the trailing assistant message for a session
    async fn replace_last_assistant_message(&self, session_id: &str, role: Role, content: &str) -> eyre::Result<()>;

    /// Notify that a session changed, for update-time ordering refresh
    async fn touch_session(&self, _session_id: &str) -> eyre::Result<()> {
        Ok(())
    }
}

/// Retrieval collaborator, invoked only for non-automated user turns
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return an augmentation context block for a query; empty when nothing
    /// relevant is indexed
    async fn retrieve_knowledge(&self, query: &str) -> String;
}

/// Production retriever over the local knowledge store.
///
/// rusqlite connections are not Sync, so queries serialize on a mutex; the
/// index is read-mostly and queries are short.
pub struct KnowledgeRetriever {
    store: Mutex<knowledgestore::KnowledgeStore>,
    options: knowledgestore::RetrieveOptions,
}

impl KnowledgeRetriever {
    pub fn new(store: knowledgestore::KnowledgeStore) -> Self {
        Self {
            store: Mutex::new(store),
            options: knowledgestore::RetrieveOptions::default(),
        }
    }
}

#[async_trait]
impl Retriever for KnowledgeRetriever {
    async fn retrieve_knowledge(&self, query: &str) -> String {
        let result = {
            let store = self.store.lock().expect("knowledge store lock poisoned");
            store.retrieve(query, &self.options)
        };
        match result {
            Ok(retrieval) => {
                debug!(trace = %retrieval.trace, "retrieve_knowledge: retrieval trace");
                retrieval.context
            }
            Err(e) => {
                tracing::warn!(error = %e, "retrieve_knowledge: retrieval failed, skipping augmentation");
                String::new()
            }
        }
    }
}

/// A gateway that only logs; used by the CLI when no store is wired
pub struct NullGateway;

#[async_trait]
impl PersistenceGateway for NullGateway {
    async fn replace_last_assistant_message(&self, session_id: &str, _role: Role, content: &str) -> eyre::Result<()> {
        debug!(%session_id, content_len = content.len(), "replace_last_assistant_message: no-op");
        Ok(())
    }
}

/// Test doubles for the collaborator seams
pub mod mock {
    use super::*;

    /// Gateway that records every upsert for assertions
    #[derive(Default)]
    pub struct RecordingGateway {
        writes: Mutex<Vec<(String, String)>>,
        touches: Mutex<Vec<String>>,
    }

    impl RecordingGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn writes(&self) -> Vec<(String, String)> {
            self.writes.lock().expect("mock lock poisoned").clone()
        }

        pub fn last_write(&self) -> Option<String> {
            self.writes
                .lock()
                .expect("mock lock poisoned")
                .last()
                .map(|(_, content)| content.clone())
        }

        pub fn touches(&self) -> Vec<String> {
            self.touches.lock().expect("mock lock poisoned").clone()
        }
    }

    #[async_trait]
    impl PersistenceGateway for RecordingGateway {
        async fn replace_last_assistant_message(
            &self,
            session_id: &str,
            _role: Role,
            content: &str,
        ) -> eyre::Result<()> {
            self.writes
                .lock()
                .expect("mock lock poisoned")
                .push((session_id.to_string(), content.to_string()));
            Ok(())
        }

        async fn touch_session(&self, session_id: &str) -> eyre::Result<()> {
            self.touches.lock().expect("mock lock poisoned").push(session_id.to_string());
            Ok(())
        }
    }

    /// Retriever that always returns a fixed context block
    pub struct StaticRetriever(pub String);

    #[async_trait]
    impl Retriever for StaticRetriever {
        async fn retrieve_knowledge(&self, _query: &str) -> String {
            self.0.clone()
        }
    }
}
