//! ChatEngine - streaming conversation engine
//!
//! ChatEngine drives conversations against OpenAI-compatible and Gemini
//! streaming endpoints, augments user turns from a local knowledge store,
//! and keeps per-session state in a bounded LRU cache.
//!
//! # Core Concepts
//!
//! - **One stream per session**: opening a new turn supersedes the session's
//!   in-flight stream; cancellation is cooperative and race-free
//! - **Fallback once**: a failed turn against a remote provider retries once
//!   against the configured local fallback before the failure surfaces
//! - **Ground before asking**: user turns are augmented with locally
//!   retrieved knowledge before they reach the provider
//!
//! # Modules
//!
//! - [`codec`] - provider wire formats (request bodies, SSE payload parsing)
//! - [`transport`] - cancellable SSE stream client
//! - [`orchestrator`] - the per-turn state machine and auto-loop planner
//! - [`session`] - per-session state and the bounded session cache
//! - [`gateway`] - persistence/UI seams the orchestrator talks through
//! - [`config`] - configuration types and loading

pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod session;
pub mod transport;

pub use codec::{ChatMessage, MessagePart, Role};
pub use config::{Config, GenerationParams, OrchestratorConfig, ProviderConfig};
pub use error::ChatError;
pub use orchestrator::{Orchestrator, TurnReport, TurnStatus};
pub use session::{SessionCache, SessionState};
pub use transport::{StreamClient, StreamEvent, StreamTransport};
