//! Auto-loop planner: asks the model what to do next.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::{self, ChatMessage};
use crate::config::ProviderConfig;
use crate::transport::{StreamEvent, StreamTransport};

/// Reply that ends the auto-loop
pub const STOP_SENTINEL: &str = "STOP";

/// Trailing conversation turns shown to the planner
const PLANNER_CONTEXT_TURNS: usize = 4;

const MAX_RETRIES: u32 = 2;
const INITIAL_BACKOFF_MS: u64 = 500;

const PLANNER_SYSTEM_PROMPT: &str = "You are a planning assistant supervising an ongoing \
conversation. Given the recent exchange, reply with a single short instruction that would \
productively continue the assistant's work. If the work is complete or no useful \
continuation exists, reply with exactly STOP.";

/// Ask the provider for the next instruction in an auto-loop.
///
/// Returns `None` when the planner replies with the stop sentinel, replies
/// with nothing usable, or keeps failing after retries. Planner transport
/// failures never surface to the user; the loop just ends.
pub async fn next_instruction(
    transport: &Arc<dyn StreamTransport>,
    provider: &ProviderConfig,
    history: &[ChatMessage],
) -> Option<String> {
    debug!(provider = provider.label(), "planner: requesting next instruction");

    let mut messages = vec![ChatMessage::system(PLANNER_SYSTEM_PROMPT)];
    let tail = history.len().saturating_sub(PLANNER_CONTEXT_TURNS);
    messages.extend(history[tail..].iter().cloned());
    messages.push(ChatMessage::user(
        "What should the assistant do next? Reply with one instruction, or STOP.",
    ));

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let backoff = INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1);
            debug!(attempt, backoff_ms = backoff, "planner: retrying");
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }

        let request = codec::build_request(provider, &messages);
        let task_id = format!("planner-{}", Uuid::now_v7());
        let mut handle = transport.open(request, &task_id).await;

        let mut reply = String::new();
        let mut failed = false;
        while let Some(event) = handle.events.recv().await {
            match event {
                StreamEvent::Payload(payload) => {
                    if let Some(delta) = codec::parse_payload(provider, &payload) {
                        reply.push_str(&delta);
                    }
                }
                StreamEvent::Done => break,
                StreamEvent::Cancelled => return None,
                StreamEvent::Failed(err) => {
                    warn!(error = %err, attempt, "planner: request failed");
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            continue;
        }
        return interpret(&reply);
    }

    warn!("planner: giving up after retries");
    None
}

/// Normalize a planner reply into an instruction, or `None` on stop.
fn interpret(reply: &str) -> Option<String> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return None;
    }
    // Models tend to decorate the sentinel with quotes or a period.
    let bare = trimmed.trim_matches(|c: char| !c.is_alphanumeric());
    if bare.eq_ignore_ascii_case(STOP_SENTINEL) {
        return None;
    }
    Some(trimmed.to_string())
}
