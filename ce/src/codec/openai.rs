//! OpenAI-compatible wire codec
//!
//! Builds Chat Completions request bodies and extracts text deltas from SSE
//! payloads. Used for both the OpenAI-compatible and local-inference
//! provider variants.

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::codec::types::{ChatMessage, MessagePart, inline_to_parts, parts_to_inline};
use crate::config::GenerationParams;

/// End-of-stream sentinel payload
pub const DONE_SENTINEL: &str = "[DONE]";

/// Build a streaming Chat Completions request body
pub fn build_request_body(model: &str, params: &GenerationParams, messages: &[ChatMessage]) -> serde_json::Value {
    debug!(%model, message_count = messages.len(), "build_request_body: called");
    json!({
        "model": model,
        "messages": messages.iter().map(convert_message).collect::<Vec<_>>(),
        "stream": true,
        "temperature": params.temperature,
        "top_p": params.top_p,
        "max_tokens": params.max_tokens,
    })
}

/// Convert a message to OpenAI wire format.
///
/// Plain-text messages use a string `content`; messages carrying images use
/// an array of typed blocks. In-band image markers in text parts are
/// re-split so embedded images always land in explicit blocks.
fn convert_message(msg: &ChatMessage) -> serde_json::Value {
    let parts = inline_to_parts(&parts_to_inline(&msg.parts));
    let has_images = parts.iter().any(|p| matches!(p, MessagePart::Image { .. }));

    if !has_images {
        return json!({
            "role": msg.role.as_openai(),
            "content": msg.text_content(),
        });
    }

    let blocks: Vec<serde_json::Value> = parts
        .iter()
        .map(|part| match part {
            MessagePart::Text { text } => json!({ "type": "text", "text": text }),
            MessagePart::Image { data_uri } => json!({
                "type": "image_url",
                "image_url": { "url": data_uri },
            }),
        })
        .collect();

    json!({
        "role": msg.role.as_openai(),
        "content": blocks,
    })
}

/// Extract the text delta from one SSE payload.
///
/// `[DONE]` and blank payloads are end-of-stream noise; malformed JSON is
/// skipped. Both yield `None`, never an error.
pub fn parse_payload(payload: &str) -> Option<String> {
    let payload = payload.trim();
    if payload.is_empty() || payload == DONE_SENTINEL {
        return None;
    }

    let chunk: StreamPayload = match serde_json::from_str(payload) {
        Ok(c) => c,
        Err(e) => {
            debug!(error = %e, "parse_payload: malformed payload skipped");
            return None;
        }
    };

    let choice = chunk.choices.into_iter().next()?;
    choice
        .delta
        .and_then(|d| d.content)
        .or_else(|| choice.message.and_then(|m| m.content))
}

// Wire types

#[derive(Debug, Deserialize)]
struct StreamPayload {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    message: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}
