//! Gemini wire codec
//!
//! Builds streamGenerateContent request bodies and extracts text deltas
//! from SSE payloads. Roles map user→user and everything else→model;
//! images become `inline_data` decoded from their data URIs.

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::codec::types::{ChatMessage, MessagePart, inline_to_parts, parts_to_inline};
use crate::config::GenerationParams;

/// Build a streaming generateContent request body
pub fn build_request_body(params: &GenerationParams, messages: &[ChatMessage]) -> serde_json::Value {
    debug!(message_count = messages.len(), "build_request_body: called");
    json!({
        "contents": messages.iter().map(convert_message).collect::<Vec<_>>(),
        "generationConfig": {
            "temperature": params.temperature,
            "topP": params.top_p,
            "maxOutputTokens": params.max_tokens,
        },
    })
}

fn convert_message(msg: &ChatMessage) -> serde_json::Value {
    let parts = inline_to_parts(&parts_to_inline(&msg.parts));
    let wire_parts: Vec<serde_json::Value> = parts
        .iter()
        .map(|part| match part {
            MessagePart::Text { text } => json!({ "text": text }),
            MessagePart::Image { data_uri } => match split_data_uri(data_uri) {
                Some((mime, data)) => json!({
                    "inline_data": { "mime_type": mime, "data": data },
                }),
                // not a well-formed data URI, pass through as text
                None => json!({ "text": data_uri }),
            },
        })
        .collect();

    json!({
        "role": msg.role.as_gemini(),
        "parts": wire_parts,
    })
}

/// Split `data:<mime>;base64,<data>` into (mime, data)
fn split_data_uri(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix("data:")?;
    let (mime, data) = rest.split_once(";base64,")?;
    if mime.is_empty() { None } else { Some((mime, data)) }
}

/// Extract the text delta from one SSE payload.
///
/// Malformed or metadata-only payloads yield `None`, never an error.
pub fn parse_payload(payload: &str) -> Option<String> {
    let payload = payload.trim();
    if payload.is_empty() || payload == super::openai::DONE_SENTINEL {
        return None;
    }

    let chunk: StreamPayload = match serde_json::from_str(payload) {
        Ok(c) => c,
        Err(e) => {
            debug!(error = %e, "parse_payload: malformed payload skipped");
            return None;
        }
    };

    chunk
        .candidates
        .into_iter()
        .next()?
        .content?
        .parts
        .into_iter()
        .next()?
        .text
}

// Wire types

#[derive(Debug, Deserialize)]
struct StreamPayload {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}
