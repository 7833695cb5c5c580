//! Provider-agnostic message types
//!
//! Messages are built fresh per request from conversation history and never
//! mutated after construction. Images travel as data URIs, either as a
//! structured part or embedded in plain text via an in-band marker that the
//! codecs re-split losslessly.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Marker opening an in-band image embed
pub const IMAGE_MARKER_START: &str = "<|image|>";

/// Marker closing an in-band image embed
pub const IMAGE_MARKER_END: &str = "<|/image|>";

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    /// Wire name used by OpenAI-compatible providers
    pub fn as_openai(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    /// Gemini maps user to user and everything else to model
    pub fn as_gemini(&self) -> &'static str {
        match self {
            Role::User => "user",
            _ => "model",
        }
    }
}

/// One part of a message: plain text, or an image as a data URI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagePart {
    Text { text: String },
    Image { data_uri: String },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }

    pub fn image(data_uri: impl Into<String>) -> Self {
        MessagePart::Image {
            data_uri: data_uri.into(),
        }
    }
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub parts: Vec<MessagePart>,
}

impl ChatMessage {
    /// Create a system message with text content
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            parts: vec![MessagePart::text(text)],
        }
    }

    /// Create a user message with text content
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![MessagePart::text(text)],
        }
    }

    /// Create an assistant message with text content
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            parts: vec![MessagePart::text(text)],
        }
    }

    /// Create a user message from explicit parts
    pub fn user_parts(parts: Vec<MessagePart>) -> Self {
        debug!(part_count = %parts.len(), "ChatMessage::user_parts: called");
        Self { role: Role::User, parts }
    }

    /// Concatenated text content, ignoring image parts
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                MessagePart::Image { .. } => None,
            })
            .collect()
    }

    /// True when any part is an image
    pub fn has_images(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, MessagePart::Image { .. }))
    }
}

/// Flatten parts into a single string, embedding images via in-band markers
pub fn parts_to_inline(parts: &[MessagePart]) -> String {
    let mut out = String::new();
    for part in parts {
        match part {
            MessagePart::Text { text } => out.push_str(text),
            MessagePart::Image { data_uri } => {
                out.push_str(IMAGE_MARKER_START);
                out.push_str(data_uri);
                out.push_str(IMAGE_MARKER_END);
            }
        }
    }
    out
}

/// Re-split an inline string back into structured parts.
///
/// Lossless inverse of [`parts_to_inline`] for well-formed markers; an
/// unterminated marker is kept as literal text.
pub fn inline_to_parts(inline: &str) -> Vec<MessagePart> {
    let mut parts = Vec::new();
    let mut rest = inline;

    while let Some(start) = rest.find(IMAGE_MARKER_START) {
        let (before, after_start) = rest.split_at(start);
        if !before.is_empty() {
            parts.push(MessagePart::text(before));
        }
        let after_start = &after_start[IMAGE_MARKER_START.len()..];

        match after_start.find(IMAGE_MARKER_END) {
            Some(end) => {
                parts.push(MessagePart::image(&after_start[..end]));
                rest = &after_start[end + IMAGE_MARKER_END.len()..];
            }
            None => {
                // unterminated marker, keep as literal text
                parts.push(MessagePart::text(format!("{}{}", IMAGE_MARKER_START, after_start)));
                rest = "";
            }
        }
    }

    if !rest.is_empty() {
        parts.push(MessagePart::text(rest));
    }

    parts
}
