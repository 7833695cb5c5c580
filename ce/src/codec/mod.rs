//! Wire codec: provider-agnostic messages in, provider-specific requests out
//!
//! Pure transforms, no side effects. Each provider variant gets an
//! exhaustive dispatch here; the per-provider encoding lives in its own
//! module.

use tracing::debug;

pub mod gemini;
pub mod openai;
pub mod types;

pub use types::{ChatMessage, IMAGE_MARKER_END, IMAGE_MARKER_START, MessagePart, Role, inline_to_parts, parts_to_inline};

use crate::config::ProviderConfig;

/// A fully-built provider request ready for the transport client
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
}

/// Build the provider-specific streaming request
pub fn build_request(provider: &ProviderConfig, messages: &[ChatMessage]) -> ProviderRequest {
    debug!(provider = provider.label(), "build_request: called");
    match provider {
        ProviderConfig::OpenAi {
            base_url,
            api_key,
            model,
            params,
        }
        | ProviderConfig::Local {
            base_url,
            api_key,
            model,
            params,
        } => ProviderRequest {
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            headers: vec![("Authorization".to_string(), format!("Bearer {}", api_key))],
            body: openai::build_request_body(model, params, messages),
        },
        ProviderConfig::Gemini {
            base_url,
            api_key,
            model,
            params,
        } => ProviderRequest {
            url: format!(
                "{}/models/{}:streamGenerateContent?alt=sse&key={}",
                base_url.trim_end_matches('/'),
                model,
                api_key
            ),
            headers: vec![],
            body: gemini::build_request_body(params, messages),
        },
    }
}

/// Decode one raw SSE payload into a text delta.
///
/// Keep-alive, metadata-only, sentinel, and malformed payloads all yield
/// `None`; transport-level errors are surfaced separately.
pub fn parse_payload(provider: &ProviderConfig, payload: &str) -> Option<String> {
    match provider {
        ProviderConfig::OpenAi { .. } | ProviderConfig::Local { .. } => openai::parse_payload(payload),
        ProviderConfig::Gemini { .. } => gemini::parse_payload(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerationParams;

    fn openai_provider() -> ProviderConfig {
        ProviderConfig::OpenAi {
            base_url: "https://api.example.com/v1/".to_string(),
            api_key: "sk-test".to_string(),
            model: "gpt-4o".to_string(),
            params: GenerationParams::default(),
        }
    }

    fn gemini_provider() -> ProviderConfig {
        ProviderConfig::Gemini {
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key: "g-test".to_string(),
            model: "gemini-pro".to_string(),
            params: GenerationParams::default(),
        }
    }

    #[test]
    fn test_openai_request_url_and_auth() {
        let req = build_request(&openai_provider(), &[ChatMessage::user("hi")]);
        assert_eq!(req.url, "https://api.example.com/v1/chat/completions");
        assert_eq!(req.headers[0].0, "Authorization");
        assert_eq!(req.headers[0].1, "Bearer sk-test");
        assert_eq!(req.body["stream"], true);
    }

    #[test]
    fn test_gemini_request_url_carries_key() {
        let req = build_request(&gemini_provider(), &[ChatMessage::user("hi")]);
        assert!(req.url.contains(":streamGenerateContent?alt=sse&key=g-test"));
        assert!(req.headers.is_empty());
        assert!(req.body["contents"].is_array());
    }

    #[test]
    fn test_parse_dispatch() {
        let openai_payload = r#"{"choices":[{"delta":{"content":"a"}}]}"#;
        let gemini_payload = r#"{"candidates":[{"content":{"parts":[{"text":"b"}]}}]}"#;

        assert_eq!(parse_payload(&openai_provider(), openai_payload), Some("a".to_string()));
        assert_eq!(parse_payload(&gemini_provider(), gemini_payload), Some("b".to_string()));
        // wrong-provider payloads are noise, not errors
        assert_eq!(parse_payload(&openai_provider(), gemini_payload), None);
    }
}
