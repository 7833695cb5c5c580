//! Chat error taxonomy
//!
//! Transport and protocol failures are mapped deterministically into these
//! kinds. Raw error text is logged, never shown; `user_message` carries the
//! human-readable summary for the UI.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during a conversation turn
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChatError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication rejected (status {status})")]
    Authentication { status: u16 },

    #[error("rate limited")]
    RateLimited,

    #[error("request rejected (status {status}): {message}")]
    Request { status: u16, message: String },

    #[error("server error (status {status})")]
    Server { status: u16 },

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl ChatError {
    /// Map an HTTP status code to an error kind
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => ChatError::Authentication { status },
            429 => ChatError::RateLimited,
            400..=499 => ChatError::Request { status, message },
            500..=599 => ChatError::Server { status },
            _ => ChatError::Unknown(format!("unexpected status {}: {}", status, message)),
        }
    }

    /// Check if this is an explicit user cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChatError::Cancelled)
    }

    /// Human-readable summary shown to the user.
    ///
    /// Never includes raw exception text; that goes to the log.
    pub fn user_message(&self) -> &'static str {
        match self {
            ChatError::Network(_) => "network error, check your connection",
            ChatError::Authentication { .. } => "authentication failed, check your key",
            ChatError::RateLimited => "rate limited, retry later",
            ChatError::Request { .. } => "the request was rejected by the provider",
            ChatError::Server { .. } => "the provider had a server error, retry later",
            ChatError::Cancelled => "generation stopped",
            ChatError::Timeout(_) => "the response timed out",
            ChatError::Unknown(_) => "something went wrong, retry later",
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChatError::Timeout(Duration::from_secs(0))
        } else if let Some(status) = e.status() {
            ChatError::from_status(status.as_u16(), e.to_string())
        } else {
            ChatError::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            ChatError::from_status(401, String::new()),
            ChatError::Authentication { status: 401 }
        ));
        assert!(matches!(
            ChatError::from_status(403, String::new()),
            ChatError::Authentication { status: 403 }
        ));
        assert!(matches!(ChatError::from_status(429, String::new()), ChatError::RateLimited));
        assert!(matches!(
            ChatError::from_status(404, String::new()),
            ChatError::Request { status: 404, .. }
        ));
        assert!(matches!(
            ChatError::from_status(500, String::new()),
            ChatError::Server { status: 500 }
        ));
        assert!(matches!(
            ChatError::from_status(503, String::new()),
            ChatError::Server { status: 503 }
        ));
    }

    #[test]
    fn test_is_cancelled() {
        assert!(ChatError::Cancelled.is_cancelled());
        assert!(!ChatError::RateLimited.is_cancelled());
    }

    #[test]
    fn test_user_message_has_no_raw_detail() {
        let err = ChatError::Request {
            status: 422,
            message: "secret internal detail".to_string(),
        };
        assert!(!err.user_message().contains("secret"));
    }
}
