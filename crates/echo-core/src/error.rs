use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::LifecycleState;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EchoErrorCategory {
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// Missing, expired or rejected credentials.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the backend.
    RateLimited,
    /// Application error reported in a GraphQL `errors` list.
    GraphQl,
    /// Secret store or other local persistence failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct EchoError {
    /// High-level error category.
    pub category: EchoErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl EchoError {
    pub fn new(
        category: EchoErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: LifecycleState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            EchoErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while client is in state {current:?}"),
        )
    }

    /// Build the error surfaced when a call is rejected for authentication.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(EchoErrorCategory::Auth, "unauthorized", message)
    }

    pub fn is_auth(&self) -> bool {
        self.category == EchoErrorCategory::Auth
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            EchoErrorCategory::Network | EchoErrorCategory::RateLimited
        )
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> EchoErrorCategory {
    match status {
        401 | 403 => EchoErrorCategory::Auth,
        408 | 429 => EchoErrorCategory::RateLimited,
        400..=499 => EchoErrorCategory::Config,
        500..=599 => EchoErrorCategory::Network,
        _ => EchoErrorCategory::Internal,
    }
}

/// Whether a GraphQL error message means the access token is missing or expired.
///
/// The backend reports expired tokens only through message text, so this is
/// the single place that knows the wording.
pub fn is_auth_failure_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("unauthorized") || lowered.contains("no valid access token")
}
