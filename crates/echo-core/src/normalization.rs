use crate::{
    error::{EchoError, EchoErrorCategory},
    timeline::ReactionToggle,
    types::{BackendEvent, PostAck, ReactionAck},
};

/// Convert a `createPost` result to a stable `BackendEvent::PostAck`.
///
/// A `false` mutation result is reported as a rejected post.
pub fn normalize_post_outcome(
    client_txn_id: impl Into<String>,
    outcome: Result<bool, EchoError>,
) -> BackendEvent {
    let client_txn_id = client_txn_id.into();
    let error_code = match outcome {
        Ok(true) => None,
        Ok(false) => Some("post_rejected".to_owned()),
        Err(error) => Some(error.code),
    };

    BackendEvent::PostAck(PostAck {
        client_txn_id,
        success: error_code.is_none(),
        error_code,
    })
}

/// Convert a reaction mutation result to a stable `BackendEvent::ReactionAck`.
pub fn normalize_reaction_outcome(
    post_id: impl Into<String>,
    toggle: ReactionToggle,
    outcome: &Result<bool, EchoError>,
) -> BackendEvent {
    let post_id = post_id.into();
    match outcome {
        Ok(true) => BackendEvent::ReactionAck(ReactionAck {
            post_id,
            reaction: toggle.resulting_reaction(),
            error_code: None,
        }),
        Ok(false) => BackendEvent::ReactionAck(ReactionAck {
            post_id,
            reaction: None,
            error_code: Some("reaction_rejected".to_owned()),
        }),
        Err(error) => BackendEvent::ReactionAck(ReactionAck {
            post_id,
            reaction: None,
            error_code: Some(error.code.clone()),
        }),
    }
}

/// Convert an error into a `FatalError` event.
pub fn normalize_fatal_error(error: EchoError) -> BackendEvent {
    let recoverable = error.is_recoverable();
    BackendEvent::FatalError {
        code: error.code,
        message: error.message,
        recoverable,
    }
}

/// Wrap a stream/transport failure message as a network-classified error.
pub fn classify_stream_error_message(message: impl Into<String>) -> EchoError {
    EchoError::new(EchoErrorCategory::Network, "stream_failed", message.into())
}
