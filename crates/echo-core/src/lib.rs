//! Core contract shared between the Echo client runtime and its frontends.
//!
//! This crate defines the command/event protocol, feed and realtime payloads,
//! the lifecycle model, the timeline reducer and common error/channel
//! abstractions. It performs no I/O.

/// Async command/event channel primitives.
pub mod channel;
/// Stable error types, HTTP classification and the auth-failure predicate.
pub mod error;
/// Outcome normalization into acknowledgement events.
pub mod normalization;
/// Backoff policy used by realtime reconnects.
pub mod retry;
/// Client lifecycle state machine.
pub mod state_machine;
/// Timeline view state reducer.
pub mod timeline;
/// Frontend-facing protocol types (commands, events, payloads).
pub mod types;

pub use channel::{BackendChannelError, BackendChannels, EventStream};
pub use error::{EchoError, EchoErrorCategory, classify_http_status, is_auth_failure_message};
pub use normalization::{
    classify_stream_error_message, normalize_fatal_error, normalize_post_outcome,
    normalize_reaction_outcome,
};
pub use retry::RetryPolicy;
pub use state_machine::LifecycleStateMachine;
pub use timeline::{ReactionToggle, TimelineState};
pub use types::{
    BackendCommand, BackendEvent, BackendInitConfig, LifecycleState, Post, PostAck, PostEvent,
    ReactionAck, ReactionEvent, ReactionType, RealtimeStatus, Session, StreamChannel, StreamState,
    TimelineSnapshot, UnknownReactionType,
};
