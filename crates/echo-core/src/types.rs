use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};

/// High-level client lifecycle state reported to the frontend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LifecycleState {
    /// Runtime has not been initialized yet.
    Cold,
    /// Runtime has accepted `Init` and knows its server URL.
    Configured,
    /// A login, signup or session restore flow is currently running.
    Authenticating,
    /// A session is active and feed commands are accepted.
    Authenticated,
    /// Realtime subscriptions are running on top of an active session.
    Streaming,
    /// The session was cleared by logout or by an irrecoverable refresh failure.
    LoggedOut,
    /// Runtime entered an unrecoverable fatal state.
    Fatal,
}

/// Authenticated session owned by the client process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    /// Short-lived bearer credential for GraphQL calls.
    pub access_token: Option<String>,
    /// Identifier of the logged-in user, when known.
    pub user_id: Option<String>,
}

impl Session {
    pub fn new(access_token: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            user_id,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }
}

/// Reaction a user can attach to a post.
///
/// Serialized in upper case for GraphQL. The realtime streams send lower-case
/// names, so both spellings deserialize.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReactionType {
    #[serde(alias = "surprise")]
    Surprise,
    #[serde(alias = "empathy")]
    Empathy,
    #[serde(alias = "laugh")]
    Laugh,
    #[serde(alias = "sad")]
    Sad,
    #[serde(alias = "confused")]
    Confused,
}

impl ReactionType {
    pub const ALL: [ReactionType; 5] = [
        ReactionType::Surprise,
        ReactionType::Empathy,
        ReactionType::Laugh,
        ReactionType::Sad,
        ReactionType::Confused,
    ];

    /// Wire name used by GraphQL variables.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Surprise => "SURPRISE",
            Self::Empathy => "EMPATHY",
            Self::Laugh => "LAUGH",
            Self::Sad => "SAD",
            Self::Confused => "CONFUSED",
        }
    }
}

impl fmt::Display for ReactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not one of the known reaction names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown reaction type '{0}'")]
pub struct UnknownReactionType(pub String);

impl FromStr for ReactionType {
    type Err = UnknownReactionType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|reaction| reaction.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| UnknownReactionType(value.to_owned()))
    }
}

/// Feed post as returned by the `timeline` query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    /// Post identifier. Accepted as a JSON string or integer.
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub author_avatar: String,
    /// Number of times the backend has shown the post.
    #[serde(default)]
    pub display_count: u32,
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(value) => value,
        RawId::Number(value) => value.to_string(),
    })
}

/// Realtime reaction notification delivered on the reactions stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionEvent {
    pub post_id: String,
    pub reactor_user_id: String,
    pub reaction_type: ReactionType,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Reaction the author's avatar should display next.
    pub latest_reaction_for_author: ReactionType,
}

/// Realtime post notification delivered on the posts stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PostEvent {
    /// A post was created by any user.
    NewPost {
        post_id: String,
        user_id: String,
        content: String,
        image_url: Option<String>,
        display_count: u32,
        created_at: i64,
        author_name: String,
        author_avatar: String,
    },
    /// Backend bumped the display counter of a post.
    DisplayCountUpdated { post_id: String, display_count: u32 },
    /// Post reached its display cap and was removed.
    PostDeleted { post_id: String },
}

impl PostEvent {
    pub fn post_id(&self) -> &str {
        match self {
            Self::NewPost { post_id, .. }
            | Self::DisplayCountUpdated { post_id, .. }
            | Self::PostDeleted { post_id } => post_id,
        }
    }

    /// Feed post carried by a `new_post` event.
    pub fn to_post(&self) -> Option<Post> {
        match self {
            Self::NewPost {
                post_id,
                content,
                image_url,
                display_count,
                author_name,
                author_avatar,
                ..
            } => Some(Post {
                id: post_id.clone(),
                content: content.clone(),
                image_url: image_url.clone(),
                author_name: author_name.clone(),
                author_avatar: author_avatar.clone(),
                display_count: *display_count,
            }),
            _ => None,
        }
    }
}

/// Realtime channel served by the backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StreamChannel {
    Reactions,
    Posts,
}

impl StreamChannel {
    /// Server path of the event stream endpoint.
    pub fn path(self) -> &'static str {
        match self {
            Self::Reactions => "/api/reactions/events",
            Self::Posts => "/api/posts/events",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reactions => "reactions",
            Self::Posts => "posts",
        }
    }
}

impl fmt::Display for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one renewing realtime subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StreamState {
    /// Subscription exists but has not started minting.
    Idle,
    /// Requesting a fresh stream token.
    Minting,
    /// Event stream is open; `generation` increments on every connection.
    Connected { generation: u64 },
    /// Renewal timer fired; the current connection is being rotated.
    ScheduledRenewal,
    /// Minting or the connection failed; waiting before the next attempt.
    Error,
    /// Subscription was stopped explicitly.
    Disconnected,
}

/// Optional runtime tuning values supplied with `BackendCommand::Init`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BackendInitConfig {
    /// Page size used by `LoadTimeline` and `LoadMore`.
    pub timeline_page_size: Option<u16>,
    /// Cap on posts retained by the timeline reducer.
    pub timeline_max_items: Option<usize>,
    /// Stream token renewal interval in milliseconds.
    pub stream_renewal_interval_ms: Option<u64>,
    /// Minimum delay between two accepted `LoadMore` commands.
    pub load_more_cooldown_ms: Option<u64>,
}

/// Command channel input accepted by the client runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendCommand {
    /// Initialize the runtime against a backend base URL.
    Init {
        /// Base URL, for example `http://localhost:8000`.
        server_url: String,
        /// Optional runtime tuning overrides.
        config: Option<BackendInitConfig>,
    },
    /// Login with username and password.
    Login { username: String, password: String },
    /// Create an account and login.
    Signup { username: String, password: String },
    /// Restore the persisted session, refreshing the access token when needed.
    RestoreSession,
    /// Open the reactions and posts subscriptions.
    StartRealtime,
    /// Close both subscriptions.
    StopRealtime,
    /// Load the first timeline page, replacing the server-confirmed set.
    LoadTimeline,
    /// Fetch another page and merge it by post ID.
    LoadMore,
    /// Publish a new post.
    CreatePost {
        /// Frontend-provided transaction ID echoed in `PostAck`.
        client_txn_id: String,
        content: String,
        image_url: Option<String>,
    },
    /// Add `reaction`, or remove it when it is already applied.
    ToggleReaction {
        post_id: String,
        reaction: ReactionType,
    },
    /// Report that a post was shown to the user.
    IncrementDisplayCount { post_id: String },
    /// Fetch the latest reaction received by a user's posts.
    FetchLatestReaction { user_id: String },
    /// Logout and clear persisted session state.
    Logout,
}

/// Owned view of the timeline reducer for frontend rendering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TimelineSnapshot {
    /// Posts in display order (realtime first, then server pages).
    pub posts: Vec<Post>,
    /// Reaction the current user applied, keyed by post ID.
    pub user_reactions: BTreeMap<String, ReactionType>,
    /// Stable error code of the last failed feed operation.
    pub error_code: Option<String>,
}

/// Acknowledgement for `CreatePost`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostAck {
    /// Original frontend transaction ID.
    pub client_txn_id: String,
    pub success: bool,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Acknowledgement for `ToggleReaction`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionAck {
    pub post_id: String,
    /// Reaction applied after the toggle; `None` when removed or on failure.
    pub reaction: Option<ReactionType>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Realtime subscription status update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RealtimeStatus {
    pub channel: StreamChannel,
    pub state: StreamState,
}

/// Event channel output emitted by the client runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendEvent {
    /// Lifecycle transition.
    StateChanged { state: LifecycleState },
    /// Result of login/signup/session-restore flow.
    AuthResult {
        success: bool,
        /// Logged-in user on success.
        user_id: Option<String>,
        /// Stable error code when `success == false`.
        error_code: Option<String>,
    },
    /// Session was cleared after an irrecoverable refresh failure.
    SessionExpired,
    /// Timeline reducer changed.
    TimelineUpdated(TimelineSnapshot),
    /// `CreatePost` acknowledgement.
    PostAck(PostAck),
    /// `ToggleReaction` acknowledgement.
    ReactionAck(ReactionAck),
    /// Someone reacted to one of the user's posts.
    ReactionReceived(ReactionEvent),
    /// Expression the user's avatar should show.
    AvatarExpression { reaction: ReactionType },
    /// Realtime subscription status update.
    RealtimeStatus(RealtimeStatus),
    /// Runtime error not tied to a specific acknowledgement.
    FatalError {
        code: String,
        message: String,
        /// Indicates whether retrying may recover.
        recoverable: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_accepts_numeric_and_string_ids() {
        let numeric: Post =
            serde_json::from_str(r#"{"id": 42, "content": "hi", "imageUrl": null}"#)
                .expect("numeric id should parse");
        assert_eq!(numeric.id, "42");
        assert_eq!(numeric.display_count, 0);

        let text: Post = serde_json::from_str(
            r#"{"id": "7f1c", "content": "hi", "authorName": "echo", "authorAvatar": "a.png", "displayCount": 3}"#,
        )
        .expect("string id should parse");
        assert_eq!(text.id, "7f1c");
        assert_eq!(text.author_name, "echo");
        assert_eq!(text.display_count, 3);
    }

    #[test]
    fn reaction_event_uses_snake_case_wire_fields() {
        let event: ReactionEvent = serde_json::from_str(
            r#"{
                "post_id": "p1",
                "reactor_user_id": "u2",
                "reaction_type": "LAUGH",
                "timestamp": 1731000000,
                "latest_reaction_for_author": "LAUGH"
            }"#,
        )
        .expect("reaction event should parse");
        assert_eq!(event.reaction_type, ReactionType::Laugh);
        assert_eq!(event.latest_reaction_for_author, ReactionType::Laugh);
    }

    #[test]
    fn post_event_is_tagged_by_type() {
        let event: PostEvent = serde_json::from_str(
            r#"{"type": "display_count_updated", "post_id": "p9", "display_count": 12}"#,
        )
        .expect("post event should parse");
        assert_eq!(
            event,
            PostEvent::DisplayCountUpdated {
                post_id: "p9".into(),
                display_count: 12,
            }
        );
        assert_eq!(event.post_id(), "p9");
        assert_eq!(event.to_post(), None);
    }

    #[test]
    fn new_post_event_converts_to_feed_post() {
        let event = PostEvent::NewPost {
            post_id: "p1".into(),
            user_id: "u1".into(),
            content: "hello".into(),
            image_url: None,
            display_count: 0,
            created_at: 1_731_000_000,
            author_name: "Mika".into(),
            author_avatar: "mika.png".into(),
        };
        let post = event.to_post().expect("new_post carries a post");
        assert_eq!(post.id, "p1");
        assert_eq!(post.author_name, "Mika");
    }

    #[test]
    fn reaction_type_parses_either_case() {
        assert_eq!("SAD".parse::<ReactionType>(), Ok(ReactionType::Sad));
        assert_eq!("sad".parse::<ReactionType>(), Ok(ReactionType::Sad));
        assert_eq!(
            "grin".parse::<ReactionType>(),
            Err(UnknownReactionType("grin".into()))
        );
    }

    #[test]
    fn reaction_event_accepts_lowercase_stream_names() {
        let event: ReactionEvent = serde_json::from_str(
            r#"{"post_id":"6f1c","reactor_user_id":"u2","reaction_type":"laugh","timestamp":1731000000,"latest_reaction_for_author":"laugh"}"#,
        )
        .expect("stream payload should parse");

        assert_eq!(event.reaction_type, ReactionType::Laugh);
        assert_eq!(event.latest_reaction_for_author, ReactionType::Laugh);
        assert_eq!(
            serde_json::to_value(ReactionType::Laugh).expect("serialize"),
            serde_json::json!("LAUGH")
        );
    }

    #[test]
    fn session_is_authenticated_only_with_token() {
        assert!(!Session::default().is_authenticated());
        assert!(Session::new("tok", None).is_authenticated());
    }

    #[test]
    fn stream_channel_paths_are_stable() {
        assert_eq!(StreamChannel::Reactions.path(), "/api/reactions/events");
        assert_eq!(StreamChannel::Posts.path(), "/api/posts/events");
    }
}
