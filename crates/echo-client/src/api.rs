use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use echo_core::{
    EchoError, EchoErrorCategory, Post, PostEvent, ReactionEvent, ReactionType, RetryPolicy,
    Session, StreamChannel,
};
use echo_platform::TokenStore;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use url::Url;

use crate::{
    cookies::PersistentCookieJar,
    graphql::{GraphqlRequest, GraphqlTransport, HttpTransport},
    refresh::RefreshCoordinator,
    session::{SessionManager, SessionReader},
    sse::HttpEventConnector,
    subscription::{
        DEFAULT_RENEWAL_INTERVAL, EventConnector, RenewingSubscription, StreamTokenSource,
        SubscriptionConfig, SubscriptionHandle,
    },
    transport::AuthenticatedTransport,
};

const LOGIN_MUTATION: &str = "mutation Login($username: String!, $password: String!) { login(username: $username, password: $password) { accessToken userId } }";
const SIGNUP_MUTATION: &str = "mutation Signup($username: String!, $password: String!) { signup(username: $username, password: $password) { accessToken userId } }";
const TIMELINE_QUERY: &str = "query Timeline($limit: Int!) { timeline(limit: $limit) { id content imageUrl authorName authorAvatar } }";
const USER_LATEST_REACTION_QUERY: &str =
    "query UserLatestReaction($userId: String!) { userLatestReaction(userId: $userId) }";
const CREATE_POST_MUTATION: &str = "mutation CreatePost($content: String!, $imageUrl: String) { createPost(content: $content, imageUrl: $imageUrl) }";
const ADD_REACTION_MUTATION: &str = "mutation AddReaction($postId: ID!, $reactionType: ReactionType!) { addReaction(postId: $postId, reactionType: $reactionType) }";
const REMOVE_REACTION_MUTATION: &str =
    "mutation RemoveReaction($postId: ID!) { removeReaction(postId: $postId) }";
const GENERATE_SSE_TOKEN_MUTATION: &str = "mutation GenerateSseToken { generateSseToken }";
const INCREMENT_DISPLAY_COUNT_MUTATION: &str =
    "mutation IncrementDisplayCount($postId: Int!) { incrementDisplayCount(postId: $postId) }";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthPayload {
    access_token: String,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Deserialize)]
struct LoginData {
    login: AuthPayload,
}

#[derive(Deserialize)]
struct SignupData {
    signup: AuthPayload,
}

#[derive(Deserialize)]
struct TimelineData {
    timeline: Vec<Post>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserLatestReactionData {
    user_latest_reaction: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePostData {
    create_post: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddReactionData {
    add_reaction: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveReactionData {
    remove_reaction: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateSseTokenData {
    generate_sse_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncrementDisplayCountData {
    increment_display_count: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoClientConfig {
    /// Backend base URL; GraphQL and stream paths are resolved against it.
    pub server_url: Url,
    pub stream_renewal_interval: Duration,
    pub reconnect_policy: RetryPolicy,
}

impl EchoClientConfig {
    pub fn new(server_url: &str) -> Result<Self, EchoError> {
        let mut server_url = Url::parse(server_url.trim()).map_err(|err| {
            EchoError::new(
                EchoErrorCategory::Config,
                "invalid_server_url",
                format!("invalid server URL '{server_url}': {err}"),
            )
        })?;
        if !server_url.path().ends_with('/') {
            let path = format!("{}/", server_url.path());
            server_url.set_path(&path);
        }

        Ok(Self {
            server_url,
            stream_renewal_interval: DEFAULT_RENEWAL_INTERVAL,
            reconnect_policy: RetryPolicy::default(),
        })
    }

    pub fn with_renewal_interval(mut self, interval: Duration) -> Self {
        self.stream_renewal_interval = interval;
        self
    }

    fn subscription_config(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            renewal_interval: self.stream_renewal_interval,
            reconnect_policy: self.reconnect_policy,
        }
    }
}

/// Typed Echo API on top of the authenticated transport.
#[derive(Clone)]
pub struct EchoClient {
    config: EchoClientConfig,
    session: Arc<SessionManager>,
    raw: Arc<dyn GraphqlTransport>,
    refresh: RefreshCoordinator,
    transport: AuthenticatedTransport,
    connector: Arc<dyn EventConnector>,
    cookies: Option<Arc<PersistentCookieJar>>,
}

impl EchoClient {
    /// HTTP client sharing one persistent cookie jar between GraphQL and streams.
    pub fn connect(config: EchoClientConfig, store: Option<TokenStore>) -> Result<Self, EchoError> {
        let cookies = Arc::new(PersistentCookieJar::load(
            config.server_url.clone(),
            store.clone(),
        )?);
        let http = Client::builder()
            .cookie_provider(Arc::clone(&cookies))
            .build()
            .map_err(|err| {
                EchoError::new(
                    EchoErrorCategory::Config,
                    "http_client_build_error",
                    err.to_string(),
                )
            })?;

        let raw = Arc::new(HttpTransport::new(http.clone(), &config.server_url)?);
        let connector = Arc::new(HttpEventConnector::new(http, config.server_url.clone()));
        let session = Arc::new(SessionManager::new(store));

        let mut client = Self::with_transports(config, session, raw, connector);
        client.cookies = Some(cookies);
        Ok(client)
    }

    /// Client over caller-supplied transports.
    pub fn with_transports(
        config: EchoClientConfig,
        session: Arc<SessionManager>,
        raw: Arc<dyn GraphqlTransport>,
        connector: Arc<dyn EventConnector>,
    ) -> Self {
        let refresh = RefreshCoordinator::new(Arc::clone(&raw), Arc::clone(&session));
        let transport = AuthenticatedTransport::new(Arc::clone(&raw), session.reader(), refresh.clone());
        Self {
            config,
            session,
            raw,
            refresh,
            transport,
            connector,
            cookies: None,
        }
    }

    pub fn config(&self) -> &EchoClientConfig {
        &self.config
    }

    pub fn session(&self) -> SessionReader {
        self.session.reader()
    }

    pub fn restore_session(&self) -> Result<Option<Session>, EchoError> {
        self.session.restore()
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Session, EchoError> {
        let request = GraphqlRequest::new(
            "Login",
            LOGIN_MUTATION,
            json!({ "username": username, "password": password }),
        );
        let data: LoginData = self.raw.execute(&request, None).await?.decode()?;
        self.install(data.login)
    }

    pub async fn signup(&self, username: &str, password: &str) -> Result<Session, EchoError> {
        let request = GraphqlRequest::new(
            "Signup",
            SIGNUP_MUTATION,
            json!({ "username": username, "password": password }),
        );
        let data: SignupData = self.raw.execute(&request, None).await?.decode()?;
        self.install(data.signup)
    }

    pub async fn refresh_session(&self) -> Option<String> {
        self.refresh.refresh().await
    }

    /// Forget the session and the refresh cookie.
    pub fn logout(&self) -> Result<(), EchoError> {
        self.session.clear()?;
        if let Some(cookies) = &self.cookies {
            cookies.clear()?;
        }
        info!("logged out");
        Ok(())
    }

    pub async fn timeline(&self, limit: u16) -> Result<Vec<Post>, EchoError> {
        let request = GraphqlRequest::new("Timeline", TIMELINE_QUERY, json!({ "limit": limit }));
        let data: TimelineData = self.transport.execute(&request).await?;
        Ok(data.timeline)
    }

    /// Latest reaction received on `user_id`'s posts.
    pub async fn user_latest_reaction(
        &self,
        user_id: &str,
    ) -> Result<Option<ReactionType>, EchoError> {
        let request = GraphqlRequest::new(
            "UserLatestReaction",
            USER_LATEST_REACTION_QUERY,
            json!({ "userId": user_id }),
        );
        let data: UserLatestReactionData = self.transport.execute(&request).await?;
        data.user_latest_reaction
            .map(|raw| {
                raw.parse::<ReactionType>().map_err(|err| {
                    EchoError::new(
                        EchoErrorCategory::Serialization,
                        "unknown_reaction_type",
                        err.to_string(),
                    )
                })
            })
            .transpose()
    }

    pub async fn create_post(
        &self,
        content: &str,
        image_url: Option<&str>,
    ) -> Result<bool, EchoError> {
        let request = GraphqlRequest::new(
            "CreatePost",
            CREATE_POST_MUTATION,
            json!({ "content": content, "imageUrl": image_url }),
        );
        let data: CreatePostData = self.transport.execute(&request).await?;
        Ok(data.create_post)
    }

    pub async fn add_reaction(
        &self,
        post_id: &str,
        reaction: ReactionType,
    ) -> Result<bool, EchoError> {
        let request = GraphqlRequest::new(
            "AddReaction",
            ADD_REACTION_MUTATION,
            json!({ "postId": post_id, "reactionType": reaction }),
        );
        let data: AddReactionData = self.transport.execute(&request).await?;
        Ok(data.add_reaction)
    }

    pub async fn remove_reaction(&self, post_id: &str) -> Result<bool, EchoError> {
        let request = GraphqlRequest::new(
            "RemoveReaction",
            REMOVE_REACTION_MUTATION,
            json!({ "postId": post_id }),
        );
        let data: RemoveReactionData = self.transport.execute(&request).await?;
        Ok(data.remove_reaction)
    }

    pub async fn generate_sse_token(&self) -> Result<String, EchoError> {
        let request =
            GraphqlRequest::new("GenerateSseToken", GENERATE_SSE_TOKEN_MUTATION, json!({}));
        let data: GenerateSseTokenData = self.transport.execute(&request).await?;
        Ok(data.generate_sse_token)
    }

    /// Report one impression of a post. The backend counts posts by integer ID.
    pub async fn increment_display_count(&self, post_id: &str) -> Result<bool, EchoError> {
        let numeric = post_id.parse::<i64>().map_err(|_| {
            EchoError::new(
                EchoErrorCategory::Config,
                "invalid_post_id",
                format!("post id '{post_id}' is not numeric"),
            )
        })?;
        let request = GraphqlRequest::new(
            "IncrementDisplayCount",
            INCREMENT_DISPLAY_COUNT_MUTATION,
            json!({ "postId": numeric }),
        );
        let data: IncrementDisplayCountData = self.transport.execute(&request).await?;
        Ok(data.increment_display_count)
    }

    /// Renewing subscription to reactions on the user's posts.
    pub fn reaction_stream<F>(&self, on_event: F) -> SubscriptionHandle
    where
        F: FnMut(ReactionEvent) + Send + 'static,
    {
        self.subscription::<ReactionEvent>(StreamChannel::Reactions)
            .spawn(on_event)
    }

    /// Renewing subscription to post creation, count and deletion events.
    pub fn post_stream<F>(&self, on_event: F) -> SubscriptionHandle
    where
        F: FnMut(PostEvent) + Send + 'static,
    {
        self.subscription::<PostEvent>(StreamChannel::Posts)
            .spawn(on_event)
    }

    fn subscription<E>(&self, channel: StreamChannel) -> RenewingSubscription<E>
    where
        E: serde::de::DeserializeOwned + Send + 'static,
    {
        RenewingSubscription::new(
            channel,
            Arc::new(GraphqlTokenSource::new(self.transport.clone())),
            Arc::clone(&self.connector),
            self.config.subscription_config(),
        )
    }

    fn install(&self, payload: AuthPayload) -> Result<Session, EchoError> {
        if let Err(err) = self
            .session
            .establish(payload.access_token.clone(), payload.user_id.clone())
        {
            warn!(error = %err, "session could not be persisted");
        }
        Ok(Session::new(payload.access_token, payload.user_id))
    }
}

/// Stream tokens minted through `generateSseToken`.
#[derive(Clone)]
pub struct GraphqlTokenSource {
    transport: AuthenticatedTransport,
}

impl GraphqlTokenSource {
    pub fn new(transport: AuthenticatedTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl StreamTokenSource for GraphqlTokenSource {
    async fn mint(&self) -> Result<String, EchoError> {
        let request =
            GraphqlRequest::new("GenerateSseToken", GENERATE_SSE_TOKEN_MUTATION, json!({}));
        let data: GenerateSseTokenData = self.transport.execute(&request).await?;
        Ok(data.generate_sse_token)
    }
}
