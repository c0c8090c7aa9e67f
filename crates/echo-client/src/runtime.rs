use std::{sync::Arc, time::Duration};

use echo_core::{
    BackendChannelError, BackendChannels, BackendCommand, BackendEvent, BackendInitConfig,
    EchoError, EchoErrorCategory, EventStream, LifecycleState, LifecycleStateMachine, PostEvent,
    ReactionEvent, ReactionToggle, ReactionType, RealtimeStatus, StreamChannel, StreamState,
    TimelineState, normalize_fatal_error, normalize_post_outcome, normalize_reaction_outcome,
    timeline::MAX_PAGE_LIMIT,
};
use echo_platform::TokenStore;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    api::{EchoClient, EchoClientConfig},
    subscription::SubscriptionHandle,
};

const DEFAULT_TIMELINE_PAGE_SIZE: u16 = 20;
const DEFAULT_TIMELINE_MAX_ITEMS: usize = 500;
const DEFAULT_LOAD_MORE_COOLDOWN: Duration = Duration::from_millis(750);

type ClientFactory = Box<dyn Fn(EchoClientConfig) -> Result<EchoClient, EchoError> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct EchoRuntimeHandle {
    channels: BackendChannels,
}

impl EchoRuntimeHandle {
    pub async fn send(&self, command: BackendCommand) -> Result<(), BackendChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

/// Start the client runtime. Sessions and cookies persist through `store`.
pub fn spawn_runtime(store: TokenStore) -> EchoRuntimeHandle {
    spawn_with_factory(Box::new(move |config| {
        EchoClient::connect(config, Some(store.clone()))
    }))
}

fn spawn_with_factory(factory: ClientFactory) -> EchoRuntimeHandle {
    let (channels, command_rx) = BackendChannels::with_default_buffers();
    let runtime = EchoRuntime::new(channels.clone(), command_rx, factory);
    tokio::spawn(async move {
        runtime.run().await;
    });

    EchoRuntimeHandle { channels }
}

#[derive(Debug)]
enum RuntimeSignal {
    Reaction(ReactionEvent),
    Post(PostEvent),
    SessionCleared,
}

struct RealtimeTasks {
    subscriptions: Vec<SubscriptionHandle>,
    status_forwarders: Vec<JoinHandle<()>>,
}

impl RealtimeTasks {
    async fn stop(self) {
        for subscription in self.subscriptions {
            subscription.stop().await;
        }
        for forwarder in self.status_forwarders {
            let _ = forwarder.await;
        }
    }
}

struct EchoRuntime {
    channels: BackendChannels,
    command_rx: mpsc::Receiver<BackendCommand>,
    signal_tx: mpsc::UnboundedSender<RuntimeSignal>,
    signal_rx: mpsc::UnboundedReceiver<RuntimeSignal>,
    factory: ClientFactory,
    state_machine: LifecycleStateMachine,
    client: Option<EchoClient>,
    timeline: TimelineState,
    realtime: Option<RealtimeTasks>,
    page_size: u16,
    load_more_cooldown: Duration,
    last_load_more: Option<Instant>,
}

impl EchoRuntime {
    fn new(
        channels: BackendChannels,
        command_rx: mpsc::Receiver<BackendCommand>,
        factory: ClientFactory,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Self {
            channels,
            command_rx,
            signal_tx,
            signal_rx,
            factory,
            state_machine: LifecycleStateMachine::default(),
            client: None,
            timeline: TimelineState::new(DEFAULT_TIMELINE_MAX_ITEMS),
            realtime: None,
            page_size: DEFAULT_TIMELINE_PAGE_SIZE,
            load_more_cooldown: DEFAULT_LOAD_MORE_COOLDOWN,
            last_load_more: None,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if let Err(err) = self.handle_command(command).await {
                        self.channels.emit(normalize_fatal_error(err));
                    }
                }
                Some(signal) = self.signal_rx.recv() => self.handle_signal(signal).await,
            }
        }

        if let Some(realtime) = self.realtime.take() {
            realtime.stop().await;
        }
        debug!("runtime stopped");
    }

    async fn handle_command(&mut self, command: BackendCommand) -> Result<(), EchoError> {
        match command {
            BackendCommand::Init { server_url, config } => {
                self.handle_init(server_url, config.unwrap_or_default())
            }
            BackendCommand::Login { username, password } => {
                self.handle_credentials(false, username, password).await;
                Ok(())
            }
            BackendCommand::Signup { username, password } => {
                self.handle_credentials(true, username, password).await;
                Ok(())
            }
            BackendCommand::RestoreSession => {
                self.handle_restore_session().await;
                Ok(())
            }
            BackendCommand::StartRealtime => self.handle_start_realtime(),
            BackendCommand::StopRealtime => self.handle_stop_realtime().await,
            BackendCommand::LoadTimeline => self.handle_load_timeline().await,
            BackendCommand::LoadMore => self.handle_load_more().await,
            BackendCommand::CreatePost {
                client_txn_id,
                content,
                image_url,
            } => {
                self.handle_create_post(client_txn_id, content, image_url)
                    .await;
                Ok(())
            }
            BackendCommand::ToggleReaction { post_id, reaction } => {
                self.handle_toggle_reaction(post_id, reaction).await;
                Ok(())
            }
            BackendCommand::IncrementDisplayCount { post_id } => {
                self.handle_increment_display_count(post_id).await
            }
            BackendCommand::FetchLatestReaction { user_id } => {
                self.handle_fetch_latest_reaction(user_id).await
            }
            BackendCommand::Logout => self.handle_logout().await,
        }
    }

    fn handle_init(&mut self, server_url: String, config: BackendInitConfig) -> Result<(), EchoError> {
        let (candidate, transition_events) = self.validate_transition(&BackendCommand::Init {
            server_url: String::new(),
            config: None,
        })?;

        let mut client_config = EchoClientConfig::new(&server_url)?;
        if let Some(ms) = config.stream_renewal_interval_ms {
            client_config = client_config.with_renewal_interval(Duration::from_millis(ms.max(1)));
        }
        let client = (self.factory)(client_config)?;

        self.page_size = TimelineState::bounded_page_limit(
            config.timeline_page_size.unwrap_or(DEFAULT_TIMELINE_PAGE_SIZE),
            MAX_PAGE_LIMIT,
        );
        self.load_more_cooldown = config
            .load_more_cooldown_ms
            .map_or(DEFAULT_LOAD_MORE_COOLDOWN, Duration::from_millis);
        self.timeline =
            TimelineState::new(config.timeline_max_items.unwrap_or(DEFAULT_TIMELINE_MAX_ITEMS));
        self.last_load_more = None;

        self.watch_session(&client);
        info!(server_url = %client.config().server_url, "runtime initialized");
        self.client = Some(client);

        self.commit_transition(candidate, transition_events);
        Ok(())
    }

    async fn handle_credentials(&mut self, signup: bool, username: String, password: String) {
        let command = if signup {
            BackendCommand::Signup {
                username: String::new(),
                password: String::new(),
            }
        } else {
            BackendCommand::Login {
                username: String::new(),
                password: String::new(),
            }
        };
        let transition = self.validate_transition(&command);
        let Ok((candidate, transition_events)) = transition else {
            if let Err(err) = transition {
                self.emit_auth_failure(err);
            }
            return;
        };

        self.commit_transition(candidate, transition_events);

        let client = match self.require_client() {
            Ok(client) => client,
            Err(err) => {
                self.finish_auth(Err(err));
                return;
            }
        };

        let result = if signup {
            client.signup(&username, &password).await
        } else {
            client.login(&username, &password).await
        };
        self.finish_auth(result.map(|session| session.user_id));
    }

    async fn handle_restore_session(&mut self) {
        let transition = self.validate_transition(&BackendCommand::RestoreSession);
        let Ok((candidate, transition_events)) = transition else {
            if let Err(err) = transition {
                self.emit_auth_failure(err);
            }
            return;
        };

        self.commit_transition(candidate, transition_events);

        let client = match self.require_client() {
            Ok(client) => client,
            Err(err) => {
                self.finish_auth(Err(err));
                return;
            }
        };

        let restored = match client.restore_session() {
            Ok(restored) => restored,
            Err(err) => {
                self.finish_auth(Err(err));
                return;
            }
        };

        if let Some(session) = restored
            && session.is_authenticated()
        {
            self.finish_auth(Ok(session.user_id));
            return;
        }

        // No access token on disk; the refresh cookie may still be valid.
        match client.refresh_session().await {
            Some(_) => self.finish_auth(Ok(client.session().user_id())),
            None => self.finish_auth(Err(EchoError::new(
                EchoErrorCategory::Auth,
                "session_not_found",
                "no persisted session could be restored",
            ))),
        }
    }

    fn handle_start_realtime(&mut self) -> Result<(), EchoError> {
        let (candidate, transition_events) =
            self.validate_transition(&BackendCommand::StartRealtime)?;
        let client = self.require_client()?;

        let reactions = {
            let signals = self.signal_tx.clone();
            client.reaction_stream(move |event| {
                let _ = signals.send(RuntimeSignal::Reaction(event));
            })
        };
        let posts = {
            let signals = self.signal_tx.clone();
            client.post_stream(move |event| {
                let _ = signals.send(RuntimeSignal::Post(event));
            })
        };

        let status_forwarders = [&reactions, &posts]
            .into_iter()
            .map(|handle| {
                forward_status(self.channels.clone(), handle.channel(), handle.watch_state())
            })
            .collect();
        self.realtime = Some(RealtimeTasks {
            subscriptions: vec![reactions, posts],
            status_forwarders,
        });

        self.commit_transition(candidate, transition_events);
        Ok(())
    }

    async fn handle_stop_realtime(&mut self) -> Result<(), EchoError> {
        let (candidate, transition_events) =
            self.validate_transition(&BackendCommand::StopRealtime)?;
        if let Some(realtime) = self.realtime.take() {
            realtime.stop().await;
        }
        self.commit_transition(candidate, transition_events);
        Ok(())
    }

    async fn handle_load_timeline(&mut self) -> Result<(), EchoError> {
        self.validate_transition(&BackendCommand::LoadTimeline)?;
        let client = self.require_client()?;

        match client.timeline(self.page_size).await {
            Ok(posts) => {
                let added = self.timeline.replace_page(posts);
                self.timeline.clear_error();
                debug!(added, "timeline loaded");
            }
            Err(err) => {
                warn!(code = %err.code, error = %err.message, "timeline load failed");
                self.timeline.set_error(err);
            }
        }
        self.emit_timeline();
        Ok(())
    }

    async fn handle_load_more(&mut self) -> Result<(), EchoError> {
        self.validate_transition(&BackendCommand::LoadMore)?;
        let client = self.require_client()?;

        let now = Instant::now();
        if let Some(last) = self.last_load_more
            && now.duration_since(last) < self.load_more_cooldown
        {
            debug!("load more ignored during cooldown");
            return Ok(());
        }
        self.last_load_more = Some(now);

        // The backend pages by limit only, so ask for everything shown plus one page.
        let wanted = self.timeline.len().saturating_add(usize::from(self.page_size));
        let limit = TimelineState::bounded_page_limit(
            u16::try_from(wanted).unwrap_or(u16::MAX),
            MAX_PAGE_LIMIT,
        );

        match client.timeline(limit).await {
            Ok(posts) => {
                let added = self.timeline.merge_page(posts);
                self.timeline.clear_error();
                debug!(added, limit, "timeline page merged");
            }
            Err(err) => {
                warn!(code = %err.code, error = %err.message, "loading more posts failed");
                self.timeline.set_error(err);
            }
        }
        self.emit_timeline();
        Ok(())
    }

    async fn handle_create_post(
        &mut self,
        client_txn_id: String,
        content: String,
        image_url: Option<String>,
    ) {
        let validation = self.validate_transition(&BackendCommand::CreatePost {
            client_txn_id: String::new(),
            content: String::new(),
            image_url: None,
        });
        if let Err(err) = validation {
            self.channels
                .emit(normalize_post_outcome(client_txn_id, Err(err)));
            return;
        }

        let client = match self.require_client() {
            Ok(client) => client,
            Err(err) => {
                self.channels
                    .emit(normalize_post_outcome(client_txn_id, Err(err)));
                return;
            }
        };

        let outcome = client.create_post(&content, image_url.as_deref()).await;
        self.channels
            .emit(normalize_post_outcome(client_txn_id, outcome));
    }

    async fn handle_toggle_reaction(&mut self, post_id: String, reaction: ReactionType) {
        let toggle = self.timeline.plan_toggle(&post_id, reaction);
        let validation = self.validate_transition(&BackendCommand::ToggleReaction {
            post_id: String::new(),
            reaction,
        });
        if let Err(err) = validation {
            self.channels
                .emit(normalize_reaction_outcome(post_id, toggle, &Err(err)));
            return;
        }

        let client = match self.require_client() {
            Ok(client) => client,
            Err(err) => {
                self.channels
                    .emit(normalize_reaction_outcome(post_id, toggle, &Err(err)));
                return;
            }
        };

        let outcome = match toggle {
            ReactionToggle::Add(reaction) => client.add_reaction(&post_id, reaction).await,
            ReactionToggle::Remove => client.remove_reaction(&post_id).await,
        };

        self.timeline.apply_toggle_outcome(&post_id, toggle, &outcome);
        self.channels
            .emit(normalize_reaction_outcome(post_id, toggle, &outcome));
        self.emit_timeline();
    }

    async fn handle_increment_display_count(&mut self, post_id: String) -> Result<(), EchoError> {
        self.validate_transition(&BackendCommand::IncrementDisplayCount {
            post_id: String::new(),
        })?;
        let client = self.require_client()?;

        match client.increment_display_count(&post_id).await {
            Ok(true) => {}
            Ok(false) => debug!(post_id, "display count not incremented"),
            Err(err) => warn!(post_id, code = %err.code, "display count increment failed"),
        }
        Ok(())
    }

    async fn handle_fetch_latest_reaction(&mut self, user_id: String) -> Result<(), EchoError> {
        self.validate_transition(&BackendCommand::FetchLatestReaction {
            user_id: String::new(),
        })?;
        let client = self.require_client()?;

        if let Some(reaction) = client.user_latest_reaction(&user_id).await? {
            self.channels
                .emit(BackendEvent::AvatarExpression { reaction });
        }
        Ok(())
    }

    async fn handle_logout(&mut self) -> Result<(), EchoError> {
        let (candidate, transition_events) = self.validate_transition(&BackendCommand::Logout)?;

        if let Some(realtime) = self.realtime.take() {
            realtime.stop().await;
        }
        if let Some(client) = &self.client {
            client.logout()?;
        }

        self.timeline.reset();
        self.last_load_more = None;
        self.commit_transition(candidate, transition_events);
        self.emit_timeline();
        Ok(())
    }

    async fn handle_signal(&mut self, signal: RuntimeSignal) {
        match signal {
            RuntimeSignal::Reaction(event) => {
                if self.state_machine.state() != LifecycleState::Streaming {
                    return;
                }
                let reaction = event.latest_reaction_for_author;
                self.channels.emit(BackendEvent::ReactionReceived(event));
                self.channels
                    .emit(BackendEvent::AvatarExpression { reaction });
            }
            RuntimeSignal::Post(event) => {
                if self.state_machine.state() != LifecycleState::Streaming {
                    return;
                }
                if self.timeline.apply_post_event(&event) {
                    self.emit_timeline();
                }
            }
            RuntimeSignal::SessionCleared => self.handle_session_cleared().await,
        }
    }

    async fn handle_session_cleared(&mut self) {
        if !self.state_machine.is_authenticated_context() {
            return;
        }

        warn!("session expired; returning to login");
        if let Some(realtime) = self.realtime.take() {
            realtime.stop().await;
        }
        self.timeline.reset();
        self.last_load_more = None;

        if let Ok(state_event) = self.state_machine.on_session_expired() {
            self.channels.emit(state_event);
        }
        self.channels.emit(BackendEvent::SessionExpired);
        self.emit_timeline();
    }

    fn watch_session(&self, client: &EchoClient) {
        let mut reader = client.session();
        let signals = self.signal_tx.clone();
        tokio::spawn(async move {
            let mut authenticated = reader.is_authenticated();
            while let Some(session) = reader.changed().await {
                let now_authenticated = session.is_authenticated();
                if authenticated
                    && !now_authenticated
                    && signals.send(RuntimeSignal::SessionCleared).is_err()
                {
                    break;
                }
                authenticated = now_authenticated;
            }
        });
    }

    fn validate_transition(
        &self,
        command: &BackendCommand,
    ) -> Result<(LifecycleStateMachine, Vec<BackendEvent>), EchoError> {
        let mut candidate = self.state_machine.clone();
        let events = candidate.apply(command)?;
        Ok((candidate, events))
    }

    fn commit_transition(&mut self, candidate: LifecycleStateMachine, events: Vec<BackendEvent>) {
        self.state_machine = candidate;
        self.channels.emit_all(events);
    }

    fn require_client(&self) -> Result<EchoClient, EchoError> {
        self.client.clone().ok_or_else(|| {
            EchoError::new(
                EchoErrorCategory::Config,
                "client_not_initialized",
                "client is not initialized; send Init first",
            )
        })
    }

    fn emit_timeline(&self) {
        self.channels
            .emit(BackendEvent::TimelineUpdated(self.timeline.snapshot()));
    }

    fn finish_auth(&mut self, result: Result<Option<String>, EchoError>) {
        if let Ok(state_event) = self.state_machine.on_auth_result(result.is_ok()) {
            self.channels.emit(state_event);
        }

        match result {
            Ok(user_id) => {
                info!(user_id = user_id.as_deref().unwrap_or("unknown"), "authenticated");
                self.channels.emit(BackendEvent::AuthResult {
                    success: true,
                    user_id,
                    error_code: None,
                });
            }
            Err(err) => {
                warn!(code = %err.code, error = %err.message, "authentication failed");
                self.emit_auth_failure(err);
            }
        }
    }

    fn emit_auth_failure(&self, error: EchoError) {
        self.channels.emit(BackendEvent::AuthResult {
            success: false,
            user_id: None,
            error_code: Some(error.code),
        });
    }
}

fn forward_status(
    channels: BackendChannels,
    channel: StreamChannel,
    mut state: watch::Receiver<StreamState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let current = *state.borrow_and_update();
            channels.emit(BackendEvent::RealtimeStatus(RealtimeStatus {
                channel,
                state: current,
            }));
            if current == StreamState::Disconnected || state.changed().await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::env;

    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::{
        session::SessionManager,
        testing::{ChannelConnector, ScriptedTransport, data_reply, error_reply, settle},
    };

    struct Harness {
        handle: EchoRuntimeHandle,
        events: EventStream,
        raw: Arc<ScriptedTransport>,
        connector: Arc<ChannelConnector>,
    }

    fn harness() -> Harness {
        let raw = Arc::new(ScriptedTransport::default());
        let connector = Arc::new(ChannelConnector::default());
        let handle = {
            let raw = raw.clone();
            let connector = connector.clone();
            spawn_with_factory(Box::new(move |config| {
                Ok(EchoClient::with_transports(
                    config,
                    Arc::new(SessionManager::new(None)),
                    raw.clone(),
                    connector.clone(),
                ))
            }))
        };
        let events = handle.subscribe();
        Harness {
            handle,
            events,
            raw,
            connector,
        }
    }

    impl Harness {
        async fn send(&self, command: BackendCommand) {
            self.handle
                .send(command)
                .await
                .expect("command should enqueue");
        }

        async fn next(&mut self) -> BackendEvent {
            timeout(Duration::from_secs(2), self.events.recv())
                .await
                .expect("event timeout")
                .expect("event receive")
        }

        /// Skip events until `pick` accepts one.
        async fn until<T>(&mut self, mut pick: impl FnMut(BackendEvent) -> Option<T>) -> T {
            loop {
                if let Some(found) = pick(self.next().await) {
                    return found;
                }
            }
        }

        async fn until_state(&mut self, wanted: LifecycleState) {
            self.until(|event| match event {
                BackendEvent::StateChanged { state } if state == wanted => Some(()),
                _ => None,
            })
            .await;
        }

        async fn login(&mut self) {
            self.raw.push(
                "Login",
                Ok(data_reply(json!({ "login": { "accessToken": "a1", "userId": "u1" } }))),
            );
            self.send(BackendCommand::Init {
                server_url: "http://localhost:8000".to_owned(),
                config: Some(BackendInitConfig {
                    load_more_cooldown_ms: Some(0),
                    ..BackendInitConfig::default()
                }),
            })
            .await;
            self.send(BackendCommand::Login {
                username: "mika".to_owned(),
                password: "secret".to_owned(),
            })
            .await;
            self.until_state(LifecycleState::Authenticated).await;
        }
    }

    fn post_json(id: &str) -> serde_json::Value {
        json!({ "id": id, "content": format!("post {id}"), "imageUrl": null, "authorName": "A", "authorAvatar": "a.png" })
    }

    #[tokio::test]
    async fn runtime_emits_fatal_error_for_invalid_transition() {
        let mut harness = harness();

        harness.send(BackendCommand::StartRealtime).await;

        match harness.next().await {
            BackendEvent::FatalError { code, .. } => {
                assert_eq!(code, "invalid_state_transition");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn runtime_create_post_before_login_emits_post_ack_failure() {
        let mut harness = harness();

        harness
            .send(BackendCommand::CreatePost {
                client_txn_id: "tx-1".to_owned(),
                content: "hello".to_owned(),
                image_url: None,
            })
            .await;

        match harness.next().await {
            BackendEvent::PostAck(ack) => {
                assert_eq!(ack.client_txn_id, "tx-1");
                assert!(!ack.success);
                assert_eq!(ack.error_code.as_deref(), Some("invalid_state_transition"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn login_reports_user_and_timeline_loads() {
        let mut harness = harness();
        harness.login().await;

        let user_id = harness
            .until(|event| match event {
                BackendEvent::AuthResult {
                    success: true,
                    user_id,
                    ..
                } => Some(user_id),
                _ => None,
            })
            .await;
        assert_eq!(user_id.as_deref(), Some("u1"));

        harness.raw.push(
            "Timeline",
            Ok(data_reply(json!({ "timeline": [post_json("1"), post_json("2")] }))),
        );
        harness.send(BackendCommand::LoadTimeline).await;

        let snapshot = harness
            .until(|event| match event {
                BackendEvent::TimelineUpdated(snapshot) => Some(snapshot),
                _ => None,
            })
            .await;
        let ids: Vec<_> = snapshot.posts.iter().map(|post| post.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(snapshot.error_code, None);
    }

    #[tokio::test]
    async fn load_more_merges_without_duplicates() {
        let mut harness = harness();
        harness.login().await;

        harness.raw.push(
            "Timeline",
            Ok(data_reply(json!({ "timeline": [post_json("1"), post_json("2")] }))),
        );
        harness.raw.push(
            "Timeline",
            Ok(data_reply(
                json!({ "timeline": [post_json("1"), post_json("2"), post_json("3")] }),
            )),
        );
        harness.send(BackendCommand::LoadTimeline).await;
        harness.send(BackendCommand::LoadMore).await;

        let mut snapshots = Vec::new();
        while snapshots.len() < 2 {
            if let BackendEvent::TimelineUpdated(snapshot) = harness.next().await {
                snapshots.push(snapshot);
            }
        }
        let ids: Vec<_> = snapshots[1]
            .posts
            .iter()
            .map(|post| post.id.as_str())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn failed_toggle_keeps_reaction_map() {
        let mut harness = harness();
        harness.login().await;

        harness
            .raw
            .push("AddReaction", Ok(data_reply(json!({ "addReaction": true }))));
        harness.raw.push("AddReaction", Ok(error_reply("Post not found")));

        harness
            .send(BackendCommand::ToggleReaction {
                post_id: "p1".to_owned(),
                reaction: ReactionType::Laugh,
            })
            .await;
        let first = harness
            .until(|event| match event {
                BackendEvent::ReactionAck(ack) => Some(ack),
                _ => None,
            })
            .await;
        assert_eq!(first.reaction, Some(ReactionType::Laugh));

        harness
            .send(BackendCommand::ToggleReaction {
                post_id: "p1".to_owned(),
                reaction: ReactionType::Sad,
            })
            .await;
        let second = harness
            .until(|event| match event {
                BackendEvent::ReactionAck(ack) => Some(ack),
                _ => None,
            })
            .await;
        assert_eq!(second.reaction, None);
        assert_eq!(second.error_code.as_deref(), Some("graphql_error"));

        let snapshot = harness
            .until(|event| match event {
                BackendEvent::TimelineUpdated(snapshot) => Some(snapshot),
                _ => None,
            })
            .await;
        assert_eq!(snapshot.user_reactions.get("p1"), Some(&ReactionType::Laugh));
        assert_eq!(snapshot.error_code.as_deref(), Some("graphql_error"));
    }

    #[tokio::test]
    async fn failed_refresh_expires_session() {
        let mut harness = harness();
        harness.login().await;

        harness.raw.push("Timeline", Ok(error_reply("Unauthorized")));
        harness
            .raw
            .push("RefreshToken", Ok(error_reply("refresh token expired")));
        harness.send(BackendCommand::LoadTimeline).await;

        let snapshot = harness
            .until(|event| match event {
                BackendEvent::TimelineUpdated(snapshot) => Some(snapshot),
                _ => None,
            })
            .await;
        assert_eq!(snapshot.error_code.as_deref(), Some("unauthorized"));

        harness.until_state(LifecycleState::LoggedOut).await;
        assert_eq!(harness.next().await, BackendEvent::SessionExpired);
    }

    #[tokio::test]
    async fn realtime_events_reach_the_timeline() {
        let mut harness = harness();
        harness.login().await;

        harness.raw.push(
            "GenerateSseToken",
            Ok(data_reply(json!({ "generateSseToken": "sse-r" }))),
        );
        harness.raw.push(
            "GenerateSseToken",
            Ok(data_reply(json!({ "generateSseToken": "sse-p" }))),
        );
        harness.send(BackendCommand::StartRealtime).await;
        harness.until_state(LifecycleState::Streaming).await;
        timeout(Duration::from_secs(2), async {
            while harness.connector.connection_count() < 2 {
                settle().await;
            }
        })
        .await
        .expect("both streams should connect");

        // Connection order follows task scheduling; send to both.
        let new_post = json!({
            "type": "new_post",
            "post_id": "9",
            "user_id": "u2",
            "content": "live",
            "image_url": null,
            "display_count": 0,
            "created_at": 1731000000,
            "author_name": "B",
            "author_avatar": "b.png"
        })
        .to_string();
        let reaction = json!({
            "post_id": "9",
            "reactor_user_id": "u2",
            "reaction_type": "surprise",
            "timestamp": 1731000000,
            "latest_reaction_for_author": "surprise"
        })
        .to_string();
        for index in 0..2 {
            harness.connector.send(index, Ok(new_post.clone()));
            harness.connector.send(index, Ok(reaction.clone()));
        }

        // The two streams are handled independently; accept either order.
        let mut live_post = None;
        let mut expression = None;
        while live_post.is_none() || expression.is_none() {
            match harness.next().await {
                BackendEvent::TimelineUpdated(snapshot)
                    if snapshot.posts.iter().any(|post| post.id == "9") =>
                {
                    live_post = Some(snapshot.posts[0].id.clone());
                }
                BackendEvent::AvatarExpression { reaction } => expression = Some(reaction),
                _ => {}
            }
        }
        assert_eq!(live_post.as_deref(), Some("9"));
        assert_eq!(expression, Some(ReactionType::Surprise));

        harness.send(BackendCommand::StopRealtime).await;
        harness.until_state(LifecycleState::Authenticated).await;
    }

    #[tokio::test]
    async fn logout_clears_session_without_expiry_event() {
        let mut harness = harness();
        harness.login().await;

        harness.send(BackendCommand::Logout).await;
        harness.until_state(LifecycleState::LoggedOut).await;
        let snapshot = harness
            .until(|event| match event {
                BackendEvent::TimelineUpdated(snapshot) => Some(snapshot),
                _ => None,
            })
            .await;
        assert!(snapshot.posts.is_empty());

        harness.send(BackendCommand::LoadTimeline).await;
        let code = harness
            .until(|event| match event {
                BackendEvent::FatalError { code, .. } => Some(code),
                BackendEvent::SessionExpired => panic!("logout must not report an expired session"),
                _ => None,
            })
            .await;
        assert_eq!(code, "invalid_state_transition");

        let late = timeout(
            Duration::from_millis(200),
            harness.until(|event| matches!(event, BackendEvent::SessionExpired).then_some(())),
        )
        .await;
        assert!(late.is_err(), "no SessionExpired after logout");
    }

    #[tokio::test]
    async fn restore_without_token_falls_back_to_refresh() {
        let mut harness = harness();
        harness.raw.push(
            "RefreshToken",
            Ok(data_reply(json!({ "refreshToken": { "accessToken": "r1" } }))),
        );

        harness
            .send(BackendCommand::Init {
                server_url: "http://localhost:8000".to_owned(),
                config: None,
            })
            .await;
        harness.send(BackendCommand::RestoreSession).await;

        let success = harness
            .until(|event| match event {
                BackendEvent::AuthResult { success, .. } => Some(success),
                _ => None,
            })
            .await;
        assert!(success);
        assert_eq!(harness.raw.count("RefreshToken"), 1);
    }

    #[tokio::test]
    #[ignore = "runs against a live Echo backend, requires env vars"]
    async fn live_login_timeline_and_stream_smoke() {
        let server_url = env::var("ECHO_SERVER_URL").expect("ECHO_SERVER_URL must be set");
        let user = env::var("ECHO_USER").expect("ECHO_USER must be set");
        let password = env::var("ECHO_PASSWORD").expect("ECHO_PASSWORD must be set");

        let client = EchoClient::connect(EchoClientConfig::new(&server_url).expect("config"), None)
            .expect("client");
        client.login(&user, &password).await.expect("login");
        client.timeline(10).await.expect("timeline");
        let token = client.generate_sse_token().await.expect("sse token");
        assert!(!token.is_empty());
    }
}
