//! Token-renewing realtime subscriptions.
//!
//! A subscription mints a one-shot stream token, connects with it and rotates
//! both on a fixed interval. One supervisor task owns the timer and the
//! current connection; a reader task per connection forwards payloads tagged
//! with its generation, and anything from a retired generation is dropped.

use std::{marker::PhantomData, sync::Arc, time::Duration};

use async_trait::async_trait;
use echo_core::{EchoError, RetryPolicy, StreamChannel, StreamState};
use futures::{StreamExt, stream::BoxStream};
use serde::de::DeserializeOwned;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Stream tokens are rotated before the backend's token lifetime runs out.
pub const DEFAULT_RENEWAL_INTERVAL: Duration = Duration::from_secs(55);

const DELIVERY_BUFFER: usize = 64;

/// A connection that lived this long counts as healthy even without messages.
const STABLE_CONNECTION: Duration = Duration::from_secs(30);

/// Raw message payloads of one open event stream.
pub type MessageStream = BoxStream<'static, Result<String, EchoError>>;

/// Mints the short-lived token a stream connection authenticates with.
#[async_trait]
pub trait StreamTokenSource: Send + Sync {
    async fn mint(&self) -> Result<String, EchoError>;
}

/// Opens an event stream for `channel` using a freshly minted token.
#[async_trait]
pub trait EventConnector: Send + Sync {
    async fn connect(&self, channel: StreamChannel, token: &str)
    -> Result<MessageStream, EchoError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionConfig {
    pub renewal_interval: Duration,
    /// Backoff between reconnects after the stream fails.
    pub reconnect_policy: RetryPolicy,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            renewal_interval: DEFAULT_RENEWAL_INTERVAL,
            reconnect_policy: RetryPolicy::default(),
        }
    }
}

/// Tracks which connection generation may still deliver events.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GenerationGuard {
    current: u64,
}

impl GenerationGuard {
    /// Retire the current generation and return the new one.
    pub fn advance(&mut self) -> u64 {
        self.current += 1;
        self.current
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn admits(&self, generation: u64) -> bool {
        self.current != 0 && generation == self.current
    }
}

#[derive(Debug)]
enum Delivery {
    Message { generation: u64, payload: String },
    Closed { generation: u64, error: Option<EchoError> },
}

enum ConnectionEnd {
    Stopped,
    Renew,
    Failed(Option<EchoError>),
}

/// Renewing subscription for one channel, parsing payloads as `E`.
pub struct RenewingSubscription<E> {
    channel: StreamChannel,
    tokens: Arc<dyn StreamTokenSource>,
    connector: Arc<dyn EventConnector>,
    config: SubscriptionConfig,
    _event: PhantomData<fn() -> E>,
}

impl<E> RenewingSubscription<E>
where
    E: DeserializeOwned + Send + 'static,
{
    pub fn new(
        channel: StreamChannel,
        tokens: Arc<dyn StreamTokenSource>,
        connector: Arc<dyn EventConnector>,
        config: SubscriptionConfig,
    ) -> Self {
        Self {
            channel,
            tokens,
            connector,
            config,
            _event: PhantomData,
        }
    }

    /// Start minting and connecting; `on_event` runs for every parsed payload.
    pub fn spawn<F>(self, on_event: F) -> SubscriptionHandle
    where
        F: FnMut(E) + Send + 'static,
    {
        let stop = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(StreamState::Idle);
        let channel = self.channel;
        let supervisor_stop = stop.child_token();
        let task = tokio::spawn(async move {
            self.supervise(on_event, supervisor_stop, state_tx).await;
        });

        SubscriptionHandle {
            channel,
            stop,
            state: state_rx,
            task: Some(task),
        }
    }

    async fn supervise<F>(
        self,
        mut on_event: F,
        stop: CancellationToken,
        state_tx: watch::Sender<StreamState>,
    ) where
        F: FnMut(E) + Send + 'static,
    {
        let channel = self.channel;
        let (delivery_tx, mut delivery_rx) = mpsc::channel::<Delivery>(DELIVERY_BUFFER);
        let mut guard = GenerationGuard::default();
        let mut attempt: u32 = 0;

        'session: loop {
            state_tx.send_replace(StreamState::Minting);
            let minted = tokio::select! {
                _ = stop.cancelled() => break 'session,
                minted = self.tokens.mint() => minted,
            };
            let token = match minted {
                Ok(token) => token,
                Err(err) => {
                    warn!(%channel, code = %err.code, error = %err.message, "stream token mint failed");
                    state_tx.send_replace(StreamState::Error);
                    if !pause(&stop, self.config.renewal_interval).await {
                        break 'session;
                    }
                    continue 'session;
                }
            };

            let connected = tokio::select! {
                _ = stop.cancelled() => break 'session,
                connected = self.connector.connect(channel, &token) => connected,
            };
            let stream = match connected {
                Ok(stream) => stream,
                Err(err) => {
                    let delay = self.reconnect_delay(attempt, &err);
                    attempt = attempt.saturating_add(1);
                    let delay_ms = delay.as_millis() as u64;
                    warn!(%channel, code = %err.code, delay_ms, "stream connect failed");
                    state_tx.send_replace(StreamState::Error);
                    if !pause(&stop, delay).await {
                        break 'session;
                    }
                    continue 'session;
                }
            };

            let generation = guard.advance();
            let connection = stop.child_token();
            let reader = tokio::spawn(read_connection(
                stream,
                generation,
                delivery_tx.clone(),
                connection.clone(),
            ));
            state_tx.send_replace(StreamState::Connected { generation });
            info!(%channel, generation, "stream connected");

            let connected_at = Instant::now();
            let mut delivered = false;
            let renewal = tokio::time::sleep(self.config.renewal_interval);
            tokio::pin!(renewal);

            let end = loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break ConnectionEnd::Stopped,
                    _ = &mut renewal => break ConnectionEnd::Renew,
                    Some(delivery) = delivery_rx.recv() => {
                        delivered |= matches!(
                            &delivery,
                            Delivery::Message { generation, .. } if guard.admits(*generation)
                        );
                        if let Some(end) = self.dispatch(&guard, delivery, &mut on_event) {
                            break end;
                        }
                    }
                }
            };
            connection.cancel();
            let _ = reader.await;

            match end {
                ConnectionEnd::Stopped => break 'session,
                ConnectionEnd::Renew => {
                    self.drain_pending(&guard, &mut delivery_rx, &mut on_event);
                    attempt = 0;
                    debug!(%channel, generation, "renewing stream token");
                    state_tx.send_replace(StreamState::ScheduledRenewal);
                }
                ConnectionEnd::Failed(error) => {
                    if delivered || connected_at.elapsed() >= STABLE_CONNECTION {
                        attempt = 0;
                    }
                    let delay = match &error {
                        Some(err) => self.reconnect_delay(attempt, err),
                        None => self.config.reconnect_policy.delay_for_attempt(attempt, None),
                    };
                    attempt = attempt.saturating_add(1);
                    let delay_ms = delay.as_millis() as u64;
                    match &error {
                        Some(err) => {
                            warn!(%channel, generation, error = %err.message, delay_ms, "stream failed")
                        }
                        None => warn!(%channel, generation, delay_ms, "stream closed by server"),
                    }
                    state_tx.send_replace(StreamState::Error);
                    if !pause(&stop, delay).await {
                        break 'session;
                    }
                }
            }
        }

        state_tx.send_replace(StreamState::Disconnected);
        info!(%channel, "stream stopped");
    }

    /// Handle one delivery; `Some` when the current connection is over.
    fn dispatch<F>(
        &self,
        guard: &GenerationGuard,
        delivery: Delivery,
        on_event: &mut F,
    ) -> Option<ConnectionEnd>
    where
        F: FnMut(E),
    {
        match delivery {
            Delivery::Message {
                generation,
                payload,
            } => {
                if !guard.admits(generation) {
                    debug!(channel = %self.channel, generation, "dropping message from retired connection");
                    return None;
                }
                match serde_json::from_str::<E>(&payload) {
                    Ok(event) => on_event(event),
                    Err(err) => {
                        warn!(channel = %self.channel, generation, error = %err, "dropping malformed stream payload");
                    }
                }
                None
            }
            Delivery::Closed { generation, error } => {
                guard.admits(generation).then_some(ConnectionEnd::Failed(error))
            }
        }
    }

    /// Dispatch deliveries the retired reader queued before it was cancelled.
    ///
    /// Must run before the guard advances so they still count as current.
    fn drain_pending<F>(
        &self,
        guard: &GenerationGuard,
        deliveries: &mut mpsc::Receiver<Delivery>,
        on_event: &mut F,
    ) where
        F: FnMut(E),
    {
        while let Ok(delivery) = deliveries.try_recv() {
            let _ = self.dispatch(guard, delivery, on_event);
        }
    }

    fn reconnect_delay(&self, attempt: u32, err: &EchoError) -> Duration {
        let hint = err.retry_after_ms.map(Duration::from_millis);
        self.config.reconnect_policy.delay_for_attempt(attempt, hint)
    }
}

/// Sleep unless stopped first. `false` when the subscription was stopped.
async fn pause(stop: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn read_connection(
    mut stream: MessageStream,
    generation: u64,
    deliveries: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => return,
            item = stream.next() => match item {
                Some(Ok(payload)) => Delivery::Message { generation, payload },
                Some(Err(error)) => Delivery::Closed { generation, error: Some(error) },
                None => Delivery::Closed { generation, error: None },
            },
        };
        let last = matches!(delivery, Delivery::Closed { .. });

        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = deliveries.send(delivery) => {
                if sent.is_err() || last {
                    return;
                }
            }
        }
    }
}

/// Owner handle of a running subscription.
///
/// Dropping the handle stops the subscription without waiting for it.
pub struct SubscriptionHandle {
    channel: StreamChannel,
    stop: CancellationToken,
    state: watch::Receiver<StreamState>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn channel(&self) -> StreamChannel {
        self.channel
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.state.clone()
    }

    /// Cancel the renewal timer and the live connection, then wait for both.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
