//! In-process fakes for the network seams.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use echo_core::{EchoError, EchoErrorCategory, StreamChannel};
use futures::{StreamExt, channel::mpsc};
use serde_json::{Value, json};

use crate::{
    graphql::{GraphqlError, GraphqlReply, GraphqlRequest, GraphqlResponse, GraphqlTransport},
    subscription::{EventConnector, MessageStream, StreamTokenSource},
};

pub(crate) fn data_reply(data: Value) -> GraphqlReply {
    GraphqlReply::new(
        200,
        GraphqlResponse {
            data: Some(data),
            errors: Vec::new(),
        },
    )
}

pub(crate) fn error_reply(message: &str) -> GraphqlReply {
    GraphqlReply::new(
        200,
        GraphqlResponse {
            data: None,
            errors: vec![GraphqlError {
                message: message.to_owned(),
            }],
        },
    )
}

pub(crate) fn status_reply(status: u16) -> GraphqlReply {
    GraphqlReply::new(status, GraphqlResponse::default())
}

pub(crate) fn refresh_ok(token: &str) -> GraphqlReply {
    data_reply(json!({ "refreshToken": { "accessToken": token } }))
}

pub(crate) fn network_error() -> EchoError {
    EchoError::new(EchoErrorCategory::Network, "http_connect_failed", "connection refused")
}

/// GraphQL transport answering from per-operation reply queues.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    replies: Mutex<HashMap<&'static str, VecDeque<Result<GraphqlReply, EchoError>>>>,
    calls: Mutex<Vec<(String, Option<String>)>>,
    latency: Option<Duration>,
}

impl ScriptedTransport {
    pub(crate) fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub(crate) fn push(&self, operation: &'static str, reply: Result<GraphqlReply, EchoError>) {
        self.replies
            .lock()
            .expect("replies lock")
            .entry(operation)
            .or_default()
            .push_back(reply);
    }

    /// Operation names and bearer tokens in call order.
    pub(crate) fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn count(&self, operation: &str) -> usize {
        self.calls()
            .iter()
            .filter(|(name, _)| name == operation)
            .count()
    }
}

#[async_trait]
impl GraphqlTransport for ScriptedTransport {
    async fn execute(
        &self,
        request: &GraphqlRequest,
        bearer: Option<&str>,
    ) -> Result<GraphqlReply, EchoError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((request.operation_name.to_owned(), bearer.map(ToOwned::to_owned)));

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        self.replies
            .lock()
            .expect("replies lock")
            .get_mut(request.operation_name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Err(EchoError::new(
                    EchoErrorCategory::Internal,
                    "unscripted",
                    format!("no reply scripted for {}", request.operation_name),
                ))
            })
    }
}

/// Token minter yielding `tok-1`, `tok-2`, ... unless a failure is queued.
#[derive(Default)]
pub(crate) struct CountingTokens {
    minted: AtomicUsize,
    failures: Mutex<VecDeque<EchoError>>,
}

impl CountingTokens {
    pub(crate) fn fail_next(&self, error: EchoError) {
        self.failures.lock().expect("failures lock").push_back(error);
    }

    pub(crate) fn minted(&self) -> usize {
        self.minted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamTokenSource for CountingTokens {
    async fn mint(&self) -> Result<String, EchoError> {
        if let Some(error) = self.failures.lock().expect("failures lock").pop_front() {
            return Err(error);
        }
        let n = self.minted.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("tok-{n}"))
    }
}

/// Connector handing out test-controlled in-memory streams.
#[derive(Default)]
pub(crate) struct ChannelConnector {
    connections: Mutex<Vec<(String, Option<mpsc::UnboundedSender<Result<String, EchoError>>>)>>,
}

impl ChannelConnector {
    /// Stream tokens used, one per connection, in order.
    pub(crate) fn tokens(&self) -> Vec<String> {
        self.connections
            .lock()
            .expect("connections lock")
            .iter()
            .map(|(token, _)| token.clone())
            .collect()
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.lock().expect("connections lock").len()
    }

    /// Push a payload into connection `index`. `false` once its reader is gone.
    pub(crate) fn send(&self, index: usize, item: Result<String, EchoError>) -> bool {
        let connections = self.connections.lock().expect("connections lock");
        match connections.get(index).and_then(|(_, tx)| tx.as_ref()) {
            Some(tx) => tx.unbounded_send(item).is_ok(),
            None => false,
        }
    }

    /// Whether the reader of connection `index` dropped its stream.
    pub(crate) fn is_closed(&self, index: usize) -> bool {
        let connections = self.connections.lock().expect("connections lock");
        match connections.get(index).and_then(|(_, tx)| tx.as_ref()) {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }

    /// End connection `index` from the server side.
    pub(crate) fn hang_up(&self, index: usize) {
        let mut connections = self.connections.lock().expect("connections lock");
        if let Some((_, tx)) = connections.get_mut(index) {
            tx.take();
        }
    }
}

#[async_trait]
impl EventConnector for ChannelConnector {
    async fn connect(
        &self,
        _channel: StreamChannel,
        token: &str,
    ) -> Result<MessageStream, EchoError> {
        let (tx, rx) = mpsc::unbounded();
        self.connections
            .lock()
            .expect("connections lock")
            .push((token.to_owned(), Some(tx)));
        Ok(rx.boxed())
    }
}

/// Let spawned tasks run until they block again.
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
