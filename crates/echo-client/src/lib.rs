//! Network side of the Echo client.
//!
//! GraphQL calls go through [`AuthenticatedTransport`], which attaches the
//! bearer token and funnels every authentication failure into one
//! [`RefreshCoordinator`]. Realtime channels are [`RenewingSubscription`]s that
//! rotate their stream token on a fixed interval. [`spawn_runtime`] wires all
//! of it behind the `echo-core` command/event protocol.

pub mod api;
pub mod cookies;
pub mod graphql;
pub mod refresh;
pub mod runtime;
pub mod session;
pub mod sse;
pub mod subscription;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{EchoClient, EchoClientConfig, GraphqlTokenSource};
pub use cookies::PersistentCookieJar;
pub use graphql::{
    GraphqlError, GraphqlReply, GraphqlRequest, GraphqlResponse, GraphqlTransport, HttpTransport,
};
pub use refresh::RefreshCoordinator;
pub use runtime::{EchoRuntimeHandle, spawn_runtime};
pub use session::{SessionManager, SessionReader};
pub use sse::{HttpEventConnector, SseCodec, SseError, SseFrame};
pub use subscription::{
    DEFAULT_RENEWAL_INTERVAL, EventConnector, GenerationGuard, MessageStream,
    RenewingSubscription, StreamTokenSource, SubscriptionConfig, SubscriptionHandle,
};
pub use transport::AuthenticatedTransport;
