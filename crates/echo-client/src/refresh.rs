use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::{
    graphql::{GraphqlRequest, GraphqlTransport},
    session::SessionManager,
};

const REFRESH_TOKEN_MUTATION: &str = "mutation RefreshToken { refreshToken { accessToken } }";

type RefreshFlight = Shared<BoxFuture<'static, Option<String>>>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshTokenData {
    refresh_token: RefreshedToken,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshedToken {
    access_token: Option<String>,
}

/// Single-flight access token refresh.
///
/// All callers that arrive while a refresh is running await the same flight
/// and observe the same outcome. The flight clears its slot once settled, so
/// a later call starts a fresh attempt.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<RefreshInner>,
}

struct RefreshInner {
    transport: Arc<dyn GraphqlTransport>,
    session: Arc<SessionManager>,
    in_flight: Mutex<Option<(u64, RefreshFlight)>>,
    next_flight: AtomicU64,
}

impl RefreshCoordinator {
    /// `transport` must be the raw transport so a refresh never triggers another.
    pub fn new(transport: Arc<dyn GraphqlTransport>, session: Arc<SessionManager>) -> Self {
        Self {
            inner: Arc::new(RefreshInner {
                transport,
                session,
                in_flight: Mutex::new(None),
                next_flight: AtomicU64::new(0),
            }),
        }
    }

    /// New access token, or `None` after the session has been cleared.
    pub async fn refresh(&self) -> Option<String> {
        let flight = {
            let mut slot = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some((_, flight)) => flight.clone(),
                None => {
                    let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                    let inner = Arc::clone(&self.inner);
                    let flight = async move {
                        let outcome = inner.run().await;
                        inner.settle(id);
                        outcome
                    }
                    .boxed()
                    .shared();
                    *slot = Some((id, flight.clone()));
                    flight
                }
            }
        };

        flight.await
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl RefreshInner {
    async fn run(&self) -> Option<String> {
        let request = GraphqlRequest::new("RefreshToken", REFRESH_TOKEN_MUTATION, json!({}));
        let outcome = match self.transport.execute(&request, None).await {
            Ok(reply) => reply
                .decode::<RefreshTokenData>()
                .map(|data| data.refresh_token.access_token),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(Some(token)) => {
                if let Err(err) = self.session.replace_access_token(token.clone()) {
                    warn!(error = %err, "refreshed token could not be persisted");
                }
                info!("access token refreshed");
                Some(token)
            }
            Ok(None) => {
                warn!("refresh response carried no access token; clearing session");
                self.clear_session();
                None
            }
            Err(err) => {
                warn!(code = %err.code, error = %err.message, "token refresh failed; clearing session");
                self.clear_session();
                None
            }
        }
    }

    fn clear_session(&self) {
        if let Err(err) = self.session.clear() {
            warn!(error = %err, "failed to clear persisted session");
        }
    }

    fn settle(&self, id: u64) {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(slot.as_ref(), Some((current, _)) if *current == id) {
            *slot = None;
        }
    }
}
