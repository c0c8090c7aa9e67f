use std::sync::Arc;

use echo_core::EchoError;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    graphql::{GraphqlRequest, GraphqlTransport, decode_data},
    refresh::RefreshCoordinator,
    session::SessionReader,
};

/// GraphQL client that attaches the session token and recovers from expiry.
///
/// On an authentication failure the request is re-sent exactly once with the
/// token produced by the [`RefreshCoordinator`]. The retry's result is final.
#[derive(Clone)]
pub struct AuthenticatedTransport {
    raw: Arc<dyn GraphqlTransport>,
    session: SessionReader,
    refresh: RefreshCoordinator,
}

impl AuthenticatedTransport {
    pub fn new(
        raw: Arc<dyn GraphqlTransport>,
        session: SessionReader,
        refresh: RefreshCoordinator,
    ) -> Self {
        Self {
            raw,
            session,
            refresh,
        }
    }

    pub async fn execute<T: DeserializeOwned>(&self, request: &GraphqlRequest) -> Result<T, EchoError> {
        decode_data(self.execute_value(request).await?)
    }

    pub async fn execute_value(&self, request: &GraphqlRequest) -> Result<Value, EchoError> {
        let token = self.session.access_token();
        let reply = self.raw.execute(request, token.as_deref()).await?;

        let Some(original) = reply.auth_failure() else {
            return reply.into_data();
        };

        debug!(
            operation = request.operation_name,
            had_token = token.is_some(),
            "request rejected for authentication; refreshing"
        );

        let Some(fresh) = self.refresh.refresh().await else {
            warn!(
                operation = request.operation_name,
                "refresh failed; surfacing original authentication error"
            );
            return Err(original);
        };

        let retry = self.raw.execute(request, Some(&fresh)).await?;
        if retry.is_auth_failure() {
            warn!(
                operation = request.operation_name,
                "request still rejected after refresh"
            );
        }
        retry.into_data()
    }
}

#[cfg(test)]
mod tests {
    use echo_core::{EchoErrorCategory, Post};
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::{
        session::SessionManager,
        testing::{ScriptedTransport, data_reply, error_reply, network_error, refresh_ok, status_reply},
    };

    #[derive(Debug, Deserialize)]
    struct TimelineData {
        timeline: Vec<Post>,
    }

    fn timeline_request() -> GraphqlRequest {
        GraphqlRequest::new(
            "Timeline",
            "query Timeline($limit: Int!) { timeline(limit: $limit) { id content } }",
            json!({ "limit": 10 }),
        )
    }

    fn timeline_reply() -> crate::graphql::GraphqlReply {
        data_reply(json!({ "timeline": [{ "id": 1, "content": "hello" }] }))
    }

    fn stack(
        session: Arc<SessionManager>,
    ) -> (AuthenticatedTransport, Arc<ScriptedTransport>) {
        let raw = Arc::new(ScriptedTransport::default());
        let refresh = RefreshCoordinator::new(raw.clone(), Arc::clone(&session));
        (
            AuthenticatedTransport::new(raw.clone(), session.reader(), refresh),
            raw,
        )
    }

    #[tokio::test]
    async fn attaches_bearer_when_session_has_token() {
        let session = Arc::new(SessionManager::new(None));
        session.establish("tok-a", None).expect("establish");
        let (transport, raw) = stack(session);
        raw.push("Timeline", Ok(timeline_reply()));

        let data: TimelineData = transport
            .execute(&timeline_request())
            .await
            .expect("timeline should load");

        assert_eq!(data.timeline[0].id, "1");
        assert_eq!(
            raw.calls(),
            vec![("Timeline".to_owned(), Some("tok-a".to_owned()))]
        );
    }

    #[tokio::test]
    async fn unauthorized_without_token_refreshes_and_retries_once() {
        let session = Arc::new(SessionManager::new(None));
        let (transport, raw) = stack(Arc::clone(&session));
        raw.push("Timeline", Ok(error_reply("Unauthorized")));
        raw.push("RefreshToken", Ok(refresh_ok("fresh")));
        raw.push("Timeline", Ok(timeline_reply()));

        let data: TimelineData = transport
            .execute(&timeline_request())
            .await
            .expect("retry should succeed");

        assert_eq!(data.timeline.len(), 1);
        assert_eq!(session.snapshot().access_token.as_deref(), Some("fresh"));
        assert_eq!(
            raw.calls(),
            vec![
                ("Timeline".to_owned(), None),
                ("RefreshToken".to_owned(), None),
                ("Timeline".to_owned(), Some("fresh".to_owned())),
            ]
        );
    }

    #[tokio::test]
    async fn http_401_triggers_refresh() {
        let session = Arc::new(SessionManager::new(None));
        session.establish("expired", None).expect("establish");
        let (transport, raw) = stack(session);
        raw.push("Timeline", Ok(status_reply(401)));
        raw.push("RefreshToken", Ok(refresh_ok("fresh")));
        raw.push("Timeline", Ok(timeline_reply()));

        transport
            .execute_value(&timeline_request())
            .await
            .expect("retry should succeed");
        assert_eq!(raw.count("RefreshToken"), 1);
    }

    #[tokio::test]
    async fn failed_refresh_clears_session_and_surfaces_auth_error() {
        let session = Arc::new(SessionManager::new(None));
        session.establish("expired", Some("u1".into())).expect("establish");
        let (transport, raw) = stack(Arc::clone(&session));
        raw.push("Timeline", Ok(error_reply("No valid access token")));
        raw.push("RefreshToken", Ok(error_reply("refresh token expired")));

        let err = transport
            .execute_value(&timeline_request())
            .await
            .expect_err("request must fail");

        assert_eq!(err.category, EchoErrorCategory::Auth);
        assert_eq!(err.message, "No valid access token");
        assert!(!session.snapshot().is_authenticated());
        assert_eq!(raw.count("Timeline"), 1);
    }

    #[tokio::test]
    async fn retry_failure_is_surfaced_without_second_refresh() {
        let session = Arc::new(SessionManager::new(None));
        session.establish("expired", None).expect("establish");
        let (transport, raw) = stack(session);
        raw.push("Timeline", Ok(error_reply("Unauthorized")));
        raw.push("RefreshToken", Ok(refresh_ok("fresh")));
        raw.push("Timeline", Ok(error_reply("Unauthorized")));

        let err = transport
            .execute_value(&timeline_request())
            .await
            .expect_err("retry failure must surface");

        assert!(err.is_auth());
        assert_eq!(raw.count("RefreshToken"), 1);
        assert_eq!(raw.count("Timeline"), 2);
    }

    #[tokio::test]
    async fn non_auth_errors_pass_through_untouched() {
        let session = Arc::new(SessionManager::new(None));
        session.establish("tok", None).expect("establish");
        let (transport, raw) = stack(session);
        raw.push("Timeline", Ok(error_reply("Post not found")));
        raw.push("Timeline", Err(network_error()));

        let app = transport
            .execute_value(&timeline_request())
            .await
            .expect_err("graphql error");
        assert_eq!(app.category, EchoErrorCategory::GraphQl);

        let net = transport
            .execute_value(&timeline_request())
            .await
            .expect_err("network error");
        assert_eq!(net.category, EchoErrorCategory::Network);
        assert_eq!(raw.count("RefreshToken"), 0);
    }
}
