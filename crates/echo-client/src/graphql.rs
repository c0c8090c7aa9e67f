use async_trait::async_trait;
use echo_core::{EchoError, EchoErrorCategory, classify_http_status, is_auth_failure_message};
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::debug;
use url::Url;

/// One GraphQL operation as posted to `/graphql`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GraphqlRequest {
    pub operation_name: &'static str,
    pub query: &'static str,
    pub variables: Value,
}

impl GraphqlRequest {
    pub fn new(operation_name: &'static str, query: &'static str, variables: Value) -> Self {
        Self {
            operation_name,
            query,
            variables,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GraphqlError {
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct GraphqlResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Vec<GraphqlError>,
}

/// HTTP status plus decoded GraphQL body of a single exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphqlReply {
    pub status: u16,
    pub response: GraphqlResponse,
}

impl GraphqlReply {
    pub fn new(status: u16, response: GraphqlResponse) -> Self {
        Self { status, response }
    }

    /// Authentication failure carried by this reply, if any.
    ///
    /// Either HTTP 401 or a GraphQL error whose message names a missing or
    /// rejected access token.
    pub fn auth_failure(&self) -> Option<EchoError> {
        if self.status == StatusCode::UNAUTHORIZED.as_u16() {
            return Some(EchoError::unauthorized("backend answered HTTP 401"));
        }
        self.response
            .errors
            .iter()
            .find(|err| is_auth_failure_message(&err.message))
            .map(|err| EchoError::unauthorized(err.message.clone()))
    }

    pub fn is_auth_failure(&self) -> bool {
        self.auth_failure().is_some()
    }

    /// The `data` object, or the error this reply stands for.
    pub fn into_data(self) -> Result<Value, EchoError> {
        if let Some(err) = self.auth_failure() {
            return Err(err);
        }

        if !self.response.errors.is_empty() {
            let message = self
                .response
                .errors
                .iter()
                .map(|err| err.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(EchoError::new(
                EchoErrorCategory::GraphQl,
                "graphql_error",
                message,
            ));
        }

        if !(200..300).contains(&self.status) {
            return Err(EchoError::new(
                classify_http_status(self.status),
                "http_status",
                format!("backend answered HTTP {}", self.status),
            ));
        }

        match self.response.data {
            Some(Value::Null) | None => Err(EchoError::new(
                EchoErrorCategory::Serialization,
                "graphql_missing_data",
                "GraphQL response carried no data",
            )),
            Some(data) => Ok(data),
        }
    }

    pub fn decode<T: DeserializeOwned>(self) -> Result<T, EchoError> {
        decode_data(self.into_data()?)
    }
}

pub(crate) fn decode_data<T: DeserializeOwned>(data: Value) -> Result<T, EchoError> {
    serde_json::from_value(data).map_err(|err| {
        EchoError::new(
            EchoErrorCategory::Serialization,
            "graphql_decode_error",
            err.to_string(),
        )
    })
}

/// Sends one GraphQL request with an optional bearer credential.
///
/// Implementations never retry and never interpret the reply.
#[async_trait]
pub trait GraphqlTransport: Send + Sync {
    async fn execute(
        &self,
        request: &GraphqlRequest,
        bearer: Option<&str>,
    ) -> Result<GraphqlReply, EchoError>;
}

/// `reqwest` transport posting JSON to `{base}/graphql`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: Url,
}

impl HttpTransport {
    pub fn new(client: Client, server_url: &Url) -> Result<Self, EchoError> {
        let endpoint = server_url.join("graphql").map_err(|err| {
            EchoError::new(
                EchoErrorCategory::Config,
                "invalid_server_url",
                format!("cannot derive GraphQL endpoint from '{server_url}': {err}"),
            )
        })?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl GraphqlTransport for HttpTransport {
    async fn execute(
        &self,
        request: &GraphqlRequest,
        bearer: Option<&str>,
    ) -> Result<GraphqlReply, EchoError> {
        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .header(header::ACCEPT, "application/json")
            .json(request);
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        debug!(
            operation = request.operation_name,
            status = status.as_u16(),
            authenticated = bearer.is_some(),
            "graphql exchange finished"
        );

        if status == StatusCode::UNAUTHORIZED {
            return Ok(GraphqlReply::new(status.as_u16(), GraphqlResponse::default()));
        }

        let body = response.bytes().await.map_err(map_reqwest_error)?;
        match serde_json::from_slice::<GraphqlResponse>(&body) {
            Ok(decoded) => Ok(GraphqlReply::new(status.as_u16(), decoded)),
            Err(_) if !status.is_success() => Ok(GraphqlReply::new(
                status.as_u16(),
                GraphqlResponse::default(),
            )),
            Err(err) => Err(EchoError::new(
                EchoErrorCategory::Serialization,
                "graphql_decode_error",
                err.to_string(),
            )),
        }
    }
}

pub(crate) fn map_reqwest_error(err: reqwest::Error) -> EchoError {
    if let Some(status) = err.status() {
        return EchoError::new(
            classify_http_status(status.as_u16()),
            "http_status",
            err.to_string(),
        );
    }

    let code = if err.is_timeout() {
        "http_timeout"
    } else if err.is_connect() {
        "http_connect_failed"
    } else if err.is_decode() {
        return EchoError::new(
            EchoErrorCategory::Serialization,
            "http_decode_error",
            err.to_string(),
        );
    } else {
        "http_transport_error"
    };

    EchoError::new(EchoErrorCategory::Network, code, err.to_string())
}
