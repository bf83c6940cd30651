use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::{
    config::EndpointInfo,
    error::GraphQLError,
    schema::{SchemaIndex, TypeRenamer},
};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UpstreamRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
    /// Headers forwarded from the client request.
    #[serde(skip)]
    pub headers: Vec<(String, String)>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Vec<GraphQLError>,
}

/// The request never produced a GraphQL response.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Executes GraphQL requests against one upstream service.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn execute(&self, request: UpstreamRequest) -> Result<UpstreamResponse, TransportError>;
}

pub struct HttpUpstreamClient {
    client: reqwest::Client,
    url: String,
}

impl HttpUpstreamClient {
    pub fn new(url: &str) -> Self {
        HttpUpstreamClient::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: &str) -> Self {
        HttpUpstreamClient {
            client,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn execute(&self, request: UpstreamRequest) -> Result<UpstreamResponse, TransportError> {
        let mut builder = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .json(&request)
            .send()
            .await
            .map_err(|e| TransportError(format!("failed to send request to {}: {}", self.url, e)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError(format!("failed to read response from {}: {}", self.url, e)))?;

        // GraphQL servers may answer errors with a non-2xx status and a regular body.
        match serde_json::from_slice::<UpstreamResponse>(&body) {
            Ok(response) if response.data.is_some() || !response.errors.is_empty() => Ok(response),
            _ if !status.is_success() => Err(TransportError(format!(
                "{} responded with status {}",
                self.url, status
            ))),
            Ok(response) => Ok(response),
            Err(e) => Err(TransportError(format!(
                "failed to parse response from {}: {}",
                self.url, e
            ))),
        }
    }
}

/// One configured endpoint bound to its client and its (renamed) schema.
pub struct Upstream {
    pub id: String,
    pub info: EndpointInfo,
    pub client: Arc<dyn UpstreamClient>,
    pub schema: SchemaIndex,
    pub renamer: TypeRenamer,
}

impl Upstream {
    pub fn new(
        id: &str,
        info: EndpointInfo,
        client: Arc<dyn UpstreamClient>,
        mut schema: SchemaIndex,
    ) -> Self {
        let renamer = TypeRenamer::new(&info.prefix, &info.suffix);
        schema.rename_types(&renamer);
        Upstream {
            id: id.to_string(),
            info,
            client,
            schema,
            renamer,
        }
    }
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("id", &self.id)
            .field("url", &self.info.url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn posts_query_variables_and_forwarded_headers() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/graphql")
                    .header("authorization", "Bearer abc")
                    .json_body(json!({
                        "query": "query($id: ID!) { f0: user(id: $id) { f1: name } }",
                        "variables": { "id": "42" }
                    }));
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(json!({ "data": { "f0": { "f1": "Ada" } } }));
            })
            .await;

        let client = HttpUpstreamClient::new(&server.url("/graphql"));
        let mut variables = Map::new();
        variables.insert("id".to_string(), json!("42"));
        let response = client
            .execute(UpstreamRequest {
                query: "query($id: ID!) { f0: user(id: $id) { f1: name } }".to_string(),
                variables,
                headers: vec![("Authorization".to_string(), "Bearer abc".to_string())],
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.data, Some(json!({ "f0": { "f1": "Ada" } })));
        assert!(response.errors.is_empty());
    }

    #[tokio::test]
    async fn keeps_graphql_errors_sent_with_a_failure_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/graphql");
                then.status(400)
                    .json_body(json!({ "errors": [{ "message": "Cannot query field \"nope\"" }] }));
            })
            .await;

        let client = HttpUpstreamClient::new(&server.url("/graphql"));
        let response = client
            .execute(UpstreamRequest {
                query: "{ nope }".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(response.errors[0].message, "Cannot query field \"nope\"");
    }

    #[tokio::test]
    async fn reports_failure_statuses_without_a_graphql_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/graphql");
                then.status(502).body("bad gateway");
            })
            .await;

        let client = HttpUpstreamClient::new(&server.url("/graphql"));
        let err = client
            .execute(UpstreamRequest {
                query: "{ a }".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(err.0.contains("502"));
    }
}
