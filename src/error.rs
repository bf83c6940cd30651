use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One step of a response path: either an object key or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(value: &str) -> Self {
        PathSegment::Field(value.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(value: usize) -> Self {
        PathSegment::Index(value)
    }
}

/// An error as it appears in a GraphQL response, both ours and the ones upstreams send us.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        GraphQLError {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }

    pub fn with_path(mut self, path: &[PathSegment]) -> Self {
        self.path = Some(path.to_vec());
        self
    }
}

impl std::fmt::Display for GraphQLError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Errors raised while building the gateway. Any of them aborts startup.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("invalid mount template: {0}")]
    InvalidTemplate(String),
    #[error("failed to parse mount template: {0}")]
    TemplateParse(String),
    #[error("field `{field}` not found on type `{type_name}`")]
    UnknownField { type_name: String, field: String },
    #[error("type `{type_name}` of field `{field}` is not an object type")]
    NotAnObjectType { field: String, type_name: String },
    #[error("variable name `{0}` not found defined in operation arguments")]
    UndeclaredVariable(String),
    #[error("unknown type `{0}`")]
    UnknownType(String),
    #[error("invalid endpoint id: {0}")]
    InvalidEndpoint(String),
    #[error("can only configure fields on OBJECT types: {type_name} is a {kind}")]
    NotAnObject { type_name: String, kind: &'static str },
    #[error("failed to parse schema of endpoint `{endpoint}`: {message}")]
    SchemaParse { endpoint: String, message: String },
    #[error("no schema defined for endpoint {endpoint}: {url}")]
    SchemaUnavailable { endpoint: String, url: String },
    #[error("schema download for endpoint `{endpoint}` failed: {reason}")]
    SchemaDownload { endpoint: String, reason: String },
    #[error("could not persist schema to {}: {source}", path.display())]
    CouldNotPersistSchema {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors local to the resolution of one mounted field.
///
/// A failed upstream load hands the same error to every field attached to it, so these are
/// cheap to clone.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("upstream `{endpoint}` returned errors")]
    Upstream {
        endpoint: String,
        query: String,
        errors: Vec<GraphQLError>,
    },
    #[error("expected json field not found: {path}")]
    MissingField { path: String },
    #[error("request to upstream `{endpoint}` failed: {message}")]
    Transport { endpoint: String, message: String },
    #[error("request to upstream `{endpoint}` timed out")]
    Timeout { endpoint: String },
    #[error("request to upstream `{endpoint}` was abandoned before it completed")]
    Cancelled { endpoint: String },
    #[error("{0}")]
    InvalidQuery(String),
}

impl ResolveError {
    /// Turns the error into the client-facing errors of the field at `path`.
    pub fn into_graphql_errors(self, path: &[PathSegment]) -> Vec<GraphQLError> {
        match self {
            ResolveError::Upstream {
                endpoint,
                query,
                errors,
            } => errors
                .into_iter()
                .map(|error| {
                    let mut extensions = error.extensions.unwrap_or_default();
                    extensions.insert("endpoint".to_string(), Value::String(endpoint.clone()));
                    extensions.insert("upstreamQuery".to_string(), Value::String(query.clone()));
                    if let Some(upstream_path) = error.path {
                        if let Ok(upstream_path) = serde_json::to_value(upstream_path) {
                            extensions.insert("upstreamPath".to_string(), upstream_path);
                        }
                    }
                    GraphQLError {
                        message: error.message,
                        path: Some(path.to_vec()),
                        extensions: Some(extensions),
                    }
                })
                .collect(),
            other => vec![GraphQLError::new(other.to_string()).with_path(path)],
        }
    }
}
