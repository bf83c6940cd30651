pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod federation_gateway;
pub mod load;
pub mod merge;
pub mod mount;
pub mod query;
pub mod schema;
pub mod schema_registry;
pub mod upstream;

pub use config::Config;
pub use error::{GatewayError, GraphQLError, ResolveError};
pub use federation_gateway::{FederationGateway, GatewayBuilder};
pub use upstream::{HttpUpstreamClient, UpstreamClient};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Map<String, Value>>,
    #[serde(default, rename = "operationName")]
    pub operation_name: Option<String>,
    #[serde(skip)]
    pub auth_headers: Option<HashMap<String, String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct GraphQLResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

impl GraphQLResponse {
    /// A response for a request that failed before execution started.
    pub fn from_error(error: GraphQLError) -> Self {
        GraphQLResponse {
            data: None,
            errors: vec![error],
        }
    }
}
