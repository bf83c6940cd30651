use async_trait::async_trait;
use cynic::QueryBuilder;
use cynic_introspection::IntrospectionQuery;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::{
    config::{Config, EndpointInfo},
    error::GatewayError,
    upstream::{UpstreamClient, UpstreamRequest},
};

/// Produces the schema document (SDL) of an upstream endpoint.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn acquire(
        &self,
        endpoint_id: &str,
        info: &EndpointInfo,
        client: &dyn UpstreamClient,
    ) -> Result<String, GatewayError>;
}

/// Uses the static schema when one is configured, otherwise introspects the upstream, falling
/// back to a previously stored copy under `<config-dir>/endpoints/<id>.graphql`.
pub struct ConfiguredSchemaSource {
    storage_dir: PathBuf,
    disable_downloads: bool,
    enable_storage: bool,
}

impl ConfiguredSchemaSource {
    pub fn new(storage_dir: PathBuf, disable_downloads: bool, enable_storage: bool) -> Self {
        ConfiguredSchemaSource {
            storage_dir,
            disable_downloads,
            enable_storage,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        ConfiguredSchemaSource::new(
            config.schema_storage_dir(),
            config.disable_schema_downloads,
            config.enable_schema_storage,
        )
    }

    pub fn schema_file(&self, endpoint_id: &str) -> PathBuf {
        self.storage_dir.join(format!("{}.graphql", endpoint_id))
    }

    /// Stores a freshly downloaded schema so later startups can fall back to it.
    pub async fn persist(&self, endpoint_id: &str, sdl: &str) -> Result<(), GatewayError> {
        let path = self.schema_file(endpoint_id);
        let written = async {
            tokio::fs::create_dir_all(&self.storage_dir).await?;
            tokio::fs::write(&path, sdl).await
        }
        .await;
        written.map_err(|source| GatewayError::CouldNotPersistSchema { path, source })
    }

    async fn read_cached(&self, path: &Path) -> Result<String, GatewayError> {
        info!("loading previously stored schema: {}", path.display());
        Ok(tokio::fs::read_to_string(path).await?)
    }
}

#[async_trait]
impl SchemaSource for ConfiguredSchemaSource {
    async fn acquire(
        &self,
        endpoint_id: &str,
        info: &EndpointInfo,
        client: &dyn UpstreamClient,
    ) -> Result<String, GatewayError> {
        if !info.schema.trim().is_empty() {
            info!("using static schema for endpoint {}: {}", endpoint_id, info.url);
            return Ok(info.schema.clone());
        }

        let cached = self.schema_file(endpoint_id);
        let cached_exists = tokio::fs::metadata(&cached)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);

        if !self.disable_downloads {
            info!("downloading schema for endpoint {}: {}", endpoint_id, info.url);
            match introspect(client).await {
                Ok(sdl) => {
                    if self.enable_storage {
                        self.persist(endpoint_id, &sdl).await?;
                    }
                    return Ok(sdl);
                }
                Err(reason) if cached_exists => {
                    warn!(
                        endpoint = endpoint_id,
                        "download failed (will load cached schema version): {}", reason
                    );
                }
                Err(reason) => {
                    return Err(GatewayError::SchemaDownload {
                        endpoint: endpoint_id.to_string(),
                        reason,
                    });
                }
            }
        }

        if cached_exists {
            return self.read_cached(&cached).await;
        }

        Err(GatewayError::SchemaUnavailable {
            endpoint: endpoint_id.to_string(),
            url: info.url.clone(),
        })
    }
}

/// Runs the standard introspection query through `client` and renders the result as SDL.
pub async fn introspect(client: &dyn UpstreamClient) -> Result<String, String> {
    let operation = IntrospectionQuery::build(());
    let response = client
        .execute(UpstreamRequest {
            query: operation.query,
            ..Default::default()
        })
        .await
        .map_err(|e| e.to_string())?;

    if !response.errors.is_empty() {
        let messages: Vec<String> = response.errors.iter().map(|e| e.message.clone()).collect();
        return Err(messages.join("; "));
    }

    let data = response
        .data
        .ok_or_else(|| "introspection response carried no data".to_string())?;
    let introspection: IntrospectionQuery =
        serde_json::from_value(data).map_err(|e| format!("invalid introspection result: {}", e))?;
    let schema = introspection
        .into_schema()
        .map_err(|e| format!("invalid introspection result: {}", e))?;
    Ok(schema.to_sdl())
}
