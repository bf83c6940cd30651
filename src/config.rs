use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::GatewayError;

/// Identifies one upstream service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub suffix: String,
    /// Statically embedded upstream schema. When set, the schema is never downloaded.
    #[serde(default, rename = "types", skip_serializing_if = "String::is_empty")]
    pub schema: String,
}

/// Binds a field of a unified type to a query against an upstream.
///
/// An empty `name` mounts every field of the type the query selects.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub endpoint: String,
    pub query: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeConfig {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Directory the config was loaded from; cached upstream schemas live below it.
    #[serde(skip)]
    pub config_directory: PathBuf,
    #[serde(default)]
    pub disable_schema_downloads: bool,
    #[serde(default)]
    pub enable_schema_storage: bool,
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointInfo>,
    #[serde(default)]
    pub types: Vec<TypeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_timeout_ms: Option<u64>,
}

impl Config {
    /// Reads a config file. Files ending in `.yaml`/`.yml` are parsed as YAML, anything else
    /// as JSON.
    pub fn from_file(path: &Path) -> Result<Self, GatewayError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("failed to read {}: {}", path.display(), e)))?;

        let mut config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str::<Config>(&contents)
                .map_err(|e| GatewayError::Config(format!("failed to parse {}: {}", path.display(), e)))?,
            _ => Self::from_json(&contents)?,
        };

        config.config_directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok(config)
    }

    pub fn from_json(contents: &str) -> Result<Self, GatewayError> {
        let mut config: Config = serde_json::from_str(contents)
            .map_err(|e| GatewayError::Config(format!("failed to parse config: {}", e)))?;
        config.config_directory = PathBuf::from(".");
        Ok(config)
    }

    pub fn schema_storage_dir(&self) -> PathBuf {
        let base = if self.config_directory.as_os_str().is_empty() {
            Path::new(".")
        } else {
            self.config_directory.as_path()
        };
        base.join("endpoints")
    }

    pub fn upstream_timeout(&self) -> Option<Duration> {
        self.upstream_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"{
        "disable-schema-downloads": true,
        "enable-schema-storage": false,
        "endpoints": {
            "users": {
                "url": "http://users.local/graphql",
                "prefix": "Users",
                "types": "type Query { user(id: ID!): User } type User { name: String }"
            }
        },
        "types": [
            {
                "name": "Query",
                "fields": [
                    { "name": "userName", "description": "a user's name", "endpoint": "users", "query": "query { user(id: $id) { name } }" },
                    { "endpoint": "users", "query": "query {}" }
                ]
            }
        ],
        "upstream-timeout-ms": 2500
    }"#;

    #[test]
    fn parses_the_json_layout() {
        let config = Config::from_json(SAMPLE).unwrap();

        assert!(config.disable_schema_downloads);
        assert!(!config.enable_schema_storage);
        assert_eq!(config.endpoints["users"].prefix, "Users");
        assert!(config.endpoints["users"].schema.starts_with("type Query"));
        assert_eq!(config.types[0].fields.len(), 2);
        assert_eq!(config.types[0].fields[0].description, "a user's name");
        assert_eq!(config.types[0].fields[1].name, "");
        assert_eq!(config.upstream_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.schema_storage_dir(), PathBuf::from("./endpoints"));
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let config = Config::from_json("{}").unwrap();
        assert!(config.endpoints.is_empty());
        assert!(config.types.is_empty());
        assert_eq!(config.upstream_timeout(), None);
    }

    #[test]
    fn loads_yaml_files_relative_to_their_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        fs::write(
            &path,
            "endpoints:\n  users:\n    url: http://users.local/graphql\ntypes: []\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.endpoints["users"].url, "http://users.local/graphql");
        assert_eq!(config.config_directory, dir.path());
        assert_eq!(config.schema_storage_dir(), dir.path().join("endpoints"));
    }

    #[test]
    fn reports_malformed_config() {
        let err = Config::from_json("{\"types\": 3}").unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
