use graphql_parser::schema::TypeDefinition;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    GraphQLRequest, GraphQLResponse,
    bridge::{MountResolver, MountedKeys},
    config::Config,
    engine::{self, RequestContext, ResolverRegistry},
    error::GatewayError,
    load::UpstreamOptions,
    mount::{MountedField, mount},
    schema::{SchemaIndex, empty_object, is_builtin_scalar, kind_name, named_type},
    schema_registry::{ConfiguredSchemaSource, SchemaSource},
    upstream::{HttpUpstreamClient, Upstream, UpstreamClient},
};

/// The unified schema plus everything needed to resolve its mounted fields. Immutable once
/// built; share it behind an `Arc`.
pub struct FederationGateway {
    schema: Arc<SchemaIndex>,
    resolvers: Arc<ResolverRegistry>,
    mounted: Vec<Arc<MountedField>>,
    upstreams: BTreeMap<String, Arc<Upstream>>,
    upstream_timeout: Option<Duration>,
}

pub struct GatewayBuilder {
    config: Config,
    clients: HashMap<String, Arc<dyn UpstreamClient>>,
    schema_source: Option<Box<dyn SchemaSource>>,
}

impl GatewayBuilder {
    /// Uses `client` to reach `endpoint` instead of plain HTTP.
    pub fn client(mut self, endpoint: &str, client: Arc<dyn UpstreamClient>) -> Self {
        self.clients.insert(endpoint.to_string(), client);
        self
    }

    pub fn schema_source(mut self, source: Box<dyn SchemaSource>) -> Self {
        self.schema_source = Some(source);
        self
    }

    /// Acquires every upstream schema, mounts every configured field and assembles the
    /// unified schema. Any failure aborts the build.
    pub async fn build(self) -> Result<FederationGateway, GatewayError> {
        let GatewayBuilder {
            config,
            mut clients,
            schema_source,
        } = self;
        let source: Box<dyn SchemaSource> = match schema_source {
            Some(source) => source,
            None => Box::new(ConfiguredSchemaSource::from_config(&config)),
        };

        let mut upstreams = BTreeMap::new();
        for (id, info) in &config.endpoints {
            let client: Arc<dyn UpstreamClient> = match clients.remove(id) {
                Some(client) => client,
                None => Arc::new(HttpUpstreamClient::new(&info.url)),
            };
            let sdl = source.acquire(id, info, client.as_ref()).await?;
            let schema = SchemaIndex::parse(&sdl).map_err(|e| GatewayError::SchemaParse {
                endpoint: id.clone(),
                message: e.to_string(),
            })?;
            upstreams.insert(
                id.clone(),
                Arc::new(Upstream::new(id, info.clone(), client, schema)),
            );
        }

        let mut mounted = Vec::new();
        for type_config in &config.types {
            for field in &type_config.fields {
                let upstream = upstreams
                    .get(&field.endpoint)
                    .ok_or_else(|| GatewayError::InvalidEndpoint(field.endpoint.clone()))?;
                let fields = mount(
                    &type_config.name,
                    &field.name,
                    Some(field.description.as_str()),
                    upstream,
                    &field.query,
                )?;
                mounted.extend(fields.into_iter().map(Arc::new));
            }
        }

        let schema = assemble_schema(&config, &mounted)?;

        let keys: Arc<MountedKeys> = Arc::new(
            mounted
                .iter()
                .map(|field| (field.type_name.clone(), field.name().to_string()))
                .collect(),
        );
        let mut resolvers = ResolverRegistry::new();
        for field in &mounted {
            let upstream = upstreams
                .get(&field.endpoint)
                .ok_or_else(|| GatewayError::InvalidEndpoint(field.endpoint.clone()))?;
            resolvers.register(
                &field.type_name,
                field.name(),
                Arc::new(MountResolver::new(field.clone(), upstream.clone(), keys.clone())),
            );
        }

        info!(
            "gateway ready: {} endpoint(s), {} mounted field(s)",
            upstreams.len(),
            mounted.len()
        );

        Ok(FederationGateway {
            schema: Arc::new(schema),
            resolvers: Arc::new(resolvers),
            mounted,
            upstreams,
            upstream_timeout: config.upstream_timeout(),
        })
    }
}

/// Builds the unified schema from the types every mounted field requires, then installs the
/// mounted field definitions.
fn assemble_schema(
    config: &Config,
    mounted: &[Arc<MountedField>],
) -> Result<SchemaIndex, GatewayError> {
    let mut schema = SchemaIndex::with_root_types();
    for field in mounted {
        for def in &field.required_types {
            schema.insert_if_missing(def.clone());
        }
    }

    for type_config in &config.types {
        if is_builtin_scalar(&type_config.name) {
            return Err(GatewayError::NotAnObject {
                type_name: type_config.name.clone(),
                kind: "SCALAR",
            });
        }
        match schema.get(&type_config.name) {
            None => {
                schema.insert_if_missing(empty_object(&type_config.name));
            }
            Some(TypeDefinition::Object(_)) => {}
            Some(other) => {
                return Err(GatewayError::NotAnObject {
                    type_name: type_config.name.clone(),
                    kind: kind_name(other),
                });
            }
        }
    }

    for field in mounted {
        for argument in &field.definition.arguments {
            let argument_type = named_type(&argument.value_type);
            if !schema.contains(argument_type) {
                return Err(GatewayError::UnknownType(argument_type.to_string()));
            }
        }

        let object = schema.object_mut(&field.type_name).ok_or_else(|| {
            GatewayError::NotAnObject {
                type_name: field.type_name.clone(),
                kind: "non-object type",
            }
        })?;
        match object.fields.iter_mut().find(|f| f.name == field.name()) {
            Some(existing) => {
                debug!(
                    "overwriting {}.{} with a field mounted from {}",
                    field.type_name,
                    field.name(),
                    field.endpoint
                );
                *existing = field.definition.clone();
            }
            None => object.fields.push(field.definition.clone()),
        }
    }
    Ok(schema)
}

impl FederationGateway {
    pub fn builder(config: Config) -> GatewayBuilder {
        GatewayBuilder {
            config,
            clients: HashMap::new(),
            schema_source: None,
        }
    }

    /// Builds a gateway that reaches every endpoint over HTTP.
    pub async fn new(config: Config) -> Result<Self, GatewayError> {
        FederationGateway::builder(config).build().await
    }

    pub async fn process_request(&self, request: GraphQLRequest) -> GraphQLResponse {
        debug!(operation = ?request.operation_name, "processing request");

        let mut headers: Vec<(String, String)> = request
            .auth_headers
            .clone()
            .map(|headers| headers.into_iter().collect())
            .unwrap_or_default();
        headers.sort();

        let context = RequestContext::new(UpstreamOptions {
            headers,
            deadline: self.upstream_timeout.map(|timeout| Instant::now() + timeout),
        });
        engine::execute(&self.schema, &self.resolvers, &request, &context).await
    }

    pub fn schema(&self) -> &SchemaIndex {
        &self.schema
    }

    /// The unified schema as SDL.
    pub fn sdl(&self) -> String {
        self.schema.to_sdl()
    }

    pub fn mounted_fields(&self) -> &[Arc<MountedField>] {
        &self.mounted
    }

    pub fn upstream(&self, id: &str) -> Option<&Arc<Upstream>> {
        self.upstreams.get(id)
    }
}
