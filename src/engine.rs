//! A small executor for client operations against the unified schema.
//!
//! Fields with a registered [`FieldResolver`] are resolved through it; every other field reads
//! its value from the parent object, which is how data forwarded from upstreams flows through.

use async_trait::async_trait;
use futures::{
    FutureExt,
    future::{BoxFuture, join_all},
};
use graphql_parser::{
    query::{Selection, TypeCondition, Value as AstValue},
    schema::{Type, TypeDefinition},
};
use serde_json::{Map, Number, Value};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use crate::{
    GraphQLRequest, GraphQLResponse,
    error::{GraphQLError, PathSegment, ResolveError},
    load::{LoadCoordinator, UpstreamOptions},
    query::{self, FragmentDef, QueryDirective, QueryField, QuerySelectionSet, QueryValue, VariableDef},
    schema::{FieldDef, OperationKind, SchemaIndex, TypeRef, type_to_string},
};

pub type Fragments = HashMap<String, FragmentDef>;

/// State shared by every resolver of one client request.
pub struct RequestContext {
    loads: LoadCoordinator,
}

impl RequestContext {
    pub fn new(options: UpstreamOptions) -> Self {
        RequestContext {
            loads: LoadCoordinator::new(options),
        }
    }

    pub fn loads(&self) -> &LoadCoordinator {
        &self.loads
    }
}

pub struct ResolveRequest<'r> {
    pub context: &'r RequestContext,
    /// The value of the enclosing object.
    pub parent: &'r Value,
    /// The client's field, with the selection sets of every occurrence of its response key
    /// combined.
    pub field: &'r QueryField,
    /// Argument values after defaults and variables were applied.
    pub arguments: Map<String, Value>,
    pub fragments: &'r Fragments,
    /// Variable definitions of the client operation.
    pub variable_definitions: &'r [VariableDef],
    /// Client variable values, defaults included.
    pub variables: &'r Map<String, Value>,
}

#[async_trait]
pub trait FieldResolver: Send + Sync {
    async fn resolve(&self, request: ResolveRequest<'_>) -> Result<Value, ResolveError>;
}

#[derive(Clone, Default)]
pub struct ResolverRegistry {
    resolvers: HashMap<(String, String), Arc<dyn FieldResolver>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        ResolverRegistry::default()
    }

    /// Registers `resolver` for `type_name.field_name`, replacing any previous one.
    pub fn register(&mut self, type_name: &str, field_name: &str, resolver: Arc<dyn FieldResolver>) {
        self.resolvers
            .insert((type_name.to_string(), field_name.to_string()), resolver);
    }

    pub fn get(&self, type_name: &str, field_name: &str) -> Option<&Arc<dyn FieldResolver>> {
        self.resolvers
            .get(&(type_name.to_string(), field_name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

/// Converts a query literal to JSON, substituting variables from `variables`.
pub fn value_to_json(value: &QueryValue, variables: &Map<String, Value>) -> Value {
    match value {
        AstValue::Variable(name) => variables.get(name).cloned().unwrap_or(Value::Null),
        AstValue::Int(n) => n.as_i64().map(Value::from).unwrap_or(Value::Null),
        AstValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        AstValue::String(s) => Value::String(s.clone()),
        AstValue::Boolean(b) => Value::Bool(*b),
        AstValue::Null => Value::Null,
        AstValue::Enum(e) => Value::String(e.clone()),
        AstValue::List(items) => Value::Array(items.iter().map(|i| value_to_json(i, variables)).collect()),
        AstValue::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), value_to_json(v, variables)))
                .collect(),
        ),
    }
}

fn child_path(path: &[PathSegment], segment: PathSegment) -> Vec<PathSegment> {
    let mut path = path.to_vec();
    path.push(segment);
    path
}

struct Execution<'e> {
    schema: &'e SchemaIndex,
    resolvers: &'e ResolverRegistry,
    context: &'e RequestContext,
    fragments: Fragments,
    variable_definitions: Vec<VariableDef>,
    variables: Map<String, Value>,
    errors: Mutex<Vec<GraphQLError>>,
}

impl<'e> Execution<'e> {
    fn report(&self, errors: impl IntoIterator<Item = GraphQLError>) {
        let mut reported = self.errors.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        reported.extend(errors);
    }

    fn included(&self, directives: &[QueryDirective]) -> bool {
        let condition = |name: &str| {
            directives
                .iter()
                .find(|d| d.name == name)
                .and_then(|d| d.arguments.iter().find(|(arg, _)| arg == "if"))
                .map(|(_, value)| value_to_json(value, &self.variables) == Value::Bool(true))
        };
        condition("skip") != Some(true) && condition("include") != Some(false)
    }

    /// Whether a fragment with `condition` applies to an object of `type_name`. For an
    /// abstract `type_name` the concrete type is unknown, so any overlapping condition applies.
    fn applies(&self, type_name: &str, condition: Option<&TypeCondition<'static, String>>) -> bool {
        let Some(TypeCondition::On(condition)) = condition else {
            return true;
        };
        condition == type_name
            || self.schema.is_possible_type(condition, type_name)
            || (self.schema.is_abstract(type_name)
                && (self.schema.is_possible_type(type_name, condition)
                    || self.schema.is_abstract(condition)))
    }

    fn collect_fields(
        &self,
        type_name: &str,
        selection_set: &QuerySelectionSet,
        visited: &mut HashSet<String>,
        out: &mut Vec<(String, QueryField)>,
    ) {
        for selection in &selection_set.items {
            match selection {
                Selection::Field(field) => {
                    if !self.included(&field.directives) {
                        continue;
                    }
                    let key = query::response_key(field);
                    match out.iter_mut().find(|(existing, _)| existing == key) {
                        Some((_, merged)) => merged
                            .selection_set
                            .items
                            .extend(field.selection_set.items.iter().cloned()),
                        None => out.push((key.to_string(), field.clone())),
                    }
                }
                Selection::InlineFragment(fragment) => {
                    if self.included(&fragment.directives)
                        && self.applies(type_name, fragment.type_condition.as_ref())
                    {
                        self.collect_fields(type_name, &fragment.selection_set, visited, out);
                    }
                }
                Selection::FragmentSpread(spread) => {
                    if !self.included(&spread.directives) || !visited.insert(spread.fragment_name.clone()) {
                        continue;
                    }
                    let Some(fragment) = self.fragments.get(&spread.fragment_name) else {
                        self.report([GraphQLError::new(format!(
                            "Unknown fragment \"{}\".",
                            spread.fragment_name
                        ))]);
                        continue;
                    };
                    if self.applies(type_name, Some(&fragment.type_condition)) {
                        self.collect_fields(type_name, &fragment.selection_set, visited, out);
                    }
                }
            }
        }
    }

    /// Finds the definition of `field_name`, looking through the possible types when
    /// `type_name` is abstract.
    fn field_definition(&self, type_name: &str, field_name: &str) -> Option<&'e FieldDef> {
        if let Some(definition) = self.schema.field(type_name, field_name) {
            return Some(definition);
        }
        if !self.schema.is_abstract(type_name) {
            return None;
        }
        self.schema.types().find_map(|def| match def {
            TypeDefinition::Object(object) if self.schema.is_possible_type(type_name, &object.name) => {
                object.fields.iter().find(|f| f.name == field_name)
            }
            _ => None,
        })
    }

    fn coerce_arguments(
        &self,
        definition: &FieldDef,
        field: &QueryField,
    ) -> Result<Map<String, Value>, String> {
        for (name, _) in &field.arguments {
            if !definition.arguments.iter().any(|a| &a.name == name) {
                return Err(format!(
                    "Unknown argument \"{}\" on field \"{}\".",
                    name, field.name
                ));
            }
        }

        let mut arguments = Map::new();
        for argument in &definition.arguments {
            let provided = match field.arguments.iter().find(|(name, _)| name == &argument.name) {
                Some((_, AstValue::Variable(variable))) => self.variables.get(variable).cloned(),
                Some((_, literal)) => Some(value_to_json(literal, &self.variables)),
                None => None,
            };
            let value = provided.or_else(|| {
                argument
                    .default_value
                    .as_ref()
                    .map(|d| value_to_json(d, &Map::new()))
            });
            let required = matches!(argument.value_type, Type::NonNullType(_));

            match value {
                Some(Value::Null) if required => {
                    return Err(format!(
                        "Argument \"{}\" of non-null type \"{}\" must not be null.",
                        argument.name,
                        type_to_string(&argument.value_type)
                    ));
                }
                Some(value) => {
                    arguments.insert(argument.name.clone(), value);
                }
                None if required => {
                    return Err(format!(
                        "Argument \"{}\" of required type \"{}\" was not provided.",
                        argument.name,
                        type_to_string(&argument.value_type)
                    ));
                }
                None => {}
            }
        }
        Ok(arguments)
    }

    fn execute_selection_set<'a>(
        &'a self,
        type_name: &'a str,
        parent: &'a Value,
        selection_set: &'a QuerySelectionSet,
        path: Vec<PathSegment>,
        serial: bool,
    ) -> BoxFuture<'a, Map<String, Value>> {
        async move {
            let mut fields = Vec::new();
            self.collect_fields(type_name, selection_set, &mut HashSet::new(), &mut fields);

            let mut result = Map::new();
            if serial {
                for (key, field) in &fields {
                    let path = child_path(&path, key.as_str().into());
                    if let Some(value) = self.execute_field(type_name, parent, field, path).await {
                        result.insert(key.clone(), value);
                    }
                }
            } else {
                let values = join_all(fields.iter().map(|(key, field)| {
                    let path = child_path(&path, key.as_str().into());
                    self.execute_field(type_name, parent, field, path)
                }))
                .await;
                for ((key, _), value) in fields.iter().zip(values) {
                    if let Some(value) = value {
                        result.insert(key.clone(), value);
                    }
                }
            }
            result
        }
        .boxed()
    }

    /// Resolves and completes one field. `None` leaves the key out of the result, which only
    /// happens for fields of an abstract type whose concrete type is unknown.
    async fn execute_field(
        &self,
        type_name: &str,
        parent: &Value,
        field: &QueryField,
        path: Vec<PathSegment>,
    ) -> Option<Value> {
        let key = query::response_key(field);
        if field.name == "__typename" {
            let runtime = parent
                .get(key)
                .or_else(|| parent.get("__typename"))
                .cloned()
                .unwrap_or_else(|| Value::String(type_name.to_string()));
            return Some(runtime);
        }

        let Some(definition) = self.field_definition(type_name, &field.name) else {
            self.report([GraphQLError::new(format!(
                "Cannot query field \"{}\" on type \"{}\".",
                field.name, type_name
            ))
            .with_path(&path)]);
            return Some(Value::Null);
        };

        let resolver = self.resolvers.get(type_name, &field.name);
        if resolver.is_none() && self.schema.is_abstract(type_name) && parent.get(key).is_none() {
            return None;
        }

        let arguments = match self.coerce_arguments(definition, field) {
            Ok(arguments) => arguments,
            Err(message) => {
                self.report([GraphQLError::new(message).with_path(&path)]);
                return Some(Value::Null);
            }
        };

        let resolved = match resolver {
            Some(resolver) => {
                resolver
                    .resolve(ResolveRequest {
                        context: self.context,
                        parent,
                        field,
                        arguments,
                        fragments: &self.fragments,
                        variable_definitions: &self.variable_definitions,
                        variables: &self.variables,
                    })
                    .await
            }
            None => Ok(parent
                .get(key)
                .or_else(|| parent.get(&field.name))
                .cloned()
                .unwrap_or(Value::Null)),
        };

        match resolved {
            Ok(value) => Some(
                self.complete_value(&definition.field_type, field, value, path)
                    .await,
            ),
            Err(error) => {
                self.report(error.into_graphql_errors(&path));
                Some(Value::Null)
            }
        }
    }

    fn complete_value<'a>(
        &'a self,
        field_type: &'a TypeRef,
        field: &'a QueryField,
        value: Value,
        path: Vec<PathSegment>,
    ) -> BoxFuture<'a, Value> {
        async move {
            match field_type {
                Type::NonNullType(inner) => {
                    let was_null = value.is_null();
                    let completed = self.complete_value(inner, field, value, path.clone()).await;
                    if was_null {
                        self.report([GraphQLError::new(format!(
                            "Cannot return null for non-nullable field {}.",
                            field.name
                        ))
                        .with_path(&path)]);
                    }
                    completed
                }
                Type::ListType(inner) => match value {
                    Value::Null => Value::Null,
                    Value::Array(items) => {
                        let completed = join_all(items.into_iter().enumerate().map(|(i, item)| {
                            self.complete_value(inner, field, item, child_path(&path, i.into()))
                        }))
                        .await;
                        Value::Array(completed)
                    }
                    _ => {
                        self.report([GraphQLError::new(format!(
                            "Expected a list for field {}.",
                            field.name
                        ))
                        .with_path(&path)]);
                        Value::Null
                    }
                },
                Type::NamedType(name) => {
                    let composite = self.schema.fields(name).is_some()
                        || matches!(self.schema.get(name), Some(TypeDefinition::Union(_)));
                    if value.is_null() || !composite {
                        return value;
                    }
                    if field.selection_set.items.is_empty() || !value.is_object() {
                        self.report([GraphQLError::new(format!(
                            "Field {} of type {} must have a selection of subfields and an object value.",
                            field.name, name
                        ))
                        .with_path(&path)]);
                        return Value::Null;
                    }

                    let runtime = match value.get("__typename").and_then(Value::as_str) {
                        Some(concrete)
                            if self.schema.is_abstract(name)
                                && self.schema.is_possible_type(name, concrete) =>
                        {
                            concrete.to_string()
                        }
                        _ => name.clone(),
                    };
                    Value::Object(
                        self.execute_selection_set(&runtime, &value, &field.selection_set, path, false)
                            .await,
                    )
                }
            }
        }
        .boxed()
    }
}

/// Executes a client request against `schema`.
pub async fn execute(
    schema: &SchemaIndex,
    resolvers: &ResolverRegistry,
    request: &GraphQLRequest,
    context: &RequestContext,
) -> GraphQLResponse {
    let document = match query::parse(&request.query) {
        Ok(document) => document,
        Err(e) => {
            return GraphQLResponse::from_error(GraphQLError::new(format!(
                "failed to parse query: {}",
                e
            )));
        }
    };
    let (operations, fragments) = query::split_document(document);

    let operation = match (&request.operation_name, operations.len()) {
        (Some(name), _) => operations
            .into_iter()
            .find(|o| o.name.as_deref() == Some(name.as_str())),
        (None, 1) => operations.into_iter().next(),
        (None, _) => None,
    };
    let Some(operation) = operation else {
        return GraphQLResponse::from_error(GraphQLError::new(match &request.operation_name {
            Some(name) => format!("Unknown operation named \"{}\".", name),
            None => "Must provide an operation name when the document has several operations.".to_string(),
        }));
    };

    if operation.kind == OperationKind::Subscription {
        return GraphQLResponse::from_error(GraphQLError::new("subscriptions are not supported"));
    }
    let Some(root_type) = schema.root_type(operation.kind) else {
        return GraphQLResponse::from_error(GraphQLError::new(format!(
            "Schema is not configured for {} operations.",
            operation.kind
        )));
    };

    let provided = request.variables.clone().unwrap_or_default();
    let mut variables = Map::new();
    for definition in &operation.variables {
        let value = provided.get(&definition.name).cloned().or_else(|| {
            definition
                .default_value
                .as_ref()
                .map(|d| value_to_json(d, &Map::new()))
        });
        match value {
            Some(value) => {
                variables.insert(definition.name.clone(), value);
            }
            None if matches!(definition.var_type, Type::NonNullType(_)) => {
                return GraphQLResponse::from_error(GraphQLError::new(format!(
                    "Variable \"${}\" of required type \"{}\" was not provided.",
                    definition.name,
                    type_to_string(&definition.var_type)
                )));
            }
            None => {}
        }
    }

    let execution = Execution {
        schema,
        resolvers,
        context,
        fragments: fragments.into_iter().map(|f| (f.name.clone(), f)).collect(),
        variable_definitions: operation.variables.clone(),
        variables,
        errors: Mutex::new(Vec::new()),
    };

    let root = Value::Object(Map::new());
    let data = execution
        .execute_selection_set(
            root_type,
            &root,
            &operation.selection_set,
            vec![],
            operation.kind == OperationKind::Mutation,
        )
        .await;

    GraphQLResponse {
        data: Some(Value::Object(data)),
        errors: execution
            .errors
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SDL: &str = r#"
        type Query {
            hero: Character
            people(first: Int = 2): [Person!]!
            greet(name: String!): String
            echo(first: Int = 2, name: String): Args
        }
        type Args { first: Int name: String }
        type Mutation { bump: Int }
        interface Character { name: String }
        type Person implements Character { name: String age: Int }
        type Droid implements Character { name: String model: String }
    "#;

    struct Constant(Value);

    #[async_trait]
    impl FieldResolver for Constant {
        async fn resolve(&self, _: ResolveRequest<'_>) -> Result<Value, ResolveError> {
            Ok(self.0.clone())
        }
    }

    struct Echo;

    #[async_trait]
    impl FieldResolver for Echo {
        async fn resolve(&self, request: ResolveRequest<'_>) -> Result<Value, ResolveError> {
            Ok(Value::Object(request.arguments))
        }
    }

    struct Greeter;

    #[async_trait]
    impl FieldResolver for Greeter {
        async fn resolve(&self, request: ResolveRequest<'_>) -> Result<Value, ResolveError> {
            match request.arguments.get("name").and_then(Value::as_str) {
                Some("nobody") => Err(ResolveError::MissingField {
                    path: "f0.greeting".to_string(),
                }),
                Some(name) => Ok(json!(format!("hello {}", name))),
                None => Ok(Value::Null),
            }
        }
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    #[async_trait]
    impl FieldResolver for Counter {
        async fn resolve(&self, _: ResolveRequest<'_>) -> Result<Value, ResolveError> {
            tokio::task::yield_now().await;
            Ok(json!(self.0.fetch_add(1, Ordering::SeqCst) + 1))
        }
    }

    fn registry() -> ResolverRegistry {
        let mut resolvers = ResolverRegistry::new();
        resolvers.register(
            "Query",
            "hero",
            Arc::new(Constant(json!({ "__typename": "Droid", "name": "R2", "model": "astromech" }))),
        );
        resolvers.register(
            "Query",
            "people",
            Arc::new(Constant(json!([{ "name": "Ada", "age": 36 }, { "name": "Alan", "age": 41 }]))),
        );
        resolvers.register("Query", "greet", Arc::new(Greeter));
        resolvers.register("Query", "echo", Arc::new(Echo));
        resolvers.register("Mutation", "bump", Arc::new(Counter::default()));
        resolvers
    }

    async fn run(query: &str, variables: Value) -> GraphQLResponse {
        let schema = SchemaIndex::parse(SDL).unwrap();
        let request = GraphQLRequest {
            query: query.to_string(),
            variables: variables.as_object().cloned(),
            ..Default::default()
        };
        let context = RequestContext::new(UpstreamOptions::default());
        execute(&schema, &registry(), &request, &context).await
    }

    #[tokio::test]
    async fn completes_nested_values_by_response_key() {
        let response = run("{ people { who: name ...Years } } fragment Years on Person { age }", json!({}))
            .await;

        assert!(response.errors.is_empty());
        assert_eq!(
            response.data,
            Some(json!({ "people": [{ "who": "Ada", "age": 36 }, { "who": "Alan", "age": 41 }] }))
        );
    }

    #[tokio::test]
    async fn resolves_abstract_types_through_typename() {
        let response = run(
            "{ hero { __typename name ... on Droid { model } ... on Person { age } } }",
            json!({}),
        )
        .await;

        assert!(response.errors.is_empty());
        assert_eq!(
            response.data,
            Some(json!({ "hero": { "__typename": "Droid", "name": "R2", "model": "astromech" } }))
        );
    }

    #[tokio::test]
    async fn applies_variables_defaults_and_directives() {
        let response = run(
            "query($n: String!, $skip: Boolean = true) { greet(name: $n) other: greet(name: \"x\") @skip(if: $skip) }",
            json!({ "n": "Ada" }),
        )
        .await;

        assert_eq!(response.data, Some(json!({ "greet": "hello Ada" })));

        let response = run("query($n: String!) { greet(name: $n) }", json!({})).await;
        assert_eq!(response.data, None);
        assert!(response.errors[0].message.contains("$n"));
    }

    #[tokio::test]
    async fn field_errors_keep_sibling_data() {
        let response = run(
            "{ ok: greet(name: \"Ada\") bad: greet(name: \"nobody\") missing: greet }",
            json!({}),
        )
        .await;

        assert_eq!(
            response.data,
            Some(json!({ "ok": "hello Ada", "bad": null, "missing": null }))
        );
        let paths: Vec<Option<Vec<PathSegment>>> = response.errors.iter().map(|e| e.path.clone()).collect();
        assert_eq!(
            paths,
            vec![Some(vec!["bad".into()]), Some(vec!["missing".into()])]
        );
    }

    #[tokio::test]
    async fn mutation_fields_run_one_after_another() {
        let response = run("mutation { a: bump b: bump c: bump }", json!({})).await;

        assert_eq!(response.data, Some(json!({ "a": 1, "b": 2, "c": 3 })));
    }

    #[tokio::test]
    async fn reports_unknown_fields_and_operations() {
        let response = run("{ nope }", json!({})).await;
        assert_eq!(response.data, Some(json!({ "nope": null })));
        assert_eq!(response.errors[0].message, "Cannot query field \"nope\" on type \"Query\".");

        let schema = SchemaIndex::parse(SDL).unwrap();
        let request = GraphQLRequest {
            query: "query A { hero { name } } query B { people { name } }".to_string(),
            operation_name: Some("C".to_string()),
            ..Default::default()
        };
        let context = RequestContext::new(UpstreamOptions::default());
        let response = execute(&schema, &registry(), &request, &context).await;
        assert_eq!(response.data, None);
    }

    #[tokio::test]
    async fn argument_defaults_reach_resolvers() {
        let response = run("{ echo { first name } }", json!({})).await;

        assert!(response.errors.is_empty());
        assert_eq!(response.data, Some(json!({ "echo": { "first": 2, "name": null } })));
    }

    #[tokio::test]
    async fn wrong_shapes_become_field_errors() {
        let schema = SchemaIndex::parse(SDL).unwrap();
        let mut resolvers = ResolverRegistry::new();
        resolvers.register("Query", "people", Arc::new(Echo));
        let request = GraphQLRequest {
            query: "{ people { name } }".to_string(),
            ..Default::default()
        };
        let context = RequestContext::new(UpstreamOptions::default());

        let response = execute(&schema, &resolvers, &request, &context).await;

        assert_eq!(response.data, Some(json!({ "people": null })));
        assert_eq!(response.errors.len(), 1);
        assert!(response.errors[0].message.contains("Expected a list"));
    }
}
