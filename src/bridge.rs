use async_trait::async_trait;
use graphql_parser::query::{Selection, TypeCondition};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeSet, HashSet, VecDeque},
    sync::Arc,
};
use tracing::warn;

use crate::{
    engine::{FieldResolver, Fragments, ResolveRequest},
    error::{GraphQLError, PathSegment, ResolveError},
    load::LoadResult,
    merge::AliasNode,
    mount::MountedField,
    query::{self, FragmentDef, QueryField, QuerySelectionSet, VariableDef},
    schema::named_type,
    upstream::Upstream,
};

/// The upstream query for one client occurrence of a mounted field.
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardedQuery {
    pub text: String,
    /// Client variables the forwarded selection uses, as (name in `text`, client name).
    pub client_variables: Vec<(String, String)>,
}

/// `(type, field)` pairs of every mounted field of the unified schema.
pub type MountedKeys = HashSet<(String, String)>;

/// Resolves a mounted field by sending its query through the request's upstream load.
pub struct MountResolver {
    field: Arc<MountedField>,
    upstream: Arc<Upstream>,
    mounted: Arc<MountedKeys>,
}

impl MountResolver {
    /// Selections of fields listed in `mounted` are not forwarded; they have resolvers of
    /// their own.
    pub fn new(field: Arc<MountedField>, upstream: Arc<Upstream>, mounted: Arc<MountedKeys>) -> Self {
        MountResolver {
            field,
            upstream,
            mounted,
        }
    }

    pub fn field(&self) -> &MountedField {
        &self.field
    }

    /// Builds the upstream query text for one client occurrence of the field.
    pub fn upstream_query(&self, field: &QueryField, fragments: &Fragments) -> ForwardedQuery {
        if field.selection_set.items.is_empty() {
            return ForwardedQuery {
                text: self.field.query_for(""),
                client_variables: vec![],
            };
        }

        let mut spreads = VecDeque::new();
        let mut selection_set = field.selection_set.clone();
        self.prepare(
            &mut selection_set,
            named_type(&self.field.definition.field_type),
            &mut spreads,
        );

        let mut seen = HashSet::new();
        let mut referenced = Vec::new();
        while let Some(name) = spreads.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let Some(fragment) = fragments.get(&name) else {
                continue;
            };
            let mut fragment = fragment.clone();
            let TypeCondition::On(on_type) = &mut fragment.type_condition;
            let unified = on_type.clone();
            *on_type = self.upstream.renamer.revert(&unified);
            self.prepare(&mut fragment.selection_set, &unified, &mut spreads);
            referenced.push(fragment);
        }

        let client_variables = self.rename_client_variables(&mut selection_set, &mut referenced);

        let mut text = self
            .field
            .query_for(query::print_selection_set(selection_set).trim_end());
        if !referenced.is_empty() {
            text.push('\n');
            text.push_str(&query::print_fragments(referenced));
        }
        ForwardedQuery {
            text,
            client_variables,
        }
    }

    /// Client variables used by the forwarded selection keep their name unless the template
    /// declares one of the same name; those are renamed to `name_<n>`.
    fn rename_client_variables(
        &self,
        selection_set: &mut QuerySelectionSet,
        fragments: &mut [FragmentDef],
    ) -> Vec<(String, String)> {
        let mut used = BTreeSet::new();
        query::collect_selection_variables(selection_set, &mut used);
        for fragment in fragments.iter() {
            query::collect_fragment_variables(fragment, &mut used);
        }

        let template: HashSet<&str> = self.field.variables.iter().map(String::as_str).collect();
        let mut taken: HashSet<String> = used.iter().cloned().collect();
        let mut renamed = Vec::with_capacity(used.len());
        for name in used {
            if !template.contains(name.as_str()) {
                renamed.push((name.clone(), name));
                continue;
            }
            let target = (1..)
                .map(|n| format!("{}_{}", name, n))
                .find(|candidate| !template.contains(candidate.as_str()) && !taken.contains(candidate))
                .unwrap_or_else(|| format!("{}_", name));
            query::rename_selection_variable(selection_set, &name, &target);
            for fragment in fragments.iter_mut() {
                query::rename_fragment_variable(fragment, &name, &target);
            }
            taken.insert(target.clone());
            renamed.push((target, name));
        }
        renamed
    }

    /// Rewrites a client selection set for the upstream. Type conditions get their upstream
    /// names back, and selections on abstract types gain `__typename` so the concrete type of
    /// every forwarded object is known.
    fn prepare(
        &self,
        selection_set: &mut QuerySelectionSet,
        type_name: &str,
        spreads: &mut VecDeque<String>,
    ) {
        let schema = &self.upstream.schema;
        selection_set.items.retain(|s| match s {
            Selection::Field(f) => !self.mounted.contains(&(type_name.to_string(), f.name.clone())),
            _ => true,
        });
        let has_typename = selection_set
            .items
            .iter()
            .any(|s| matches!(s, Selection::Field(f) if f.name == "__typename" && f.alias.is_none()));
        if (selection_set.items.is_empty() || schema.is_abstract(type_name)) && !has_typename {
            selection_set
                .items
                .push(Selection::Field(query::bare_field("__typename")));
        }

        for selection in &mut selection_set.items {
            match selection {
                Selection::Field(field) => {
                    if field.selection_set.items.is_empty() {
                        continue;
                    }
                    let child = schema
                        .field(type_name, &field.name)
                        .map(|def| named_type(&def.field_type).to_string())
                        .unwrap_or_default();
                    self.prepare(&mut field.selection_set, &child, spreads);
                }
                Selection::InlineFragment(fragment) => {
                    let inner = match &fragment.type_condition {
                        Some(TypeCondition::On(on_type)) => on_type.clone(),
                        None => type_name.to_string(),
                    };
                    self.prepare(&mut fragment.selection_set, &inner, spreads);
                    if let Some(TypeCondition::On(on_type)) = &mut fragment.type_condition {
                        *on_type = self.upstream.renamer.revert(&inner);
                    }
                }
                Selection::FragmentSpread(spread) => spreads.push_back(spread.fragment_name.clone()),
            }
        }
    }

    /// Picks this attachment's value out of the shared load result.
    fn extract(&self, result: &LoadResult, index: usize) -> Result<Value, ResolveError> {
        let missing = |walked: &[String]| ResolveError::MissingField {
            path: walked.join("."),
        };
        let tree = result.aliases.get(index).ok_or_else(|| missing(&[]))?;

        let own: HashSet<&str> = tree.fields.iter().map(|f| f.alias.as_str()).collect();
        let errors: Vec<GraphQLError> = result
            .response
            .errors
            .iter()
            .filter(|e| match e.path.as_ref().and_then(|p| p.first()) {
                Some(PathSegment::Field(top)) => own.contains(top.as_str()),
                _ => true,
            })
            .cloned()
            .collect();
        if !errors.is_empty() {
            warn!(
                endpoint = %self.upstream.id,
                query = %result.query,
                "upstream returned {} error(s) for {}.{}",
                errors.len(),
                self.field.type_name,
                self.field.name()
            );
            return Err(ResolveError::Upstream {
                endpoint: self.upstream.id.clone(),
                query: result.query.clone(),
                errors,
            });
        }

        let mut current = result.response.data.as_ref().unwrap_or(&Value::Null);
        let mut nodes: &[AliasNode] = &tree.fields;
        let mut walked = Vec::with_capacity(self.field.alias_path.len());
        for key in &self.field.alias_path {
            walked.push(key.clone());
            let node = nodes
                .iter()
                .find(|n| &n.response_key == key)
                .ok_or_else(|| missing(&walked))?;
            current = current
                .as_object()
                .and_then(|object| object.get(&node.alias))
                .ok_or_else(|| missing(&walked))?;
            nodes = &node.children;
        }
        Ok(self.restore_keys(current, nodes))
    }

    /// Maps merged aliases back to the client's response keys.
    fn restore_keys(&self, value: &Value, nodes: &[AliasNode]) -> Value {
        match value {
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.restore_keys(item, nodes)).collect())
            }
            Value::Object(object) => {
                let mut restored = Map::new();
                for node in nodes {
                    let Some(value) = object.get(&node.alias) else {
                        continue;
                    };
                    let value = if node.name == "__typename" {
                        self.forward_typename(value)
                    } else {
                        self.restore_keys(value, &node.children)
                    };
                    restored.insert(node.response_key.clone(), value);
                }

                // fields selected through named fragments keep their own keys
                let aliases: HashSet<&str> = nodes.iter().map(|n| n.alias.as_str()).collect();
                for (key, value) in object {
                    if aliases.contains(key.as_str()) || restored.contains_key(key) {
                        continue;
                    }
                    let value = if key == "__typename" {
                        self.forward_typename(value)
                    } else {
                        self.restore_keys(value, &[])
                    };
                    restored.insert(key.clone(), value);
                }
                Value::Object(restored)
            }
            other => other.clone(),
        }
    }

    fn forward_typename(&self, value: &Value) -> Value {
        match value {
            Value::String(name) => Value::String(self.upstream.renamer.rename(name)),
            other => other.clone(),
        }
    }
}

#[async_trait]
impl FieldResolver for MountResolver {
    async fn resolve(&self, request: ResolveRequest<'_>) -> Result<Value, ResolveError> {
        let forwarded = self.upstream_query(request.field, request.fragments);
        let mut document = query::parse(&forwarded.text)
            .map_err(|e| ResolveError::InvalidQuery(format!("invalid upstream query: {}", e)))?;

        let mut variables = request.arguments;
        for (name, client_name) in &forwarded.client_variables {
            let definition = request
                .variable_definitions
                .iter()
                .find(|v| &v.name == client_name)
                .ok_or_else(|| {
                    ResolveError::InvalidQuery(format!(
                        "Variable \"${}\" is not defined by the operation.",
                        client_name
                    ))
                })?;
            query::declare_variable(
                &mut document,
                VariableDef {
                    position: definition.position,
                    name: name.clone(),
                    var_type: self.upstream.renamer.revert_type(&definition.var_type),
                    default_value: definition.default_value.clone(),
                },
            );
            if let Some(value) = request.variables.get(client_name) {
                variables.insert(name.clone(), value.clone());
            }
        }

        let attachment = request.context.loads().attach(
            &self.upstream,
            self.field.operation,
            document,
            variables,
        );
        let result = attachment.outcome().await?;
        self.extract(&result, attachment.index())
    }
}
