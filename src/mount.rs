use graphql_parser::{
    query::{Selection, Value},
    schema::{InputValue, Type},
};
use std::collections::BTreeSet;
use tracing::debug;

use crate::{
    error::GatewayError,
    query::{self, FragmentDef, Operation, QuerySelectionSet, QueryValue, VariableDef},
    schema::{FieldDef, InputValueDef, OperationKind, TypeDef, TypeRef, named_type},
    upstream::Upstream,
};

/// Marks the selection point while the template is printed; never sent upstream.
const PLACEHOLDER: &str = "__gatekeep_selection__";

/// An upstream field exposed on a unified type.
#[derive(Clone, Debug)]
pub struct MountedField {
    /// The unified type the field is installed on.
    pub type_name: String,
    pub definition: FieldDef,
    pub endpoint: String,
    pub operation: OperationKind,
    /// Template text up to the point where the client's selection set is inserted.
    pub query_head: String,
    /// Template text after the client's selection set, fragment definitions included.
    pub query_tail: String,
    /// The (renamed) upstream type reached by each step of the template's path.
    pub result_types: Vec<String>,
    /// Response keys to follow from the root of the upstream response to the mounted value.
    pub alias_path: Vec<String>,
    /// Variables the template declares.
    pub variables: Vec<String>,
    /// Upstream types the unified schema needs for this field to be well formed.
    pub required_types: Vec<TypeDef>,
}

impl MountedField {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// The upstream query for a client selection; `selection` is a printed selection set or
    /// empty for leaf fields.
    pub fn query_for(&self, selection: &str) -> String {
        if selection.is_empty() {
            format!("{}{}", self.query_head, self.query_tail)
        } else {
            format!("{} {}{}", self.query_head, selection, self.query_tail)
        }
    }
}

struct Template {
    operation: Operation,
    fragments: Vec<FragmentDef>,
}

struct Step {
    name: String,
    response_key: String,
    arguments: Vec<(String, QueryValue)>,
    definition: FieldDef,
}

/// Mounts the upstream field selected by `template` as `type_name.field_name`.
///
/// An empty `field_name` mounts every field of the type the template's path ends on.
pub fn mount(
    type_name: &str,
    field_name: &str,
    description: Option<&str>,
    upstream: &Upstream,
    template: &str,
) -> Result<Vec<MountedField>, GatewayError> {
    let document = query::parse(&fill_empty_selection(template))
        .map_err(|e| GatewayError::TemplateParse(e.to_string()))?;
    let (mut operations, fragments) = query::split_document(document);
    for operation in &mut operations {
        drop_placeholder(&mut operation.selection_set);
    }
    if operations.len() != 1 {
        return Err(GatewayError::InvalidTemplate(format!(
            "query document must contain exactly one operation, found {}",
            operations.len()
        )));
    }
    let template = Template {
        operation: operations.remove(0),
        fragments,
    };
    mount_template(type_name, field_name, description, upstream, template)
}

/// `query {}` selects nothing, which the parser rejects. A trailing empty selection set is
/// filled with the placeholder so the template parses.
fn fill_empty_selection(template: &str) -> String {
    let trimmed = template.trim_end();
    let open = trimmed.trim_end_matches(|c: char| c == '}' || c.is_whitespace());
    if !open.ends_with('{') || open.len() == trimmed.len() {
        return template.to_string();
    }
    format!("{} {} {}", open, PLACEHOLDER, &trimmed[open.len()..])
}

fn drop_placeholder(selection_set: &mut QuerySelectionSet) {
    selection_set
        .items
        .retain(|s| !matches!(s, Selection::Field(f) if f.name == PLACEHOLDER));
    for selection in &mut selection_set.items {
        if let Selection::Field(field) = selection {
            drop_placeholder(&mut field.selection_set);
        }
    }
}

fn walk(upstream: &Upstream, operation: &Operation) -> Result<(String, Vec<Step>), GatewayError> {
    if operation.kind == OperationKind::Subscription {
        return Err(GatewayError::InvalidTemplate(
            "subscriptions cannot be mounted".to_string(),
        ));
    }
    let root = upstream
        .schema
        .root_type(operation.kind)
        .ok_or_else(|| {
            GatewayError::InvalidTemplate(format!(
                "endpoint `{}` does not support {} operations",
                upstream.id, operation.kind
            ))
        })?
        .to_string();

    let mut steps = Vec::new();
    let mut on_type = root.clone();
    let mut selections = &operation.selection_set.items;

    while let Some(selection) = selections.first() {
        if selections.len() > 1 {
            return Err(GatewayError::InvalidTemplate(format!(
                "only one field may be selected on `{}`",
                on_type
            )));
        }
        let Selection::Field(field) = selection else {
            return Err(GatewayError::InvalidTemplate(
                "fragments cannot be used on the mount path".to_string(),
            ));
        };

        let definition = upstream.schema.field(&on_type, &field.name).ok_or_else(|| {
            GatewayError::UnknownField {
                type_name: on_type.clone(),
                field: field.name.clone(),
            }
        })?;
        for (argument, _) in &field.arguments {
            if !definition.arguments.iter().any(|a| &a.name == argument) {
                return Err(GatewayError::InvalidTemplate(format!(
                    "unknown argument `{}` on field `{}.{}`",
                    argument, on_type, field.name
                )));
            }
        }

        let result_type = named_type(&definition.field_type).to_string();
        if !field.selection_set.items.is_empty() && upstream.schema.fields(&result_type).is_none() {
            return Err(GatewayError::NotAnObjectType {
                field: field.name.clone(),
                type_name: result_type,
            });
        }

        steps.push(Step {
            name: field.name.clone(),
            response_key: query::response_key(field).to_string(),
            arguments: field.arguments.clone(),
            definition: definition.clone(),
        });
        on_type = result_type;
        selections = &field.selection_set.items;
    }
    Ok((root, steps))
}

/// The selection set `depth` fields down the template's path.
fn placeholder_set(selection_set: &mut QuerySelectionSet, depth: usize) -> Option<&mut QuerySelectionSet> {
    if depth == 0 {
        return Some(selection_set);
    }
    match selection_set.items.first_mut()? {
        Selection::Field(field) => placeholder_set(&mut field.selection_set, depth - 1),
        _ => None,
    }
}

fn deepest_field(
    selection_set: &mut QuerySelectionSet,
    depth: usize,
) -> Option<&mut query::QueryField> {
    match selection_set.items.first_mut()? {
        Selection::Field(field) => {
            if depth <= 1 {
                Some(field)
            } else {
                deepest_field(&mut field.selection_set, depth - 1)
            }
        }
        _ => None,
    }
}

fn input_value(
    name: &str,
    value_type: TypeRef,
    default_value: Option<QueryValue>,
    description: Option<String>,
) -> InputValueDef {
    InputValue {
        position: query::zero_pos(),
        description,
        name: name.to_string(),
        value_type,
        default_value,
        directives: vec![],
    }
}

fn variable_definition(name: &str, var_type: TypeRef) -> VariableDef {
    VariableDef {
        position: query::zero_pos(),
        name: name.to_string(),
        var_type,
        default_value: None,
    }
}

fn uses_variable_directly<'s>(steps: &'s [Step], variable: &str) -> Option<&'s InputValueDef> {
    steps.iter().find_map(|step| {
        let (argument, _) = step
            .arguments
            .iter()
            .find(|(_, value)| matches!(value, Value::Variable(v) if v == variable))?;
        step.definition.arguments.iter().find(|a| &a.name == argument)
    })
}

/// Splits printed template text around the placeholder field.
fn split_at_placeholder(text: &str) -> Option<(String, String)> {
    let at = text.find(PLACEHOLDER)?;
    let open = text[..at].rfind('{')?;
    let after = at + PLACEHOLDER.len();
    let close = after + text[after..].find('}')?;
    Some((
        text[..open].trim_end().to_string(),
        text[close + 1..].to_string(),
    ))
}

fn mount_template(
    type_name: &str,
    field_name: &str,
    description: Option<&str>,
    upstream: &Upstream,
    template: Template,
) -> Result<Vec<MountedField>, GatewayError> {
    let (root, steps) = walk(upstream, &template.operation)?;
    let final_type: TypeRef = steps
        .last()
        .map(|step| step.definition.field_type.clone())
        .unwrap_or_else(|| Type::NamedType(root.clone()));
    let final_name = named_type(&final_type).to_string();

    if field_name.is_empty() {
        let fields = upstream.schema.fields(&final_name).ok_or_else(|| {
            GatewayError::NotAnObjectType {
                field: steps.last().map(|s| s.name.clone()).unwrap_or(root.clone()),
                type_name: final_name.clone(),
            }
        })?;

        let mut mounted = Vec::with_capacity(fields.len());
        for field in fields {
            let mut operation = template.operation.clone();
            let set = placeholder_set(&mut operation.selection_set, steps.len()).ok_or_else(|| {
                GatewayError::InvalidTemplate("could not locate the selection point".to_string())
            })?;
            set.items = vec![Selection::Field(query::bare_field(&field.name))];

            let derived = Template {
                operation,
                fragments: template.fragments.clone(),
            };
            mounted.extend(mount_template(
                type_name,
                &field.name,
                field.description.as_deref(),
                upstream,
                derived,
            )?);
        }
        return Ok(mounted);
    }

    let Template {
        mut operation,
        fragments,
    } = template;
    let mut exposed: Vec<InputValueDef> = Vec::new();

    let mut used = BTreeSet::new();
    for step in &steps {
        for (_, value) in &step.arguments {
            query::collect_variables(value, &mut used);
        }
    }
    for variable in &used {
        if let Some(declared) = operation.variables.iter().find(|v| &v.name == variable) {
            exposed.push(input_value(
                variable,
                upstream.renamer.rename_type(&declared.var_type),
                declared.default_value.clone(),
                None,
            ));
            continue;
        }
        let argument = uses_variable_directly(&steps, variable)
            .ok_or_else(|| GatewayError::UndeclaredVariable(variable.clone()))?;
        operation.variables.push(variable_definition(
            variable,
            upstream.renamer.revert_type(&argument.value_type),
        ));
        exposed.push(input_value(
            variable,
            argument.value_type.clone(),
            None,
            argument.description.clone(),
        ));
    }

    if let Some(deepest) = steps.last() {
        let unbound: Vec<InputValueDef> = deepest
            .definition
            .arguments
            .iter()
            .filter(|a| !used.contains(&a.name))
            .filter(|a| !deepest.arguments.iter().any(|(name, _)| name == &a.name))
            .cloned()
            .collect();

        if !unbound.is_empty() {
            let field = deepest_field(&mut operation.selection_set, steps.len()).ok_or_else(|| {
                GatewayError::InvalidTemplate("could not locate the mounted field".to_string())
            })?;
            for argument in &unbound {
                field
                    .arguments
                    .push((argument.name.clone(), Value::Variable(argument.name.clone())));
            }
            for argument in &unbound {
                if !operation.variables.iter().any(|v| v.name == argument.name) {
                    operation.variables.push(variable_definition(
                        &argument.name,
                        upstream.renamer.revert_type(&argument.value_type),
                    ));
                }
            }
            exposed.extend(unbound);
        }
    }
    exposed.sort_by(|a, b| a.name.cmp(&b.name));

    let mut printed = operation.clone();
    let set = placeholder_set(&mut printed.selection_set, steps.len()).ok_or_else(|| {
        GatewayError::InvalidTemplate("could not locate the selection point".to_string())
    })?;
    set.items = vec![Selection::Field(query::bare_field(PLACEHOLDER))];
    let text = query::join_document(vec![printed], fragments).to_string();
    let (query_head, query_tail) = split_at_placeholder(&text).ok_or_else(|| {
        GatewayError::InvalidTemplate("could not locate the selection point".to_string())
    })?;

    let roots: Vec<&str> = std::iter::once(final_name.as_str())
        .chain(exposed.iter().map(|a| named_type(&a.value_type)))
        .collect();
    let required_types = upstream.schema.reachable_types(roots)?;

    let definition = FieldDef {
        position: query::zero_pos(),
        description: description.filter(|d| !d.is_empty()).map(str::to_string),
        name: field_name.to_string(),
        arguments: exposed,
        field_type: final_type,
        directives: vec![],
    };

    debug!(
        type_name,
        field = field_name,
        endpoint = %upstream.id,
        "mounted upstream field"
    );

    Ok(vec![MountedField {
        type_name: type_name.to_string(),
        definition,
        endpoint: upstream.id.clone(),
        operation: operation.kind,
        query_head,
        query_tail,
        result_types: steps
            .iter()
            .map(|s| named_type(&s.definition.field_type).to_string())
            .collect(),
        alias_path: steps.iter().map(|s| s.response_key.clone()).collect(),
        variables: operation.variables.iter().map(|v| v.name.clone()).collect(),
        required_types,
    }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::EndpointInfo,
        schema::{SchemaIndex, type_def_name, type_to_string},
        upstream::{TransportError, UpstreamClient, UpstreamRequest, UpstreamResponse},
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    struct Offline;

    #[async_trait]
    impl UpstreamClient for Offline {
        async fn execute(&self, _: UpstreamRequest) -> Result<UpstreamResponse, TransportError> {
            Err(TransportError("offline".to_string()))
        }
    }

    fn upstream(sdl: &str, prefix: &str) -> Upstream {
        let info = EndpointInfo {
            url: "http://upstream.local/graphql".to_string(),
            prefix: prefix.to_string(),
            ..Default::default()
        };
        Upstream::new("up", info, Arc::new(Offline), SchemaIndex::parse(sdl).unwrap())
    }

    fn argument_names(field: &MountedField) -> Vec<String> {
        field
            .definition
            .arguments
            .iter()
            .map(|a| a.name.clone())
            .collect()
    }

    const USERS: &str = "type Query { user(id: ID!): User } type User { name: String email: String }";

    #[test]
    fn mounts_a_leaf_through_a_variable() {
        let up = upstream(USERS, "");
        let mounted = mount("Query", "userName", Some("a name"), &up, "query { user(id: $id) { name } }")
            .unwrap();

        assert_eq!(mounted.len(), 1);
        let field = &mounted[0];
        assert_eq!(field.name(), "userName");
        assert_eq!(field.definition.description.as_deref(), Some("a name"));
        assert_eq!(type_to_string(&field.definition.field_type), "String");
        assert_eq!(argument_names(field), vec!["id"]);
        assert_eq!(type_to_string(&field.definition.arguments[0].value_type), "ID!");
        assert_eq!(field.alias_path, vec!["user", "name"]);
        assert_eq!(field.result_types, vec!["User", "String"]);
        assert_eq!(field.operation, OperationKind::Query);

        assert!(field.query_head.ends_with("name"));
        assert!(field.query_head.contains("user(id: $id)"));
        assert!(field.query_head.contains("$id: ID!"));
        assert_eq!(field.query_tail.trim().replace(char::is_whitespace, ""), "}}");

        let text = field.query_for("");
        assert!(query::parse(&text).is_ok());
    }

    #[test]
    fn client_selections_are_inserted_between_head_and_tail() {
        let up = upstream(USERS, "");
        let mounted = mount("Query", "user", None, &up, "query { user(id: $id) }").unwrap();
        let field = &mounted[0];

        assert_eq!(field.alias_path, vec!["user"]);
        let text = field.query_for("{ name }");
        let document = query::parse(&text).unwrap();
        let (operations, _) = query::split_document(document);
        let Selection::Field(user) = &operations[0].selection_set.items[0] else {
            panic!("expected a field");
        };
        assert_eq!(user.name, "user");
        assert_eq!(user.selection_set.items.len(), 1);
    }

    #[test]
    fn only_variables_and_unbound_arguments_are_exposed() {
        let up = upstream(
            "type Query { search(a: Int, b: String, c: Boolean): [Hit] } type Hit { x: Int }",
            "",
        );

        let mounted = mount("Query", "search", None, &up, "query($x: String) { search(a: 1, b: $x) }")
            .unwrap();

        let field = &mounted[0];
        assert_eq!(argument_names(field), vec!["c", "x"]);
        assert_eq!(type_to_string(&field.definition.arguments[1].value_type), "String");
        assert!(field.query_head.contains("c: $c"));
        assert_eq!(field.variables, vec!["x", "c"]);
        assert!(field.query_head.contains("$c: Boolean"));
        assert_eq!(type_to_string(&field.definition.field_type), "[Hit]");
    }

    #[test]
    fn literal_arguments_stay_hidden() {
        let up = upstream("type Query { search(a: Int, b: String): [Hit] } type Hit { x: Int }", "");

        let mounted = mount("Query", "search", None, &up, "query($x: String) { search(a: 1, b: $x) }")
            .unwrap();

        assert_eq!(argument_names(&mounted[0]), vec!["x"]);
    }

    #[test]
    fn wildcard_mounts_every_field_of_the_walked_type() {
        let up = upstream(
            "type Query { point(id: ID!): Point } type Point { x: Int y: Int z: Int }",
            "",
        );

        let mounted = mount("Query", "", None, &up, "query { point(id: $id) }").unwrap();

        let names: Vec<&str> = mounted.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["x", "y", "z"]);
        for field in &mounted {
            assert_eq!(field.alias_path, vec!["point".to_string(), field.name().to_string()]);
            assert_eq!(argument_names(field), vec!["id"]);
        }
    }

    #[test]
    fn empty_templates_mount_every_root_field() {
        let up = upstream(
            "type Query { user(id: ID!): User users: [User!]! } type User { name: String }",
            "",
        );

        let mounted = mount("Query", "", None, &up, "query {}").unwrap();

        let names: Vec<&str> = mounted.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["user", "users"]);
        assert_eq!(mounted[0].alias_path, vec!["user"]);
        assert_eq!(argument_names(&mounted[0]), vec!["id"]);
        assert!(!mounted[0].query_head.contains(PLACEHOLDER));
        assert!(query::parse(&mounted[1].query_for("{ name }")).is_ok());

        let nested = mount("Query", "", None, &up, "query { user(id: $id) { } }").unwrap();
        let names: Vec<&str> = nested.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["name"]);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let up = upstream(USERS, "");
        let err = mount("Query", "nope", None, &up, "query { user(id: $id) { nope } }").unwrap_err();

        assert!(
            matches!(err, GatewayError::UnknownField { type_name, field } if type_name == "User" && field == "nope")
        );
    }

    #[test]
    fn selections_below_scalars_are_rejected() {
        let up = upstream(USERS, "");
        let err = mount("Query", "first", None, &up, "query { user(id: $id) { name { first } } }")
            .unwrap_err();

        assert!(matches!(err, GatewayError::NotAnObjectType { field, .. } if field == "name"));
    }

    #[test]
    fn templates_need_exactly_one_operation() {
        let up = upstream(USERS, "");
        let err = mount(
            "Query",
            "a",
            None,
            &up,
            "query A { user(id: $id) { name } } query B { user(id: $id) { email } }",
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidTemplate(_)));

        let err = mount("Query", "a", None, &up, "query { user(id: ").unwrap_err();
        assert!(matches!(err, GatewayError::TemplateParse(_)));
    }

    #[test]
    fn undeclared_variables_inside_literals_are_rejected() {
        let sdl = "type Query { find(filter: Filter): User } input Filter { id: ID } type User { name: String }";
        let up = upstream(sdl, "");

        let err = mount("Query", "find", None, &up, "query { find(filter: {id: $id}) }").unwrap_err();
        assert!(matches!(err, GatewayError::UndeclaredVariable(name) if name == "id"));

        let mounted =
            mount("Query", "find", None, &up, "query($id: ID) { find(filter: {id: $id}) }").unwrap();
        assert_eq!(argument_names(&mounted[0]), vec!["id"]);
        assert_eq!(type_to_string(&mounted[0].definition.arguments[0].value_type), "ID");
    }

    #[test]
    fn prefixed_upstreams_mount_renamed_types_and_send_original_names() {
        let up = upstream(
            "scalar Cursor type Query { page(after: Cursor): Page } type Page { size: Int next: Cursor }",
            "Up",
        );

        let mounted = mount("Query", "page", None, &up, "query { page }").unwrap();
        let field = &mounted[0];

        assert_eq!(type_to_string(&field.definition.field_type), "UpPage");
        assert_eq!(type_to_string(&field.definition.arguments[0].value_type), "UpCursor");
        assert!(field.query_head.contains("$after: Cursor"));

        let required: BTreeSet<&str> = field.required_types.iter().map(type_def_name).collect();
        assert_eq!(required, ["UpCursor", "UpPage"].into_iter().collect());
    }

    #[test]
    fn mutations_are_mounted_on_the_mutation_root() {
        let up = upstream(
            "type Query { a: Int } type Mutation { rename(id: ID!, name: String!): User } type User { name: String }",
            "",
        );

        let mounted = mount("Mutation", "rename", None, &up, "mutation { rename }").unwrap();

        assert_eq!(mounted[0].operation, OperationKind::Mutation);
        assert_eq!(argument_names(&mounted[0]), vec!["id", "name"]);
        assert!(mounted[0].query_head.starts_with("mutation"));
    }
}
