//! Helpers over `graphql-parser` executable documents.

use graphql_parser::{
    Pos,
    query::{
        Definition, Directive, Document, Field, FragmentDefinition, Mutation, OperationDefinition,
        ParseError, Query, Selection, SelectionSet, Subscription, Value, VariableDefinition,
        parse_query,
    },
};
use std::collections::BTreeSet;

use crate::schema::OperationKind;

pub type QueryDocument = Document<'static, String>;
pub type QueryField = Field<'static, String>;
pub type QuerySelection = Selection<'static, String>;
pub type QuerySelectionSet = SelectionSet<'static, String>;
pub type QueryValue = Value<'static, String>;
pub type QueryDirective = Directive<'static, String>;
pub type VariableDef = VariableDefinition<'static, String>;
pub type FragmentDef = FragmentDefinition<'static, String>;

pub fn parse(text: &str) -> Result<QueryDocument, ParseError> {
    Ok(parse_query::<String>(text)?.into_static())
}

pub fn zero_pos() -> Pos {
    Pos { line: 0, column: 0 }
}

pub fn selection_set(items: Vec<QuerySelection>) -> QuerySelectionSet {
    SelectionSet {
        span: (zero_pos(), zero_pos()),
        items,
    }
}

/// A field selection with no alias, arguments or sub-selections.
pub fn bare_field(name: &str) -> QueryField {
    Field {
        position: zero_pos(),
        alias: None,
        name: name.to_string(),
        arguments: vec![],
        directives: vec![],
        selection_set: selection_set(vec![]),
    }
}

pub fn response_key(field: &QueryField) -> &str {
    field.alias.as_deref().unwrap_or(&field.name)
}

/// An operation with its kind pulled out of the `OperationDefinition` variants.
#[derive(Clone, Debug)]
pub struct Operation {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub variables: Vec<VariableDef>,
    pub directives: Vec<QueryDirective>,
    pub selection_set: QuerySelectionSet,
}

impl Operation {
    pub fn from_definition(definition: OperationDefinition<'static, String>) -> Self {
        match definition {
            OperationDefinition::SelectionSet(selection_set) => Operation {
                kind: OperationKind::Query,
                name: None,
                variables: vec![],
                directives: vec![],
                selection_set,
            },
            OperationDefinition::Query(q) => Operation {
                kind: OperationKind::Query,
                name: q.name,
                variables: q.variable_definitions,
                directives: q.directives,
                selection_set: q.selection_set,
            },
            OperationDefinition::Mutation(m) => Operation {
                kind: OperationKind::Mutation,
                name: m.name,
                variables: m.variable_definitions,
                directives: m.directives,
                selection_set: m.selection_set,
            },
            OperationDefinition::Subscription(s) => Operation {
                kind: OperationKind::Subscription,
                name: s.name,
                variables: s.variable_definitions,
                directives: s.directives,
                selection_set: s.selection_set,
            },
        }
    }

    pub fn into_definition(self) -> OperationDefinition<'static, String> {
        match self.kind {
            OperationKind::Query => OperationDefinition::Query(Query {
                position: zero_pos(),
                name: self.name,
                variable_definitions: self.variables,
                directives: self.directives,
                selection_set: self.selection_set,
            }),
            OperationKind::Mutation => OperationDefinition::Mutation(Mutation {
                position: zero_pos(),
                name: self.name,
                variable_definitions: self.variables,
                directives: self.directives,
                selection_set: self.selection_set,
            }),
            OperationKind::Subscription => OperationDefinition::Subscription(Subscription {
                position: zero_pos(),
                name: self.name,
                variable_definitions: self.variables,
                directives: self.directives,
                selection_set: self.selection_set,
            }),
        }
    }
}

pub fn split_document(document: QueryDocument) -> (Vec<Operation>, Vec<FragmentDef>) {
    let mut operations = Vec::new();
    let mut fragments = Vec::new();
    for definition in document.definitions {
        match definition {
            Definition::Operation(operation) => operations.push(Operation::from_definition(operation)),
            Definition::Fragment(fragment) => fragments.push(fragment),
        }
    }
    (operations, fragments)
}

pub fn join_document(operations: Vec<Operation>, fragments: Vec<FragmentDef>) -> QueryDocument {
    let mut definitions: Vec<Definition<'static, String>> = operations
        .into_iter()
        .map(|operation| Definition::Operation(operation.into_definition()))
        .collect();
    definitions.extend(fragments.into_iter().map(Definition::Fragment));
    Document { definitions }
}

/// Prints a bare selection set, braces included.
pub fn print_selection_set(selection_set: QuerySelectionSet) -> String {
    Document {
        definitions: vec![Definition::Operation(OperationDefinition::SelectionSet(
            selection_set,
        ))],
    }
    .to_string()
}

pub fn print_fragments(fragments: Vec<FragmentDef>) -> String {
    Document {
        definitions: fragments.into_iter().map(Definition::Fragment).collect(),
    }
    .to_string()
}

/// Deterministic text for a value, used to compare argument lists.
pub fn write_value(out: &mut String, value: &QueryValue) {
    match value {
        Value::Variable(name) => {
            out.push('$');
            out.push_str(name);
        }
        Value::Int(number) => {
            if let Some(n) = number.as_i64() {
                out.push_str(&n.to_string());
            }
        }
        Value::Float(f) => out.push_str(&f.to_string()),
        Value::String(s) => out.push_str(&serde_json::Value::String(s.clone()).to_string()),
        Value::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
        Value::Enum(name) => out.push_str(name),
        Value::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(fields) => {
            out.push('{');
            for (i, (name, item)) in fields.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(name);
                out.push_str(": ");
                write_value(out, item);
            }
            out.push('}');
        }
    }
}

pub fn write_arguments(out: &mut String, arguments: &[(String, QueryValue)]) {
    if arguments.is_empty() {
        return;
    }
    out.push('(');
    for (i, (name, value)) in arguments.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(name);
        out.push_str(": ");
        write_value(out, value);
    }
    out.push(')');
}

/// Collects the names of every variable referenced by `value`, looking through lists and
/// object literals.
pub fn collect_variables(value: &QueryValue, used: &mut BTreeSet<String>) {
    match value {
        Value::Variable(name) => {
            used.insert(name.clone());
        }
        Value::List(items) => {
            for item in items {
                collect_variables(item, used);
            }
        }
        Value::Object(fields) => {
            for item in fields.values() {
                collect_variables(item, used);
            }
        }
        _ => {}
    }
}

fn collect_directive_variables(directives: &[QueryDirective], used: &mut BTreeSet<String>) {
    for directive in directives {
        for (_, value) in &directive.arguments {
            collect_variables(value, used);
        }
    }
}

/// Collects the variables referenced by arguments and directives anywhere in `selection_set`.
pub fn collect_selection_variables(selection_set: &QuerySelectionSet, used: &mut BTreeSet<String>) {
    for selection in &selection_set.items {
        match selection {
            Selection::Field(field) => {
                for (_, value) in &field.arguments {
                    collect_variables(value, used);
                }
                collect_directive_variables(&field.directives, used);
                collect_selection_variables(&field.selection_set, used);
            }
            Selection::InlineFragment(fragment) => {
                collect_directive_variables(&fragment.directives, used);
                collect_selection_variables(&fragment.selection_set, used);
            }
            Selection::FragmentSpread(spread) => collect_directive_variables(&spread.directives, used),
        }
    }
}

/// Same as [`collect_selection_variables`] for a fragment definition.
pub fn collect_fragment_variables(fragment: &FragmentDef, used: &mut BTreeSet<String>) {
    collect_directive_variables(&fragment.directives, used);
    collect_selection_variables(&fragment.selection_set, used);
}

fn rename_in_value(value: &mut QueryValue, from: &str, to: &str) {
    match value {
        Value::Variable(name) if name == from => *name = to.to_string(),
        Value::List(items) => {
            for item in items {
                rename_in_value(item, from, to);
            }
        }
        Value::Object(fields) => {
            for item in fields.values_mut() {
                rename_in_value(item, from, to);
            }
        }
        _ => {}
    }
}

fn rename_in_directives(directives: &mut [QueryDirective], from: &str, to: &str) {
    for directive in directives {
        for (_, value) in &mut directive.arguments {
            rename_in_value(value, from, to);
        }
    }
}

fn rename_in_selection_set(selection_set: &mut QuerySelectionSet, from: &str, to: &str) {
    for selection in &mut selection_set.items {
        match selection {
            Selection::Field(field) => {
                for (_, value) in &mut field.arguments {
                    rename_in_value(value, from, to);
                }
                rename_in_directives(&mut field.directives, from, to);
                rename_in_selection_set(&mut field.selection_set, from, to);
            }
            Selection::InlineFragment(fragment) => {
                rename_in_directives(&mut fragment.directives, from, to);
                rename_in_selection_set(&mut fragment.selection_set, from, to);
            }
            Selection::FragmentSpread(spread) => {
                rename_in_directives(&mut spread.directives, from, to);
            }
        }
    }
}

/// Renames variable `$from` to `$to` in a selection set that is not yet part of a document.
pub fn rename_selection_variable(selection_set: &mut QuerySelectionSet, from: &str, to: &str) {
    rename_in_selection_set(selection_set, from, to);
}

pub fn rename_fragment_variable(fragment: &mut FragmentDef, from: &str, to: &str) {
    rename_in_directives(&mut fragment.directives, from, to);
    rename_in_selection_set(&mut fragment.selection_set, from, to);
}

/// Adds `variable` to the first operation of the document unless it declares one of that
/// name already.
pub fn declare_variable(document: &mut QueryDocument, variable: VariableDef) {
    for definition in &mut document.definitions {
        if let Definition::Operation(OperationDefinition::SelectionSet(selection_set)) = definition {
            let selection_set = std::mem::replace(selection_set, self::selection_set(vec![]));
            *definition = Definition::Operation(OperationDefinition::Query(Query {
                position: zero_pos(),
                name: None,
                variable_definitions: vec![],
                directives: vec![],
                selection_set,
            }));
        }
        let declared = match definition {
            Definition::Operation(OperationDefinition::Query(q)) => &mut q.variable_definitions,
            Definition::Operation(OperationDefinition::Mutation(m)) => &mut m.variable_definitions,
            Definition::Operation(OperationDefinition::Subscription(s)) => &mut s.variable_definitions,
            _ => continue,
        };
        if !declared.iter().any(|v| v.name == variable.name) {
            declared.push(variable);
        }
        return;
    }
}

/// Renames variable `$from` to `$to` everywhere in the document, definitions included.
pub fn rename_variable(document: &mut QueryDocument, from: &str, to: &str) {
    for definition in &mut document.definitions {
        match definition {
            Definition::Operation(operation) => {
                let (variables, directives, selection_set) = match operation {
                    OperationDefinition::SelectionSet(selection_set) => {
                        rename_in_selection_set(selection_set, from, to);
                        continue;
                    }
                    OperationDefinition::Query(q) => {
                        (&mut q.variable_definitions, &mut q.directives, &mut q.selection_set)
                    }
                    OperationDefinition::Mutation(m) => {
                        (&mut m.variable_definitions, &mut m.directives, &mut m.selection_set)
                    }
                    OperationDefinition::Subscription(s) => {
                        (&mut s.variable_definitions, &mut s.directives, &mut s.selection_set)
                    }
                };
                for variable in variables.iter_mut().filter(|v| v.name == from) {
                    variable.name = to.to_string();
                }
                rename_in_directives(directives, from, to);
                rename_in_selection_set(selection_set, from, to);
            }
            Definition::Fragment(fragment) => {
                rename_in_directives(&mut fragment.directives, from, to);
                rename_in_selection_set(&mut fragment.selection_set, from, to);
            }
        }
    }
}

/// The variable definitions of the document's operations.
pub fn variable_definitions(document: &QueryDocument) -> Vec<&VariableDef> {
    document
        .definitions
        .iter()
        .filter_map(|definition| match definition {
            Definition::Operation(OperationDefinition::Query(q)) => Some(&q.variable_definitions),
            Definition::Operation(OperationDefinition::Mutation(m)) => Some(&m.variable_definitions),
            Definition::Operation(OperationDefinition::Subscription(s)) => {
                Some(&s.variable_definitions)
            }
            _ => None,
        })
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn argument_text_is_stable() {
        let document = parse(r#"{ a(x: 1, y: "two", z: [ONE, $v], w: {b: true, a: null}) }"#).unwrap();
        let (operations, _) = split_document(document);
        let Selection::Field(field) = &operations[0].selection_set.items[0] else {
            panic!("expected a field");
        };

        let mut out = String::new();
        write_arguments(&mut out, &field.arguments);

        assert_eq!(out, r#"(x: 1, y: "two", z: [ONE, $v], w: {a: null, b: true})"#);
    }

    #[test]
    fn collects_variables_nested_in_literals() {
        let document = parse("query($a: Int, $b: Int) { f(x: {y: [$a]}, z: $b, w: 3) }").unwrap();
        let (operations, _) = split_document(document);
        let Selection::Field(field) = &operations[0].selection_set.items[0] else {
            panic!("expected a field");
        };

        let mut used = BTreeSet::new();
        for (_, value) in &field.arguments {
            collect_variables(value, &mut used);
        }

        assert_eq!(used.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn renames_variables_in_definitions_arguments_and_fragments() {
        let mut document = parse(
            "query($id: ID!) { user(id: $id) @include(if: $id) { ...F } } fragment F on User { friends(of: $id) { name } }",
        )
        .unwrap();

        rename_variable(&mut document, "id", "id_1");

        let printed = document.to_string();
        assert!(!printed.contains("$id "));
        assert!(!printed.contains("$id)"));
        assert!(printed.contains("$id_1: ID!"));
        assert!(printed.contains("user(id: $id_1)"));
        assert!(printed.contains("friends(of: $id_1)"));
        assert_eq!(variable_definitions(&document)[0].name, "id_1");
    }

    #[test]
    fn finds_variables_in_selections_and_declares_new_ones() {
        let document = parse(
            "query($n: Boolean!, $after: Int) { a { b(x: [$after]) @include(if: $n) ... on T @skip(if: $s) { c } } }",
        )
        .unwrap();
        let (operations, _) = split_document(document);

        let mut used = BTreeSet::new();
        collect_selection_variables(&operations[0].selection_set, &mut used);
        assert_eq!(used.into_iter().collect::<Vec<_>>(), vec!["after", "n", "s"]);

        let mut document = parse("query($id: ID!) { user(id: $id) { name } }").unwrap();
        let extra = parse("query($n: Boolean!, $id: Int) { a }").unwrap();
        for variable in variable_definitions(&extra).into_iter().cloned() {
            declare_variable(&mut document, variable);
        }
        let names: Vec<&str> = variable_definitions(&document)
            .into_iter()
            .map(|v| v.name.as_str())
            .collect();
        assert_eq!(names, vec!["id", "n"]);

        let mut anonymous = parse("{ a(x: $n) }").unwrap();
        for variable in variable_definitions(&extra).into_iter().take(1).cloned() {
            declare_variable(&mut anonymous, variable);
        }
        let names: Vec<&str> = variable_definitions(&anonymous)
            .into_iter()
            .map(|v| v.name.as_str())
            .collect();
        assert_eq!(names, vec!["n"]);
    }

    #[test]
    fn operations_survive_a_split_and_join() {
        let document = parse("mutation Save($x: Int) { save(x: $x) { id } } fragment F on T { a }").unwrap();
        let (operations, fragments) = split_document(document);

        assert_eq!(operations[0].kind, OperationKind::Mutation);
        assert_eq!(operations[0].name.as_deref(), Some("Save"));
        assert_eq!(fragments.len(), 1);

        let joined = join_document(operations, fragments).to_string();
        let reparsed = parse(&joined).unwrap();
        assert_eq!(reparsed.definitions.len(), 2);
    }
}
