//! Combines the upstream queries of many mounted fields into one query per operation kind.
//!
//! Every kept field is given a fresh alias (`f0`, `f1`, ...) so identical selections collapse
//! onto one entry and different ones can never collide. The alias each input field ended up
//! with is reported back as an [`AliasTree`] per input document, which is what lets the
//! bridge pick its own part out of the shared response.

use graphql_parser::query::{FragmentSpread, InlineFragment, Selection, TypeCondition};
use std::collections::{HashMap, HashSet};

use crate::{
    query::{self, FragmentDef, Operation, QueryDocument, QueryField},
    schema::OperationKind,
};

/// The alias assigned to one field of an input document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AliasNode {
    pub name: String,
    /// The key the field had in its own document (its alias, or its name).
    pub response_key: String,
    /// The key the field has in the merged document.
    pub alias: String,
    pub children: Vec<AliasNode>,
}

/// Fields selected inside inline fragments are listed with the fields of the enclosing
/// selection set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AliasTree {
    pub fields: Vec<AliasNode>,
}

impl AliasTree {
    pub fn field(&self, response_key: &str) -> Option<&AliasNode> {
        self.fields.iter().find(|f| f.response_key == response_key)
    }
}

impl AliasNode {
    pub fn child(&self, response_key: &str) -> Option<&AliasNode> {
        self.children.iter().find(|f| f.response_key == response_key)
    }
}

#[derive(Clone, Debug)]
pub struct MergedDocument {
    pub kind: OperationKind,
    pub document: QueryDocument,
}

#[derive(Clone, Debug)]
pub struct Merged {
    /// One document per operation kind, in order of first appearance.
    pub documents: Vec<MergedDocument>,
    /// One tree per input document, in input order.
    pub aliases: Vec<AliasTree>,
}

struct Shape {
    name: String,
    response_key: String,
    alias: String,
    children: Vec<usize>,
}

enum Node {
    Field {
        field: QueryField,
        targets: Vec<usize>,
        children: Vec<Node>,
    },
    Inline {
        fragment: InlineFragment<'static, String>,
        children: Vec<Node>,
    },
    Spread(FragmentSpread<'static, String>),
}

impl Node {
    fn key(&self) -> String {
        match self {
            Node::Field { field, .. } => {
                let mut key = field.name.clone();
                query::write_arguments(&mut key, &field.arguments);
                key
            }
            Node::Inline { fragment, .. } => match &fragment.type_condition {
                Some(TypeCondition::On(name)) => format!("... on {}", name),
                None => "...".to_string(),
            },
            Node::Spread(spread) => format!("...{}", spread.fragment_name),
        }
    }

    fn absorb(&mut self, other: Node) {
        match (self, other) {
            (
                Node::Field {
                    targets, children, ..
                },
                Node::Field {
                    targets: more_targets,
                    children: more_children,
                    ..
                },
            ) => {
                targets.extend(more_targets);
                children.extend(more_children);
            }
            (
                Node::Inline { children, .. },
                Node::Inline {
                    children: more_children,
                    ..
                },
            ) => children.extend(more_children),
            _ => {}
        }
    }

    fn children_mut(&mut self) -> Option<&mut Vec<Node>> {
        match self {
            Node::Field { children, .. } | Node::Inline { children, .. } => Some(children),
            Node::Spread(_) => None,
        }
    }
}

fn lower(
    selection_set: query::QuerySelectionSet,
    shapes: &mut Vec<Shape>,
    siblings: &mut Vec<usize>,
) -> Vec<Node> {
    let mut nodes = Vec::with_capacity(selection_set.items.len());
    for selection in selection_set.items {
        match selection {
            Selection::Field(mut field) => {
                let id = shapes.len();
                shapes.push(Shape {
                    name: field.name.clone(),
                    response_key: query::response_key(&field).to_string(),
                    alias: String::new(),
                    children: vec![],
                });
                siblings.push(id);

                let nested = std::mem::replace(&mut field.selection_set, query::selection_set(vec![]));
                let mut nested_shapes = vec![];
                let children = lower(nested, shapes, &mut nested_shapes);
                shapes[id].children = nested_shapes;

                nodes.push(Node::Field {
                    field,
                    targets: vec![id],
                    children,
                });
            }
            Selection::InlineFragment(mut fragment) => {
                let nested =
                    std::mem::replace(&mut fragment.selection_set, query::selection_set(vec![]));
                let children = lower(nested, shapes, siblings);
                nodes.push(Node::Inline { fragment, children });
            }
            Selection::FragmentSpread(spread) => nodes.push(Node::Spread(spread)),
        }
    }
    nodes
}

fn merge_nodes(nodes: Vec<Node>, counter: &mut usize) -> Vec<Node> {
    let mut kept: Vec<Node> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for mut node in nodes {
        let key = node.key();
        if let Some(&position) = positions.get(&key) {
            kept[position].absorb(node);
            continue;
        }
        if let Node::Field { field, .. } = &mut node {
            field.alias = Some(format!("f{:x}", counter));
            *counter += 1;
        }
        positions.insert(key, kept.len());
        kept.push(node);
    }

    for node in &mut kept {
        if let Some(children) = node.children_mut() {
            let merged = merge_nodes(std::mem::take(children), counter);
            *children = merged;
        }
    }
    kept
}

fn raise(nodes: Vec<Node>, shapes: &mut [Shape]) -> Vec<Selection<'static, String>> {
    nodes
        .into_iter()
        .map(|node| match node {
            Node::Field {
                mut field,
                targets,
                children,
            } => {
                let alias = field.alias.clone().unwrap_or_default();
                for target in targets {
                    shapes[target].alias = alias.clone();
                }
                field.selection_set = query::selection_set(raise(children, shapes));
                Selection::Field(field)
            }
            Node::Inline {
                mut fragment,
                children,
            } => {
                fragment.selection_set = query::selection_set(raise(children, shapes));
                Selection::InlineFragment(fragment)
            }
            Node::Spread(spread) => Selection::FragmentSpread(spread),
        })
        .collect()
}

fn alias_nodes(ids: &[usize], shapes: &[Shape]) -> Vec<AliasNode> {
    ids.iter()
        .map(|&id| {
            let shape = &shapes[id];
            AliasNode {
                name: shape.name.clone(),
                response_key: shape.response_key.clone(),
                alias: shape.alias.clone(),
                children: alias_nodes(&shape.children, shapes),
            }
        })
        .collect()
}

struct Group {
    operation: Operation,
    nodes: Vec<Node>,
    fragments: Vec<FragmentDef>,
    fragment_names: HashSet<String>,
}

/// Merges `documents` into one document per operation kind.
pub fn merge(documents: Vec<QueryDocument>) -> Merged {
    let mut shapes: Vec<Shape> = Vec::new();
    let mut roots: Vec<Vec<usize>> = Vec::with_capacity(documents.len());
    let mut groups: Vec<Group> = Vec::new();

    for document in documents {
        let (operations, fragments) = query::split_document(document);
        let mut document_roots = Vec::new();
        let mut kinds = Vec::new();

        for mut operation in operations {
            let selection_set =
                std::mem::replace(&mut operation.selection_set, query::selection_set(vec![]));
            let nodes = lower(selection_set, &mut shapes, &mut document_roots);
            kinds.push(operation.kind);

            match groups.iter_mut().find(|g| g.operation.kind == operation.kind) {
                Some(group) => {
                    for variable in operation.variables {
                        if !group.operation.variables.iter().any(|v| v.name == variable.name) {
                            group.operation.variables.push(variable);
                        }
                    }
                    group.nodes.extend(nodes);
                }
                None => groups.push(Group {
                    operation,
                    nodes,
                    fragments: vec![],
                    fragment_names: HashSet::new(),
                }),
            }
        }

        for fragment in fragments {
            for group in groups.iter_mut().filter(|g| kinds.contains(&g.operation.kind)) {
                if group.fragment_names.insert(fragment.name.clone()) {
                    group.fragments.push(fragment.clone());
                }
            }
        }
        roots.push(document_roots);
    }

    let mut counter = 0usize;
    let mut merged = Vec::with_capacity(groups.len());
    for group in groups {
        let Group {
            mut operation,
            nodes,
            fragments,
            ..
        } = group;
        let nodes = merge_nodes(nodes, &mut counter);
        operation.selection_set = query::selection_set(raise(nodes, &mut shapes));
        merged.push(MergedDocument {
            kind: operation.kind,
            document: query::join_document(vec![operation], fragments),
        });
    }

    Merged {
        documents: merged,
        aliases: roots
            .iter()
            .map(|ids| AliasTree {
                fields: alias_nodes(ids, &shapes),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn docs(texts: &[&str]) -> Vec<QueryDocument> {
        texts.iter().map(|t| query::parse(t).unwrap()).collect()
    }

    fn top_level(merged: &MergedDocument) -> Vec<QueryField> {
        let (operations, _) = query::split_document(merged.document.clone());
        operations[0]
            .selection_set
            .items
            .iter()
            .filter_map(|s| match s {
                Selection::Field(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    fn collect_aliases(items: &[Selection<'static, String>], out: &mut Vec<String>) {
        for item in items {
            match item {
                Selection::Field(field) => {
                    out.extend(field.alias.clone());
                    collect_aliases(&field.selection_set.items, out);
                }
                Selection::InlineFragment(fragment) => {
                    collect_aliases(&fragment.selection_set.items, out)
                }
                Selection::FragmentSpread(_) => {}
            }
        }
    }

    #[test]
    fn identical_documents_collapse_onto_one_field() {
        let text = r#"query { user(id: "1") { name } }"#;
        let merged = merge(docs(&[text, text, text]));

        assert_eq!(merged.documents.len(), 1);
        let fields = top_level(&merged.documents[0]);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].alias.as_deref(), Some("f0"));
        assert_eq!(fields[0].selection_set.items.len(), 1);

        for tree in &merged.aliases {
            let user = tree.field("user").unwrap();
            assert_eq!(user.alias, "f0");
            assert_eq!(user.child("name").unwrap().alias, "f1");
        }
    }

    #[test]
    fn different_arguments_stay_apart() {
        let merged = merge(docs(&[
            r#"query { user(id: "1") { name } }"#,
            r#"query { user(id: "2") { email } }"#,
        ]));

        let fields = top_level(&merged.documents[0]);
        assert_eq!(fields.len(), 2);
        assert_ne!(fields[0].alias, fields[1].alias);
        for field in &fields {
            assert_eq!(field.selection_set.items.len(), 1);
        }
        assert_ne!(
            merged.aliases[0].field("user").unwrap().alias,
            merged.aliases[1].field("user").unwrap().alias
        );
    }

    #[test]
    fn sub_selections_of_shared_fields_are_combined() {
        let merged = merge(docs(&[
            "query($id: ID!) { user(id: $id) { name friends { name } } }",
            "query($id: ID!) { user(id: $id) { email friends { name age } } }",
        ]));

        let fields = top_level(&merged.documents[0]);
        assert_eq!(fields.len(), 1);
        let names: Vec<String> = fields[0]
            .selection_set
            .items
            .iter()
            .filter_map(|s| match s {
                Selection::Field(f) => Some(f.name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["name", "friends", "email"]);

        let first = merged.aliases[0].field("user").unwrap();
        let second = merged.aliases[1].field("user").unwrap();
        assert_eq!(
            first.child("friends").unwrap().child("name").unwrap().alias,
            second.child("friends").unwrap().child("name").unwrap().alias
        );
        assert_eq!(
            query::variable_definitions(&merged.documents[0].document).len(),
            1
        );
    }

    #[test]
    fn every_assigned_alias_is_unique() {
        let merged = merge(docs(&[
            "query { a { b { c } b { d } } x: a { b { c } } }",
            "query { a(n: 1) { b { c } } a { e } }",
            "mutation { save { a { b } } }",
        ]));

        let mut aliases = Vec::new();
        for document in &merged.documents {
            let (operations, _) = query::split_document(document.document.clone());
            collect_aliases(&operations[0].selection_set.items, &mut aliases);
        }
        let unique: BTreeSet<&String> = aliases.iter().collect();
        assert_eq!(unique.len(), aliases.len());
        assert!(aliases.len() >= 8);
    }

    #[test]
    fn sibling_inline_fragments_are_merged_per_type_condition() {
        let merged = merge(docs(&[
            "query { node { ... on User { id } ... on Post { id } } }",
            "query { node { ... on User { name } } }",
        ]));

        let fields = top_level(&merged.documents[0]);
        let fragments: Vec<&InlineFragment<'static, String>> = fields[0]
            .selection_set
            .items
            .iter()
            .filter_map(|s| match s {
                Selection::InlineFragment(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].selection_set.items.len(), 2);
        assert_eq!(fragments[1].selection_set.items.len(), 1);

        // the same field under different type conditions resolves to different aliases
        let node = merged.aliases[0].field("node").unwrap();
        assert_eq!(node.children.len(), 2);
        assert_ne!(node.children[0].alias, node.children[1].alias);
    }

    #[test]
    fn operation_kinds_are_merged_separately() {
        let merged = merge(docs(&[
            "query($a: Int) { a(x: $a) { ...Parts } } fragment Parts on A { p }",
            "mutation { save { ok } }",
            "query($b: Int) { b(x: $b) { ...Parts } } fragment Parts on A { p }",
        ]));

        assert_eq!(merged.documents.len(), 2);
        assert_eq!(merged.documents[0].kind, OperationKind::Query);
        assert_eq!(merged.documents[1].kind, OperationKind::Mutation);

        let printed = merged.documents[0].document.to_string();
        assert_eq!(printed.matches("fragment Parts").count(), 1);
        let variables: Vec<String> = query::variable_definitions(&merged.documents[0].document)
            .into_iter()
            .map(|v| v.name.clone())
            .collect();
        assert_eq!(variables, vec!["a", "b"]);
        assert!(!merged.documents[1].document.to_string().contains("fragment"));
        assert_eq!(merged.aliases[1].field("save").unwrap().alias, "f2");
    }

    #[test]
    fn duplicate_spreads_are_dropped() {
        let merged = merge(docs(&[
            "query { a { ...F ...F } } fragment F on A { p }",
            "query { a { ...F } } fragment F on A { p }",
        ]));

        let fields = top_level(&merged.documents[0]);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].selection_set.items.len(), 1);
    }
}
