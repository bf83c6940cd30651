use graphql_parser::{
    Pos,
    schema::{
        Definition, Document, Field, InputValue, ObjectType, ParseError, SchemaDefinition, Type,
        TypeDefinition, TypeExtension, parse_schema,
    },
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::GatewayError;

pub type TypeDef = TypeDefinition<'static, String>;
pub type FieldDef = Field<'static, String>;
pub type InputValueDef = InputValue<'static, String>;
pub type TypeRef = Type<'static, String>;

pub const BUILTIN_SCALARS: [&str; 5] = ["Int", "Float", "String", "Boolean", "ID"];

pub fn is_builtin_scalar(name: &str) -> bool {
    BUILTIN_SCALARS.contains(&name)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The innermost named type of a (possibly wrapped) type reference.
pub fn named_type(ty: &TypeRef) -> &str {
    match ty {
        Type::NamedType(name) => name,
        Type::ListType(inner) | Type::NonNullType(inner) => named_type(inner),
    }
}

pub fn type_to_string(ty: &TypeRef) -> String {
    match ty {
        Type::NamedType(name) => name.clone(),
        Type::ListType(inner) => format!("[{}]", type_to_string(inner)),
        Type::NonNullType(inner) => format!("{}!", type_to_string(inner)),
    }
}

pub fn map_type_names(ty: &TypeRef, rename: &impl Fn(&str) -> String) -> TypeRef {
    match ty {
        Type::NamedType(name) => Type::NamedType(rename(name)),
        Type::ListType(inner) => Type::ListType(Box::new(map_type_names(inner, rename))),
        Type::NonNullType(inner) => Type::NonNullType(Box::new(map_type_names(inner, rename))),
    }
}

pub fn type_def_name(def: &TypeDef) -> &str {
    match def {
        TypeDefinition::Scalar(t) => &t.name,
        TypeDefinition::Object(t) => &t.name,
        TypeDefinition::Interface(t) => &t.name,
        TypeDefinition::Union(t) => &t.name,
        TypeDefinition::Enum(t) => &t.name,
        TypeDefinition::InputObject(t) => &t.name,
    }
}

fn type_def_name_mut(def: &mut TypeDef) -> &mut String {
    match def {
        TypeDefinition::Scalar(t) => &mut t.name,
        TypeDefinition::Object(t) => &mut t.name,
        TypeDefinition::Interface(t) => &mut t.name,
        TypeDefinition::Union(t) => &mut t.name,
        TypeDefinition::Enum(t) => &mut t.name,
        TypeDefinition::InputObject(t) => &mut t.name,
    }
}

pub fn kind_name(def: &TypeDef) -> &'static str {
    match def {
        TypeDefinition::Scalar(_) => "SCALAR",
        TypeDefinition::Object(_) => "OBJECT",
        TypeDefinition::Interface(_) => "INTERFACE",
        TypeDefinition::Union(_) => "UNION",
        TypeDefinition::Enum(_) => "ENUM",
        TypeDefinition::InputObject(_) => "INPUT_OBJECT",
    }
}

pub fn empty_object(name: &str) -> TypeDef {
    TypeDefinition::Object(ObjectType {
        position: Pos { line: 0, column: 0 },
        description: None,
        name: name.to_string(),
        implements_interfaces: vec![],
        directives: vec![],
        fields: vec![],
    })
}

/// Namespaces upstream type names with a prefix and/or suffix.
///
/// Built-in scalars and introspection types keep their names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TypeRenamer {
    prefix: String,
    suffix: String,
}

impl TypeRenamer {
    pub fn new(prefix: &str, suffix: &str) -> Self {
        TypeRenamer {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.prefix.is_empty() && self.suffix.is_empty()
    }

    fn keeps(&self, name: &str) -> bool {
        self.is_identity() || is_builtin_scalar(name) || name.starts_with("__")
    }

    pub fn rename(&self, name: &str) -> String {
        if self.keeps(name) {
            return name.to_string();
        }
        format!("{}{}{}", self.prefix, name, self.suffix)
    }

    /// Maps a unified type name back to the name the upstream knows it by.
    pub fn revert(&self, name: &str) -> String {
        if self.keeps(name) {
            return name.to_string();
        }
        name.strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_suffix(self.suffix.as_str()))
            .unwrap_or(name)
            .to_string()
    }

    pub fn rename_type(&self, ty: &TypeRef) -> TypeRef {
        map_type_names(ty, &|name| self.rename(name))
    }

    pub fn revert_type(&self, ty: &TypeRef) -> TypeRef {
        map_type_names(ty, &|name| self.revert(name))
    }
}

/// An owned, name-indexed view over a GraphQL schema.
#[derive(Clone, Debug, Default)]
pub struct SchemaIndex {
    types: BTreeMap<String, TypeDef>,
    query_type: Option<String>,
    mutation_type: Option<String>,
    subscription_type: Option<String>,
}

impl SchemaIndex {
    pub fn parse(sdl: &str) -> Result<Self, ParseError> {
        let document = parse_schema::<String>(sdl)?.into_static();
        Ok(Self::from_document(document))
    }

    pub fn from_document(document: Document<'static, String>) -> Self {
        let mut index = SchemaIndex::default();
        let mut extensions = Vec::new();
        let mut explicit_roots = false;

        for definition in document.definitions {
            match definition {
                Definition::SchemaDefinition(schema) => {
                    explicit_roots = true;
                    index.query_type = schema.query;
                    index.mutation_type = schema.mutation;
                    index.subscription_type = schema.subscription;
                }
                Definition::TypeDefinition(def) => {
                    if !is_builtin_scalar(type_def_name(&def)) {
                        index.types.insert(type_def_name(&def).to_string(), def);
                    }
                }
                Definition::TypeExtension(extension) => extensions.push(extension),
                _ => {}
            }
        }

        // extensions may precede the type they extend
        for extension in extensions {
            index.apply_extension(extension);
        }

        for (kind, slot) in [
            (OperationKind::Query, "Query"),
            (OperationKind::Mutation, "Mutation"),
            (OperationKind::Subscription, "Subscription"),
        ] {
            if !explicit_roots && index.types.contains_key(slot) {
                index.set_root_type(kind, slot);
            }
        }
        index
    }

    /// A schema holding nothing but empty `Query` and `Mutation` root objects.
    pub fn with_root_types() -> Self {
        let mut index = SchemaIndex::default();
        index.insert_if_missing(empty_object("Query"));
        index.insert_if_missing(empty_object("Mutation"));
        index.set_root_type(OperationKind::Query, "Query");
        index.set_root_type(OperationKind::Mutation, "Mutation");
        index
    }

    fn apply_extension(&mut self, extension: TypeExtension<'static, String>) {
        match extension {
            TypeExtension::Object(ext) => match self.types.get_mut(&ext.name) {
                Some(TypeDefinition::Object(object)) => {
                    object.fields.extend(ext.fields);
                    object.implements_interfaces.extend(ext.implements_interfaces);
                }
                _ => {
                    let mut object = empty_object(&ext.name);
                    if let TypeDefinition::Object(o) = &mut object {
                        o.fields = ext.fields;
                        o.implements_interfaces = ext.implements_interfaces;
                    }
                    self.types.insert(ext.name, object);
                }
            },
            TypeExtension::Interface(ext) => {
                if let Some(TypeDefinition::Interface(interface)) = self.types.get_mut(&ext.name) {
                    interface.fields.extend(ext.fields);
                }
            }
            TypeExtension::Union(ext) => {
                if let Some(TypeDefinition::Union(union)) = self.types.get_mut(&ext.name) {
                    union.types.extend(ext.types);
                }
            }
            TypeExtension::Enum(ext) => {
                if let Some(TypeDefinition::Enum(e)) = self.types.get_mut(&ext.name) {
                    e.values.extend(ext.values);
                }
            }
            TypeExtension::InputObject(ext) => {
                if let Some(TypeDefinition::InputObject(input)) = self.types.get_mut(&ext.name) {
                    input.fields.extend(ext.fields);
                }
            }
            TypeExtension::Scalar(_) => {}
        }
    }

    pub fn root_type(&self, kind: OperationKind) -> Option<&str> {
        match kind {
            OperationKind::Query => self.query_type.as_deref(),
            OperationKind::Mutation => self.mutation_type.as_deref(),
            OperationKind::Subscription => self.subscription_type.as_deref(),
        }
    }

    pub fn set_root_type(&mut self, kind: OperationKind, name: &str) {
        let slot = match kind {
            OperationKind::Query => &mut self.query_type,
            OperationKind::Mutation => &mut self.mutation_type,
            OperationKind::Subscription => &mut self.subscription_type,
        };
        *slot = Some(name.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.values()
    }

    /// Whether `name` can be referenced from this schema.
    pub fn contains(&self, name: &str) -> bool {
        is_builtin_scalar(name) || self.types.contains_key(name)
    }

    /// Inserts `def` unless a type of the same name is already present. Returns whether it was
    /// inserted.
    pub fn insert_if_missing(&mut self, def: TypeDef) -> bool {
        let name = type_def_name(&def).to_string();
        if self.contains(&name) {
            return false;
        }
        self.types.insert(name, def);
        true
    }

    pub fn object_mut(&mut self, name: &str) -> Option<&mut ObjectType<'static, String>> {
        match self.types.get_mut(name) {
            Some(TypeDefinition::Object(object)) => Some(object),
            _ => None,
        }
    }

    /// Fields of an object or interface type.
    pub fn fields(&self, type_name: &str) -> Option<&[FieldDef]> {
        match self.types.get(type_name)? {
            TypeDefinition::Object(object) => Some(&object.fields),
            TypeDefinition::Interface(interface) => Some(&interface.fields),
            _ => None,
        }
    }

    pub fn field(&self, type_name: &str, field_name: &str) -> Option<&FieldDef> {
        self.fields(type_name)?
            .iter()
            .find(|field| field.name == field_name)
    }

    pub fn is_abstract(&self, name: &str) -> bool {
        matches!(
            self.types.get(name),
            Some(TypeDefinition::Interface(_)) | Some(TypeDefinition::Union(_))
        )
    }

    /// Whether an object of type `object` may appear where `abstract_type` is expected.
    pub fn is_possible_type(&self, abstract_type: &str, object: &str) -> bool {
        if abstract_type == object {
            return true;
        }
        match self.types.get(abstract_type) {
            Some(TypeDefinition::Union(union)) => union.types.iter().any(|t| t == object),
            Some(TypeDefinition::Interface(_)) => match self.types.get(object) {
                Some(TypeDefinition::Object(o)) => {
                    o.implements_interfaces.iter().any(|i| i == abstract_type)
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// Applies `renamer` to every type definition and type reference.
    pub fn rename_types(&mut self, renamer: &TypeRenamer) {
        if renamer.is_identity() {
            return;
        }

        let types = std::mem::take(&mut self.types);
        for (_, mut def) in types {
            let name = type_def_name_mut(&mut def);
            *name = renamer.rename(name.as_str());

            match &mut def {
                TypeDefinition::Object(object) => {
                    for interface in &mut object.implements_interfaces {
                        *interface = renamer.rename(interface.as_str());
                    }
                    rename_fields(&mut object.fields, renamer);
                }
                TypeDefinition::Interface(interface) => rename_fields(&mut interface.fields, renamer),
                TypeDefinition::Union(union) => {
                    for member in &mut union.types {
                        *member = renamer.rename(member.as_str());
                    }
                }
                TypeDefinition::InputObject(input) => rename_input_values(&mut input.fields, renamer),
                TypeDefinition::Scalar(_) | TypeDefinition::Enum(_) => {}
            }

            self.types.insert(type_def_name(&def).to_string(), def);
        }

        for root in [
            &mut self.query_type,
            &mut self.mutation_type,
            &mut self.subscription_type,
        ]
        .into_iter()
        .flatten()
        {
            *root = renamer.rename(root.as_str());
        }
    }

    /// Clones every definition reachable from `roots`: field, argument and input field types,
    /// implemented interfaces, union members and the implementations of reachable interfaces.
    pub fn reachable_types<'n>(
        &self,
        roots: impl IntoIterator<Item = &'n str>,
    ) -> Result<Vec<TypeDef>, GatewayError> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = roots.into_iter().map(str::to_string).collect();
        let mut result = Vec::new();

        while let Some(name) = queue.pop_front() {
            if is_builtin_scalar(&name) || !seen.insert(name.clone()) {
                continue;
            }
            let def = self
                .types
                .get(&name)
                .ok_or_else(|| GatewayError::UnknownType(name.clone()))?;

            match def {
                TypeDefinition::Object(object) => {
                    queue.extend(object.implements_interfaces.iter().cloned());
                    enqueue_fields(&mut queue, &object.fields);
                }
                TypeDefinition::Interface(interface) => {
                    enqueue_fields(&mut queue, &interface.fields);
                    for candidate in self.types.values() {
                        if let TypeDefinition::Object(object) = candidate {
                            if object.implements_interfaces.contains(&name) {
                                queue.push_back(object.name.clone());
                            }
                        }
                    }
                }
                TypeDefinition::Union(union) => queue.extend(union.types.iter().cloned()),
                TypeDefinition::InputObject(input) => {
                    for field in &input.fields {
                        queue.push_back(named_type(&field.value_type).to_string());
                    }
                }
                TypeDefinition::Scalar(_) | TypeDefinition::Enum(_) => {}
            }
            result.push(def.clone());
        }
        Ok(result)
    }

    /// Renders the schema as SDL. Root types without fields are left out.
    pub fn to_sdl(&self) -> String {
        let is_empty_root = |name: &str| {
            self.is_root(name) && self.fields(name).map(|f| f.is_empty()).unwrap_or(false)
        };
        let visible_root = |root: &Option<String>| {
            root.as_ref().filter(|name| !is_empty_root(name)).cloned()
        };

        let mut definitions = Vec::new();
        let query = visible_root(&self.query_type);
        let mutation = visible_root(&self.mutation_type);
        let subscription = visible_root(&self.subscription_type);
        let conventional = query.as_deref().is_none_or(|n| n == "Query")
            && mutation.as_deref().is_none_or(|n| n == "Mutation")
            && subscription.as_deref().is_none_or(|n| n == "Subscription");
        if !conventional {
            definitions.push(Definition::SchemaDefinition(SchemaDefinition {
                position: Pos { line: 0, column: 0 },
                directives: vec![],
                query,
                mutation,
                subscription,
            }));
        }

        for (name, def) in &self.types {
            if !is_empty_root(name) {
                definitions.push(Definition::TypeDefinition(def.clone()));
            }
        }
        Document { definitions }.to_string()
    }

    fn is_root(&self, name: &str) -> bool {
        [&self.query_type, &self.mutation_type, &self.subscription_type]
            .iter()
            .any(|root| root.as_deref() == Some(name))
    }
}

fn enqueue_fields(queue: &mut VecDeque<String>, fields: &[FieldDef]) {
    for field in fields {
        queue.push_back(named_type(&field.field_type).to_string());
        for argument in &field.arguments {
            queue.push_back(named_type(&argument.value_type).to_string());
        }
    }
}

fn rename_fields(fields: &mut [FieldDef], renamer: &TypeRenamer) {
    for field in fields {
        field.field_type = renamer.rename_type(&field.field_type);
        rename_input_values(&mut field.arguments, renamer);
    }
}

fn rename_input_values(values: &mut [InputValueDef], renamer: &TypeRenamer) {
    for value in values {
        value.value_type = renamer.rename_type(&value.value_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SDL: &str = r#"
        schema { query: Root }
        type Root { node(id: ID!): Node search(filter: Filter): [Result!]! }
        interface Node { id: ID! }
        type User implements Node { id: ID! name: String }
        type Post implements Node { id: ID! title: String author: User }
        union Result = User | Post
        input Filter { kind: Kind text: String }
        enum Kind { USER POST }
        extend type User { email: String }
        type Unrelated { x: Int }
    "#;

    #[test]
    fn indexes_types_roots_and_extensions() {
        let schema = SchemaIndex::parse(SDL).unwrap();

        assert_eq!(schema.root_type(OperationKind::Query), Some("Root"));
        assert_eq!(schema.root_type(OperationKind::Mutation), None);
        assert!(schema.field("User", "email").is_some());
        assert!(schema.field("Node", "id").is_some());
        assert!(schema.contains("String"));
        assert!(schema.is_abstract("Result"));
        assert!(schema.is_possible_type("Node", "Post"));
        assert!(schema.is_possible_type("Result", "User"));
        assert!(!schema.is_possible_type("Result", "Unrelated"));
    }

    #[test]
    fn reachable_types_follow_fields_arguments_and_implementations() {
        let schema = SchemaIndex::parse(SDL).unwrap();

        let names: BTreeSet<String> = schema
            .reachable_types(["Node"])
            .unwrap()
            .iter()
            .map(|def| type_def_name(def).to_string())
            .collect();
        assert_eq!(
            names,
            ["Node", "Post", "User"].iter().map(|s| s.to_string()).collect()
        );

        let names: BTreeSet<String> = schema
            .reachable_types(["Root"])
            .unwrap()
            .iter()
            .map(|def| type_def_name(def).to_string())
            .collect();
        assert!(names.contains("Filter"));
        assert!(names.contains("Kind"));
        assert!(!names.contains("Unrelated"));
    }

    #[test]
    fn reachable_types_reject_dangling_references() {
        let schema = SchemaIndex::parse("type Query { a: Missing }").unwrap();
        let err = schema.reachable_types(["Query"]).unwrap_err();
        assert!(matches!(err, GatewayError::UnknownType(name) if name == "Missing"));
    }

    #[test]
    fn renaming_touches_every_reference_but_builtins() {
        let mut schema = SchemaIndex::parse(SDL).unwrap();
        let renamer = TypeRenamer::new("Gh", "");
        schema.rename_types(&renamer);

        assert_eq!(schema.root_type(OperationKind::Query), Some("GhRoot"));
        assert!(schema.get("User").is_none());
        let search = schema.field("GhRoot", "search").unwrap();
        assert_eq!(type_to_string(&search.field_type), "[GhResult!]!");
        assert_eq!(type_to_string(&search.arguments[0].value_type), "GhFilter");
        let node = schema.field("GhRoot", "node").unwrap();
        assert_eq!(type_to_string(&node.arguments[0].value_type), "ID!");
        assert!(schema.is_possible_type("GhNode", "GhUser"));
        assert_eq!(renamer.revert("GhUser"), "User");
        assert_eq!(renamer.revert("ID"), "ID");
    }

    #[test]
    fn sdl_hides_empty_root_types() {
        let schema = SchemaIndex::with_root_types();
        assert_eq!(schema.to_sdl().trim(), "");

        let schema = SchemaIndex::parse(SDL).unwrap();
        let sdl = schema.to_sdl();
        assert!(sdl.contains("query: Root"));
        assert!(sdl.contains("type User implements Node"));
    }
}
