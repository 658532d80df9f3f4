//! Arena storage for executable and type system documents.
//!
//! Nodes live in flat vectors owned by a [`Document`] and reference each other through typed
//! `u32` indices. A document is owned by a single request (or a single schema) and can be
//! [`reset`](Document::reset) to be reused without reallocating.

mod lower;
mod printer;

use std::fmt;

pub(crate) use lower::parse_executable;
pub(crate) use lower::parse_executable_into;
pub(crate) use lower::parse_type_system;
pub use printer::print_document;
pub use printer::print_operation;
pub(crate) use printer::print_type;
pub(crate) use printer::print_value;

use crate::query_planner::OperationKind;

macro_rules! node_ref {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub(crate) u32);

            impl $name {
                pub fn index(self) -> usize {
                    self.0 as usize
                }
            }
        )*
    };
}

node_ref!(
    /// Index of an operation definition.
    OperationRef,
    /// Index of a fragment definition.
    FragmentRef,
    SelectionSetRef,
    FieldRef,
    InlineFragmentRef,
    FragmentSpreadRef,
    DirectiveRef,
    ValueRef,
    TypeRef,
    VariableDefinitionRef,
    /// Index of a type definition in a type system document.
    TypeDefinitionRef,
);

/// Line and column of a node in its source text, both starting at 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

/// Top level definitions in source order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Definition {
    Operation(OperationRef),
    Fragment(FragmentRef),
    Type(TypeDefinitionRef),
}

#[derive(Clone, Debug, PartialEq)]
pub struct OperationDefinition {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub variable_definitions: Vec<VariableDefinitionRef>,
    pub directives: Vec<DirectiveRef>,
    pub selection_set: SelectionSetRef,
    pub position: Position,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FragmentDefinition {
    pub name: String,
    pub type_condition: String,
    pub directives: Vec<DirectiveRef>,
    pub selection_set: SelectionSetRef,
    pub position: Position,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SelectionSet {
    pub selections: Vec<Selection>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selection {
    Field(FieldRef),
    InlineFragment(InlineFragmentRef),
    FragmentSpread(FragmentSpreadRef),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub alias: Option<String>,
    pub name: String,
    pub arguments: Vec<Argument>,
    pub directives: Vec<DirectiveRef>,
    pub selection_set: Option<SelectionSetRef>,
    pub position: Position,
}

impl Field {
    /// The key under which this field appears in the response.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Argument {
    pub name: String,
    pub value: ValueRef,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InlineFragment {
    pub type_condition: Option<String>,
    pub directives: Vec<DirectiveRef>,
    pub selection_set: SelectionSetRef,
    pub position: Position,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FragmentSpread {
    pub name: String,
    pub directives: Vec<DirectiveRef>,
    pub position: Position,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Directive {
    pub name: String,
    pub arguments: Vec<Argument>,
}

/// An input value literal.
///
/// Numbers keep their source text so that printing is lossless.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Variable(String),
    Int(String),
    Float(String),
    String(String),
    Boolean(bool),
    Null,
    Enum(String),
    List(Vec<ValueRef>),
    Object(Vec<(String, ValueRef)>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Type {
    Named(String),
    List(TypeRef),
    NonNull(TypeRef),
}

#[derive(Clone, Debug, PartialEq)]
pub struct VariableDefinition {
    pub name: String,
    pub ty: TypeRef,
    pub default_value: Option<ValueRef>,
    pub directives: Vec<DirectiveRef>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeDefinitionKind {
    Scalar,
    Object,
    Interface,
    Union,
    Enum,
    InputObject,
}

impl fmt::Display for TypeDefinitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TypeDefinitionKind::Scalar => "scalar",
            TypeDefinitionKind::Object => "type",
            TypeDefinitionKind::Interface => "interface",
            TypeDefinitionKind::Union => "union",
            TypeDefinitionKind::Enum => "enum",
            TypeDefinitionKind::InputObject => "input",
        })
    }
}

/// A type definition, with all of its extensions merged in.
#[derive(Clone, Debug, PartialEq)]
pub struct TypeDefinition {
    pub kind: TypeDefinitionKind,
    pub name: String,
    pub fields: Vec<FieldDefinition>,
    pub interfaces: Vec<String>,
    pub union_members: Vec<String>,
    pub enum_values: Vec<String>,
    pub input_fields: Vec<InputValueDefinition>,
}

impl TypeDefinition {
    pub(crate) fn new(kind: TypeDefinitionKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            fields: Vec::new(),
            interfaces: Vec::new(),
            union_members: Vec::new(),
            enum_values: Vec::new(),
            input_fields: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldDefinition {
    pub name: String,
    pub arguments: Vec<InputValueDefinition>,
    pub ty: TypeRef,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InputValueDefinition {
    pub name: String,
    pub ty: TypeRef,
    pub default_value: Option<ValueRef>,
}

/// Root operation type names declared by a `schema` definition.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RootOperationTypes {
    pub query: Option<String>,
    pub mutation: Option<String>,
    pub subscription: Option<String>,
}

/// Arena of GraphQL nodes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Document {
    pub definitions: Vec<Definition>,
    pub operations: Vec<OperationDefinition>,
    pub fragments: Vec<FragmentDefinition>,
    pub selection_sets: Vec<SelectionSet>,
    pub fields: Vec<Field>,
    pub inline_fragments: Vec<InlineFragment>,
    pub fragment_spreads: Vec<FragmentSpread>,
    pub directives: Vec<Directive>,
    pub values: Vec<Value>,
    pub types: Vec<Type>,
    pub variable_definitions: Vec<VariableDefinition>,
    pub type_definitions: Vec<TypeDefinition>,
    pub root_operation_types: RootOperationTypes,
}

impl Document {
    /// Clears every node while keeping the allocated capacity.
    pub fn reset(&mut self) {
        self.definitions.clear();
        self.operations.clear();
        self.fragments.clear();
        self.selection_sets.clear();
        self.fields.clear();
        self.inline_fragments.clear();
        self.fragment_spreads.clear();
        self.directives.clear();
        self.values.clear();
        self.types.clear();
        self.variable_definitions.clear();
        self.type_definitions.clear();
        self.root_operation_types = RootOperationTypes::default();
    }

    pub fn operation(&self, r: OperationRef) -> &OperationDefinition {
        &self.operations[r.index()]
    }

    pub fn fragment(&self, r: FragmentRef) -> &FragmentDefinition {
        &self.fragments[r.index()]
    }

    pub fn selection_set(&self, r: SelectionSetRef) -> &SelectionSet {
        &self.selection_sets[r.index()]
    }

    pub fn selection_set_mut(&mut self, r: SelectionSetRef) -> &mut SelectionSet {
        &mut self.selection_sets[r.index()]
    }

    pub fn field(&self, r: FieldRef) -> &Field {
        &self.fields[r.index()]
    }

    pub fn field_mut(&mut self, r: FieldRef) -> &mut Field {
        &mut self.fields[r.index()]
    }

    pub fn inline_fragment(&self, r: InlineFragmentRef) -> &InlineFragment {
        &self.inline_fragments[r.index()]
    }

    pub fn fragment_spread(&self, r: FragmentSpreadRef) -> &FragmentSpread {
        &self.fragment_spreads[r.index()]
    }

    pub fn directive(&self, r: DirectiveRef) -> &Directive {
        &self.directives[r.index()]
    }

    pub fn value(&self, r: ValueRef) -> &Value {
        &self.values[r.index()]
    }

    pub fn ty(&self, r: TypeRef) -> &Type {
        &self.types[r.index()]
    }

    pub fn variable_definition(&self, r: VariableDefinitionRef) -> &VariableDefinition {
        &self.variable_definitions[r.index()]
    }

    pub fn type_definition(&self, r: TypeDefinitionRef) -> &TypeDefinition {
        &self.type_definitions[r.index()]
    }

    pub fn add_operation(&mut self, operation: OperationDefinition) -> OperationRef {
        self.operations.push(operation);
        let r = OperationRef(self.operations.len() as u32 - 1);
        self.definitions.push(Definition::Operation(r));
        r
    }

    pub fn add_fragment(&mut self, fragment: FragmentDefinition) -> FragmentRef {
        self.fragments.push(fragment);
        let r = FragmentRef(self.fragments.len() as u32 - 1);
        self.definitions.push(Definition::Fragment(r));
        r
    }

    pub fn add_selection_set(&mut self, selection_set: SelectionSet) -> SelectionSetRef {
        self.selection_sets.push(selection_set);
        SelectionSetRef(self.selection_sets.len() as u32 - 1)
    }

    pub fn add_field(&mut self, field: Field) -> FieldRef {
        self.fields.push(field);
        FieldRef(self.fields.len() as u32 - 1)
    }

    pub fn add_inline_fragment(&mut self, fragment: InlineFragment) -> InlineFragmentRef {
        self.inline_fragments.push(fragment);
        InlineFragmentRef(self.inline_fragments.len() as u32 - 1)
    }

    pub fn add_fragment_spread(&mut self, spread: FragmentSpread) -> FragmentSpreadRef {
        self.fragment_spreads.push(spread);
        FragmentSpreadRef(self.fragment_spreads.len() as u32 - 1)
    }

    pub fn add_directive(&mut self, directive: Directive) -> DirectiveRef {
        self.directives.push(directive);
        DirectiveRef(self.directives.len() as u32 - 1)
    }

    pub fn add_value(&mut self, value: Value) -> ValueRef {
        self.values.push(value);
        ValueRef(self.values.len() as u32 - 1)
    }

    pub fn add_type(&mut self, ty: Type) -> TypeRef {
        self.types.push(ty);
        TypeRef(self.types.len() as u32 - 1)
    }

    pub fn add_named_type(&mut self, name: impl Into<String>) -> TypeRef {
        self.add_type(Type::Named(name.into()))
    }

    pub fn add_variable_definition(
        &mut self,
        definition: VariableDefinition,
    ) -> VariableDefinitionRef {
        self.variable_definitions.push(definition);
        VariableDefinitionRef(self.variable_definitions.len() as u32 - 1)
    }

    pub fn add_type_definition(&mut self, definition: TypeDefinition) -> TypeDefinitionRef {
        self.type_definitions.push(definition);
        let r = TypeDefinitionRef(self.type_definitions.len() as u32 - 1);
        self.definitions.push(Definition::Type(r));
        r
    }

    /// Operations in source order.
    pub fn operation_refs(&self) -> impl Iterator<Item = OperationRef> + '_ {
        self.definitions.iter().filter_map(|d| match d {
            Definition::Operation(r) => Some(*r),
            _ => None,
        })
    }

    /// Fragments in source order.
    pub fn fragment_refs(&self) -> impl Iterator<Item = FragmentRef> + '_ {
        self.definitions.iter().filter_map(|d| match d {
            Definition::Fragment(r) => Some(*r),
            _ => None,
        })
    }

    pub fn fragment_by_name(&self, name: &str) -> Option<FragmentRef> {
        self.fragment_refs()
            .find(|r| self.fragment(*r).name == name)
    }

    /// Finds the operation designated by `name`.
    ///
    /// Without a name the document must hold exactly one operation.
    pub fn operation_by_name(&self, name: Option<&str>) -> Option<OperationRef> {
        match name {
            Some(name) => self
                .operation_refs()
                .find(|r| self.operation(*r).name.as_deref() == Some(name)),
            None => {
                let mut operations = self.operation_refs();
                match (operations.next(), operations.next()) {
                    (Some(r), None) => Some(r),
                    _ => None,
                }
            }
        }
    }

    /// Name of the innermost named type.
    pub fn type_name(&self, r: TypeRef) -> &str {
        match self.ty(r) {
            Type::Named(name) => name,
            Type::List(inner) | Type::NonNull(inner) => self.type_name(*inner),
        }
    }

    pub fn is_non_null(&self, r: TypeRef) -> bool {
        matches!(self.ty(r), Type::NonNull(_))
    }

    /// Deep copies a type from another document into this one.
    pub fn import_type(&mut self, from: &Document, r: TypeRef) -> TypeRef {
        let ty = match from.ty(r) {
            Type::Named(name) => Type::Named(name.clone()),
            Type::List(inner) => Type::List(self.import_type(from, *inner)),
            Type::NonNull(inner) => Type::NonNull(self.import_type(from, *inner)),
        };
        self.add_type(ty)
    }

    /// Deep copies a value from another document into this one.
    pub fn import_value(&mut self, from: &Document, r: ValueRef) -> ValueRef {
        let value = match from.value(r) {
            Value::List(items) => Value::List(
                items
                    .iter()
                    .map(|item| self.import_value(from, *item))
                    .collect(),
            ),
            Value::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(name, value)| (name.clone(), self.import_value(from, *value)))
                    .collect(),
            ),
            other => other.clone(),
        };
        self.add_value(value)
    }

    /// Whether the value contains a variable reference at any depth.
    pub fn value_contains_variable(&self, r: ValueRef) -> bool {
        match self.value(r) {
            Value::Variable(_) => true,
            Value::List(items) => items.iter().any(|v| self.value_contains_variable(*v)),
            Value::Object(fields) => fields.iter().any(|(_, v)| self.value_contains_variable(*v)),
            _ => false,
        }
    }

    /// Converts a literal to JSON, resolving variables from `variables`.
    pub fn value_to_json(
        &self,
        r: ValueRef,
        variables: &crate::json_ext::Object,
    ) -> crate::json_ext::Value {
        use crate::json_ext::Value as Json;

        match self.value(r) {
            Value::Variable(name) => variables.get(name.as_str()).cloned().unwrap_or(Json::Null),
            Value::Int(text) | Value::Float(text) => serde_json::from_str::<serde_json::Number>(text)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) | Value::Enum(s) => Json::String(s.as_str().into()),
            Value::Boolean(b) => Json::Bool(*b),
            Value::Null => Json::Null,
            Value::List(items) => Json::Array(
                items
                    .iter()
                    .map(|item| self.value_to_json(*item, variables))
                    .collect(),
            ),
            Value::Object(fields) => Json::Object(
                fields
                    .iter()
                    .map(|(name, value)| {
                        (name.as_str().into(), self.value_to_json(*value, variables))
                    })
                    .collect(),
            ),
        }
    }

    /// Converts a JSON value into a literal node.
    pub fn add_json_value(&mut self, json: &crate::json_ext::Value) -> ValueRef {
        use crate::json_ext::Value as Json;

        let value = match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Boolean(*b),
            Json::Number(n) if n.is_f64() => Value::Float(n.to_string()),
            Json::Number(n) => Value::Int(n.to_string()),
            Json::String(s) => Value::String(s.as_str().to_string()),
            Json::Array(items) => {
                Value::List(items.iter().map(|item| self.add_json_value(item)).collect())
            }
            Json::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.as_str().to_string(), self.add_json_value(v)))
                    .collect(),
            ),
        };
        self.add_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_keeps_document_reusable() {
        let mut document = parse_executable("query Q { hero { name } }").unwrap();
        assert_eq!(document.operations.len(), 1);
        document.reset();
        assert!(document.definitions.is_empty());
        assert!(document.fields.is_empty());
        assert_eq!(document, Document::default());
    }

    #[test]
    fn operation_lookup() {
        let document =
            parse_executable("query A { hero { name } } query B { droid { name } }").unwrap();
        assert!(document.operation_by_name(None).is_none());
        let b = document.operation_by_name(Some("B")).unwrap();
        assert_eq!(document.operation(b).name.as_deref(), Some("B"));
        assert!(document.operation_by_name(Some("C")).is_none());
    }

    #[test]
    fn literal_to_json() {
        let document =
            parse_executable(r#"{ search(filter: {ids: [1, 2], name: "x", exact: true}) }"#)
                .unwrap();
        let field = &document.fields[0];
        let json = document.value_to_json(field.arguments[0].value, &Default::default());
        assert_eq!(
            json,
            serde_json_bytes::json!({"ids": [1, 2], "name": "x", "exact": true})
        );
    }
}
