//! Operation normalization.
//!
//! Rewrites the selected operation of a request into the canonical form the planner expects:
//! - only the selected operation is kept, fragment definitions are dropped;
//! - fragment spreads are inlined, inline fragments on the enclosing type are flattened;
//! - `@skip` and `@include` are evaluated against the variables;
//! - fields with the same response key and arguments are merged;
//! - literal arguments are extracted into variables named `a`, `b`, ...;
//! - variable defaults are injected and list inputs coerced;
//! - unused variables are removed from the document and from the variables.
//!
//! Normalizing an already normalized document yields the same document.

use std::collections::HashSet;

use indexmap::IndexSet;

use crate::ast;
use crate::ast::Argument;
use crate::ast::Directive;
use crate::ast::DirectiveRef;
use crate::ast::Document;
use crate::ast::Field;
use crate::ast::InlineFragment;
use crate::ast::OperationDefinition;
use crate::ast::OperationRef;
use crate::ast::Position;
use crate::ast::Selection;
use crate::ast::SelectionSet;
use crate::ast::SelectionSetRef;
use crate::ast::TypeRef;
use crate::ast::ValueRef;
use crate::ast::VariableDefinition;
use crate::error::ValidationErrors;
use crate::graphql;
use crate::graphql::Location;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::spec::FieldType;
use crate::spec::Schema;

/// Alias of the `__typename` field standing in for a selection set emptied by `@skip`/`@include`.
pub(crate) const TYPENAME_PLACEHOLDER: &str = "__internal__typename_placeholder";

/// Outcome of [`crate::graphql::Request::normalize`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NormalizationResult {
    pub successful: bool,
    pub errors: ValidationErrors,
}

impl NormalizationResult {
    pub(crate) fn successful() -> Self {
        Self {
            successful: true,
            errors: ValidationErrors::default(),
        }
    }

    fn failed(errors: Vec<graphql::Error>) -> Self {
        Self {
            successful: false,
            errors: ValidationErrors { errors },
        }
    }
}

/// Normalizes the operation named `operation_name` in place.
///
/// On failure the document and the variables are left untouched.
pub(crate) fn normalize_operation(
    document: &mut Document,
    operation_name: Option<&str>,
    variables: &mut Object,
    schema: &Schema,
) -> NormalizationResult {
    let Some(operation) = document.operation_by_name(operation_name) else {
        let message = match operation_name {
            Some(name) => format!("Unknown operation named \"{name}\"."),
            None => "Must provide operation name if query contains multiple operations.".to_string(),
        };
        return NormalizationResult::failed(vec![graphql::Error::builder().message(message).build()]);
    };

    let mut normalized_variables = variables.clone();
    let normalizer = Normalizer {
        source: document,
        schema,
        variables: &mut normalized_variables,
        errors: Vec::new(),
        used_variables: IndexSet::new(),
        extracted: Vec::new(),
        next_variable: 0,
    };
    match normalizer.run(operation) {
        Ok(normalized) => {
            *document = normalized;
            *variables = normalized_variables;
            NormalizationResult::successful()
        }
        Err(errors) => NormalizationResult::failed(errors),
    }
}

/// Coerces a variable value to its input type: single values become one element lists and
/// missing input object fields receive their default value.
pub(crate) fn coerce_input_value(value: &mut Value, ty: &FieldType, schema: &Schema) {
    match ty {
        FieldType::NonNull(inner) => coerce_input_value(value, inner, schema),
        FieldType::List(inner) => {
            if value.is_null() {
                return;
            }
            if !matches!(value, Value::Array(_)) {
                let item = std::mem::replace(value, Value::Null);
                *value = Value::Array(vec![item]);
            }
            if let Value::Array(items) = value {
                for item in items.iter_mut() {
                    coerce_input_value(item, inner, schema);
                }
            }
        }
        FieldType::Named(name) => {
            let (Some(definition), Value::Object(object)) = (schema.type_definition(name), value)
            else {
                return;
            };
            let schema_document = schema.document();
            for field in &definition.input_fields {
                let field_type = FieldType::from_document(schema_document, field.ty);
                match object.get_mut(field.name.as_str()) {
                    Some(field_value) => coerce_input_value(field_value, &field_type, schema),
                    None => {
                        if let Some(default_value) = field.default_value {
                            let mut default_value =
                                schema_document.value_to_json(default_value, &Object::new());
                            coerce_input_value(&mut default_value, &field_type, schema);
                            object.insert(field.name.as_str(), default_value);
                        }
                    }
                }
            }
        }
        _ => {}
    }
}

#[derive(Debug, Clone)]
enum Node {
    Field {
        alias: Option<String>,
        name: String,
        parent_type: String,
        arguments: Vec<Argument>,
        directives: Vec<DirectiveRef>,
        selection_set: Option<Vec<Node>>,
        position: Position,
    },
    InlineFragment {
        type_condition: Option<String>,
        directives: Vec<DirectiveRef>,
        selection_set: Vec<Node>,
        position: Position,
    },
}

impl Node {
    fn typename_placeholder(parent_type: &str) -> Self {
        Node::Field {
            alias: Some(TYPENAME_PLACEHOLDER.to_string()),
            name: "__typename".to_string(),
            parent_type: parent_type.to_string(),
            arguments: Vec::new(),
            directives: Vec::new(),
            selection_set: None,
            position: Position::default(),
        }
    }
}

struct Extracted {
    name: String,
    value: Value,
    printed_type: String,
    ty: TypeRef,
}

struct Normalizer<'a> {
    source: &'a Document,
    schema: &'a Schema,
    variables: &'a mut Object,
    errors: Vec<graphql::Error>,
    used_variables: IndexSet<String>,
    extracted: Vec<Extracted>,
    next_variable: usize,
}

impl Normalizer<'_> {
    fn run(mut self, operation: OperationRef) -> Result<Document, Vec<graphql::Error>> {
        let source = self.source;
        let operation = source.operation(operation);
        let root_type = self
            .schema
            .root_type_name(operation.kind)
            .unwrap_or_default()
            .to_string();

        self.inject_variable_defaults(operation);

        let mut fragments = Vec::new();
        let nodes = self.selection_set(operation.selection_set, &root_type, &mut fragments);
        if !self.errors.is_empty() {
            return Err(self.errors);
        }
        let nodes = merge(source, nodes);

        let mut output = Document::default();
        let selection_set = self.emit_selection_set(&mut output, &nodes);
        let directives = self.emit_directives(&mut output, &operation.directives);

        let mut variable_definitions = Vec::new();
        let mut defined = HashSet::new();
        for r in &operation.variable_definitions {
            let definition = source.variable_definition(*r);
            if !self.used_variables.contains(&definition.name) {
                continue;
            }
            let ty = output.import_type(source, definition.ty);
            let default_value = definition
                .default_value
                .map(|value| output.import_value(source, value));
            let directives = self.emit_directives(&mut output, &definition.directives);
            defined.insert(definition.name.clone());
            variable_definitions.push(output.add_variable_definition(VariableDefinition {
                name: definition.name.clone(),
                ty,
                default_value,
                directives,
            }));
        }
        for extracted in std::mem::take(&mut self.extracted) {
            defined.insert(extracted.name.clone());
            variable_definitions.push(output.add_variable_definition(VariableDefinition {
                name: extracted.name.clone(),
                ty: extracted.ty,
                default_value: None,
                directives: Vec::new(),
            }));
            self.variables.insert(extracted.name.as_str(), extracted.value);
        }

        let unused: Vec<String> = self
            .variables
            .keys()
            .filter(|name| !defined.contains(name.as_str()))
            .map(|name| name.as_str().to_string())
            .collect();
        for name in unused {
            self.variables.remove(name.as_str());
        }

        output.add_operation(OperationDefinition {
            kind: operation.kind,
            name: operation.name.clone(),
            variable_definitions,
            directives,
            selection_set,
            position: operation.position,
        });
        Ok(output)
    }

    fn inject_variable_defaults(&mut self, operation: &OperationDefinition) {
        let source = self.source;
        for r in &operation.variable_definitions {
            let definition = source.variable_definition(*r);
            let ty = FieldType::from_document(source, definition.ty);
            if !self.variables.contains_key(definition.name.as_str()) {
                if let Some(default_value) = definition.default_value {
                    let value = source.value_to_json(default_value, &Object::new());
                    self.variables.insert(definition.name.as_str(), value);
                }
            }
            if let Some(value) = self.variables.get_mut(definition.name.as_str()) {
                coerce_input_value(value, &ty, self.schema);
            }
        }
    }

    /// Evaluates `@skip` and `@include`. Returns `None` when the selection is excluded,
    /// otherwise the directives left to keep.
    fn evaluate_directives(&self, directives: &[DirectiveRef]) -> Option<Vec<DirectiveRef>> {
        let source = self.source;
        let mut kept = Vec::with_capacity(directives.len());
        for r in directives {
            let directive = source.directive(*r);
            let condition = match directive.name.as_str() {
                "skip" | "include" => directive
                    .arguments
                    .iter()
                    .find(|argument| argument.name == "if")
                    .and_then(|argument| {
                        source
                            .value_to_json(argument.value, &*self.variables)
                            .as_bool()
                    }),
                _ => None,
            };
            match (directive.name.as_str(), condition) {
                ("skip", Some(true)) | ("include", Some(false)) => return None,
                ("skip", Some(false)) | ("include", Some(true)) => {}
                _ => kept.push(*r),
            }
        }
        Some(kept)
    }

    fn selection_set(
        &mut self,
        r: SelectionSetRef,
        parent_type: &str,
        fragments: &mut Vec<String>,
    ) -> Vec<Node> {
        let source = self.source;
        let mut nodes = Vec::new();
        for selection in &source.selection_set(r).selections {
            match *selection {
                Selection::Field(r) => {
                    let field = source.field(r);
                    let Some(directives) = self.evaluate_directives(&field.directives) else {
                        continue;
                    };
                    let selection_set = field.selection_set.map(|set| {
                        let field_type = self
                            .schema
                            .field_type(parent_type, &field.name)
                            .map(|ty| ty.inner_type_name().to_string())
                            .unwrap_or_default();
                        let children = self.selection_set(set, &field_type, fragments);
                        if children.is_empty() {
                            vec![Node::typename_placeholder(&field_type)]
                        } else {
                            children
                        }
                    });
                    nodes.push(Node::Field {
                        alias: field.alias.clone().filter(|alias| *alias != field.name),
                        name: field.name.clone(),
                        parent_type: parent_type.to_string(),
                        arguments: field.arguments.clone(),
                        directives,
                        selection_set,
                        position: field.position,
                    });
                }
                Selection::InlineFragment(r) => {
                    let fragment = source.inline_fragment(r);
                    let Some(directives) = self.evaluate_directives(&fragment.directives) else {
                        continue;
                    };
                    let type_condition = fragment.type_condition.as_deref().unwrap_or(parent_type);
                    let children = self.selection_set(fragment.selection_set, type_condition, fragments);
                    push_fragment(
                        &mut nodes,
                        fragment.type_condition.clone(),
                        parent_type,
                        directives,
                        children,
                        fragment.position,
                    );
                }
                Selection::FragmentSpread(r) => {
                    let spread = source.fragment_spread(r);
                    let Some(directives) = self.evaluate_directives(&spread.directives) else {
                        continue;
                    };
                    let Some(fragment) = source.fragment_by_name(&spread.name) else {
                        self.errors.push(error(
                            format!("Unknown fragment \"{}\".", spread.name),
                            spread.position,
                        ));
                        continue;
                    };
                    if fragments.contains(&spread.name) {
                        self.errors.push(error(
                            format!("Cannot spread fragment \"{}\" within itself.", spread.name),
                            spread.position,
                        ));
                        continue;
                    }
                    let fragment = source.fragment(fragment);
                    fragments.push(spread.name.clone());
                    let children =
                        self.selection_set(fragment.selection_set, &fragment.type_condition, fragments);
                    fragments.pop();
                    push_fragment(
                        &mut nodes,
                        Some(fragment.type_condition.clone()),
                        parent_type,
                        directives,
                        children,
                        spread.position,
                    );
                }
            }
        }
        nodes
    }

    fn emit_selection_set(&mut self, output: &mut Document, nodes: &[Node]) -> SelectionSetRef {
        let mut selections = Vec::with_capacity(nodes.len());
        for node in nodes {
            match node {
                Node::Field {
                    alias,
                    name,
                    parent_type,
                    arguments,
                    directives,
                    selection_set,
                    position,
                } => {
                    let arguments = arguments
                        .iter()
                        .map(|argument| Argument {
                            name: argument.name.clone(),
                            value: self.emit_argument(output, parent_type, name, argument),
                        })
                        .collect();
                    let directives = self.emit_directives(output, directives);
                    let selection_set = selection_set
                        .as_ref()
                        .map(|set| self.emit_selection_set(output, set));
                    selections.push(Selection::Field(output.add_field(Field {
                        alias: alias.clone(),
                        name: name.clone(),
                        arguments,
                        directives,
                        selection_set,
                        position: *position,
                    })));
                }
                Node::InlineFragment {
                    type_condition,
                    directives,
                    selection_set,
                    position,
                } => {
                    let directives = self.emit_directives(output, directives);
                    let selection_set = self.emit_selection_set(output, selection_set);
                    selections.push(Selection::InlineFragment(output.add_inline_fragment(
                        InlineFragment {
                            type_condition: type_condition.clone(),
                            directives,
                            selection_set,
                            position: *position,
                        },
                    )));
                }
            }
        }
        output.add_selection_set(SelectionSet { selections })
    }

    fn emit_directives(&mut self, output: &mut Document, directives: &[DirectiveRef]) -> Vec<DirectiveRef> {
        let source = self.source;
        directives
            .iter()
            .map(|r| {
                let directive = source.directive(*r);
                let arguments = directive
                    .arguments
                    .iter()
                    .map(|argument| {
                        collect_variables(source, argument.value, &mut self.used_variables);
                        Argument {
                            name: argument.name.clone(),
                            value: output.import_value(source, argument.value),
                        }
                    })
                    .collect();
                output.add_directive(Directive {
                    name: directive.name.clone(),
                    arguments,
                })
            })
            .collect()
    }

    /// Replaces a literal argument with a variable holding its value.
    ///
    /// Identical literals of the same type share one variable.
    fn emit_argument(
        &mut self,
        output: &mut Document,
        parent_type: &str,
        field_name: &str,
        argument: &Argument,
    ) -> ValueRef {
        let source = self.source;
        if let ast::Value::Variable(name) = source.value(argument.value) {
            self.used_variables.insert(name.clone());
            return output.add_value(ast::Value::Variable(name.clone()));
        }

        let definition = self
            .schema
            .field_definition(parent_type, field_name)
            .and_then(|field| field.arguments.iter().find(|a| a.name == argument.name));
        let Some(definition) = definition else {
            collect_variables(source, argument.value, &mut self.used_variables);
            return output.import_value(source, argument.value);
        };

        let schema_document = self.schema.document();
        let mut value = source.value_to_json(argument.value, &*self.variables);
        coerce_input_value(
            &mut value,
            &FieldType::from_document(schema_document, definition.ty),
            self.schema,
        );
        let printed_type = ast::print_type(schema_document, definition.ty);
        let existing = self
            .extracted
            .iter()
            .find(|extracted| extracted.value == value && extracted.printed_type == printed_type)
            .map(|extracted| extracted.name.clone());
        let name = match existing {
            Some(name) => name,
            None => {
                let name = self.next_variable_name();
                let ty = output.import_type(schema_document, definition.ty);
                self.extracted.push(Extracted {
                    name: name.clone(),
                    value,
                    printed_type,
                    ty,
                });
                name
            }
        };
        output.add_value(ast::Value::Variable(name))
    }

    /// `a`, `b`, ... `z`, `aa`, `ab`, ... skipping names already in use.
    fn next_variable_name(&mut self) -> String {
        loop {
            let mut index = self.next_variable;
            self.next_variable += 1;
            let mut name = String::new();
            loop {
                name.insert(0, (b'a' + (index % 26) as u8) as char);
                if index < 26 {
                    break;
                }
                index = index / 26 - 1;
            }
            let taken = self.variables.contains_key(name.as_str())
                || self.source.variable_definitions.iter().any(|d| d.name == name)
                || self.extracted.iter().any(|e| e.name == name);
            if !taken {
                return name;
            }
        }
    }
}

fn push_fragment(
    nodes: &mut Vec<Node>,
    type_condition: Option<String>,
    parent_type: &str,
    directives: Vec<DirectiveRef>,
    children: Vec<Node>,
    position: Position,
) {
    if children.is_empty() {
        return;
    }
    let on_parent = type_condition
        .as_deref()
        .map(|type_condition| type_condition == parent_type)
        .unwrap_or(true);
    if on_parent && directives.is_empty() {
        nodes.extend(children);
    } else {
        nodes.push(Node::InlineFragment {
            type_condition,
            directives,
            selection_set: children,
            position,
        });
    }
}

/// Merges fields with the same response key and arguments, and inline fragments with the same
/// type condition, keeping the position of the first occurrence.
fn merge(source: &Document, nodes: Vec<Node>) -> Vec<Node> {
    let mut merged: Vec<Node> = Vec::with_capacity(nodes.len());
    for node in nodes {
        let existing = merged
            .iter_mut()
            .find(|existing| mergeable(source, existing, &node));
        match (existing, node) {
            (
                Some(Node::Field {
                    selection_set: Some(existing),
                    ..
                }),
                Node::Field {
                    selection_set: Some(other),
                    ..
                },
            ) => existing.extend(other),
            (
                Some(Node::InlineFragment {
                    selection_set: existing,
                    ..
                }),
                Node::InlineFragment {
                    selection_set: other,
                    ..
                },
            ) => existing.extend(other),
            (Some(_), _) => {}
            (None, node) => merged.push(node),
        }
    }

    for node in merged.iter_mut() {
        match node {
            Node::Field {
                selection_set: Some(selection_set),
                ..
            }
            | Node::InlineFragment { selection_set, .. } => {
                let children = std::mem::take(selection_set);
                *selection_set = merge(source, children);
                // the placeholder is only needed when nothing else is selected
                if selection_set.len() > 1 {
                    selection_set.retain(|child| {
                        !matches!(child, Node::Field { alias: Some(alias), .. } if alias == TYPENAME_PLACEHOLDER)
                    });
                }
            }
            Node::Field { .. } => {}
        }
    }
    merged
}

fn mergeable(source: &Document, left: &Node, right: &Node) -> bool {
    match (left, right) {
        (
            Node::Field {
                alias: left_alias,
                name: left_name,
                arguments: left_arguments,
                directives: left_directives,
                ..
            },
            Node::Field {
                alias: right_alias,
                name: right_name,
                arguments: right_arguments,
                directives: right_directives,
                ..
            },
        ) => {
            left_alias == right_alias
                && left_name == right_name
                && printed_arguments(source, left_arguments)
                    == printed_arguments(source, right_arguments)
                && printed_directives(source, left_directives)
                    == printed_directives(source, right_directives)
        }
        (
            Node::InlineFragment {
                type_condition: left_type,
                directives: left_directives,
                ..
            },
            Node::InlineFragment {
                type_condition: right_type,
                directives: right_directives,
                ..
            },
        ) => {
            left_type == right_type
                && printed_directives(source, left_directives)
                    == printed_directives(source, right_directives)
        }
        _ => false,
    }
}

fn printed_arguments(source: &Document, arguments: &[Argument]) -> Vec<(String, String)> {
    arguments
        .iter()
        .map(|argument| {
            (
                argument.name.clone(),
                ast::print_value(source, argument.value),
            )
        })
        .collect()
}

fn printed_directives(source: &Document, directives: &[DirectiveRef]) -> Vec<String> {
    directives
        .iter()
        .map(|r| {
            let directive = source.directive(*r);
            let arguments = printed_arguments(source, &directive.arguments);
            format!("{}{:?}", directive.name, arguments)
        })
        .collect()
}

fn collect_variables(document: &Document, r: ValueRef, used: &mut IndexSet<String>) {
    match document.value(r) {
        ast::Value::Variable(name) => {
            used.insert(name.clone());
        }
        ast::Value::List(items) => {
            for item in items {
                collect_variables(document, *item, used);
            }
        }
        ast::Value::Object(fields) => {
            for (_, value) in fields {
                collect_variables(document, *value, used);
            }
        }
        _ => {}
    }
}

fn error(message: String, position: Position) -> graphql::Error {
    graphql::Error::builder()
        .message(message)
        .location(Location {
            line: position.line,
            column: position.column,
        })
        .extension_code("GRAPHQL_VALIDATION_FAILED")
        .build()
}
