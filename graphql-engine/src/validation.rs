//! Operation validation against a schema, and variable validation.
//!
//! This covers the rules the planner relies on, not the whole GraphQL rule catalog.

use std::collections::HashSet;

use crate::ast::Argument;
use crate::ast::DirectiveRef;
use crate::ast::Document;
use crate::ast::OperationRef;
use crate::ast::Position;
use crate::ast::Selection;
use crate::ast::SelectionSetRef;
use crate::ast::Value as AstValue;
use crate::ast::ValueRef;
use crate::error::ValidationErrors;
use crate::graphql;
use crate::graphql::Location;
use crate::json_ext::Object;
use crate::spec::FieldType;
use crate::spec::Schema;
use crate::spec::TYPENAME;

/// Outcome of [`crate::graphql::Request::validate_for_schema`] and
/// [`crate::graphql::Request::validate_input`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: ValidationErrors,
}

impl ValidationResult {
    pub(crate) fn valid() -> Self {
        Self {
            valid: true,
            errors: ValidationErrors::default(),
        }
    }

    fn from_errors(errors: Vec<graphql::Error>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors: ValidationErrors { errors },
        }
    }
}

/// Validates the selected operation against the schema.
pub(crate) fn validate_operation(
    document: &Document,
    operation_name: Option<&str>,
    schema: &Schema,
) -> ValidationResult {
    let Some(operation) = document.operation_by_name(operation_name) else {
        return ValidationResult::from_errors(vec![
            graphql::Error::builder()
                .message(format!(
                    "Unknown operation named \"{}\".",
                    operation_name.unwrap_or_default()
                ))
                .extension_code("GRAPHQL_VALIDATION_FAILED")
                .build(),
        ]);
    };
    let mut validator = Validator {
        document,
        schema,
        errors: Vec::new(),
        defined_variables: HashSet::new(),
        visited_fragments: Vec::new(),
    };
    validator.operation(operation);
    ValidationResult::from_errors(validator.errors)
}

/// Validates the provided variables against the variable definitions of the selected operation.
pub(crate) fn validate_variables(
    document: &Document,
    operation_name: Option<&str>,
    variables: &Object,
    schema: &Schema,
) -> ValidationResult {
    let Some(operation) = document.operation_by_name(operation_name) else {
        return ValidationResult::valid();
    };
    let mut errors = Vec::new();
    for r in &document.operation(operation).variable_definitions {
        let definition = document.variable_definition(*r);
        let ty = FieldType::from_document(document, definition.ty);
        match variables.get(definition.name.as_str()) {
            None if ty.is_non_null() && definition.default_value.is_none() => {
                errors.push(input_error(format!(
                    "Variable \"${}\" of required type \"{ty}\" was not provided.",
                    definition.name
                )));
            }
            None => {}
            Some(value) => {
                if ty.validate_input_value(value, schema).is_err() {
                    errors.push(input_error(format!(
                        "Variable \"${}\" got invalid value {}; expected type \"{ty}\".",
                        definition.name,
                        serde_json::to_string(value).unwrap_or_default()
                    )));
                }
            }
        }
    }
    ValidationResult::from_errors(errors)
}

fn input_error(message: String) -> graphql::Error {
    graphql::Error::builder()
        .message(message)
        .extension_code("BAD_USER_INPUT")
        .build()
}

struct Validator<'a> {
    document: &'a Document,
    schema: &'a Schema,
    errors: Vec<graphql::Error>,
    defined_variables: HashSet<&'a str>,
    visited_fragments: Vec<&'a str>,
}

impl<'a> Validator<'a> {
    fn error(&mut self, message: String, position: Position) {
        let mut builder = graphql::Error::builder()
            .message(message)
            .extension_code("GRAPHQL_VALIDATION_FAILED");
        if position.line > 0 {
            builder = builder.location(Location {
                line: position.line,
                column: position.column,
            });
        }
        self.errors.push(builder.build());
    }

    fn operation(&mut self, r: OperationRef) {
        let document = self.document;
        let schema = self.schema;
        let operation = document.operation(r);
        for r in &operation.variable_definitions {
            let definition = document.variable_definition(*r);
            self.defined_variables.insert(definition.name.as_str());
            let type_name = document.type_name(definition.ty);
            if !self.schema.is_input_type(type_name) {
                self.error(
                    format!(
                        "Variable \"${}\" cannot be non-input type \"{type_name}\".",
                        definition.name
                    ),
                    operation.position,
                );
            }
        }
        self.directives(&operation.directives, operation.position);

        let Some(root_type) = schema.root_type_name(operation.kind) else {
            self.error(
                format!("Schema is not configured for {} operations.", operation.kind),
                operation.position,
            );
            return;
        };
        self.selection_set(operation.selection_set, root_type);
    }

    fn selection_set(&mut self, r: SelectionSetRef, parent_type: &str) {
        let document = self.document;
        let schema = self.schema;
        for selection in &document.selection_set(r).selections {
            match *selection {
                Selection::Field(r) => {
                    let field = document.field(r);
                    self.directives(&field.directives, field.position);
                    if field.name == TYPENAME {
                        if field.selection_set.is_some() {
                            self.error(
                                format!("Field \"{TYPENAME}\" must not have a selection."),
                                field.position,
                            );
                        }
                        continue;
                    }
                    let Some(definition) = schema.field_definition(parent_type, &field.name)
                    else {
                        self.error(
                            format!(
                                "Cannot query field \"{}\" on type \"{parent_type}\".",
                                field.name
                            ),
                            field.position,
                        );
                        continue;
                    };
                    self.arguments(
                        &field.arguments,
                        &definition.arguments,
                        &format!("{parent_type}.{}", field.name),
                        field.position,
                    );

                    let schema_document = schema.document();
                    let type_name = schema_document.type_name(definition.ty);
                    let ty = FieldType::from_document(schema_document, definition.ty);
                    match (schema.is_leaf(type_name), field.selection_set) {
                        (true, Some(_)) => self.error(
                            format!(
                                "Field \"{}\" must not have a selection since type \"{ty}\" has no subfields.",
                                field.name
                            ),
                            field.position,
                        ),
                        (false, None) => self.error(
                            format!(
                                "Field \"{}\" of type \"{ty}\" must have a selection of subfields.",
                                field.name
                            ),
                            field.position,
                        ),
                        (false, Some(set)) => self.selection_set(set, type_name),
                        (true, None) => {}
                    }
                }
                Selection::InlineFragment(r) => {
                    let fragment = document.inline_fragment(r);
                    self.directives(&fragment.directives, fragment.position);
                    let type_condition = match &fragment.type_condition {
                        Some(type_condition) => type_condition.as_str(),
                        None => parent_type,
                    };
                    if self.type_condition(type_condition, parent_type, fragment.position) {
                        self.selection_set(fragment.selection_set, type_condition);
                    }
                }
                Selection::FragmentSpread(r) => {
                    let spread = document.fragment_spread(r);
                    self.directives(&spread.directives, spread.position);
                    let Some(fragment) = document.fragment_by_name(&spread.name) else {
                        self.error(
                            format!("Unknown fragment \"{}\".", spread.name),
                            spread.position,
                        );
                        continue;
                    };
                    if self.visited_fragments.contains(&spread.name.as_str()) {
                        continue;
                    }
                    let fragment = document.fragment(fragment);
                    if self.type_condition(&fragment.type_condition, parent_type, spread.position) {
                        self.visited_fragments.push(spread.name.as_str());
                        self.selection_set(fragment.selection_set, &fragment.type_condition);
                        self.visited_fragments.pop();
                    }
                }
            }
        }
    }

    fn type_condition(&mut self, type_condition: &str, parent_type: &str, position: Position) -> bool {
        if !self.schema.is_composite(type_condition) {
            self.error(
                format!("Unknown type \"{type_condition}\"."),
                position,
            );
            return false;
        }
        if !self.schema.types_overlap(parent_type, type_condition) {
            self.error(
                format!(
                    "Fragment cannot be spread here as objects of type \"{parent_type}\" can never be of type \"{type_condition}\"."
                ),
                position,
            );
            return false;
        }
        true
    }

    fn arguments(
        &mut self,
        arguments: &[Argument],
        definitions: &[crate::ast::InputValueDefinition],
        coordinate: &str,
        position: Position,
    ) {
        for argument in arguments {
            if !definitions.iter().any(|d| d.name == argument.name) {
                self.error(
                    format!(
                        "Unknown argument \"{}\" on field \"{coordinate}\".",
                        argument.name
                    ),
                    position,
                );
            }
            self.value(argument.value, position);
        }
        let schema = self.schema;
        let schema_document = schema.document();
        for definition in definitions {
            let required =
                schema_document.is_non_null(definition.ty) && definition.default_value.is_none();
            if required && !arguments.iter().any(|a| a.name == definition.name) {
                self.error(
                    format!(
                        "Field \"{coordinate}\" argument \"{}\" of type \"{}\" is required, but it was not provided.",
                        definition.name,
                        FieldType::from_document(schema_document, definition.ty)
                    ),
                    position,
                );
            }
        }
    }

    fn directives(&mut self, directives: &[DirectiveRef], position: Position) {
        let document = self.document;
        for r in directives {
            for argument in &document.directive(*r).arguments {
                self.value(argument.value, position);
            }
        }
    }

    fn value(&mut self, r: ValueRef, position: Position) {
        let document = self.document;
        match document.value(r) {
            AstValue::Variable(name) => {
                if !self.defined_variables.contains(name.as_str()) {
                    self.error(format!("Variable \"${name}\" is not defined."), position);
                }
            }
            AstValue::List(items) => {
                for item in items {
                    self.value(*item, position);
                }
            }
            AstValue::Object(fields) => {
                for (_, value) in fields {
                    self.value(*value, position);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use super::*;
    use crate::ast;

    const SCHEMA: &str = r#"
        type Query { hero: Character droid(id: ID!): Droid starship(id: ID!, unit: Unit = METER): Starship }
        interface Character { name: String! friends: [Character] }
        type Human implements Character { name: String! friends: [Character] }
        type Droid implements Character { name: String! friends: [Character] primaryFunction: String }
        type Starship { name: String! length(unit: Unit): Float }
        enum Unit { METER FOOT }
    "#;

    fn messages(query: &str) -> Vec<String> {
        let schema = Schema::parse(SCHEMA).unwrap();
        let document = ast::parse_executable(query).unwrap();
        validate_operation(&document, None, &schema)
            .errors
            .errors
            .into_iter()
            .map(|e| e.message)
            .collect()
    }

    #[test]
    fn valid_operation() {
        assert!(
            messages("query($id: ID!) { hero { name ... on Droid { primaryFunction } } droid(id: $id) { __typename } }")
                .is_empty()
        );
    }

    #[test]
    fn reports_field_errors() {
        assert_eq!(
            messages("{ hero { unknown friends } starship { name { x } } }"),
            vec![
                "Cannot query field \"unknown\" on type \"Character\".",
                "Field \"friends\" of type \"[Character]\" must have a selection of subfields.",
                "Field \"Query.starship\" argument \"id\" of type \"ID!\" is required, but it was not provided.",
                "Field \"name\" must not have a selection since type \"String!\" has no subfields.",
            ]
        );
    }

    #[test]
    fn reports_fragment_and_variable_errors() {
        assert_eq!(
            messages("{ hero { ... on Starship { name } } droid(id: $id, other: 1) { name } }"),
            vec![
                "Fragment cannot be spread here as objects of type \"Character\" can never be of type \"Starship\".",
                "Variable \"$id\" is not defined.",
                "Unknown argument \"other\" on field \"Query.droid\".",
            ]
        );
    }

    #[test]
    fn error_locations() {
        let schema = Schema::parse(SCHEMA).unwrap();
        let document = ast::parse_executable("{\n  hero {\n    unknown\n  }\n}").unwrap();
        let result = validate_operation(&document, None, &schema);
        assert!(!result.valid);
        assert_eq!(result.errors.errors[0].locations.len(), 1);
    }

    #[test]
    fn validates_variables() {
        let schema = Schema::parse(SCHEMA).unwrap();
        let document =
            ast::parse_executable("query($id: ID!, $unit: Unit) { starship(id: $id, unit: $unit) { name } }")
                .unwrap();
        let check = |variables: serde_json_bytes::Value| {
            validate_variables(&document, None, variables.as_object().unwrap(), &schema)
                .errors
                .errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
        };

        assert!(check(json!({"id": "1", "unit": "FOOT"})).is_empty());
        assert_eq!(
            check(json!({"unit": "FOOT"})),
            vec!["Variable \"$id\" of required type \"ID!\" was not provided."]
        );
        assert_eq!(
            check(json!({"id": 1, "unit": "INCH"})),
            vec!["Variable \"$unit\" got invalid value \"INCH\"; expected type \"Unit\"."]
        );
    }
}
