//! Response shape of an operation, used to format the merged upstream data.

use std::collections::HashSet;

use crate::ast::Document;
use crate::ast::OperationRef;
use crate::ast::Selection as AstSelection;
use crate::ast::SelectionSetRef;
use crate::error::PlanningError;
use crate::graphql::Error;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::PathElement;
use crate::json_ext::Value;
use crate::json_ext::ValueExt;
use crate::normalization::TYPENAME_PLACEHOLDER;
use crate::query_planner::OperationKind;
use crate::spec::FieldType;
use crate::spec::InvalidValue;
use crate::spec::Schema;

pub(crate) const TYPENAME: &str = "__typename";

/// The selections of an operation, resolved against the schema.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Selection {
    Field {
        response_key: String,
        field_type: FieldType,
        selection_set: Vec<Selection>,
    },
    InlineFragment {
        type_condition: String,
        /// Concrete types the fragment applies to.
        possible_types: HashSet<String>,
        selection_set: Vec<Selection>,
    },
}

/// The response shape of a normalized operation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Query {
    pub(crate) kind: OperationKind,
    pub(crate) root_type: String,
    pub(crate) selection_set: Vec<Selection>,
}

impl Query {
    pub(crate) fn from_operation(
        document: &Document,
        operation: OperationRef,
        schema: &Schema,
    ) -> Result<Self, PlanningError> {
        let operation = document.operation(operation);
        let root_type = schema
            .root_type_name(operation.kind)
            .ok_or_else(|| PlanningError::MissingRootType {
                kind: operation.kind.to_string(),
            })?
            .to_string();
        let selection_set =
            Self::selection_set(document, operation.selection_set, &root_type, schema)?;
        Ok(Self {
            kind: operation.kind,
            root_type,
            selection_set,
        })
    }

    fn selection_set(
        document: &Document,
        selection_set: SelectionSetRef,
        parent_type: &str,
        schema: &Schema,
    ) -> Result<Vec<Selection>, PlanningError> {
        document
            .selection_set(selection_set)
            .selections
            .iter()
            // placeholders only keep emptied selections valid upstream
            .filter(|selection| match selection {
                AstSelection::Field(r) => {
                    document.field(*r).alias.as_deref() != Some(TYPENAME_PLACEHOLDER)
                }
                _ => true,
            })
            .map(|selection| match selection {
                AstSelection::Field(r) => {
                    let field = document.field(*r);
                    let field_type = schema.field_type(parent_type, &field.name).ok_or_else(
                        || PlanningError::UnknownField {
                            type_name: parent_type.to_string(),
                            field_name: field.name.clone(),
                        },
                    )?;
                    let selection_set = match field.selection_set {
                        Some(set) => {
                            Self::selection_set(document, set, field_type.inner_type_name(), schema)?
                        }
                        None => Vec::new(),
                    };
                    Ok(Selection::Field {
                        response_key: field.response_key().to_string(),
                        field_type,
                        selection_set,
                    })
                }
                AstSelection::InlineFragment(r) => {
                    let fragment = document.inline_fragment(*r);
                    let type_condition = fragment
                        .type_condition
                        .clone()
                        .unwrap_or_else(|| parent_type.to_string());
                    let possible_types = schema
                        .possible_types(&type_condition)
                        .into_iter()
                        .map(str::to_string)
                        .collect();
                    Ok(Selection::InlineFragment {
                        selection_set: Self::selection_set(
                            document,
                            fragment.selection_set,
                            &type_condition,
                            schema,
                        )?,
                        type_condition,
                        possible_types,
                    })
                }
                AstSelection::FragmentSpread(r) => Err(PlanningError::UnnormalizedFragmentSpread {
                    name: document.fragment_spread(*r).name.clone(),
                }),
            })
            .collect()
    }

    /// Shapes the merged upstream data after the operation's selections.
    ///
    /// Fields that were not selected (keys fetched for entity resolution) are dropped, fields
    /// appear in selection order, and a null in a non-null position nulls the closest nullable
    /// ancestor while recording an error, unless an error was already reported at or below
    /// that path.
    pub(crate) fn format_response(&self, data: Option<Value>, errors: &mut Vec<Error>) -> Value {
        let input = match data {
            Some(Value::Object(object)) => object,
            _ => return Value::Null,
        };
        let mut output = Object::new();
        let mut path = Path::empty();
        match self.apply_selection_set(
            &self.selection_set,
            &self.root_type,
            &input,
            &mut output,
            &mut path,
            errors,
        ) {
            Ok(()) => Value::Object(output),
            Err(InvalidValue) => Value::Null,
        }
    }

    fn format_value(
        &self,
        field_type: &FieldType,
        input: Value,
        path: &mut Path,
        selection_set: &[Selection],
        errors: &mut Vec<Error>,
    ) -> Result<Value, InvalidValue> {
        match field_type {
            // the error goes up until the next nullable parent
            FieldType::NonNull(inner_type) => {
                let value = self.format_value(inner_type, input, path, selection_set, errors)?;
                if value.is_null() {
                    let already_reported = errors.iter().any(|error| {
                        error
                            .path
                            .as_ref()
                            .map(|error_path| path.is_prefix_of(error_path))
                            .unwrap_or(false)
                    });
                    if !already_reported {
                        errors.push(
                            Error::builder()
                                .message(format!(
                                    "Cannot return null for non-nullable field '{}'.",
                                    self.field_coordinate(path)
                                ))
                                .path(path.clone())
                                .build(),
                        );
                    }
                    Err(InvalidValue)
                } else {
                    Ok(value)
                }
            }
            FieldType::List(inner_type) => match input {
                Value::Array(items) => {
                    let mut output = Vec::with_capacity(items.len());
                    for (index, item) in items.into_iter().enumerate() {
                        path.push(PathElement::Index(index));
                        let formatted =
                            self.format_value(inner_type, item, path, selection_set, errors);
                        path.pop();
                        match formatted {
                            Ok(value) => output.push(value),
                            // a null item that cannot be null nulls the whole list
                            Err(InvalidValue) => return Ok(Value::Null),
                        }
                    }
                    Ok(Value::Array(output))
                }
                _ => Ok(Value::Null),
            },
            FieldType::Named(type_name) if !selection_set.is_empty() => match input {
                Value::Object(input) => {
                    let concrete_type = input
                        .get(TYPENAME)
                        .and_then(|v| v.as_str())
                        .unwrap_or(type_name)
                        .to_string();
                    let mut output = Object::new();
                    match self.apply_selection_set(
                        selection_set,
                        &concrete_type,
                        &input,
                        &mut output,
                        path,
                        errors,
                    ) {
                        Ok(()) => Ok(Value::Object(output)),
                        Err(InvalidValue) => Ok(Value::Null),
                    }
                }
                _ => Ok(Value::Null),
            },
            FieldType::Int => Ok(match input {
                Value::Number(n) if n.is_i64() || n.is_u64() => Value::Number(n),
                _ => Value::Null,
            }),
            FieldType::Float => Ok(match input {
                Value::Number(n) => Value::Number(n),
                _ => Value::Null,
            }),
            FieldType::Boolean => Ok(match input {
                Value::Bool(b) => Value::Bool(b),
                _ => Value::Null,
            }),
            FieldType::String => Ok(match input {
                Value::String(s) => Value::String(s),
                _ => Value::Null,
            }),
            FieldType::Id => Ok(match input {
                Value::String(s) => Value::String(s),
                Value::Number(n) => Value::String(n.to_string().into()),
                _ => Value::Null,
            }),
            // enums and custom scalars are passed through
            FieldType::Named(_) => Ok(input),
        }
    }

    fn apply_selection_set(
        &self,
        selection_set: &[Selection],
        concrete_type: &str,
        input: &Object,
        output: &mut Object,
        path: &mut Path,
        errors: &mut Vec<Error>,
    ) -> Result<(), InvalidValue> {
        for selection in selection_set {
            match selection {
                Selection::Field {
                    response_key,
                    field_type,
                    selection_set,
                } => {
                    if response_key == TYPENAME {
                        let typename = match input.get(TYPENAME) {
                            Some(Value::String(s)) => Value::String(s.clone()),
                            _ => Value::String(concrete_type.into()),
                        };
                        output.insert(response_key.as_str(), typename);
                        continue;
                    }

                    let input_value = input.get(response_key.as_str()).cloned().unwrap_or(Value::Null);
                    path.push(PathElement::Key(response_key.clone()));
                    let formatted =
                        self.format_value(field_type, input_value, path, selection_set, errors);
                    path.pop();
                    let value = formatted?;
                    match output.get_mut(response_key.as_str()) {
                        Some(existing) => existing.deep_merge(value),
                        None => {
                            output.insert(response_key.as_str(), value);
                        }
                    }
                }
                Selection::InlineFragment {
                    type_condition,
                    possible_types,
                    selection_set,
                } => {
                    if type_condition == concrete_type || possible_types.contains(concrete_type) {
                        self.apply_selection_set(
                            selection_set,
                            concrete_type,
                            input,
                            output,
                            path,
                            errors,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    /// `Query.topProducts.reviews` for the path `topProducts/0/reviews`.
    fn field_coordinate(&self, path: &Path) -> String {
        let mut coordinate = self.root_type.clone();
        for element in path.iter() {
            if let PathElement::Key(key) = element {
                coordinate.push('.');
                coordinate.push_str(key);
            }
        }
        coordinate
    }
}
