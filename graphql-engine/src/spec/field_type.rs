use std::fmt;

use crate::ast::Document;
use crate::ast::Type;
use crate::ast::TypeRef;
use crate::json_ext::Value;
use crate::spec::Schema;

#[derive(Debug)]
pub(crate) struct InvalidValue;

// Primitives are taken from scalars: https://spec.graphql.org/draft/#sec-Scalars
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Named(String),
    List(Box<FieldType>),
    NonNull(Box<FieldType>),
    String,
    Int,
    Float,
    Id,
    Boolean,
}

impl FieldType {
    pub(crate) fn from_document(document: &Document, ty: TypeRef) -> Self {
        match document.ty(ty) {
            Type::Named(name) => match name.as_str() {
                "String" => FieldType::String,
                "Int" => FieldType::Int,
                "Float" => FieldType::Float,
                "ID" => FieldType::Id,
                "Boolean" => FieldType::Boolean,
                _ => FieldType::Named(name.clone()),
            },
            Type::List(inner) => FieldType::List(Box::new(Self::from_document(document, *inner))),
            Type::NonNull(inner) => {
                FieldType::NonNull(Box::new(Self::from_document(document, *inner)))
            }
        }
    }

    /// Checks a variable value against this input type.
    ///
    /// Lists accept a single item, which is coerced to a one element list during normalization.
    pub(crate) fn validate_input_value(
        &self,
        value: &Value,
        schema: &Schema,
    ) -> Result<(), InvalidValue> {
        match (self, value) {
            (FieldType::NonNull(inner_ty), value) => {
                if value.is_null() {
                    Err(InvalidValue)
                } else {
                    inner_ty.validate_input_value(value, schema)
                }
            }
            // NOTE: graphql's types are all optional by default
            (_, Value::Null) => Ok(()),
            (FieldType::String, Value::String(_)) => Ok(()),
            // Spec: https://spec.graphql.org/June2018/#sec-Int
            (FieldType::Int, Value::Number(number)) => number
                .as_i64()
                .and_then(|x| i32::try_from(x).ok())
                .map(|_| ())
                .ok_or(InvalidValue),
            // Spec: https://spec.graphql.org/draft/#sec-Float
            (FieldType::Float, Value::Number(_)) => Ok(()),
            // "The ID scalar type represents a unique identifier, often used to refetch an object
            // or as the key for a cache. The ID type is serialized in the same way as a String;
            // however, it is not intended to be human-readable. While it is often numeric, it
            // should always serialize as a String."
            //
            // In practice it seems Int works too
            (FieldType::Id, Value::String(_) | Value::Number(_)) => Ok(()),
            (FieldType::Boolean, Value::Bool(_)) => Ok(()),
            (FieldType::List(inner_ty), Value::Array(vec)) => vec
                .iter()
                .try_for_each(|x| inner_ty.validate_input_value(x, schema)),
            (FieldType::List(inner_ty), value) => inner_ty.validate_input_value(value, schema),
            (FieldType::Named(name), value) => schema.validate_named_input(name, value),
            _ => Err(InvalidValue),
        }
    }

    /// return the name of the type on which selections happen
    ///
    /// Example if we get the field `list: [User!]!`, it will return "User"
    pub fn inner_type_name(&self) -> &str {
        match self {
            FieldType::Named(name) => name.as_str(),
            FieldType::List(inner) | FieldType::NonNull(inner) => inner.inner_type_name(),
            FieldType::String => "String",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Id => "ID",
            FieldType::Boolean => "Boolean",
        }
    }

    pub fn is_builtin_scalar(&self) -> bool {
        match self {
            FieldType::Named(_) | FieldType::List(_) | FieldType::NonNull(_) => false,
            FieldType::String
            | FieldType::Int
            | FieldType::Float
            | FieldType::Id
            | FieldType::Boolean => true,
        }
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, FieldType::NonNull(_))
    }

    /// Whether the type holds a list at any depth.
    pub fn is_list(&self) -> bool {
        match self {
            FieldType::List(_) => true,
            FieldType::NonNull(inner) => inner.is_list(),
            _ => false,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::List(inner) => write!(f, "[{inner}]"),
            FieldType::NonNull(inner) => write!(f, "{inner}!"),
            other => f.write_str(other.inner_type_name()),
        }
    }
}
