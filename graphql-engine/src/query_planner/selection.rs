//! Representations: the part of a parent object an entity or nested fetch needs.

use serde::Deserialize;
use serde::Serialize;

use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::json_ext::ValueExt;
use crate::spec::Schema;
use crate::spec::TYPENAME;

/// One requirement on a parent object.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum Selection {
    /// Copies the value stored under `response_key` (or `name`) into the representation as
    /// `name`, narrowed to `children` when the field is composite.
    Field {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_key: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        children: Vec<Selection>,
    },

    /// Applies `children` to objects whose `__typename` is, or implements, `type_name`.
    OnType {
        type_name: String,
        children: Vec<Selection>,
    },
}

/// Builds the representation of `value`.
///
/// `None` when `value` is not an object or lacks a required field: such an object cannot be
/// fetched from another source.
pub(crate) fn select_representation(
    value: &Value,
    requires: &[Selection],
    schema: &Schema,
) -> Option<Object> {
    let object = value.as_object()?;
    let mut representation = Object::with_capacity(requires.len());
    collect(object, requires, schema, &mut representation)?;
    Some(representation)
}

fn collect(
    object: &Object,
    requires: &[Selection],
    schema: &Schema,
    representation: &mut Object,
) -> Option<()> {
    for selection in requires {
        match selection {
            Selection::Field {
                name,
                response_key,
                children,
            } => {
                let found = object.get(response_key.as_deref().unwrap_or(name.as_str()))?;
                let selected = if children.is_empty() {
                    found.clone()
                } else {
                    select_nested(found, children, schema)?
                };
                match representation.get_mut(name.as_str()) {
                    Some(existing) => existing.deep_merge(selected),
                    None => {
                        representation.insert(name.as_str(), selected);
                    }
                }
            }
            Selection::OnType {
                type_name,
                children,
            } => {
                if satisfies(object, type_name, schema) {
                    collect(object, children, schema, representation)?;
                }
            }
        }
    }
    Some(())
}

fn select_nested(value: &Value, children: &[Selection], schema: &Schema) -> Option<Value> {
    match value {
        Value::Null => Some(Value::Null),
        Value::Array(items) => items
            .iter()
            .map(|item| select_nested(item, children, schema))
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        Value::Object(_) => select_representation(value, children, schema).map(Value::Object),
        _ => None,
    }
}

fn satisfies(object: &Object, type_name: &str, schema: &Schema) -> bool {
    match object.get(TYPENAME).and_then(Value::as_str) {
        Some(typename) if typename == type_name => true,
        Some(typename) => schema.is_abstract(type_name) && schema.is_subtype(type_name, typename),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    const SCHEMA: &str = r#"
        type Query { me: User }
        interface Node { id: ID! }
        type User implements Node { id: ID! name: String address: Address }
        type Product implements Node { id: ID! upc: String! }
        type Address { city: String zip: String }
    "#;

    fn field(name: &str) -> Selection {
        Selection::Field {
            name: name.to_string(),
            response_key: None,
            children: Vec::new(),
        }
    }

    fn on(type_name: &str, children: Vec<Selection>) -> Selection {
        Selection::OnType {
            type_name: type_name.to_string(),
            children,
        }
    }

    fn select(value: Value, requires: &[Selection]) -> Option<Value> {
        let schema = Schema::parse(SCHEMA).unwrap();
        select_representation(&value, requires, &schema).map(Value::Object)
    }

    #[test]
    fn selects_representation() {
        let requires = vec![on("User", vec![field("__typename"), field("id")])];

        assert_eq!(
            select(json!({"__typename": "User", "id": "1", "name": "Ada"}), &requires),
            Some(json!({"__typename": "User", "id": "1"}))
        );
        assert_eq!(
            select(json!({"__typename": "Product", "id": "2"}), &requires),
            Some(json!({}))
        );
    }

    #[test]
    fn abstract_type_condition() {
        assert_eq!(
            select(
                json!({"__typename": "Product", "id": "2"}),
                &[on("Node", vec![field("id")])]
            ),
            Some(json!({"id": "2"}))
        );
    }

    #[test]
    fn nested_fields_are_narrowed_and_aliases_resolved() {
        let requires = vec![
            Selection::Field {
                name: "id".to_string(),
                response_key: Some("_key_id".to_string()),
                children: Vec::new(),
            },
            Selection::Field {
                name: "address".to_string(),
                response_key: None,
                children: vec![field("zip")],
            },
        ];
        assert_eq!(
            select(
                json!({"_key_id": "1", "address": {"city": "Paris", "zip": "75001"}}),
                &requires
            ),
            Some(json!({"id": "1", "address": {"zip": "75001"}}))
        );
    }

    #[test]
    fn missing_key_has_no_representation() {
        assert_eq!(select(json!({"name": "Ada"}), &[field("id")]), None);
        assert_eq!(select(json!(null), &[field("id")]), None);
    }
}
