use std::collections::HashMap;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use url::Url;

use crate::json_ext::Value;

/// An upstream data source and the part of the schema it resolves.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DataSourceConfiguration {
    /// Unique identifier of the data source.
    pub id: String,

    /// How the data source is reached.
    pub kind: DataSourceKind,

    /// Fields this data source can resolve from the root of one of its operations.
    ///
    /// For federated subgraphs, entity types are root nodes too.
    #[serde(default)]
    pub root_nodes: Vec<TypeField>,

    /// Fields this data source can resolve below a root node.
    #[serde(default)]
    pub child_nodes: Vec<TypeField>,

    /// Federation metadata.
    #[serde(default)]
    pub federation: FederationMetaData,
}

/// Selects the factory producing the planning behavior and the executor of a data source.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataSourceKind {
    /// A GraphQL server reached over HTTP.
    Graphql {
        url: Url,
        /// Headers added to every upstream request.
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Always answers with the configured data.
    Static {
        #[schemars(with = "serde_json::Value")]
        data: Value,
    },
    /// Calls a resolver registered on the engine under this name.
    Custom { resolver: String },
}

/// A type and some of its fields.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TypeField {
    pub type_name: String,
    pub field_names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct FederationMetaData {
    /// `@key` directives, one entry per entity type.
    pub keys: Vec<FederationFieldConfiguration>,
    /// `@requires` directives, one entry per field.
    pub requires: Vec<FederationFieldConfiguration>,
}

/// A selection set attached to a type, or to one of its fields.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FederationFieldConfiguration {
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    /// e.g. `"id"` or `"upc sku"`.
    pub selection_set: String,
}

impl DataSourceConfiguration {
    pub(crate) fn has_root_node(&self, type_name: &str, field_name: &str) -> bool {
        contains(&self.root_nodes, type_name, field_name)
    }

    pub(crate) fn has_child_node(&self, type_name: &str, field_name: &str) -> bool {
        contains(&self.child_nodes, type_name, field_name)
    }

    pub(crate) fn resolves(&self, type_name: &str, field_name: &str) -> bool {
        self.has_root_node(type_name, field_name) || self.has_child_node(type_name, field_name)
    }

    pub(crate) fn key(&self, type_name: &str) -> Option<&FederationFieldConfiguration> {
        self.federation
            .keys
            .iter()
            .find(|key| key.type_name == type_name)
    }

    pub(crate) fn requires(
        &self,
        type_name: &str,
        field_name: &str,
    ) -> Option<&FederationFieldConfiguration> {
        self.federation.requires.iter().find(|requires| {
            requires.type_name == type_name && requires.field_name.as_deref() == Some(field_name)
        })
    }
}

fn contains(nodes: &[TypeField], type_name: &str, field_name: &str) -> bool {
    nodes
        .iter()
        .any(|node| node.type_name == type_name && node.field_names.iter().any(|f| f == field_name))
}

/// Per field planning configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FieldConfiguration {
    pub type_name: String,
    pub field_name: String,

    /// Where the field's argument values come from.
    #[serde(default)]
    pub arguments: Vec<ArgumentConfiguration>,

    /// Fields of the parent object that must be fetched to resolve this field.
    #[serde(default)]
    pub requires_fields: Vec<String>,

    /// Name of the field in the upstream schema, when it differs.
    #[serde(default)]
    pub path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ArgumentConfiguration {
    pub name: String,
    #[serde(default)]
    pub source: ArgumentSource,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArgumentSource {
    /// The argument is taken from the operation.
    #[default]
    Request,
    /// The argument is read from the parent object at this path.
    ParentObject { path: Vec<String> },
    /// The argument always has this value.
    Constant {
        #[schemars(with = "serde_json::Value")]
        value: Value,
    },
}

/// Field configurations indexed by type and field name.
#[derive(Debug, Clone, Default)]
pub struct FieldConfigurations {
    by_coordinate: HashMap<(String, String), FieldConfiguration>,
}

impl FieldConfigurations {
    pub fn get(&self, type_name: &str, field_name: &str) -> Option<&FieldConfiguration> {
        self.by_coordinate
            .get(&(type_name.to_string(), field_name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.by_coordinate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_coordinate.is_empty()
    }
}

impl FromIterator<FieldConfiguration> for FieldConfigurations {
    fn from_iter<T: IntoIterator<Item = FieldConfiguration>>(iter: T) -> Self {
        Self {
            by_coordinate: iter
                .into_iter()
                .map(|config| {
                    (
                        (config.type_name.clone(), config.field_name.clone()),
                        config,
                    )
                })
                .collect(),
        }
    }
}

impl FieldConfiguration {
    /// Arguments bound to the parent object, with their path.
    pub(crate) fn parent_arguments(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.arguments
            .iter()
            .filter_map(|argument| match &argument.source {
                ArgumentSource::ParentObject { path } => Some((argument.name.as_str(), &path[..])),
                _ => None,
            })
    }

    pub(crate) fn constant_arguments(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.arguments
            .iter()
            .filter_map(|argument| match &argument.source {
                ArgumentSource::Constant { value } => Some((argument.name.as_str(), value)),
                _ => None,
            })
    }

    /// Name of the field in the upstream schema.
    pub(crate) fn upstream_name(&self) -> Option<&str> {
        self.path.first().map(String::as_str)
    }
}
