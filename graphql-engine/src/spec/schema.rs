//! GraphQL schema.

use std::collections::HashMap;
use std::collections::HashSet;
use std::str::FromStr;

use sha2::Digest;
use sha2::Sha256;

use crate::ast;
use crate::ast::Document;
use crate::ast::FieldDefinition;
use crate::ast::TypeDefinition;
use crate::ast::TypeDefinitionKind;
use crate::error::SchemaError;
use crate::json_ext::Value;
use crate::query_planner::OperationKind;
use crate::query_planner::QueryHash;
use crate::spec::FieldType;
use crate::spec::InvalidValue;

const BUILT_IN_SCALARS: [&str; 5] = ["Int", "Float", "String", "Boolean", "ID"];

/// A GraphQL schema: the SDL document plus lookup indices.
///
/// Immutable once built, shared behind an `Arc`.
#[derive(Debug)]
pub struct Schema {
    raw_sdl: String,
    document: Document,
    hash: QueryHash,
    types: HashMap<String, usize>,
    fields: HashMap<String, HashMap<String, usize>>,
    /// Abstract type name to the object types implementing it.
    possible_types: HashMap<String, HashSet<String>>,
    query_type: String,
    mutation_type: Option<String>,
    subscription_type: Option<String>,
}

impl Schema {
    pub fn parse(sdl: &str) -> Result<Self, SchemaError> {
        let mut document = ast::parse_type_system(sdl).map_err(SchemaError::Parse)?;

        for scalar in BUILT_IN_SCALARS {
            if !document.type_definitions.iter().any(|def| def.name == scalar) {
                document.add_type_definition(TypeDefinition::new(TypeDefinitionKind::Scalar, scalar));
            }
        }

        let mut types = HashMap::new();
        let mut fields: HashMap<String, HashMap<String, usize>> = HashMap::new();
        let mut possible_types: HashMap<String, HashSet<String>> = HashMap::new();
        for (index, definition) in document.type_definitions.iter().enumerate() {
            types.insert(definition.name.clone(), index);
            fields.insert(
                definition.name.clone(),
                definition
                    .fields
                    .iter()
                    .enumerate()
                    .map(|(i, f)| (f.name.clone(), i))
                    .collect(),
            );
            match definition.kind {
                TypeDefinitionKind::Object => {
                    for interface in &definition.interfaces {
                        possible_types
                            .entry(interface.clone())
                            .or_default()
                            .insert(definition.name.clone());
                    }
                }
                TypeDefinitionKind::Union => {
                    possible_types
                        .entry(definition.name.clone())
                        .or_default()
                        .extend(definition.union_members.iter().cloned());
                }
                _ => {}
            }
        }

        let roots = &document.root_operation_types;
        let root = |declared: &Option<String>, default: &str| {
            declared
                .clone()
                .or_else(|| types.contains_key(default).then(|| default.to_string()))
        };
        let query_type = root(&roots.query, "Query").ok_or(SchemaError::MissingQueryType)?;
        let mutation_type = root(&roots.mutation, "Mutation");
        let subscription_type = root(&roots.subscription, "Subscription");

        let schema = Self {
            raw_sdl: sdl.to_string(),
            hash: QueryHash(Sha256::digest(sdl.as_bytes()).to_vec()),
            document,
            types,
            fields,
            possible_types,
            query_type,
            mutation_type,
            subscription_type,
        };
        schema.check_references()?;
        Ok(schema)
    }

    fn check_references(&self) -> Result<(), SchemaError> {
        for definition in &self.document.type_definitions {
            let referenced = definition
                .fields
                .iter()
                .flat_map(|field| {
                    std::iter::once(field.ty)
                        .chain(field.arguments.iter().map(|argument| argument.ty))
                })
                .chain(definition.input_fields.iter().map(|field| field.ty))
                .map(|ty| self.document.type_name(ty))
                .chain(definition.interfaces.iter().map(String::as_str))
                .chain(definition.union_members.iter().map(String::as_str));
            for name in referenced {
                if !self.types.contains_key(name) {
                    return Err(SchemaError::UnknownType {
                        type_name: definition.name.clone(),
                        referenced: name.to_string(),
                    });
                }
            }
        }
        if !self.types.contains_key(&self.query_type) {
            return Err(SchemaError::MissingQueryType);
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.raw_sdl
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// SHA-256 of the SDL text.
    pub fn hash(&self) -> &QueryHash {
        &self.hash
    }

    pub fn root_type_name(&self, kind: OperationKind) -> Option<&str> {
        match kind {
            OperationKind::Query => Some(self.query_type.as_str()),
            OperationKind::Mutation => self.mutation_type.as_deref(),
            OperationKind::Subscription => self.subscription_type.as_deref(),
        }
    }

    pub fn type_definition(&self, name: &str) -> Option<&TypeDefinition> {
        self.types
            .get(name)
            .map(|index| &self.document.type_definitions[*index])
    }

    pub fn field_definition(&self, type_name: &str, field_name: &str) -> Option<&FieldDefinition> {
        let index = self.fields.get(type_name)?.get(field_name)?;
        Some(&self.type_definition(type_name)?.fields[*index])
    }

    /// The output type of a field. `__typename` is available on every composite type.
    pub fn field_type(&self, type_name: &str, field_name: &str) -> Option<FieldType> {
        if field_name == "__typename" && self.is_composite(type_name) {
            return Some(FieldType::NonNull(Box::new(FieldType::String)));
        }
        self.field_definition(type_name, field_name)
            .map(|field| FieldType::from_document(&self.document, field.ty))
    }

    pub fn is_composite(&self, name: &str) -> bool {
        matches!(
            self.type_definition(name).map(|def| def.kind),
            Some(
                TypeDefinitionKind::Object
                    | TypeDefinitionKind::Interface
                    | TypeDefinitionKind::Union
            )
        )
    }

    pub fn is_abstract(&self, name: &str) -> bool {
        matches!(
            self.type_definition(name).map(|def| def.kind),
            Some(TypeDefinitionKind::Interface | TypeDefinitionKind::Union)
        )
    }

    pub fn is_union(&self, name: &str) -> bool {
        matches!(
            self.type_definition(name).map(|def| def.kind),
            Some(TypeDefinitionKind::Union)
        )
    }

    pub fn is_leaf(&self, name: &str) -> bool {
        matches!(
            self.type_definition(name).map(|def| def.kind),
            Some(TypeDefinitionKind::Scalar | TypeDefinitionKind::Enum)
        )
    }

    pub fn is_input_type(&self, name: &str) -> bool {
        matches!(
            self.type_definition(name).map(|def| def.kind),
            Some(
                TypeDefinitionKind::Scalar
                    | TypeDefinitionKind::Enum
                    | TypeDefinitionKind::InputObject
            )
        )
    }

    /// Whether `maybe_subtype` is `abstract_type` itself or one of its possible types.
    pub fn is_subtype(&self, abstract_type: &str, maybe_subtype: &str) -> bool {
        abstract_type == maybe_subtype
            || self
                .possible_types
                .get(abstract_type)
                .map(|set| set.contains(maybe_subtype))
                .unwrap_or(false)
    }

    /// Concrete object types a value of type `name` may have.
    pub fn possible_types<'a>(&'a self, name: &'a str) -> HashSet<&'a str> {
        match self.possible_types.get(name) {
            Some(set) => set.iter().map(String::as_str).collect(),
            None if self.type_definition(name).map(|def| def.kind)
                == Some(TypeDefinitionKind::Object) =>
            {
                HashSet::from([name])
            }
            None => HashSet::new(),
        }
    }

    /// Whether a fragment on `type_condition` may ever apply within `parent_type`.
    pub fn types_overlap(&self, parent_type: &str, type_condition: &str) -> bool {
        if parent_type == type_condition {
            return true;
        }
        let parent = self.possible_types(parent_type);
        self.possible_types(type_condition)
            .iter()
            .any(|ty| parent.contains(ty))
    }

    pub(crate) fn validate_named_input(&self, name: &str, value: &Value) -> Result<(), InvalidValue> {
        let definition = self.type_definition(name).ok_or(InvalidValue)?;
        match definition.kind {
            // we cannot know about the expected format of custom scalars
            TypeDefinitionKind::Scalar => Ok(()),
            TypeDefinitionKind::Enum => match value.as_str() {
                Some(s) if definition.enum_values.iter().any(|v| v == s) => Ok(()),
                _ => Err(InvalidValue),
            },
            TypeDefinitionKind::InputObject => {
                let object = value.as_object().ok_or(InvalidValue)?;
                if object
                    .keys()
                    .any(|key| !definition.input_fields.iter().any(|f| f.name == key.as_str()))
                {
                    return Err(InvalidValue);
                }
                definition.input_fields.iter().try_for_each(|field| {
                    let ty = FieldType::from_document(&self.document, field.ty);
                    match object.get(field.name.as_str()) {
                        Some(value) => ty.validate_input_value(value, self),
                        None if ty.is_non_null() && field.default_value.is_none() => {
                            Err(InvalidValue)
                        }
                        None => Ok(()),
                    }
                })
            }
            _ => Err(InvalidValue),
        }
    }
}

impl FromStr for Schema {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
