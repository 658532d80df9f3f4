use derivative::Derivative;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value;

use crate::ast;
use crate::ast::Document;
use crate::error::ExecutionError;
use crate::json_ext::Object;
use crate::normalization;
use crate::normalization::NormalizationResult;
use crate::query_planner::OperationKind;
use crate::spec::Schema;
use crate::validation;
use crate::validation::ValidationResult;

/// A GraphQL `Request` used to represent both incoming and upstream requests.
///
/// The request caches its parsed document: parsing, normalizing and validating a request that
/// already went through those steps is a no-op.
#[derive(Clone, Derivative, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[derivative(Debug, PartialEq)]
pub struct Request {
    /// The GraphQL operation (e.g., query, mutation) string.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub query: Option<String>,

    /// The (optional) GraphQL operation name.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub operation_name: Option<String>,

    /// The (optional) GraphQL variables in the form of a JSON object.
    #[serde(
        skip_serializing_if = "Object::is_empty",
        default,
        deserialize_with = "deserialize_null_default"
    )]
    pub variables: Object,

    /// The (optional) GraphQL `extensions` of a GraphQL request.
    #[serde(skip_serializing_if = "Object::is_empty", default)]
    pub extensions: Object,

    #[serde(skip)]
    #[derivative(Debug = "ignore", PartialEq = "ignore")]
    state: RequestState,
}

#[derive(Clone, Default)]
struct RequestState {
    document: Document,
    parsed: bool,
    normalized: bool,
    valid: Option<bool>,
}

// NOTE: this deserialize helper is used to transform `null` to Default::default()
fn deserialize_null_default<'de, D, T: Default + Deserialize<'de>>(
    deserializer: D,
) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
{
    <Option<T>>::deserialize(deserializer).map(|x| x.unwrap_or_default())
}

#[buildstructor::buildstructor]
impl Request {
    /// This is the constructor (or builder) to use when constructing a GraphQL `Request`.
    #[builder(visibility = "pub")]
    fn new(
        query: Option<String>,
        operation_name: Option<String>,
        // Skip the `Object` type alias in order to use buildstructor’s map special-casing
        variables: JsonMap<ByteString, Value>,
        extensions: JsonMap<ByteString, Value>,
    ) -> Self {
        Self {
            query,
            operation_name,
            variables,
            extensions,
            state: RequestState::default(),
        }
    }

    /// Clears the request so it can be reused, keeping the document arena's capacity.
    pub fn reset(&mut self) {
        self.query = None;
        self.operation_name = None;
        self.variables.clear();
        self.extensions.clear();
        self.state.document.reset();
        self.state.parsed = false;
        self.state.normalized = false;
        self.state.valid = None;
    }

    /// Parses the query text into the request's document. Parsing twice is a no-op.
    pub fn parse(&mut self) -> Result<(), ExecutionError> {
        if self.state.parsed {
            return Ok(());
        }
        let query = match self.query.as_deref() {
            Some(query) if !query.trim().is_empty() => query,
            _ => return Err(ExecutionError::EmptyRequest),
        };
        ast::parse_executable_into(query, &mut self.state.document)
            .map_err(ExecutionError::Parse)?;
        self.state.parsed = true;
        Ok(())
    }

    pub fn is_normalized(&self) -> bool {
        self.state.normalized
    }

    /// The parsed document. Empty until [`Request::parse`] succeeded.
    pub fn document(&self) -> &Document {
        &self.state.document
    }

    /// Kind of the selected operation.
    pub fn operation_kind(&mut self) -> Result<OperationKind, ExecutionError> {
        self.parse()?;
        let document = &self.state.document;
        document
            .operation_by_name(self.operation_name.as_deref())
            .map(|r| document.operation(r).kind)
            .ok_or_else(|| ExecutionError::UnknownOperation {
                name: self.operation_name.clone().unwrap_or_default(),
            })
    }

    /// Normalizes the selected operation against the schema.
    ///
    /// A request that is already normalized is left untouched.
    pub fn normalize(&mut self, schema: &Schema) -> Result<NormalizationResult, ExecutionError> {
        self.parse()?;
        if self.state.normalized {
            return Ok(NormalizationResult::successful());
        }
        let result = normalization::normalize_operation(
            &mut self.state.document,
            self.operation_name.as_deref(),
            &mut self.variables,
            schema,
        );
        if result.successful {
            self.state.normalized = true;
        }
        Ok(result)
    }

    /// Validates the operation against the schema. The outcome is cached.
    pub fn validate_for_schema(
        &mut self,
        schema: &Schema,
    ) -> Result<ValidationResult, ExecutionError> {
        self.parse()?;
        if self.state.valid == Some(true) {
            return Ok(ValidationResult::valid());
        }
        let result = validation::validate_operation(
            &self.state.document,
            self.operation_name.as_deref(),
            schema,
        );
        self.state.valid = Some(result.valid);
        Ok(result)
    }

    /// Validates the provided variables against the operation's variable definitions.
    pub fn validate_input(&mut self, schema: &Schema) -> Result<ValidationResult, ExecutionError> {
        self.parse()?;
        Ok(validation::validate_variables(
            &self.state.document,
            self.operation_name.as_deref(),
            &self.variables,
            schema,
        ))
    }
}
