//! Router errors.
use std::fmt;
use std::sync::Arc;

use displaydoc::Display;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::graphql;
use crate::graphql::ErrorExtension;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::Value;

/// Error types for fetches against data sources.
///
/// Note that these are not actually returned to the client, but are instead converted to JSON for
/// [`struct@graphql::Error`].
#[derive(Error, Display, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[ignore_extra_doc_attributes]
pub enum FetchError {
    /// query references unknown data source '{source_id}'
    ValidationUnknownDataSource {
        /// The data source that was unknown.
        source_id: String,
    },

    /// HTTP fetch failed from '{source_id}': {reason}
    ///
    /// Note that this relates to a transport error and not a GraphQL error.
    SubrequestHttpError {
        status_code: Option<u16>,

        /// The data source that failed.
        source_id: String,

        /// The reason the fetch failed.
        reason: String,
    },

    /// data source '{source_id}' response was malformed: {reason}
    SubrequestMalformedResponse {
        /// The data source that responded with the malformed response.
        source_id: String,

        /// The reason the deserialization failed.
        reason: String,
    },

    /// custom resolver '{source_id}' failed: {reason}
    CustomResolverError { source_id: String, reason: String },

    /// invalid content: {reason}
    ExecutionInvalidContent { reason: String },

    /// could not find path: {reason}
    ExecutionPathNotFound { reason: String },
}

impl FetchError {
    /// Convert the fetch error to a GraphQL error.
    pub(crate) fn to_graphql_error(&self, path: Option<Path>) -> graphql::Error {
        let mut extensions = serde_json_bytes::to_value(self)
            .ok()
            .and_then(|value| match value {
                Value::Object(o) => Some(o),
                _ => None,
            })
            .unwrap_or_default();
        extensions.remove("type");
        if let Some(details) = self.custom_extension_details() {
            extensions.extend(details);
        }

        graphql::Error::builder()
            .message(self.to_string())
            .and_path(path)
            .extension_code(self.extension_code())
            .extensions(extensions)
            .build()
    }
}

impl ErrorExtension for FetchError {
    fn extension_code(&self) -> String {
        match self {
            FetchError::ValidationUnknownDataSource { .. } => "UNKNOWN_DATA_SOURCE",
            FetchError::SubrequestHttpError { .. } => "SUBREQUEST_HTTP_ERROR",
            FetchError::SubrequestMalformedResponse { .. } => "SUBREQUEST_MALFORMED_RESPONSE",
            FetchError::CustomResolverError { .. } => "CUSTOM_RESOLVER_ERROR",
            FetchError::ExecutionInvalidContent { .. } => "EXECUTION_INVALID_CONTENT",
            FetchError::ExecutionPathNotFound { .. } => "EXECUTION_PATH_NOT_FOUND",
        }
        .to_string()
    }

    fn custom_extension_details(&self) -> Option<Object> {
        let mut extensions = Object::new();
        if let FetchError::SubrequestHttpError {
            status_code: Some(status_code),
            ..
        } = self
        {
            extensions.insert("http", serde_json_bytes::json!({ "status": status_code }));
        }
        Some(extensions).filter(|e| !e.is_empty())
    }
}

/// A list of GraphQL errors produced while parsing, normalizing or validating a document.
#[derive(Error, Debug, Clone, PartialEq, Default)]
pub struct ValidationErrors {
    pub errors: Vec<graphql::Error>,
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, error) in self.errors.iter().enumerate() {
            if index > 0 {
                f.write_str("\n")?;
            }
            if let Some(location) = error.locations.first() {
                write!(f, "[{}:{}] {}", location.line, location.column, error.message)?;
            } else {
                write!(f, "{}", error.message)?;
            }
        }
        Ok(())
    }
}

/// An error that prevents a plan from being built.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
pub enum PlanningError {
    /// no operation named '{name}' in the document
    UnknownOperation { name: String },

    /// fragment spread '{name}' must be inlined before planning
    UnnormalizedFragmentSpread { name: String },

    /// no data source declares root field '{type_name}.{field_name}'
    MissingRootDataSource {
        type_name: String,
        field_name: String,
    },

    /// no data source can resolve field '{type_name}.{field_name}'
    MissingDataSource {
        type_name: String,
        field_name: String,
    },

    /// data source '{source_id}' declares no key for entity type '{type_name}'
    MissingFederationKey { source_id: String, type_name: String },

    /// invalid selection set '{selection_set}' on type '{type_name}': {reason}
    InvalidSelectionSet {
        type_name: String,
        selection_set: String,
        reason: String,
    },

    /// inline fragment on '{type_condition}' can never apply to '{parent_type}'
    IncompatibleFragment {
        type_condition: String,
        parent_type: String,
    },

    /// field '{field_name}' is not defined on type '{type_name}'
    UnknownField {
        type_name: String,
        field_name: String,
    },

    /// the schema has no root type for {kind} operations
    MissingRootType { kind: String },

    /// argument '{argument}' is not defined on field '{type_name}.{field_name}'
    UnknownArgument {
        type_name: String,
        field_name: String,
        argument: String,
    },
}

/// Every error collected while planning one operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct PlanningErrors {
    pub errors: Arc<Vec<PlanningError>>,
}

impl PlanningErrors {
    pub(crate) fn new(errors: Vec<PlanningError>) -> Self {
        Self {
            errors: Arc::new(errors),
        }
    }
}

impl fmt::Display for PlanningErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("query planning had errors: ")?;
        for (index, error) in self.errors.iter().enumerate() {
            if index > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

/// Errors that abort the resolution of a plan.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// batch entity fetch to '{source_id}' returned {received} entities for {expected} representations
    BatchLengthMismatch {
        source_id: String,
        expected: usize,
        received: usize,
    },

    /// resolution was cancelled
    Cancelled,

    /// could not write the response: {0}
    Write(String),
}

impl ErrorExtension for ResolveError {
    fn extension_code(&self) -> String {
        match self {
            ResolveError::BatchLengthMismatch { .. } => "BATCH_LENGTH_MISMATCH",
            ResolveError::Cancelled => "RESOLVE_CANCELLED",
            ResolveError::Write(_) => "RESPONSE_WRITE_FAILED",
        }
        .to_string()
    }
}

impl ResolveError {
    pub(crate) fn to_graphql_error(&self) -> graphql::Error {
        graphql::Error::builder()
            .message(self.to_string())
            .extension_code(self.extension_code())
            .build()
    }
}

impl From<std::io::Error> for ResolveError {
    fn from(err: std::io::Error) -> Self {
        ResolveError::Write(err.to_string())
    }
}

/// Errors returned by the execution engine.
#[derive(Error, Display, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    /// the provided request is empty
    EmptyRequest,

    /// unknown operation named '{name}'
    UnknownOperation { name: String },

    /// the resolver stage is required to build a custom execution engine
    RequiredStagesMissing,

    /// could not parse the operation: {0}
    Parse(ValidationErrors),

    /// normalization failed: {0}
    Normalization(ValidationErrors),

    /// validation failed: {0}
    Validation(ValidationErrors),

    /// invalid input: {0}
    InputValidation(ValidationErrors),

    /// {0}
    Planning(PlanningErrors),

    /// resolution failed: {0}
    Resolve(ResolveError),

    /// no data source registered for '{source_id}'
    UnknownDataSource { source_id: String },

    /// execution was cancelled
    Cancelled,
}

impl ExecutionError {
    /// GraphQL errors to return to the client for this failure.
    pub fn to_graphql_errors(&self) -> Vec<graphql::Error> {
        match self {
            ExecutionError::Parse(errors)
            | ExecutionError::Normalization(errors)
            | ExecutionError::Validation(errors)
            | ExecutionError::InputValidation(errors) => errors.errors.clone(),
            ExecutionError::Resolve(err) => vec![err.to_graphql_error()],
            ExecutionError::Planning(errors) => errors
                .errors
                .iter()
                .map(|err| {
                    graphql::Error::builder()
                        .message(err.to_string())
                        .extension_code(self.extension_code())
                        .build()
                })
                .collect(),
            other => vec![
                graphql::Error::builder()
                    .message(other.to_string())
                    .extension_code(self.extension_code())
                    .build(),
            ],
        }
    }
}

impl ErrorExtension for ExecutionError {
    fn extension_code(&self) -> String {
        match self {
            ExecutionError::EmptyRequest => "EMPTY_REQUEST",
            ExecutionError::UnknownOperation { .. } => "GRAPHQL_UNKNOWN_OPERATION_NAME",
            ExecutionError::RequiredStagesMissing => "REQUIRED_STAGES_MISSING",
            ExecutionError::Parse(_) => "GRAPHQL_PARSE_FAILED",
            ExecutionError::Normalization(_) => "GRAPHQL_NORMALIZATION_FAILED",
            ExecutionError::Validation(_) => "GRAPHQL_VALIDATION_FAILED",
            ExecutionError::InputValidation(_) => "BAD_USER_INPUT",
            ExecutionError::Planning(_) => "QUERY_PLANNING_FAILED",
            ExecutionError::Resolve(err) => return err.extension_code(),
            ExecutionError::UnknownDataSource { .. } => "UNKNOWN_DATA_SOURCE",
            ExecutionError::Cancelled => "EXECUTION_CANCELLED",
        }
        .to_string()
    }
}

impl From<PlanningErrors> for ExecutionError {
    fn from(err: PlanningErrors) -> Self {
        ExecutionError::Planning(err)
    }
}

impl From<ResolveError> for ExecutionError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Cancelled => ExecutionError::Cancelled,
            err => ExecutionError::Resolve(err),
        }
    }
}

/// Errors of the subscription engine and of the protocols driving it.
#[derive(Error, Display, Debug, Clone, PartialEq)]
pub enum SubscriptionError {
    /// subscriber for {id} already exists
    SubscriberIdAlreadyExists { id: String },

    /// on before start hook failed: {reason}
    OnBeforeStartHook { reason: String },

    /// execution did not succeed after {tries} tries: {source}
    ExecutionTimeout {
        tries: u32,
        #[source]
        source: ExecutionError,
    },

    /// {0}
    Execution(#[from] ExecutionError),

    /// could not read message from client
    CouldNotReadMessageFromClient,

    /// connection terminated by server
    ConnectionTerminatedByServer,

    /// invalid subscription payload: {reason}
    InvalidPayload { reason: String },

    /// connection initialisation rejected: {reason}
    ConnectionInitRejected { reason: String },

    /// transport error: {0}
    Transport(String),
}

impl SubscriptionError {
    /// Whether the error is an expected outcome of a client request.
    pub fn is_expected(&self) -> bool {
        matches!(self, SubscriptionError::OnBeforeStartHook { .. })
    }

    /// GraphQL errors sent to the client in `error` messages.
    pub fn to_graphql_errors(&self) -> Vec<graphql::Error> {
        match self {
            SubscriptionError::Execution(err) => err.to_graphql_errors(),
            SubscriptionError::ExecutionTimeout { source, .. } => {
                let mut errors = vec![
                    graphql::Error::builder()
                        .message(self.to_string())
                        .extension_code("EXECUTION_TIMEOUT")
                        .build(),
                ];
                errors.extend(source.to_graphql_errors());
                errors
            }
            other => vec![graphql::Error::builder().message(other.to_string()).build()],
        }
    }
}

/// Error in the schema.
#[derive(Debug, Error, Display, Clone, PartialEq)]
pub enum SchemaError {
    /// could not parse the schema: {0}
    Parse(ValidationErrors),

    /// the schema has no query root type
    MissingQueryType,

    /// type '{type_name}' references unknown type '{referenced}'
    UnknownType {
        type_name: String,
        referenced: String,
    },
}

/// Errors while building the engine's services from configuration.
#[derive(Error, Debug, Display, Clone)]
pub enum ServiceBuildError {
    /// couldn't build data source '{source_id}': {reason}
    DataSource { source_id: String, reason: String },

    /// no data source factory registered for custom data source '{source_id}'
    MissingCustomResolver { source_id: String },

    /// schema error: {0}
    Schema(#[from] SchemaError),

    /// configuration error: {0}
    Configuration(#[from] ConfigurationError),
}

/// Errors related to configuration.
#[derive(Error, Debug, Display, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// could not deserialize configuration: {0}
    Deserialization(String),

    /// duplicate data source id '{0}'
    DuplicateDataSource(String),

    /// invalid configuration for data source '{source_id}': {reason}
    InvalidDataSource { source_id: String, reason: String },

    /// invalid configuration for field '{type_name}.{field_name}': {reason}
    InvalidFieldConfiguration {
        type_name: String,
        field_name: String,
        reason: String,
    },

    /// plan cache capacity must be greater than zero
    InvalidPlanCacheCapacity,
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn fetch_error_to_graphql_error() {
        let error = FetchError::SubrequestHttpError {
            status_code: Some(502),
            source_id: "accounts".to_string(),
            reason: "bad gateway".to_string(),
        }
        .to_graphql_error(Some(Path::from("me")));

        assert_eq!(error.message, "HTTP fetch failed from 'accounts': bad gateway");
        assert_eq!(error.extension_code().as_deref(), Some("SUBREQUEST_HTTP_ERROR"));
        assert_eq!(error.extensions.get("http"), Some(&json!({"status": 502})));
        assert_eq!(error.extensions.get("source_id"), Some(&json!("accounts")));
        assert_eq!(error.path, Some(Path::from("me")));
    }

    #[test]
    fn planning_errors_display_every_error() {
        let errors = PlanningErrors::new(vec![
            PlanningError::MissingRootDataSource {
                type_name: "Query".to_string(),
                field_name: "hero".to_string(),
            },
            PlanningError::MissingFederationKey {
                source_id: "reviews".to_string(),
                type_name: "User".to_string(),
            },
        ]);
        assert_eq!(
            errors.to_string(),
            "query planning had errors: no data source declares root field 'Query.hero'; \
             data source 'reviews' declares no key for entity type 'User'"
        );
    }

    #[test]
    fn execution_timeout_keeps_last_error() {
        let error = SubscriptionError::ExecutionTimeout {
            tries: 5,
            source: ExecutionError::Cancelled,
        };
        let errors = error.to_graphql_errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[1].message, "execution was cancelled");
        assert!(std::error::Error::source(&error).is_some());
    }
}
