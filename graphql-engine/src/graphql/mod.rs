//! GraphQL-over-HTTP wire types: requests, responses and their errors.

mod request;
mod response;

use std::fmt;

use heck::ToShoutySnakeCase;
pub use request::Request;
pub use response::Response;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value;

use crate::json_ext::Object;
use crate::json_ext::Path;

const CODE_EXTENSION: &str = "code";

/// A position in a GraphQL document, both 1-based.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

/// An entry of the `errors` list of a response.
///
/// Upstream errors are deserialized into it and errors raised by the engine are converted to it,
/// so every error reaching a client has this shape.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Error {
    pub message: String,

    /// Where the error occurred in the request document.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,

    /// Response path of the field the error belongs to; absent for request errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Path>,

    #[serde(skip_serializing_if = "Object::is_empty")]
    pub extensions: Object,
}

#[buildstructor::buildstructor]
impl Error {
    /// `Error::builder().message(..)` with optional `.location(..)`, `.path(..)`,
    /// `.extension(key, value)` and `.extension_code(..)`.
    ///
    /// An explicit `code` extension takes precedence over `extension_code`.
    #[builder(visibility = "pub")]
    fn new(
        message: String,
        locations: Vec<Location>,
        path: Option<Path>,
        extension_code: Option<String>,
        // a plain map so that buildstructor generates `.extension(key, value)`
        mut extensions: JsonMap<ByteString, Value>,
    ) -> Self {
        if let Some(code) = extension_code
            && !extensions.contains_key(CODE_EXTENSION)
        {
            extensions.insert(CODE_EXTENSION, Value::String(code.into()));
        }
        Self {
            message,
            locations,
            path,
            extensions,
        }
    }

    /// The `code` extension, when it is a string or a number.
    pub fn extension_code(&self) -> Option<String> {
        match self.extensions.get(CODE_EXTENSION)? {
            Value::String(code) => Some(code.as_str().to_string()),
            Value::Number(code) => Some(code.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Engine errors that surface as GraphQL errors.
pub(crate) trait ErrorExtension
where
    Self: Sized,
{
    /// Defaults to the type name in SHOUTY_SNAKE_CASE.
    fn extension_code(&self) -> String {
        let name = std::any::type_name::<Self>();
        name.rsplit("::").next().unwrap_or(name).to_shouty_snake_case()
    }

    /// Extra extensions besides `code`.
    fn custom_extension_details(&self) -> Option<Object> {
        None
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn builder_sets_code_once() {
        let error = Error::builder()
            .message("boom")
            .path(Path::from("hero/name"))
            .extension("code", "ALREADY_SET")
            .extension_code("IGNORED")
            .build();

        assert_eq!(error.extension_code().as_deref(), Some("ALREADY_SET"));
        assert_eq!(
            serde_json_bytes::to_value(&error).unwrap(),
            json!({"message": "boom", "path": ["hero", "name"], "extensions": {"code": "ALREADY_SET"}})
        );
    }

    #[test]
    fn deserializes_upstream_errors() {
        let error: Error = serde_json::from_str(
            r#"{"message":"not found","locations":[{"line":1,"column":3}],"path":["_entities",1]}"#,
        )
        .unwrap();
        assert_eq!(error.path, Some(Path::from("_entities/1")));
        assert_eq!(error.locations, vec![Location { line: 1, column: 3 }]);
    }
}
