use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;

use super::Error;
use crate::error::FetchError;
use crate::json_ext::Object;
use crate::json_ext::Value;

/// A graphql primary response.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// The response data.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,

    /// The optional graphql errors encountered.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<Error>,

    /// The optional graphql extensions.
    #[serde(skip_serializing_if = "Object::is_empty", default)]
    pub extensions: Object,
}

#[buildstructor::buildstructor]
impl Response {
    /// Constructor
    #[builder(visibility = "pub")]
    fn new(data: Option<Value>, errors: Vec<Error>, extensions: Map<ByteString, Value>) -> Self {
        Self {
            data,
            errors,
            extensions,
        }
    }

    /// append_errors default the errors `path` with the one provided.
    pub fn append_errors(&mut self, errors: &mut Vec<Error>) {
        self.errors.append(errors)
    }

    /// Create a [`Response`] from the supplied [`Bytes`].
    ///
    /// This will return an error (identifying the faulty data source) if the input is invalid.
    pub(crate) fn from_bytes(source_id: &str, b: Bytes) -> Result<Response, FetchError> {
        let value =
            Value::from_bytes(b).map_err(|error| FetchError::SubrequestMalformedResponse {
                source_id: source_id.to_string(),
                reason: error.to_string(),
            })?;
        let mut object = match value {
            Value::Object(object) => object,
            _ => {
                return Err(FetchError::SubrequestMalformedResponse {
                    source_id: source_id.to_string(),
                    reason: "expected a JSON object".to_string(),
                });
            }
        };

        let data = object.remove("data");
        let errors = match object.remove("errors") {
            None | Some(Value::Null) => Vec::new(),
            Some(errors @ Value::Array(_)) => serde_json_bytes::from_value(errors).map_err(
                |err| FetchError::SubrequestMalformedResponse {
                    source_id: source_id.to_string(),
                    reason: format!("invalid `errors`: {err}"),
                },
            )?,
            Some(_) => {
                return Err(FetchError::SubrequestMalformedResponse {
                    source_id: source_id.to_string(),
                    reason: "`errors` must be an array".to_string(),
                });
            }
        };
        let extensions = match object.remove("extensions") {
            Some(Value::Object(o)) => o,
            _ => Object::default(),
        };

        // Graphql spec says:
        // If the data entry in the response is not present, the errors entry in the response must not be empty.
        if data.is_none() && errors.is_empty() {
            return Err(FetchError::SubrequestMalformedResponse {
                source_id: source_id.to_string(),
                reason: "graphql response without data must contain at least one error"
                    .to_string(),
            });
        }

        Ok(Response {
            data,
            errors,
            extensions,
        })
    }
}
