use std::fmt::Display;

use futures::future::join_all;
use indexmap::IndexSet;
use serde::Deserialize;
use serde::Serialize;
use tracing::instrument;

use super::execution::ExecutionParameters;
use super::selection::Selection;
use super::selection::select_representation;
use crate::error::FetchError;
use crate::error::ResolveError;
use crate::graphql::Error;
use crate::graphql::Request;
use crate::graphql::Response;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::PathElement;
use crate::json_ext::Value;
use crate::json_ext::ValueExt;
use crate::resolver::HookContext;
use crate::sources::FetchRequest;
use crate::spec::Schema;

/// GraphQL operation type.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum OperationKind {
    #[default]
    Query,
    Mutation,
    Subscription,
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.default_type_name())
    }
}

impl OperationKind {
    pub(crate) const fn default_type_name(&self) -> &'static str {
        match self {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
            OperationKind::Subscription => "Subscription",
        }
    }
}

/// How a fetch node reaches its data source.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum FetchKind {
    /// One call for a root selection.
    #[default]
    Single,
    /// One `_entities` call for the object at a single object path.
    Entity,
    /// One `_entities` call carrying every object found under a list path.
    BatchEntity,
    /// One call per parent object, with arguments read from the parent.
    Nested,
}

/// An argument of a nested fetch whose value is read from the parent object.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub(crate) struct ParentArgument {
    pub(crate) name: String,
    pub(crate) path: Vec<String>,
}

/// A fetch node.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FetchNode {
    /// The data source that the fetch is querying.
    pub(crate) source_id: String,

    pub(crate) kind: FetchKind,

    /// The data that is required for the entity fetch.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(default)]
    pub(crate) requires: Vec<Selection>,

    /// The variables that are used for the fetch.
    pub(crate) variable_usages: Vec<String>,

    /// The GraphQL operation sent upstream.
    pub(crate) operation: String,

    /// The GraphQL operation kind that is used for the fetch.
    pub(crate) operation_kind: OperationKind,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(default)]
    pub(crate) parent_arguments: Vec<ParentArgument>,

    /// Response key of the field resolved by a nested fetch.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub(crate) response_key: Option<String>,
}

#[derive(Clone, Default, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct QueryHash(#[serde(with = "hex")] pub(crate) Vec<u8>);

impl std::fmt::Debug for QueryHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("QueryHash")
            .field(&hex::encode(&self.0))
            .finish()
    }
}

impl Display for QueryHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

pub(crate) struct Variables {
    pub(crate) variables: Object,
    pub(crate) inverted_paths: Vec<Vec<Path>>,
}

impl Variables {
    #[instrument(skip_all, level = "debug", name = "make_variables")]
    pub(crate) fn new(
        requires: &[Selection],
        variable_usages: &[String],
        data: &Value,
        current_dir: &Path,
        request_variables: &Object,
        schema: &Schema,
    ) -> Option<Variables> {
        if !requires.is_empty() {
            let mut variables = Object::with_capacity(1 + variable_usages.len());

            variables.extend(select_variables(variable_usages, request_variables));

            let mut inverted_paths: Vec<Vec<Path>> = Vec::new();
            let mut values: IndexSet<Value> = IndexSet::new();

            data.select_values_and_paths(current_dir, |path, value| {
                if let Some(representation) = select_representation(value, requires, schema)
                    && !representation.is_empty()
                {
                    let value = Value::Object(representation);
                    match values.get_index_of(&value) {
                        Some(index) => {
                            inverted_paths[index].push(path.clone());
                        }
                        None => {
                            inverted_paths.push(vec![path.clone()]);
                            values.insert(value);
                            debug_assert!(inverted_paths.len() == values.len());
                        }
                    }
                }
            });

            if values.is_empty() {
                return None;
            }

            let representations = Value::Array(Vec::from_iter(values));

            variables.insert("representations", representations);
            Some(Variables {
                variables,
                inverted_paths,
            })
        } else {
            // a fetch below a field that resolved to null has nothing to fetch
            if !current_dir.is_empty()
                && data
                    .get_path(current_dir)
                    .map(|value| value.is_null())
                    .unwrap_or(true)
            {
                return None;
            }

            Some(Variables {
                variables: select_variables(variable_usages, request_variables).collect(),
                inverted_paths: Vec::new(),
            })
        }
    }
}

fn select_variables<'a>(
    variable_usages: &'a [String],
    request_variables: &'a Object,
) -> impl Iterator<Item = (serde_json_bytes::ByteString, Value)> + 'a {
    variable_usages.iter().filter_map(|key| {
        request_variables
            .get_key_value(key.as_str())
            .map(|(variable_key, value)| (variable_key.clone(), value.clone()))
    })
}

impl FetchNode {
    pub(crate) async fn fetch_node<'a>(
        &'a self,
        parameters: &'a ExecutionParameters<'a>,
        data: &'a Value,
        current_dir: &'a Path,
    ) -> Result<(Value, Vec<Error>), ResolveError> {
        match self.kind {
            FetchKind::Single => self.fetch_single(parameters, data, current_dir).await,
            FetchKind::Entity | FetchKind::BatchEntity => {
                self.fetch_entities(parameters, data, current_dir).await
            }
            FetchKind::Nested => self.fetch_nested(parameters, data, current_dir).await,
        }
    }

    async fn fetch_single(
        &self,
        parameters: &ExecutionParameters<'_>,
        data: &Value,
        current_dir: &Path,
    ) -> Result<(Value, Vec<Error>), ResolveError> {
        let Variables { variables, .. } = match Variables::new(
            &self.requires,
            &self.variable_usages,
            data,
            current_dir,
            parameters.variables,
            parameters.schema,
        ) {
            Some(variables) => variables,
            None => return Ok((Value::from_path(current_dir, Value::Null), Vec::new())),
        };

        match self.load(parameters, current_dir, variables).await? {
            Ok(response) => {
                let errors = response
                    .errors
                    .into_iter()
                    .map(|mut error| {
                        error.path = error.path.map(|path| current_dir.join(path));
                        error
                    })
                    .collect();
                Ok((
                    Value::from_path(current_dir, response.data.unwrap_or_default()),
                    errors,
                ))
            }
            Err(error) => Ok((
                Value::from_path(current_dir, Value::Null),
                vec![error.to_graphql_error(Some(current_dir.clone()))],
            )),
        }
    }

    async fn fetch_entities(
        &self,
        parameters: &ExecutionParameters<'_>,
        data: &Value,
        current_dir: &Path,
    ) -> Result<(Value, Vec<Error>), ResolveError> {
        let Variables {
            variables,
            inverted_paths,
        } = match Variables::new(
            &self.requires,
            &self.variable_usages,
            data,
            current_dir,
            parameters.variables,
            parameters.schema,
        ) {
            Some(variables) => variables,
            None => return Ok((Value::Null, Vec::new())),
        };

        let response = match self.load(parameters, current_dir, variables).await? {
            Ok(response) => response,
            Err(error) => {
                return Ok((
                    Value::Null,
                    vec![error.to_graphql_error(Some(current_dir.clone()))],
                ));
            }
        };

        let mut errors: Vec<Error> = response
            .errors
            .into_iter()
            .flat_map(|error| entity_error_paths(error, &inverted_paths, current_dir))
            .collect();

        let entities = match response.data {
            Some(Value::Object(mut data)) => data.remove("_entities"),
            _ => None,
        };

        let mut value = Value::default();
        match entities {
            Some(Value::Array(entities)) => {
                if entities.len() != inverted_paths.len() {
                    return Err(ResolveError::BatchLengthMismatch {
                        source_id: self.source_id.clone(),
                        expected: inverted_paths.len(),
                        received: entities.len(),
                    });
                }
                for (entity, paths) in entities.into_iter().zip(inverted_paths.iter()) {
                    for path in paths {
                        if let Err(error) = value.insert(path, entity.clone()) {
                            errors.push(error.to_graphql_error(Some(path.clone())));
                        }
                    }
                }
            }
            None | Some(Value::Null) => {}
            Some(_) => errors.push(
                FetchError::ExecutionInvalidContent {
                    reason: "_entities is not an array".to_string(),
                }
                .to_graphql_error(Some(current_dir.clone())),
            ),
        }

        Ok((value, errors))
    }

    async fn fetch_nested(
        &self,
        parameters: &ExecutionParameters<'_>,
        data: &Value,
        current_dir: &Path,
    ) -> Result<(Value, Vec<Error>), ResolveError> {
        let response_key = self.response_key.as_deref().unwrap_or_default();

        let mut parents = Vec::new();
        data.select_values_and_paths(current_dir, |path, parent| {
            if let Some(variables) = self.nested_variables(parent, parameters.variables) {
                parents.push((path.clone(), variables));
            }
        });

        let results = join_all(parents.into_iter().map(|(path, variables)| async move {
            let result = self.load(parameters, &path, variables).await;
            (path, result)
        }))
        .await;

        let mut value = Value::default();
        let mut errors = Vec::new();
        for (parent_path, result) in results {
            let mut field_path = parent_path.clone();
            field_path.push(PathElement::Key(response_key.to_string()));

            match result? {
                Ok(response) => {
                    errors.extend(response.errors.into_iter().map(|mut error| {
                        error.path = error.path.map(|path| parent_path.join(path));
                        error
                    }));
                    let field = match response.data {
                        Some(Value::Object(mut data)) => data.remove(response_key),
                        _ => None,
                    };
                    if let Some(field) = field {
                        if let Err(error) = value.insert(&field_path, field) {
                            errors.push(error.to_graphql_error(Some(field_path)));
                        }
                    }
                }
                Err(error) => errors.push(error.to_graphql_error(Some(field_path))),
            }
        }

        Ok((value, errors))
    }

    /// Variables of one nested call. `None` when a parent argument is missing.
    fn nested_variables(&self, parent: &Value, request_variables: &Object) -> Option<Object> {
        let mut variables: Object = select_variables(&self.variable_usages, request_variables)
            .filter(|(key, _)| {
                !self
                    .parent_arguments
                    .iter()
                    .any(|argument| argument.name == key.as_str())
            })
            .collect();
        for argument in &self.parent_arguments {
            let path = Path::from_slice(&argument.path);
            match parent.get_path(&path) {
                Ok(value) if !value.is_null() => {
                    variables.insert(argument.name.as_str(), value.clone());
                }
                _ => return None,
            }
        }
        Some(variables)
    }

    /// Calls the data source.
    ///
    /// The outer error aborts resolution, the inner one is reported at `current_dir`.
    async fn load(
        &self,
        parameters: &ExecutionParameters<'_>,
        current_dir: &Path,
        variables: Object,
    ) -> Result<Result<Response, FetchError>, ResolveError> {
        let hook_context = HookContext::new(current_dir.clone(), self.source_id.clone());

        let source = match parameters.sources.get(&self.source_id) {
            Some(source) => source.clone(),
            None => {
                return Ok(Err(FetchError::ValidationUnknownDataSource {
                    source_id: self.source_id.clone(),
                }));
            }
        };

        let body = Request::builder()
            .query(self.operation.clone())
            .variables(variables)
            .build();
        match serde_json::to_vec(&body) {
            Ok(input) => parameters.hooks.on_before_fetch(&hook_context, &input),
            Err(error) => {
                tracing::error!(
                    source_id = %self.source_id,
                    %error,
                    "could not serialize fetch request"
                );
            }
        }

        let request = FetchRequest {
            source_id: self.source_id.clone(),
            operation_kind: self.operation_kind,
            body,
            headers: parameters.headers.clone(),
        };

        let result = tokio::select! {
            biased;
            _ = parameters.cancellation.cancelled() => return Err(ResolveError::Cancelled),
            result = source.load(request) => result,
        };

        let response = result.and_then(|bytes| {
            parameters.hooks.on_data(&hook_context, &bytes);
            Response::from_bytes(&self.source_id, bytes)
        });

        match &response {
            Ok(response) if !response.errors.is_empty() => {
                parameters.hooks.on_error(&hook_context, &response.errors);
            }
            Ok(_) => {}
            Err(error) => {
                tracing::debug!(source_id = %self.source_id, "fetch failed: {error}");
                parameters.hooks.on_error(
                    &hook_context,
                    std::slice::from_ref(&error.to_graphql_error(Some(current_dir.clone()))),
                );
            }
        }
        Ok(response)
    }
}

/// Rewrites `["_entities", i, ...rest]` into the response paths of entity `i`.
fn entity_error_paths(error: Error, inverted_paths: &[Vec<Path>], current_dir: &Path) -> Vec<Error> {
    let target = match error.path.as_ref().map(|path| path.0.as_slice()) {
        Some([PathElement::Key(key), PathElement::Index(index), rest @ ..]) if key == "_entities" => {
            inverted_paths
                .get(*index)
                .map(|paths| (paths.clone(), Path(rest.to_vec())))
        }
        _ => None,
    };

    match target {
        Some((paths, rest)) => paths
            .iter()
            .map(|path| Error {
                path: Some(path.join(&rest)),
                ..error.clone()
            })
            .collect(),
        None => vec![Error {
            path: Some(current_dir.clone()),
            ..error
        }],
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    fn requires() -> Vec<Selection> {
        let field = |name: &str| Selection::Field {
            name: name.to_string(),
            response_key: None,
            children: Vec::new(),
        };
        vec![Selection::OnType {
            type_name: "Product".to_string(),
            children: vec![field("__typename"), field("upc")],
        }]
    }

    #[test]
    fn representations_are_deduplicated() {
        let schema = Schema::parse("type Query { a: Int } type Product { upc: String }").unwrap();
        let data = json!({
            "topProducts": [
                {"__typename": "Product", "upc": "1"},
                {"__typename": "Product", "upc": "2"},
                null,
                {"__typename": "Product", "upc": "1"},
            ]
        });
        let variables = Variables::new(
            &requires(),
            &["first".to_string()],
            &data,
            &Path::from("topProducts/@"),
            json!({"first": 3, "unused": true}).as_object().unwrap(),
            &schema,
        )
        .unwrap();

        assert_eq!(
            Value::Object(variables.variables),
            json!({
                "first": 3,
                "representations": [
                    {"__typename": "Product", "upc": "1"},
                    {"__typename": "Product", "upc": "2"},
                ]
            })
        );
        assert_eq!(
            variables.inverted_paths,
            vec![
                vec![Path::from("topProducts/0"), Path::from("topProducts/3")],
                vec![Path::from("topProducts/1")],
            ]
        );
    }

    #[test]
    fn no_representations_means_no_fetch() {
        let schema = Schema::parse("type Query { a: Int } type Product { upc: String }").unwrap();
        let data = json!({"topProducts": []});
        assert!(
            Variables::new(
                &requires(),
                &[],
                &data,
                &Path::from("topProducts/@"),
                &Object::new(),
                &schema,
            )
            .is_none()
        );
        assert!(
            Variables::new(&[], &[], &json!({"me": null}), &Path::from("me"), &Object::new(), &schema)
                .is_none()
        );
    }

    #[test]
    fn entity_errors_point_at_entities() {
        let inverted_paths = vec![
            vec![Path::from("topProducts/0"), Path::from("topProducts/3")],
            vec![Path::from("topProducts/1")],
        ];
        let error = Error::builder()
            .message("no reviews")
            .path(Path::from_slice(&["_entities", "0", "reviews"]))
            .build();
        let paths: Vec<_> = entity_error_paths(error, &inverted_paths, &Path::from("topProducts/@"))
            .into_iter()
            .map(|error| error.path.unwrap().to_string())
            .collect();
        assert_eq!(paths, vec!["/topProducts/0/reviews", "/topProducts/3/reviews"]);

        let error = Error::builder().message("boom").build();
        assert_eq!(
            entity_error_paths(error, &inverted_paths, &Path::from("topProducts/@"))[0].path,
            Some(Path::from("topProducts/@"))
        );
    }
}
