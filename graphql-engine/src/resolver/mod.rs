//! Plan resolution.

use std::io::Write;
use std::sync::Arc;

use tracing::Instrument;

pub use self::context::Context;
pub(crate) use self::context::ContextPool;
pub use self::hooks::FetchHooks;
pub use self::hooks::HookContext;
pub use self::hooks::NoopHooks;
use crate::error::ResolveError;
use crate::graphql::Response;
use crate::query_planner::ExecutionParameters;
use crate::query_planner::QueryPlan;
use crate::sources::DataSources;
use crate::spec::Schema;

mod context;
mod hooks;

pub(crate) const RESOLVE_SPAN_NAME: &str = "resolve";

/// Executes plans against the data sources and writes GraphQL responses.
#[derive(Clone)]
pub struct Resolver {
    schema: Arc<Schema>,
    sources: Arc<DataSources>,
}

impl Resolver {
    pub(crate) fn new(schema: Arc<Schema>, sources: Arc<DataSources>) -> Self {
        Self { schema, sources }
    }

    /// Resolves `plan` and writes the response as a single line of JSON.
    ///
    /// A fatal error is written as `{"errors":[...]}` without data and returned. A cancelled
    /// resolution writes nothing.
    pub async fn resolve<W: Write + Send + ?Sized>(
        &self,
        context: &Context,
        plan: &QueryPlan,
        writer: &mut W,
    ) -> Result<(), ResolveError> {
        match self.execute(context, plan).await {
            Ok(response) => write_response(writer, &response),
            Err(ResolveError::Cancelled) => Err(ResolveError::Cancelled),
            Err(error) => {
                tracing::error!("resolution failed: {error}");
                let response = Response::builder()
                    .errors(vec![error.to_graphql_error()])
                    .build();
                write_response(writer, &response)?;
                Err(error)
            }
        }
    }

    /// Resolves `plan` into a [`Response`].
    pub(crate) async fn execute(
        &self,
        context: &Context,
        plan: &QueryPlan,
    ) -> Result<Response, ResolveError> {
        let parameters = ExecutionParameters {
            sources: &self.sources,
            schema: &self.schema,
            variables: &context.variables,
            headers: &context.headers,
            hooks: context.hooks.as_ref(),
            cancellation: &context.cancellation,
        };
        plan.execute(&parameters)
            .instrument(tracing::info_span!(
                RESOLVE_SPAN_NAME,
                "otel.kind" = "INTERNAL",
                "graphql.operation.type" = %plan.operation_kind()
            ))
            .await
    }
}

pub(crate) fn write_response<W: Write + ?Sized>(
    writer: &mut W,
    response: &Response,
) -> Result<(), ResolveError> {
    serde_json::to_writer(&mut *writer, response)
        .map_err(|error| ResolveError::Write(error.to_string()))?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;
    use serde_json_bytes::json;
    use tower::BoxError;

    use super::*;
    use crate::ast;
    use crate::configuration::Configuration;
    use crate::graphql;
    use crate::query_planner::Planner;
    use crate::sources::CustomResolve;
    use crate::sources::CustomResolvers;
    use crate::sources::FetchRequest;
    use crate::sources::create_data_sources;

    const SCHEMA: &str = r#"
        scalar _Any
        type Query { hero: Hero heroes: [Hero] }
        type Hero { id: ID! name: String! age: Int }
    "#;

    const CONFIGURATION: &str = r#"
data_sources:
  - id: heroes
    kind: { type: custom, resolver: heroes }
    root_nodes:
      - { type_name: Query, field_names: [hero] }
      - { type_name: Hero, field_names: [id, name] }
  - id: ages
    kind: { type: custom, resolver: ages }
    root_nodes:
      - { type_name: Hero, field_names: [age] }
    federation:
      keys: [{ type_name: Hero, selection_set: id }]
"#;

    struct Fixed(serde_json_bytes::Value);

    #[async_trait]
    impl CustomResolve for Fixed {
        async fn resolve(&self, _request: &FetchRequest) -> Result<Response, BoxError> {
            Ok(serde_json_bytes::from_value(self.0.clone())?)
        }
    }

    #[derive(Default)]
    struct CountingHooks {
        before: AtomicUsize,
        data: AtomicUsize,
        errors: AtomicUsize,
    }

    impl FetchHooks for CountingHooks {
        fn on_before_fetch(&self, _context: &HookContext, _input: &[u8]) {
            self.before.fetch_add(1, Ordering::SeqCst);
        }

        fn on_data(&self, _context: &HookContext, _output: &[u8]) {
            self.data.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, _context: &HookContext, errors: &[graphql::Error]) {
            self.errors.fetch_add(errors.len(), Ordering::SeqCst);
        }
    }

    async fn resolve(
        heroes: serde_json_bytes::Value,
        ages: serde_json_bytes::Value,
        query: &str,
        hooks: Arc<dyn FetchHooks>,
    ) -> (Result<(), ResolveError>, String) {
        let configuration = Configuration::from_yaml(CONFIGURATION).unwrap();
        let schema = Arc::new(Schema::parse(SCHEMA).unwrap());
        let mut resolvers = CustomResolvers::default();
        resolvers.register("heroes", Fixed(heroes));
        resolvers.register("ages", Fixed(ages));
        let sources = create_data_sources(&configuration.data_sources, &resolvers).unwrap();

        let planner = Planner::new(
            schema.clone(),
            configuration.data_sources.clone(),
            configuration.field_configurations(),
        );
        let document = ast::parse_executable(query).unwrap();
        let plan = planner.plan(&document, None).unwrap();

        let resolver = Resolver::new(schema, Arc::new(sources));
        let context = Context {
            hooks,
            ..Default::default()
        };
        let mut out = Vec::new();
        let result = resolver.resolve(&context, &plan, &mut out).await;
        (result, String::from_utf8(out).unwrap())
    }

    #[tokio::test]
    async fn merges_entities_in_selection_order() {
        let hooks = Arc::new(CountingHooks::default());
        let (result, out) = resolve(
            json!({"data": {"hero": {"id": "1", "name": "R2-D2", "__typename": "Hero"}}}),
            json!({"data": {"_entities": [{"age": 33}]}}),
            "{hero {age name}}",
            hooks.clone(),
        )
        .await;
        result.unwrap();
        assert_eq!(out, r#"{"data":{"hero":{"age":33,"name":"R2-D2"}}}"#);
        assert_eq!(hooks.before.load(Ordering::SeqCst), 2);
        assert_eq!(hooks.data.load(Ordering::SeqCst), 2);
        assert_eq!(hooks.errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn null_propagates_to_the_nullable_parent() {
        let (result, out) = resolve(
            json!({"data": {"hero": {"id": "1", "name": null}}}),
            json!({"data": {}}),
            "{hero {name}}",
            Arc::new(NoopHooks),
        )
        .await;
        result.unwrap();
        assert_eq!(
            out,
            r#"{"data":{"hero":null},"errors":[{"message":"Cannot return null for non-nullable field 'Query.hero.name'.","path":["hero","name"]}]}"#
        );
    }

    #[tokio::test]
    async fn batch_length_mismatch_is_fatal() {
        let hooks = Arc::new(CountingHooks::default());
        let (result, out) = resolve(
            json!({"data": {"hero": {"id": "1", "name": "R2-D2", "__typename": "Hero"}}}),
            json!({"data": {"_entities": [{"age": 33}, {"age": 34}]}}),
            "{hero {name age}}",
            hooks,
        )
        .await;
        assert_eq!(
            result,
            Err(ResolveError::BatchLengthMismatch {
                source_id: "ages".to_string(),
                expected: 1,
                received: 2,
            })
        );
        assert_eq!(
            out,
            r#"{"errors":[{"message":"batch entity fetch to 'ages' returned 2 entities for 1 representations","extensions":{"code":"BATCH_LENGTH_MISMATCH"}}]}"#
        );
    }

    #[tokio::test]
    async fn upstream_errors_are_reported_to_hooks() {
        let hooks = Arc::new(CountingHooks::default());
        let (result, out) = resolve(
            json!({"data": {"hero": null}, "errors": [{"message": "hero not found", "path": ["hero"]}]}),
            json!({"data": {}}),
            "{hero {name}}",
            hooks.clone(),
        )
        .await;
        result.unwrap();
        assert_eq!(
            out,
            r#"{"data":{"hero":null},"errors":[{"message":"hero not found","path":["hero"]}]}"#
        );
        assert_eq!(hooks.errors.load(Ordering::SeqCst), 1);
    }
}
