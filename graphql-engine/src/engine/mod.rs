//! The execution engine: normalization, validation, planning and resolution of requests.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use derivative::Derivative;
use http::HeaderMap;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

pub use self::custom::CustomExecutionEngineExecutor;
pub use self::custom::CustomExecutionEngineStages;
pub use self::custom::InputValidator;
pub use self::custom::Normalizer;
pub use self::custom::ResolverStage;
pub use self::custom::SchemaInputValidator;
pub use self::custom::SchemaNormalizer;
pub use self::custom::SchemaValidator;
pub use self::custom::Validator;
use self::plan_cache::PlanCache;
use crate::configuration::Configuration;
use crate::error::ExecutionError;
use crate::error::ServiceBuildError;
use crate::graphql::Request;
use crate::graphql::Response;
use crate::query_planner::Planner;
use crate::query_planner::QueryPlan;
use crate::resolver::Context;
use crate::resolver::ContextPool;
use crate::resolver::FetchHooks;
use crate::resolver::NoopHooks;
use crate::resolver::Resolver;
use crate::sources::CustomResolvers;
use crate::sources::create_data_sources;
use crate::spec::Schema;

mod custom;
mod plan_cache;

/// Per request execution options.
#[derive(Derivative, Clone, Default)]
#[derivative(Debug)]
pub struct ExecutionOptions {
    /// Hooks called around every upstream call.
    #[derivative(Debug = "ignore")]
    pub hooks: Option<Arc<dyn FetchHooks>>,
    /// Headers added to every upstream request.
    pub upstream_headers: HeaderMap,
    /// Headers of the incoming request, some of which are part of the plan fingerprint.
    pub request_headers: HeaderMap,
    /// Cancels the resolution when triggered.
    pub cancellation: Option<CancellationToken>,
}

#[buildstructor::buildstructor]
impl ExecutionOptions {
    #[builder(visibility = "pub")]
    fn new(
        hooks: Option<Arc<dyn FetchHooks>>,
        upstream_headers: Option<HeaderMap>,
        request_headers: Option<HeaderMap>,
        cancellation: Option<CancellationToken>,
    ) -> Self {
        Self {
            hooks,
            upstream_headers: upstream_headers.unwrap_or_default(),
            request_headers: request_headers.unwrap_or_default(),
            cancellation,
        }
    }
}

/// Executes GraphQL requests against the configured data sources.
///
/// Plans are cached by fingerprint and shared between concurrent requests.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<Inner>,
}

struct Inner {
    schema: Arc<Schema>,
    planner: Planner,
    resolver: Resolver,
    plan_cache: PlanCache,
    contexts: ContextPool,
}

#[buildstructor::buildstructor]
impl ExecutionEngine {
    /// Builds the engine and every configured data source.
    #[builder(visibility = "pub")]
    fn new(
        schema: Arc<Schema>,
        configuration: Configuration,
        custom_resolvers: Option<CustomResolvers>,
    ) -> Result<Self, ServiceBuildError> {
        configuration.validate()?;
        let sources = create_data_sources(
            &configuration.data_sources,
            &custom_resolvers.unwrap_or_default(),
        )?;
        let plan_cache = PlanCache::new(
            configuration.engine.plan_cache_capacity,
            &configuration.engine.fingerprint_headers,
        )?;
        let planner = Planner::new(
            schema.clone(),
            configuration.data_sources.clone(),
            configuration.field_configurations(),
        );
        let resolver = Resolver::new(schema.clone(), Arc::new(sources));

        Ok(Self {
            inner: Arc::new(Inner {
                schema,
                planner,
                resolver,
                plan_cache,
                contexts: ContextPool::default(),
            }),
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    /// Executes a request and writes the response to `writer` as a single line of JSON.
    ///
    /// Errors raised before resolution are returned without writing anything: use
    /// [`ExecutionError::to_graphql_errors`] to answer the client.
    #[instrument(skip_all, level = "debug", name = "execute")]
    pub async fn execute<W: Write + Send>(
        &self,
        request: &mut Request,
        writer: &mut W,
        options: &ExecutionOptions,
    ) -> Result<(), ExecutionError> {
        self.prepare(request)?;
        let plan = self.plan_request(request, options).await?;
        self.resolve_plan(request, &plan, options, writer).await
    }

    /// Executes a request and returns the response.
    pub async fn execute_to_response(
        &self,
        request: &mut Request,
        options: &ExecutionOptions,
    ) -> Result<Response, ExecutionError> {
        self.prepare(request)?;
        let plan = self.plan_request(request, options).await?;
        self.response(request, &plan, options).await
    }

    /// Normalizes and validates a request.
    pub fn prepare(&self, request: &mut Request) -> Result<(), ExecutionError> {
        let schema = &self.inner.schema;
        SchemaNormalizer.normalize(request, schema)?;
        SchemaValidator.validate(request, schema)?;
        SchemaInputValidator.validate_input(request, schema)
    }

    /// Number of plans in the plan cache.
    pub fn cached_plans(&self) -> usize {
        self.inner.plan_cache.len()
    }

    pub(crate) async fn plan_request(
        &self,
        request: &Request,
        options: &ExecutionOptions,
    ) -> Result<Arc<QueryPlan>, ExecutionError> {
        let fingerprint = self.inner.plan_cache.fingerprint(
            request,
            self.inner.schema.hash(),
            &options.request_headers,
        )?;
        Ok(self
            .inner
            .plan_cache
            .get_or_plan(&self.inner.planner, request, fingerprint)
            .await?)
    }

    pub(crate) async fn resolve_plan<W: Write + Send + ?Sized>(
        &self,
        request: &Request,
        plan: &QueryPlan,
        options: &ExecutionOptions,
        writer: &mut W,
    ) -> Result<(), ExecutionError> {
        let context = self.context(request, options);
        let result = self.inner.resolver.resolve(&context, plan, writer).await;
        self.inner.contexts.put(context);
        Ok(result?)
    }

    /// Resolves a plan into a [`Response`]. Fatal resolution errors are returned.
    pub(crate) async fn response(
        &self,
        request: &Request,
        plan: &QueryPlan,
        options: &ExecutionOptions,
    ) -> Result<Response, ExecutionError> {
        let context = self.context(request, options);
        let result = self.inner.resolver.execute(&context, plan).await;
        self.inner.contexts.put(context);
        Ok(result?)
    }

    fn context(&self, request: &Request, options: &ExecutionOptions) -> Context {
        let mut context = self.inner.contexts.get();
        context.variables.clone_from(&request.variables);
        context.headers.clone_from(&options.upstream_headers);
        context.hooks = options
            .hooks
            .clone()
            .unwrap_or_else(|| Arc::new(NoopHooks));
        if let Some(cancellation) = &options.cancellation {
            context.cancellation = cancellation.clone();
        }
        context
    }
}

#[async_trait]
impl ResolverStage for ExecutionEngine {
    async fn plan(
        &self,
        request: &Request,
        options: &ExecutionOptions,
    ) -> Result<Arc<QueryPlan>, ExecutionError> {
        self.plan_request(request, options).await
    }

    async fn resolve(
        &self,
        request: &Request,
        plan: &QueryPlan,
        options: &ExecutionOptions,
        writer: &mut (dyn Write + Send),
    ) -> Result<(), ExecutionError> {
        self.resolve_plan(request, plan, options, writer).await
    }
}
