//! An execution engine assembled from swappable stages.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;

use super::ExecutionOptions;
use crate::error::ExecutionError;
use crate::graphql::Request;
use crate::query_planner::QueryPlan;
use crate::spec::Schema;

pub trait Normalizer: Send + Sync {
    fn normalize(&self, request: &mut Request, schema: &Schema) -> Result<(), ExecutionError>;
}

pub trait Validator: Send + Sync {
    fn validate(&self, request: &mut Request, schema: &Schema) -> Result<(), ExecutionError>;
}

pub trait InputValidator: Send + Sync {
    fn validate_input(&self, request: &mut Request, schema: &Schema)
    -> Result<(), ExecutionError>;
}

/// Plans and resolves requests.
#[async_trait]
pub trait ResolverStage: Send + Sync {
    /// Called before planning.
    fn setup(&self, _request: &Request) {}

    async fn plan(
        &self,
        request: &Request,
        options: &ExecutionOptions,
    ) -> Result<Arc<QueryPlan>, ExecutionError>;

    async fn resolve(
        &self,
        request: &Request,
        plan: &QueryPlan,
        options: &ExecutionOptions,
        writer: &mut (dyn Write + Send),
    ) -> Result<(), ExecutionError>;

    /// Called once the request is done, whatever the outcome.
    fn teardown(&self) {}
}

/// Normalizes requests with [`Request::normalize`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaNormalizer;

impl Normalizer for SchemaNormalizer {
    fn normalize(&self, request: &mut Request, schema: &Schema) -> Result<(), ExecutionError> {
        let result = request.normalize(schema)?;
        if !result.successful {
            return Err(ExecutionError::Normalization(result.errors));
        }
        Ok(())
    }
}

/// Validates requests with [`Request::validate_for_schema`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl Validator for SchemaValidator {
    fn validate(&self, request: &mut Request, schema: &Schema) -> Result<(), ExecutionError> {
        let result = request.validate_for_schema(schema)?;
        if !result.valid {
            return Err(ExecutionError::Validation(result.errors));
        }
        Ok(())
    }
}

/// Validates variables with [`Request::validate_input`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaInputValidator;

impl InputValidator for SchemaInputValidator {
    fn validate_input(
        &self,
        request: &mut Request,
        schema: &Schema,
    ) -> Result<(), ExecutionError> {
        let result = request.validate_input(schema)?;
        if !result.valid {
            return Err(ExecutionError::InputValidation(result.errors));
        }
        Ok(())
    }
}

/// The stages of a custom engine. Only the resolver is required.
#[derive(Clone, Default)]
pub struct CustomExecutionEngineStages {
    pub normalizer: Option<Arc<dyn Normalizer>>,
    pub validator: Option<Arc<dyn Validator>>,
    pub input_validator: Option<Arc<dyn InputValidator>>,
    pub resolver: Option<Arc<dyn ResolverStage>>,
}

pub struct CustomExecutionEngineExecutor {
    schema: Arc<Schema>,
    normalizer: Option<Arc<dyn Normalizer>>,
    validator: Option<Arc<dyn Validator>>,
    input_validator: Option<Arc<dyn InputValidator>>,
    resolver: Arc<dyn ResolverStage>,
}

impl CustomExecutionEngineExecutor {
    pub fn new(
        schema: Arc<Schema>,
        stages: CustomExecutionEngineStages,
    ) -> Result<Self, ExecutionError> {
        let resolver = stages
            .resolver
            .ok_or(ExecutionError::RequiredStagesMissing)?;
        Ok(Self {
            schema,
            normalizer: stages.normalizer,
            validator: stages.validator,
            input_validator: stages.input_validator,
            resolver,
        })
    }

    /// Runs the configured stages in order: normalization, validation, input validation,
    /// planning and resolution.
    pub async fn execute(
        &self,
        request: &mut Request,
        writer: &mut (dyn Write + Send),
        options: &ExecutionOptions,
    ) -> Result<(), ExecutionError> {
        if let Some(normalizer) = &self.normalizer {
            normalizer.normalize(request, &self.schema)?;
        } else {
            request.parse()?;
        }
        if let Some(validator) = &self.validator {
            validator.validate(request, &self.schema)?;
        }
        if let Some(input_validator) = &self.input_validator {
            input_validator.validate_input(request, &self.schema)?;
        }

        self.resolver.setup(request);
        let result = match self.resolver.plan(request, options).await {
            Ok(plan) => {
                self.resolver
                    .resolve(request, &plan, options, writer)
                    .await
            }
            Err(error) => Err(error),
        };
        self.resolver.teardown();
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::configuration::Configuration;
    use crate::engine::ExecutionEngine;

    const SCHEMA: &str = "type Query { hello(name: String): String }";

    fn engine() -> ExecutionEngine {
        let configuration = Configuration::from_yaml(
            r#"
data_sources:
  - id: greetings
    kind: { type: static, data: { hello: "world" } }
    root_nodes:
      - { type_name: Query, field_names: [hello] }
"#,
        )
        .unwrap();
        ExecutionEngine::builder()
            .schema(Arc::new(Schema::parse(SCHEMA).unwrap()))
            .configuration(configuration)
            .build()
            .unwrap()
    }

    #[test]
    fn resolver_stage_is_required() {
        let result = CustomExecutionEngineExecutor::new(
            Arc::new(Schema::parse(SCHEMA).unwrap()),
            CustomExecutionEngineStages {
                normalizer: Some(Arc::new(SchemaNormalizer)),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(ExecutionError::RequiredStagesMissing)));
    }

    #[derive(Default)]
    struct CountingNormalizer(AtomicUsize);

    impl Normalizer for CountingNormalizer {
        fn normalize(&self, request: &mut Request, schema: &Schema) -> Result<(), ExecutionError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            SchemaNormalizer.normalize(request, schema)
        }
    }

    #[tokio::test]
    async fn runs_the_configured_stages() {
        let engine = engine();
        let normalizer = Arc::new(CountingNormalizer::default());
        let executor = CustomExecutionEngineExecutor::new(
            engine.schema().clone(),
            CustomExecutionEngineStages {
                normalizer: Some(normalizer.clone()),
                validator: Some(Arc::new(SchemaValidator)),
                input_validator: None,
                resolver: Some(Arc::new(engine)),
            },
        )
        .unwrap();

        let mut request = Request::builder()
            .query(r#"{ hello(name: "you") }"#.to_string())
            .build();
        let mut out = Vec::new();
        executor
            .execute(&mut request, &mut out, &ExecutionOptions::default())
            .await
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), r#"{"data":{"hello":"world"}}"#);
        assert_eq!(normalizer.0.load(Ordering::SeqCst), 1);
        assert!(request.is_normalized());
    }

    #[tokio::test]
    async fn validation_failures_stop_the_pipeline() {
        let executor = CustomExecutionEngineExecutor::new(
            Arc::new(Schema::parse(SCHEMA).unwrap()),
            CustomExecutionEngineStages {
                validator: Some(Arc::new(SchemaValidator)),
                resolver: Some(Arc::new(engine())),
                ..Default::default()
            },
        )
        .unwrap();
        let mut request = Request::builder().query("{ goodbye }".to_string()).build();
        let mut out = Vec::new();
        let error = executor
            .execute(&mut request, &mut out, &ExecutionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, ExecutionError::Validation(_)));
        assert!(out.is_empty());
    }
}
