use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tower::BoxError;

use super::DataSource;
use super::DataSourceFactory;
use super::FetchRequest;
use super::PlanningBehavior;
use crate::configuration::DataSourceConfiguration;
use crate::configuration::DataSourceKind;
use crate::error::FetchError;
use crate::error::ServiceBuildError;
use crate::graphql::Response;

/// A data source implemented in process.
///
/// The resolver receives the upstream operation planned for it, exactly as an HTTP data source
/// would.
#[async_trait]
pub trait CustomResolve: Send + Sync + 'static {
    async fn resolve(&self, request: &FetchRequest) -> Result<Response, BoxError>;
}

/// Custom resolvers by the name data source configurations refer to.
#[derive(Clone, Default)]
pub struct CustomResolvers {
    resolvers: HashMap<String, Arc<dyn CustomResolve>>,
}

impl CustomResolvers {
    pub fn register(&mut self, name: impl Into<String>, resolver: impl CustomResolve) -> &mut Self {
        self.resolvers.insert(name.into(), Arc::new(resolver));
        self
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn CustomResolve>> {
        self.resolvers.get(name).cloned()
    }
}

impl fmt::Debug for CustomResolvers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.resolvers.keys()).finish()
    }
}

#[derive(Debug, Clone)]
pub struct CustomDataSourceFactory {
    resolvers: CustomResolvers,
}

impl CustomDataSourceFactory {
    pub(crate) const PLANNING_BEHAVIOR: PlanningBehavior = PlanningBehavior {
        entities: true,
        typename_for_abstract: false,
    };

    pub fn new(resolvers: CustomResolvers) -> Self {
        Self { resolvers }
    }
}

impl DataSourceFactory for CustomDataSourceFactory {
    fn planning_behavior(&self) -> PlanningBehavior {
        Self::PLANNING_BEHAVIOR
    }

    fn create(
        &self,
        configuration: &DataSourceConfiguration,
    ) -> Result<Arc<dyn DataSource>, ServiceBuildError> {
        let DataSourceKind::Custom { resolver } = &configuration.kind else {
            return Err(ServiceBuildError::DataSource {
                source_id: configuration.id.clone(),
                reason: "not a custom data source".to_string(),
            });
        };
        let resolver =
            self.resolvers
                .get(resolver)
                .ok_or_else(|| ServiceBuildError::MissingCustomResolver {
                    source_id: configuration.id.clone(),
                })?;
        Ok(Arc::new(CustomDataSource {
            source_id: configuration.id.clone(),
            resolver,
        }))
    }
}

struct CustomDataSource {
    source_id: String,
    resolver: Arc<dyn CustomResolve>,
}

impl fmt::Debug for CustomDataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomDataSource")
            .field("source_id", &self.source_id)
            .finish()
    }
}

#[async_trait]
impl DataSource for CustomDataSource {
    async fn load(&self, request: FetchRequest) -> Result<Bytes, FetchError> {
        let error = |reason: String| FetchError::CustomResolverError {
            source_id: self.source_id.clone(),
            reason,
        };
        let response = self
            .resolver
            .resolve(&request)
            .await
            .map_err(|e| error(e.to_string()))?;
        serde_json::to_vec(&response)
            .map(Bytes::from)
            .map_err(|e| error(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderMap;
    use serde_json_bytes::json;

    use super::*;
    use crate::graphql::Request;
    use crate::query_planner::OperationKind;

    struct Echo;

    #[async_trait]
    impl CustomResolve for Echo {
        async fn resolve(&self, request: &FetchRequest) -> Result<Response, BoxError> {
            match request.body.variables.get("fail") {
                Some(_) => Err("asked to fail".into()),
                None => Ok(Response::builder()
                    .data(json!({ "echo": request.body.query.clone() }))
                    .build()),
            }
        }
    }

    fn data_source() -> Arc<dyn DataSource> {
        let mut resolvers = CustomResolvers::default();
        resolvers.register("echo", Echo);
        CustomDataSourceFactory::new(resolvers)
            .create(&DataSourceConfiguration {
                id: "search".to_string(),
                kind: DataSourceKind::Custom {
                    resolver: "echo".to_string(),
                },
                root_nodes: Vec::new(),
                child_nodes: Vec::new(),
                federation: Default::default(),
            })
            .unwrap()
    }

    fn request(variables: serde_json_bytes::Value) -> FetchRequest {
        FetchRequest {
            source_id: "search".to_string(),
            operation_kind: OperationKind::Query,
            body: Request::builder()
                .query("{search}".to_string())
                .variables(variables.as_object().unwrap().clone())
                .build(),
            headers: HeaderMap::new(),
        }
    }

    #[tokio::test]
    async fn calls_the_registered_resolver() {
        let body = data_source().load(request(json!({}))).await.unwrap();
        assert_eq!(body.as_ref(), br#"{"data":{"echo":"{search}"}}"#);
    }

    #[tokio::test]
    async fn resolver_errors_become_fetch_errors() {
        let error = data_source()
            .load(request(json!({"fail": true})))
            .await
            .unwrap_err();
        assert_eq!(
            error,
            FetchError::CustomResolverError {
                source_id: "search".to_string(),
                reason: "asked to fail".to_string(),
            }
        );
    }
}
