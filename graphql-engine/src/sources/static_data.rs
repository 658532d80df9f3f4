use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::DataSource;
use super::DataSourceFactory;
use super::FetchRequest;
use super::PlanningBehavior;
use crate::configuration::DataSourceConfiguration;
use crate::configuration::DataSourceKind;
use crate::error::FetchError;
use crate::error::ServiceBuildError;

/// Data sources answering every request with the same configured data.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticDataSourceFactory;

impl StaticDataSourceFactory {
    pub(crate) const PLANNING_BEHAVIOR: PlanningBehavior = PlanningBehavior {
        entities: false,
        typename_for_abstract: false,
    };
}

impl DataSourceFactory for StaticDataSourceFactory {
    fn planning_behavior(&self) -> PlanningBehavior {
        Self::PLANNING_BEHAVIOR
    }

    fn create(
        &self,
        configuration: &DataSourceConfiguration,
    ) -> Result<Arc<dyn DataSource>, ServiceBuildError> {
        let DataSourceKind::Static { data } = &configuration.kind else {
            return Err(ServiceBuildError::DataSource {
                source_id: configuration.id.clone(),
                reason: "not a static data source".to_string(),
            });
        };
        let body = serde_json::to_vec(&serde_json_bytes::json!({ "data": data.clone() }))
            .map_err(|e| ServiceBuildError::DataSource {
                source_id: configuration.id.clone(),
                reason: e.to_string(),
            })?;
        Ok(Arc::new(StaticDataSource {
            body: Bytes::from(body),
        }))
    }
}

#[derive(Debug)]
struct StaticDataSource {
    body: Bytes,
}

#[async_trait]
impl DataSource for StaticDataSource {
    async fn load(&self, _request: FetchRequest) -> Result<Bytes, FetchError> {
        Ok(self.body.clone())
    }
}
