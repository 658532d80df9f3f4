//! Upstream data sources.
//!
//! A [`DataSourceFactory`] is selected by the [`DataSourceKind`] of a configured data source. It
//! tells the planner what the data source supports and builds the [`DataSource`] called at
//! resolve time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;

pub use self::custom::CustomDataSourceFactory;
pub use self::custom::CustomResolve;
pub use self::custom::CustomResolvers;
pub use self::graphql::GraphqlDataSourceFactory;
pub use self::static_data::StaticDataSourceFactory;
use crate::configuration::DataSourceConfiguration;
use crate::configuration::DataSourceKind;
use crate::error::FetchError;
use crate::error::ServiceBuildError;
use crate::graphql::Request;
use crate::query_planner::OperationKind;

mod custom;
mod graphql;
mod static_data;

/// Data sources by id.
pub(crate) type DataSources = HashMap<String, Arc<dyn DataSource>>;

/// One upstream call.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub source_id: String,
    pub operation_kind: OperationKind,
    /// The upstream operation and its variables.
    pub body: Request,
    /// Additional headers for this request.
    pub headers: HeaderMap,
}

/// Executes upstream requests and returns the raw GraphQL response body.
#[async_trait]
pub trait DataSource: Send + Sync + fmt::Debug {
    async fn load(&self, request: FetchRequest) -> Result<Bytes, FetchError>;
}

/// What a kind of data source supports, as seen by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanningBehavior {
    /// The data source answers `_entities` queries.
    pub entities: bool,
    /// `__typename` is selected on abstract types.
    pub typename_for_abstract: bool,
}

pub trait DataSourceFactory: Send + Sync {
    fn planning_behavior(&self) -> PlanningBehavior;

    fn create(
        &self,
        configuration: &DataSourceConfiguration,
    ) -> Result<Arc<dyn DataSource>, ServiceBuildError>;
}

impl DataSourceKind {
    pub(crate) fn planning_behavior(&self) -> PlanningBehavior {
        match self {
            DataSourceKind::Graphql { .. } => GraphqlDataSourceFactory::PLANNING_BEHAVIOR,
            DataSourceKind::Static { .. } => StaticDataSourceFactory::PLANNING_BEHAVIOR,
            DataSourceKind::Custom { .. } => CustomDataSourceFactory::PLANNING_BEHAVIOR,
        }
    }
}

/// Builds every configured data source.
pub(crate) fn create_data_sources(
    configurations: &[DataSourceConfiguration],
    custom_resolvers: &CustomResolvers,
) -> Result<DataSources, ServiceBuildError> {
    let graphql = GraphqlDataSourceFactory::default();
    let custom = CustomDataSourceFactory::new(custom_resolvers.clone());

    configurations
        .iter()
        .map(|configuration| {
            let factory: &dyn DataSourceFactory = match configuration.kind {
                DataSourceKind::Graphql { .. } => &graphql,
                DataSourceKind::Static { .. } => &StaticDataSourceFactory,
                DataSourceKind::Custom { .. } => &custom,
            };
            tracing::debug!(source_id = %configuration.id, "creating data source");
            Ok((configuration.id.clone(), factory.create(configuration)?))
        })
        .collect()
}
