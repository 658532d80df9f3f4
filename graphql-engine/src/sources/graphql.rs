use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use http::HeaderName;
use http::HeaderValue;
use http::header::ACCEPT;
use http::header::CONTENT_TYPE;
use tracing::Instrument;
use url::Url;

use super::DataSource;
use super::DataSourceFactory;
use super::FetchRequest;
use super::PlanningBehavior;
use crate::configuration::DataSourceConfiguration;
use crate::configuration::DataSourceKind;
use crate::error::FetchError;
use crate::error::ServiceBuildError;

const GRAPHQL_CONTENT_TYPE: &str = "application/json";

/// GraphQL servers reached over HTTP, including federated subgraphs.
#[derive(Debug, Clone)]
pub struct GraphqlDataSourceFactory {
    client: reqwest::Client,
}

impl GraphqlDataSourceFactory {
    pub(crate) const PLANNING_BEHAVIOR: PlanningBehavior = PlanningBehavior {
        entities: true,
        typename_for_abstract: true,
    };

    /// Uses a custom HTTP client, shared by every data source of the factory.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for GraphqlDataSourceFactory {
    fn default() -> Self {
        let client = reqwest::Client::builder()
            .tcp_keepalive(Some(Duration::from_secs(5)))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl DataSourceFactory for GraphqlDataSourceFactory {
    fn planning_behavior(&self) -> PlanningBehavior {
        Self::PLANNING_BEHAVIOR
    }

    fn create(
        &self,
        configuration: &DataSourceConfiguration,
    ) -> Result<Arc<dyn DataSource>, ServiceBuildError> {
        let build_error = |reason: String| ServiceBuildError::DataSource {
            source_id: configuration.id.clone(),
            reason,
        };
        let DataSourceKind::Graphql { url, headers } = &configuration.kind else {
            return Err(build_error("not a graphql data source".to_string()));
        };

        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| build_error(format!("invalid header name '{name}': {e}")))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| build_error(format!("invalid header value for '{name}': {e}")))?;
            header_map.insert(name, value);
        }

        Ok(Arc::new(GraphqlDataSource {
            source_id: configuration.id.clone(),
            url: url.clone(),
            headers: header_map,
            client: self.client.clone(),
        }))
    }
}

#[derive(Debug)]
struct GraphqlDataSource {
    source_id: String,
    url: Url,
    headers: HeaderMap,
    client: reqwest::Client,
}

impl GraphqlDataSource {
    fn http_error(&self, status_code: Option<u16>, reason: impl ToString) -> FetchError {
        FetchError::SubrequestHttpError {
            status_code,
            source_id: self.source_id.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl DataSource for GraphqlDataSource {
    async fn load(&self, request: FetchRequest) -> Result<Bytes, FetchError> {
        let body = serde_json::to_vec(&request.body).map_err(|e| self.http_error(None, e))?;

        let mut headers = self.headers.clone();
        headers.extend(request.headers);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(GRAPHQL_CONTENT_TYPE));
        headers.insert(ACCEPT, HeaderValue::from_static(GRAPHQL_CONTENT_TYPE));

        async {
            tracing::trace!(url = %self.url, "sending upstream request");
            let response = self
                .client
                .post(self.url.clone())
                .headers(headers)
                .body(body)
                .send()
                .await
                .map_err(|e| self.http_error(e.status().map(|s| s.as_u16()), e))?;

            let status = response.status();
            if !status.is_success() {
                return Err(self.http_error(
                    Some(status.as_u16()),
                    status.canonical_reason().unwrap_or("unexpected status"),
                ));
            }
            response
                .bytes()
                .await
                .map_err(|e| self.http_error(Some(status.as_u16()), e))
        }
        .instrument(tracing::debug_span!(
            "http_request",
            "data_source.id" = %self.source_id,
            "otel.kind" = "CLIENT"
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json_bytes::json;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::body_json;
    use wiremock::matchers::header;
    use wiremock::matchers::method;

    use super::*;
    use crate::graphql::Request;
    use crate::query_planner::OperationKind;

    fn configuration(url: &str) -> DataSourceConfiguration {
        DataSourceConfiguration {
            id: "accounts".to_string(),
            kind: DataSourceKind::Graphql {
                url: url.parse().unwrap(),
                headers: HashMap::from([("x-api-key".to_string(), "secret".to_string())]),
            },
            root_nodes: Vec::new(),
            child_nodes: Vec::new(),
            federation: Default::default(),
        }
    }

    fn fetch_request() -> FetchRequest {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("42"));
        FetchRequest {
            source_id: "accounts".to_string(),
            operation_kind: OperationKind::Query,
            body: Request::builder()
                .query("query($id: ID!) {user(id: $id) {name}}".to_string())
                .variables(json!({"id": "1"}).as_object().unwrap().clone())
                .build(),
            headers,
        }
    }

    #[tokio::test]
    async fn posts_the_operation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-api-key", "secret"))
            .and(header("x-request-id", "42"))
            .and(body_json(serde_json::json!({
                "query": "query($id: ID!) {user(id: $id) {name}}",
                "variables": {"id": "1"}
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(r#"{"data":{"user":{"name":"Ada"}}}"#, "application/json"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let source = GraphqlDataSourceFactory::default()
            .create(&configuration(&server.uri()))
            .unwrap();
        let body = source.load(fetch_request()).await.unwrap();
        assert_eq!(body.as_ref(), br#"{"data":{"user":{"name":"Ada"}}}"#);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let source = GraphqlDataSourceFactory::default()
            .create(&configuration(&server.uri()))
            .unwrap();
        let error = source.load(fetch_request()).await.unwrap_err();
        assert_eq!(
            error,
            FetchError::SubrequestHttpError {
                status_code: Some(502),
                source_id: "accounts".to_string(),
                reason: "Bad Gateway".to_string(),
            }
        );
    }

    #[test]
    fn invalid_headers_fail_the_build() {
        let mut configuration = configuration("http://localhost:4001");
        configuration.kind = DataSourceKind::Graphql {
            url: "http://localhost:4001".parse().unwrap(),
            headers: HashMap::from([("bad header".to_string(), "x".to_string())]),
        };
        assert!(matches!(
            GraphqlDataSourceFactory::default().create(&configuration),
            Err(ServiceBuildError::DataSource { .. })
        ));
    }
}
