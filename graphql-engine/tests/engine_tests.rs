use std::sync::Arc;

use graphql_engine::Configuration;
use graphql_engine::ExecutionEngine;
use graphql_engine::ExecutionOptions;
use graphql_engine::Schema;
use graphql_engine::ast::print_document;
use graphql_engine::graphql::Request;
use http::HeaderMap;
use http::HeaderValue;
use pretty_assertions::assert_eq;
use serde_json::json;
use serde_json_bytes::ByteString;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::body_partial_json;
use wiremock::matchers::method;

const STAR_WARS: &str = r#"
    type Query {
        hero: Character
        search(name: String): SearchResult
    }
    interface Character { name: String }
    type Human implements Character { name: String height: Float }
    type Droid implements Character { name: String primaryFunction: String }
    union SearchResult = Human | Droid
"#;

fn engine(schema: &str, configuration: &str) -> ExecutionEngine {
    ExecutionEngine::builder()
        .schema(Arc::new(Schema::parse(schema).unwrap()))
        .configuration(Configuration::from_yaml(configuration).unwrap())
        .build()
        .unwrap()
}

#[tokio::test]
async fn hero_query_against_a_single_data_source() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"hero": {"name": "Luke Skywalker"}}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine(
        STAR_WARS,
        &format!(
            r#"
data_sources:
  - id: star_wars
    kind: {{ type: graphql, url: "{}" }}
    root_nodes:
      - {{ type_name: Query, field_names: [hero, search] }}
      - {{ type_name: Human, field_names: [name, height] }}
      - {{ type_name: Droid, field_names: [name, primaryFunction] }}
"#,
            server.uri()
        ),
    );

    let mut request = Request::builder().query("{hero{name}}".to_string()).build();
    let mut output = Vec::new();
    engine
        .execute(&mut request, &mut output, &ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(
        String::from_utf8(output).unwrap(),
        r#"{"data":{"hero":{"name":"Luke Skywalker"}}}"#
    );
}

#[test]
fn unused_variables_are_stripped() {
    let schema = Schema::parse(STAR_WARS).unwrap();
    let mut request = Request::builder()
        .query(
            "query MySearch($s: String!, $other: String) {search(name: $s) {...on Human {name}}}"
                .to_string(),
        )
        .operation_name("MySearch".to_string())
        .variable("s", "Luke")
        .variable("other", "other")
        .build();

    let result = request.normalize(&schema).unwrap();
    assert!(result.successful);
    assert_eq!(
        print_document(request.document()),
        "query MySearch($s: String!) {search(name: $s) {... on Human {name}}}"
    );
    assert_eq!(request.variables.len(), 1);
    assert_eq!(
        request.variables.get("s"),
        Some(&serde_json_bytes::Value::String(ByteString::from("Luke")))
    );

    // normalizing again is a no-op
    assert!(request.normalize(&schema).unwrap().successful);
    assert_eq!(
        print_document(request.document()),
        "query MySearch($s: String!) {search(name: $s) {... on Human {name}}}"
    );
}

#[tokio::test]
async fn entity_fetches_run_after_the_owning_subgraph() {
    let accounts = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"me": {"__typename": "User", "id": "1", "username": "ada"}}
        })))
        .expect(1)
        .mount(&accounts)
        .await;

    let reviews = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "variables": {"representations": [{"__typename": "User", "id": "1"}]}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"_entities": [{"reviews": [{"body": "great"}, {"body": "meh"}]}]}
        })))
        .expect(1)
        .mount(&reviews)
        .await;

    let engine = engine(
        r#"
        scalar _Any
        type Query { me: User }
        type User { id: ID! username: String reviews: [Review] }
        type Review { body: String }
        "#,
        &format!(
            r#"
data_sources:
  - id: accounts
    kind: {{ type: graphql, url: "{}" }}
    root_nodes:
      - {{ type_name: Query, field_names: [me] }}
      - {{ type_name: User, field_names: [id, username] }}
    federation:
      keys: [{{ type_name: User, selection_set: id }}]
  - id: reviews
    kind: {{ type: graphql, url: "{}" }}
    root_nodes:
      - {{ type_name: User, field_names: [reviews] }}
    child_nodes:
      - {{ type_name: Review, field_names: [body] }}
    federation:
      keys: [{{ type_name: User, selection_set: id }}]
"#,
            accounts.uri(),
            reviews.uri()
        ),
    );

    let mut request = Request::builder()
        .query("{me {username reviews {body}}}".to_string())
        .build();
    let response = engine
        .execute_to_response(&mut request, &ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        json!({"data": {"me": {"username": "ada", "reviews": [{"body": "great"}, {"body": "meh"}]}}})
    );

    let first = accounts.received_requests().await.unwrap();
    let second = reviews.received_requests().await.unwrap();
    assert_eq!((first.len(), second.len()), (1, 1));
}

#[tokio::test]
async fn upstream_failures_become_field_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let engine = engine(
        STAR_WARS,
        &format!(
            r#"
data_sources:
  - id: star_wars
    kind: {{ type: graphql, url: "{}" }}
    root_nodes:
      - {{ type_name: Query, field_names: [hero] }}
"#,
            server.uri()
        ),
    );

    let mut request = Request::builder().query("{hero{name}}".to_string()).build();
    let response = engine
        .execute_to_response(&mut request, &ExecutionOptions::default())
        .await
        .unwrap();
    let hero = response
        .data
        .as_ref()
        .and_then(|data| data.as_object())
        .and_then(|data| data.get("hero"));
    assert!(hero.is_none_or(|hero| hero.is_null()));
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].extension_code().as_deref(), Some("SUBREQUEST_HTTP_ERROR"));
}

#[tokio::test]
async fn concurrent_requests_share_one_plan() {
    let engine = engine(
        "type Query { hello: String }",
        r#"
engine:
  fingerprint_headers: [x-tenant]
data_sources:
  - id: static
    kind: { type: static, data: { hello: world } }
    root_nodes:
      - { type_name: Query, field_names: [hello] }
"#,
    );

    let responses = futures::future::join_all((0..16).map(|_| {
        let engine = engine.clone();
        async move {
            let mut request = Request::builder().query("{ hello }".to_string()).build();
            engine
                .execute_to_response(&mut request, &ExecutionOptions::default())
                .await
                .unwrap()
        }
    }))
    .await;
    assert!(
        responses
            .iter()
            .all(|response| response.data == Some(json!({"hello": "world"}).into()))
    );
    assert_eq!(engine.cached_plans(), 1);

    // a fingerprinted header value gets its own plan
    let mut headers = HeaderMap::new();
    headers.insert("x-tenant", HeaderValue::from_static("acme"));
    let mut request = Request::builder().query("{ hello }".to_string()).build();
    engine
        .execute_to_response(
            &mut request,
            &ExecutionOptions::builder().request_headers(headers).build(),
        )
        .await
        .unwrap();
    assert_eq!(engine.cached_plans(), 2);
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_planning() {
    let engine = engine(
        "type Query { hello: String }",
        r#"
data_sources:
  - id: static
    kind: { type: static, data: { hello: world } }
    root_nodes:
      - { type_name: Query, field_names: [hello] }
"#,
    );
    let mut request = Request::builder().query("{ goodbye }".to_string()).build();
    let mut output = Vec::new();
    let error = engine
        .execute(&mut request, &mut output, &ExecutionOptions::default())
        .await
        .unwrap_err();
    assert!(!error.to_graphql_errors().is_empty());
    assert!(output.is_empty());
    assert_eq!(engine.cached_plans(), 0);
}
