use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use futures::StreamExt;
use graphql_engine::Configuration;
use graphql_engine::ExecutionEngine;
use graphql_engine::Schema;
use graphql_engine::protocols::WebSocketProtocol;
use graphql_engine::protocols::serve_websocket;
use graphql_engine::subscription::Engine;
use graphql_engine::subscription::EngineExecutorPool;
use graphql_engine::subscription::ExecutorPool;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::io::DuplexStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role;

const SCHEMA: &str = r#"
    type Query { hello: String }
    type Subscription { counter: Int }
"#;

fn configuration(websocket: &str) -> Configuration {
    Configuration::from_yaml(&format!(
        r#"
{websocket}
data_sources:
  - id: static
    kind:
      type: static
      data: {{ hello: world, counter: 1 }}
    root_nodes:
      - {{ type_name: Query, field_names: [hello] }}
      - {{ type_name: Subscription, field_names: [counter] }}
"#
    ))
    .unwrap()
}

async fn connect(
    configuration: Configuration,
    protocol: WebSocketProtocol,
) -> WebSocketStream<DuplexStream> {
    let execution = ExecutionEngine::builder()
        .schema(Arc::new(Schema::parse(SCHEMA).unwrap()))
        .configuration(configuration.clone())
        .build()
        .unwrap();
    let pool = EngineExecutorPool::builder().engine(execution).build();
    let engine = Engine::builder()
        .pool(Arc::new(pool) as Arc<dyn ExecutorPool>)
        .configuration(configuration.subscription.clone())
        .build();

    let (server, client) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        serve_websocket(server, protocol, engine, &configuration, None).await;
    });
    WebSocketStream::from_raw_socket(client, Role::Client, None).await
}

async fn send(client: &mut WebSocketStream<DuplexStream>, message: serde_json::Value) {
    client.send(Message::text(message.to_string())).await.unwrap();
}

async fn next_json(client: &mut WebSocketStream<DuplexStream>) -> serde_json::Value {
    loop {
        match client.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("expected a text message, got {other:?}"),
        }
    }
}

async fn next_close(client: &mut WebSocketStream<DuplexStream>) -> (u16, String) {
    loop {
        match client.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                return (u16::from(frame.code), frame.reason.as_str().to_string());
            }
            Some(Ok(Message::Text(_) | Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("expected a close frame, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn graphql_transport_ws_subscription() {
    let mut client = connect(configuration(""), WebSocketProtocol::GraphqlTransportWs).await;

    send(&mut client, json!({"type": "connection_init"})).await;
    assert_eq!(next_json(&mut client).await, json!({"type": "connection_ack"}));

    send(
        &mut client,
        json!({"id": "1", "type": "subscribe", "payload": {"query": "subscription { counter }"}}),
    )
    .await;
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "next", "id": "1", "payload": {"data": {"counter": 1}}})
    );

    send(&mut client, json!({"id": "1", "type": "complete"})).await;
    loop {
        let message = next_json(&mut client).await;
        if message["type"] == "complete" {
            assert_eq!(message["id"], "1");
            break;
        }
    }
}

#[tokio::test]
async fn duplicate_subscriber_id_closes_the_connection() {
    let mut client = connect(configuration(""), WebSocketProtocol::GraphqlTransportWs).await;

    send(&mut client, json!({"type": "connection_init"})).await;
    assert_eq!(next_json(&mut client).await, json!({"type": "connection_ack"}));

    let subscribe =
        json!({"id": "1", "type": "subscribe", "payload": {"query": "subscription { counter }"}});
    send(&mut client, subscribe.clone()).await;
    send(&mut client, subscribe).await;
    assert_eq!(
        next_close(&mut client).await,
        (4409, "Subscriber for 1 already exists".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn late_connection_init_finds_the_connection_closed() {
    let mut client = connect(
        configuration("websocket:\n  init_timeout: 1s"),
        WebSocketProtocol::GraphqlTransportWs,
    )
    .await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    // the server may already be gone
    let _ = client
        .send(Message::text(json!({"type": "connection_init"}).to_string()))
        .await;

    assert_eq!(
        next_close(&mut client).await,
        (4408, "Connection initialisation timeout".to_string())
    );
    assert!(!matches!(
        client.next().await,
        Some(Ok(Message::Text(_)))
    ));
}

#[tokio::test]
async fn graphql_ws_query() {
    let mut client = connect(configuration(""), WebSocketProtocol::GraphqlWs).await;

    send(&mut client, json!({"type": "connection_init", "payload": {}})).await;
    assert_eq!(next_json(&mut client).await, json!({"type": "connection_ack"}));

    send(
        &mut client,
        json!({"id": "q", "type": "start", "payload": {"query": "{ hello }"}}),
    )
    .await;
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "data", "id": "q", "payload": {"data": {"hello": "world"}}})
    );
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "complete", "id": "q"})
    );

    send(&mut client, json!({"type": "connection_terminate"})).await;
    let _ = client.close(None).await;
}
