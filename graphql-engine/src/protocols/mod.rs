//! Implements the WebSocket _server_ protocols for GraphQL subscriptions.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use http::HeaderValue;
use http::header::SEC_WEBSOCKET_PROTOCOL;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tower::BoxError;

pub use self::graphql_transport_ws::GraphqlTransportWsProtocol;
pub use self::graphql_ws::GraphqlWsProtocol;
use crate::configuration::Configuration;
use crate::error::SubscriptionError;
use crate::subscription::Engine;
use crate::subscription::EventHandler;
use crate::subscription::UniversalProtocolHandler;
use crate::subscription::WebSocketTransportClient;
use crate::subscription::spawn_writer;

mod graphql_transport_ws;
mod graphql_ws;

/// The WebSocket subprotocol name of the graphql-ws library protocol.
/// See [`WebSocketProtocol::GraphqlTransportWs`].
const GRAPHQL_TRANSPORT_WS_SUBPROTOCOL: &str = "graphql-transport-ws";
/// The WebSocket subprotocol name of the legacy subscriptions-transport-ws protocol.
/// See [`WebSocketProtocol::GraphqlWs`].
const GRAPHQL_WS_SUBPROTOCOL: &str = "graphql-ws";

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema, Copy)]
#[serde(rename_all = "snake_case")]
pub enum WebSocketProtocol {
    /// The graphql-ws library protocol. The subprotocol name is "graphql-transport-ws".
    ///
    /// Spec URL: https://github.com/enisdenjo/graphql-ws/blob/0c0eb499c3a0278c6d9cc799064f22c5d24d2f60/PROTOCOL.md
    #[default]
    GraphqlTransportWs,
    /// The legacy subscriptions-transport-ws protocol. Confusingly, the subprotocol name is
    /// "graphql-ws".
    ///
    /// https://github.com/apollographql/subscriptions-transport-ws/blob/36f3f6f780acc1a458b768db13fd39c65e5e6518/PROTOCOL.md
    GraphqlWs,
}

impl From<WebSocketProtocol> for HeaderValue {
    fn from(value: WebSocketProtocol) -> Self {
        match value {
            WebSocketProtocol::GraphqlTransportWs => {
                HeaderValue::from_static(GRAPHQL_TRANSPORT_WS_SUBPROTOCOL)
            }
            WebSocketProtocol::GraphqlWs => HeaderValue::from_static(GRAPHQL_WS_SUBPROTOCOL),
        }
    }
}

/// Picks the protocol requested in the `Sec-WebSocket-Protocol` header.
///
/// The first supported protocol listed by the client wins; `default` is used when none is.
pub fn negotiate_protocol(headers: &HeaderMap, default: WebSocketProtocol) -> WebSocketProtocol {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(|name| match name.trim() {
            GRAPHQL_TRANSPORT_WS_SUBPROTOCOL => Some(WebSocketProtocol::GraphqlTransportWs),
            GRAPHQL_WS_SUBPROTOCOL => Some(WebSocketProtocol::GraphqlWs),
            _ => None,
        })
        .unwrap_or(default)
}

/// A wire protocol on top of the subscription [`Engine`].
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Handles one message of the client.
    async fn handle(&self, data: Bytes, engine: &Engine) -> Result<(), SubscriptionError>;

    /// Turns engine events into frames for the client.
    fn event_handler(&self) -> Arc<dyn EventHandler>;
}

/// Accepts or rejects the payload of a `connection_init` message.
pub trait ConnectionInit: Send + Sync {
    fn init(&self, payload: Option<&Value>) -> Result<(), BoxError>;
}

pub(crate) fn encode<T: Serialize>(message: &T) -> Option<Bytes> {
    match serde_json::to_vec(message) {
        Ok(data) => Some(data.into()),
        Err(error) => {
            tracing::error!(%error, "could not serialize websocket message");
            None
        }
    }
}

/// Parses a serialized response so that it can be embedded in a message.
pub(crate) fn response_payload(data: &[u8]) -> Value {
    serde_json::from_slice(data).unwrap_or_else(|error| {
        tracing::error!(%error, "invalid response");
        Value::Null
    })
}

/// Serves GraphQL operations on an accepted WebSocket until the connection ends.
pub async fn serve_websocket<S>(
    stream: WebSocketStream<S>,
    protocol: WebSocketProtocol,
    engine: Engine,
    configuration: &Configuration,
    connection_init: Option<Arc<dyn ConnectionInit>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client, writer) = WebSocketTransportClient::split(stream);
    let (sender, writer_handle) = spawn_writer(writer);
    let connection = CancellationToken::new();
    let websocket = &configuration.websocket;

    let protocol: Arc<dyn Protocol> = match protocol {
        WebSocketProtocol::GraphqlTransportWs => Arc::new(
            GraphqlTransportWsProtocol::builder()
                .sender(sender)
                .connection(connection.clone())
                .init_timeout(websocket.init_timeout)
                .heartbeat_interval(websocket.keep_alive_interval)
                .and_connection_init(connection_init)
                .build(),
        ),
        WebSocketProtocol::GraphqlWs => Arc::new(
            GraphqlWsProtocol::builder()
                .sender(sender)
                .connection(connection.clone())
                .keep_alive_interval(websocket.keep_alive_interval)
                .and_connection_init(connection_init)
                .build(),
        ),
    };

    UniversalProtocolHandler::new(client, protocol, engine, connection)
        .with_read_error_timeout(configuration.subscription.read_error_timeout)
        .handle()
        .await;

    if let Err(error) = writer_handle.await {
        tracing::error!(%error, "websocket writer task failed");
    }
}
