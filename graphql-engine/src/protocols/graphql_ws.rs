//! The legacy subscriptions-transport-ws protocol, negotiated as `graphql-ws`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::ConnectionInit;
use super::Protocol;
use super::encode;
use super::response_payload;
use crate::error::SubscriptionError;
use crate::graphql;
use crate::subscription::Engine;
use crate::subscription::Event;
use crate::subscription::EventHandler;
use crate::subscription::Frame;
use crate::subscription::FrameSender;

const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    ConnectionInit {
        #[serde(default)]
        payload: Option<Value>,
    },
    Start {
        id: String,
        payload: Value,
    },
    Stop {
        id: String,
    },
    ConnectionTerminate,
    #[serde(other)]
    Unknown,
}

#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage<'a> {
    ConnectionAck,
    ConnectionError {
        payload: ErrorMessage,
    },
    #[serde(rename = "ka")]
    KeepAlive,
    Data {
        id: &'a str,
        payload: Value,
    },
    Error {
        #[serde(skip_serializing_if = "is_empty")]
        id: &'a str,
        payload: Vec<graphql::Error>,
    },
    Complete {
        id: &'a str,
    },
}

fn is_empty(id: &&str) -> bool {
    id.is_empty()
}

#[derive(Serialize, Debug)]
struct ErrorMessage {
    message: String,
}

/// Server side of the legacy `graphql-ws` subprotocol.
pub struct GraphqlWsProtocol {
    events: Arc<EventWriter>,
    connection: CancellationToken,
    keep_alive_interval: Duration,
    connection_init: Option<Arc<dyn ConnectionInit>>,
}

#[buildstructor::buildstructor]
impl GraphqlWsProtocol {
    #[builder(visibility = "pub")]
    fn new(
        sender: FrameSender,
        connection: CancellationToken,
        keep_alive_interval: Option<Duration>,
        connection_init: Option<Arc<dyn ConnectionInit>>,
    ) -> Self {
        Self {
            events: Arc::new(EventWriter { sender }),
            connection,
            keep_alive_interval: keep_alive_interval.unwrap_or(DEFAULT_KEEP_ALIVE_INTERVAL),
            connection_init,
        }
    }

    fn handle_init(&self, payload: Option<Value>, engine: &Engine) -> Result<(), SubscriptionError> {
        if let Some(connection_init) = &self.connection_init
            && let Err(error) = connection_init.init(payload.as_ref())
        {
            let error = SubscriptionError::ConnectionInitRejected {
                reason: error.to_string(),
            };
            self.events.connection_error(error.to_string());
            engine.terminate_all_subscriptions(self.events.as_ref())?;
            return Err(error);
        }

        self.events.send(&ServerMessage::ConnectionAck);
        self.start_keep_alive();
        Ok(())
    }

    fn start_keep_alive(&self) {
        if self.keep_alive_interval.is_zero() {
            return;
        }
        let Some(keep_alive) = encode(&ServerMessage::KeepAlive) else {
            return;
        };
        let sender = self.events.sender.clone();
        let connection = self.connection.clone();
        let period = self.keep_alive_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = connection.cancelled() => break,
                    _ = interval.tick() => sender.send(keep_alive.clone()),
                }
            }
        });
    }
}

#[async_trait]
impl Protocol for GraphqlWsProtocol {
    async fn handle(&self, data: Bytes, engine: &Engine) -> Result<(), SubscriptionError> {
        let message: ClientMessage = match serde_json::from_slice(&data) {
            Ok(message) => message,
            Err(error) => {
                tracing::debug!(%error, "invalid client message");
                self.events.send(&ServerMessage::Error {
                    id: "",
                    payload: vec![
                        graphql::Error::builder()
                            .message("json syntax error")
                            .build(),
                    ],
                });
                return Ok(());
            }
        };

        match message {
            ClientMessage::ConnectionInit { payload } => self.handle_init(payload, engine),
            ClientMessage::Start { id, payload } => {
                match serde_json_bytes::from_value::<graphql::Request>(payload) {
                    Ok(request) => {
                        engine.start_operation(&self.connection, id, request, self.events.clone())
                    }
                    Err(error) => {
                        let error = SubscriptionError::InvalidPayload {
                            reason: error.to_string(),
                        };
                        self.events.emit(Event::Error {
                            id,
                            error: error.clone(),
                        });
                        Err(error)
                    }
                }
            }
            ClientMessage::Stop { id } => engine.stop_subscription(&id, self.events.as_ref()),
            ClientMessage::ConnectionTerminate => {
                engine.terminate_all_subscriptions(self.events.as_ref())
            }
            ClientMessage::Unknown => {
                self.events.connection_error("unknown message type".to_string());
                Ok(())
            }
        }
    }

    fn event_handler(&self) -> Arc<dyn EventHandler> {
        self.events.clone()
    }
}

struct EventWriter {
    sender: FrameSender,
}

impl EventWriter {
    fn send(&self, message: &ServerMessage<'_>) {
        if let Some(data) = encode(message) {
            self.sender.send(data);
        }
    }

    fn connection_error(&self, message: String) {
        self.send(&ServerMessage::ConnectionError {
            payload: ErrorMessage { message },
        });
    }
}

impl EventHandler for EventWriter {
    fn emit(&self, event: Event) {
        match event {
            Event::SubscriptionData { id, data } => self.send(&ServerMessage::Data {
                id: &id,
                payload: response_payload(&data),
            }),
            Event::NonSubscriptionExecutionResult { id, data } => {
                let data = encode(&ServerMessage::Data {
                    id: &id,
                    payload: response_payload(&data),
                });
                let complete = encode(&ServerMessage::Complete { id: &id });
                self.sender
                    .send_all(data.into_iter().chain(complete).map(Frame::Message));
            }
            Event::SubscriptionCompleted { id } => self.send(&ServerMessage::Complete { id: &id }),
            Event::Error { id, error } => self.send(&ServerMessage::Error {
                id: &id,
                payload: error.to_graphql_errors(),
            }),
            Event::DuplicatedSubscriberId { id } => {
                let error = SubscriptionError::SubscriberIdAlreadyExists { id: id.clone() };
                self.send(&ServerMessage::Error {
                    id: &id,
                    payload: error.to_graphql_errors(),
                });
            }
            Event::ConnectionError { error } => self.connection_error(error.to_string()),
            Event::ConnectionOpened | Event::ConnectionTerminatedByServer => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::subscription::ExecutorPool;
    use crate::subscription::spawn_writer;
    use crate::subscription::test_utils::ChannelWriter;
    use crate::subscription::test_utils::static_pool;

    struct Harness {
        protocol: GraphqlWsProtocol,
        engine: Engine,
        frames: mpsc::UnboundedReceiver<Frame>,
        connection: CancellationToken,
    }

    impl Harness {
        fn new(connection_init: Option<Arc<dyn ConnectionInit>>) -> Self {
            let (frames_sender, frames) = mpsc::unbounded_channel();
            let (sender, _) = spawn_writer(ChannelWriter(frames_sender));
            let connection = CancellationToken::new();
            let protocol = GraphqlWsProtocol::builder()
                .sender(sender)
                .connection(connection.clone())
                .and_connection_init(connection_init)
                .build();
            let engine = Engine::builder()
                .pool(Arc::new(static_pool()) as Arc<dyn ExecutorPool>)
                .build();
            Self {
                protocol,
                engine,
                frames,
                connection,
            }
        }

        async fn send(&self, message: &str) -> Result<(), SubscriptionError> {
            self.protocol
                .handle(Bytes::copy_from_slice(message.as_bytes()), &self.engine)
                .await
        }

        async fn next_message(&mut self) -> serde_json::Value {
            match self.frames.recv().await {
                Some(Frame::Message(data)) => serde_json::from_slice(&data).unwrap(),
                other => panic!("expected a message, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn start_and_stop() {
        let mut harness = Harness::new(None);
        harness.send(r#"{"type":"connection_init"}"#).await.unwrap();
        assert_eq!(harness.next_message().await, json!({"type": "connection_ack"}));

        harness
            .send(r#"{"id":"1","type":"start","payload":{"query":"subscription { counter }"}}"#)
            .await
            .unwrap();
        assert_eq!(
            harness.next_message().await,
            json!({"type": "data", "id": "1", "payload": {"data": {"counter": 1}}})
        );

        harness.send(r#"{"id":"1","type":"stop"}"#).await.unwrap();
        loop {
            let message = harness.next_message().await;
            if message["type"] == "complete" {
                assert_eq!(message, json!({"type": "complete", "id": "1"}));
                break;
            }
        }
        assert_eq!(harness.engine.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn queries_send_data_then_complete() {
        let mut harness = Harness::new(None);
        harness
            .send(r#"{"id":"q","type":"start","payload":{"query":"{ hello }"}}"#)
            .await
            .unwrap();
        assert_eq!(
            harness.next_message().await,
            json!({"type": "data", "id": "q", "payload": {"data": {"hello": "world"}}})
        );
        assert_eq!(
            harness.next_message().await,
            json!({"type": "complete", "id": "q"})
        );
    }

    #[tokio::test]
    async fn duplicate_ids_fail_the_operation_only() {
        let mut harness = Harness::new(None);
        let start = r#"{"id":"1","type":"start","payload":{"query":"subscription { counter }"}}"#;
        harness.send(start).await.unwrap();
        harness.send(start).await.unwrap_err();

        loop {
            let message = harness.next_message().await;
            if message["type"] == "error" {
                assert_eq!(
                    message,
                    json!({
                        "type": "error",
                        "id": "1",
                        "payload": [{"message": "subscriber for 1 already exists"}]
                    })
                );
                break;
            }
        }
        assert!(!harness.connection.is_cancelled());
        assert_eq!(harness.engine.active_subscriptions(), 1);
    }

    #[tokio::test]
    async fn malformed_messages() {
        let mut harness = Harness::new(None);
        harness.send("{").await.unwrap();
        assert_eq!(
            harness.next_message().await,
            json!({"type": "error", "payload": [{"message": "json syntax error"}]})
        );

        harness.send(r#"{"type":"unknown"}"#).await.unwrap();
        assert_eq!(
            harness.next_message().await,
            json!({"type": "connection_error", "payload": {"message": "unknown message type"}})
        );
    }

    #[tokio::test]
    async fn rejected_initialisation_terminates_subscriptions() {
        struct Reject;
        impl ConnectionInit for Reject {
            fn init(&self, _: Option<&Value>) -> Result<(), tower::BoxError> {
                Err("invalid token".into())
            }
        }

        let mut harness = Harness::new(Some(Arc::new(Reject)));
        harness
            .send(r#"{"id":"1","type":"start","payload":{"query":"subscription { counter }"}}"#)
            .await
            .unwrap();
        assert_eq!(harness.next_message().await["type"], "data");

        harness
            .send(r#"{"type":"connection_init"}"#)
            .await
            .unwrap_err();
        loop {
            let message = harness.next_message().await;
            if message["type"] == "connection_error" {
                assert_eq!(
                    message["payload"]["message"],
                    "connection initialisation rejected: invalid token"
                );
                break;
            }
        }
        assert_eq!(harness.engine.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_the_connection_alive() {
        let mut harness = Harness::new(None);
        harness.send(r#"{"type":"connection_init"}"#).await.unwrap();
        assert_eq!(harness.next_message().await["type"], "connection_ack");

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(harness.next_message().await, json!({"type": "ka"}));
        harness.connection.cancel();
    }
}
