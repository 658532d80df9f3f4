//! The graphql-ws library protocol, negotiated as `graphql-transport-ws`.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value;
use serde_json_bytes::json;
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
use crate::subscription::TimeOut;

const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

const BAD_REQUEST: u16 = 4400;
const UNAUTHORIZED: u16 = 4401;
const CONNECTION_INITIALISATION_TIMEOUT: u16 = 4408;
const SUBSCRIBER_ALREADY_EXISTS: u16 = 4409;
const TOO_MANY_INITIALISATION_REQUESTS: u16 = 4429;
const INTERNAL_SERVER_ERROR: u16 = 4500;

#[derive(Deserialize, Debug)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage<'a> {
    ConnectionAck,
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Next {
        id: &'a str,
        payload: Value,
    },
    Error {
        id: &'a str,
        payload: Vec<graphql::Error>,
    },
    Complete {
        id: &'a str,
    },
}

/// Server side of the `graphql-transport-ws` subprotocol.
pub struct GraphqlTransportWsProtocol {
    events: Arc<EventWriter>,
    connection_init: Option<Arc<dyn ConnectionInit>>,
    heartbeat_interval: Duration,
    initialized: AtomicBool,
}

#[buildstructor::buildstructor]
impl GraphqlTransportWsProtocol {
    #[builder(visibility = "pub")]
    fn new(
        sender: FrameSender,
        connection: CancellationToken,
        init_timeout: Option<Duration>,
        heartbeat_interval: Option<Duration>,
        connection_init: Option<Arc<dyn ConnectionInit>>,
    ) -> Self {
        Self {
            events: Arc::new(EventWriter {
                sender,
                connection,
                init_timer: TimeOut::new("connection_init"),
                init_timeout: init_timeout.unwrap_or(DEFAULT_INIT_TIMEOUT),
            }),
            connection_init,
            heartbeat_interval: heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL),
            initialized: AtomicBool::new(false),
        }
    }

    fn handle_init(&self, payload: Option<Value>) -> Result<(), SubscriptionError> {
        if self.initialized.load(Ordering::Acquire) {
            self.events
                .close(TOO_MANY_INITIALISATION_REQUESTS, "Too many initialisation requests");
            return Ok(());
        }
        if let Some(connection_init) = &self.connection_init
            && let Err(error) = connection_init.init(payload.as_ref())
        {
            self.events
                .close(INTERNAL_SERVER_ERROR, "Internal server error");
            return Err(SubscriptionError::ConnectionInitRejected {
                reason: error.to_string(),
            });
        }

        self.events.init_timer.stop();
        self.events.send(&ServerMessage::ConnectionAck);
        self.initialized.store(true, Ordering::Release);
        self.start_heartbeat();
        Ok(())
    }

    fn start_heartbeat(&self) {
        if self.heartbeat_interval.is_zero() {
            return;
        }
        let Some(heartbeat) = encode(&ServerMessage::Pong {
            payload: Some(json!({ "type": "heartbeat" })),
        }) else {
            return;
        };
        let sender = self.events.sender.clone();
        let connection = self.events.connection.clone();
        let period = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = connection.cancelled() => break,
                    _ = interval.tick() => sender.send(heartbeat.clone()),
                }
            }
        });
    }

    fn handle_subscribe(
        &self,
        id: Option<String>,
        payload: Option<Value>,
        engine: &Engine,
    ) -> Result<(), SubscriptionError> {
        if !self.initialized.load(Ordering::Acquire) {
            self.events.close(UNAUTHORIZED, "Unauthorized");
            return Ok(());
        }
        let Some(id) = id else {
            self.events
                .close(BAD_REQUEST, "Invalid message received: missing id");
            return Ok(());
        };
        let request = match payload.map(serde_json_bytes::from_value::<graphql::Request>) {
            Some(Ok(request)) => request,
            Some(Err(error)) => {
                self.events
                    .close(BAD_REQUEST, format!("Invalid subscribe payload: {error}"));
                return Ok(());
            }
            None => {
                self.events
                    .close(BAD_REQUEST, "Invalid subscribe payload: missing payload");
                return Ok(());
            }
        };
        engine.start_operation(
            &self.events.connection,
            id,
            request,
            self.events.clone(),
        )
    }
}

#[async_trait]
impl Protocol for GraphqlTransportWsProtocol {
    async fn handle(&self, data: Bytes, engine: &Engine) -> Result<(), SubscriptionError> {
        let message: ClientMessage = match serde_json::from_slice(&data) {
            Ok(message) => message,
            Err(error) => {
                tracing::debug!(%error, "invalid client message");
                self.events.close(BAD_REQUEST, "JSON syntax error");
                return Ok(());
            }
        };

        match message.kind.as_str() {
            "connection_init" => self.handle_init(message.payload),
            "ping" => {
                self.events.send(&ServerMessage::Pong {
                    payload: message.payload,
                });
                Ok(())
            }
            "pong" => Ok(()),
            "subscribe" => self.handle_subscribe(message.id, message.payload, engine),
            "complete" => {
                match message.id {
                    Some(id) => engine.stop_subscription(&id, self.events.as_ref()),
                    None => Ok(()),
                }
            }
            other => {
                self.events
                    .close(BAD_REQUEST, format!("Invalid type '{other}'"));
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
    connection: CancellationToken,
    init_timer: TimeOut,
    init_timeout: Duration,
}

impl EventWriter {
    fn send(&self, message: &ServerMessage<'_>) {
        if let Some(data) = encode(message) {
            self.sender.send(data);
        }
    }

    fn close(&self, code: u16, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::debug!(code, reason = reason.as_str(), "closing connection");
        self.sender.close(code, reason);
        self.connection.cancel();
    }
}

impl EventHandler for EventWriter {
    fn emit(&self, event: Event) {
        match event {
            Event::ConnectionOpened => {
                let sender = self.sender.clone();
                let connection = self.connection.clone();
                self.init_timer
                    .start(&self.connection, self.init_timeout, move || {
                        sender.close(
                            CONNECTION_INITIALISATION_TIMEOUT,
                            "Connection initialisation timeout",
                        );
                        connection.cancel();
                    });
            }
            Event::SubscriptionData { id, data } => self.send(&ServerMessage::Next {
                id: &id,
                payload: response_payload(&data),
            }),
            Event::NonSubscriptionExecutionResult { id, data } => {
                let next = encode(&ServerMessage::Next {
                    id: &id,
                    payload: response_payload(&data),
                });
                let complete = encode(&ServerMessage::Complete { id: &id });
                self.sender
                    .send_all(next.into_iter().chain(complete).map(Frame::Message));
            }
            Event::SubscriptionCompleted { id } => self.send(&ServerMessage::Complete { id: &id }),
            Event::Error { id, error } => self.send(&ServerMessage::Error {
                id: &id,
                payload: error.to_graphql_errors(),
            }),
            Event::DuplicatedSubscriberId { id } => self.close(
                SUBSCRIBER_ALREADY_EXISTS,
                format!("Subscriber for {id} already exists"),
            ),
            Event::ConnectionError { error } => {
                tracing::debug!(%error, "connection error");
            }
            Event::ConnectionTerminatedByServer => {}
        }
    }
}
