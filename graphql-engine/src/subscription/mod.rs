//! Long running operations over a persistent connection.
//!
//! The [`Engine`] owns the active subscriptions of one connection and reports everything that
//! happens to them through an [`EventHandler`]. Wire protocols translate those events into
//! frames.

use bytes::Bytes;

pub use self::engine::BeforeStartHook;
pub use self::engine::Engine;
pub use self::executor::EngineExecutorPool;
pub use self::executor::Executor;
pub use self::executor::ExecutorPool;
pub use self::handler::UniversalProtocolHandler;
pub(crate) use self::time_out::TimeOut;
pub use self::transport::Frame;
pub use self::transport::FrameSender;
pub use self::transport::TransportClient;
pub use self::transport::TransportWriter;
pub use self::transport::WebSocketTransportClient;
pub use self::transport::WebSocketTransportWriter;
pub use self::transport::spawn_writer;
use crate::error::SubscriptionError;

mod engine;
mod executor;
mod handler;
mod time_out;
mod transport;

pub(crate) const SUBSCRIPTION_SPAN_NAME: &str = "subscription";

/// Something that happened on a connection or to one of its operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ConnectionOpened,
    ConnectionError { error: SubscriptionError },
    ConnectionTerminatedByServer,
    SubscriptionData { id: String, data: Bytes },
    NonSubscriptionExecutionResult { id: String, data: Bytes },
    SubscriptionCompleted { id: String },
    Error { id: String, error: SubscriptionError },
    DuplicatedSubscriberId { id: String },
}

/// Receives the events of a connection.
pub trait EventHandler: Send + Sync {
    fn emit(&self, event: Event);
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::EngineExecutorPool;
    use super::Event;
    use super::EventHandler;
    use super::Frame;
    use super::TransportClient;
    use super::TransportWriter;
    use crate::configuration::Configuration;
    use crate::engine::ExecutionEngine;
    use crate::error::SubscriptionError;
    use crate::spec::Schema;

    /// A pool executing operations against static data: `hello` is "world" and the `counter`
    /// subscription always yields 1.
    pub(crate) fn static_pool() -> EngineExecutorPool {
        let schema = Schema::parse(
            r#"
            type Query { hello: String }
            type Subscription { counter: Int }
            "#,
        )
        .unwrap();
        let configuration = Configuration::from_yaml(
            r#"
data_sources:
  - id: static
    kind:
      type: static
      data: { hello: world, counter: 1 }
    root_nodes:
      - type_name: Query
        field_names: [hello]
      - type_name: Subscription
        field_names: [counter]
"#,
        )
        .unwrap();
        let engine = ExecutionEngine::builder()
            .schema(Arc::new(schema))
            .configuration(configuration)
            .build()
            .unwrap();
        EngineExecutorPool::builder().engine(engine).build()
    }

    /// A client whose messages are pushed through a channel.
    pub(crate) struct ChannelClient(
        pub(crate) mpsc::UnboundedReceiver<Result<Bytes, SubscriptionError>>,
    );

    #[async_trait]
    impl TransportClient for ChannelClient {
        async fn read_message(&mut self) -> Result<Option<Bytes>, SubscriptionError> {
            self.0.recv().await.transpose()
        }
    }

    /// A writer forwarding frames to a channel.
    pub(crate) struct ChannelWriter(pub(crate) mpsc::UnboundedSender<Frame>);

    #[async_trait]
    impl TransportWriter for ChannelWriter {
        async fn write_frame(&mut self, frame: Frame) -> Result<(), SubscriptionError> {
            self.0
                .send(frame)
                .map_err(|error| SubscriptionError::Transport(error.to_string()))
        }
    }

    /// Forwards every event to a channel.
    pub(crate) struct ChannelHandler {
        sender: Mutex<mpsc::UnboundedSender<Event>>,
    }

    impl ChannelHandler {
        pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
            let (sender, receiver) = mpsc::unbounded_channel();
            (
                Self {
                    sender: Mutex::new(sender),
                },
                receiver,
            )
        }
    }

    impl EventHandler for ChannelHandler {
        fn emit(&self, event: Event) {
            let _ = self.sender.lock().send(event);
        }
    }
}
