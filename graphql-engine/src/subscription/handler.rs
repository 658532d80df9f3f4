use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::Engine;
use super::Event;
use super::TimeOut;
use super::TransportClient;
use crate::error::SubscriptionError;
use crate::protocols::Protocol;

const DEFAULT_READ_ERROR_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECTION_SPAN_NAME: &str = "websocket_connection";

/// Drives one client connection: reads its messages and hands them to a [`Protocol`].
pub struct UniversalProtocolHandler<C> {
    client: C,
    protocol: Arc<dyn Protocol>,
    engine: Engine,
    connection: CancellationToken,
    read_error_timeout: Duration,
    read_error_timer: TimeOut,
}

impl<C> UniversalProtocolHandler<C>
where
    C: TransportClient,
{
    pub fn new(
        client: C,
        protocol: Arc<dyn Protocol>,
        engine: Engine,
        connection: CancellationToken,
    ) -> Self {
        Self {
            client,
            protocol,
            engine,
            connection,
            read_error_timeout: DEFAULT_READ_ERROR_TIMEOUT,
            read_error_timer: TimeOut::new("read_error"),
        }
    }

    /// Time after a read error before the connection is closed, unless a read succeeds first.
    pub fn with_read_error_timeout(mut self, timeout: Duration) -> Self {
        self.read_error_timeout = timeout;
        self
    }

    /// Runs until the client goes away or the connection is cancelled. Every operation of the
    /// connection is stopped on return.
    pub async fn handle(mut self) {
        let span = tracing::info_span!(CONNECTION_SPAN_NAME, "otel.kind" = "SERVER");
        async {
            let events = self.protocol.event_handler();
            events.emit(Event::ConnectionOpened);

            loop {
                let message = tokio::select! {
                    biased;
                    _ = self.connection.cancelled() => break,
                    message = self.client.read_message() => message,
                };
                match message {
                    Ok(Some(data)) => {
                        self.read_error_timer.stop();
                        if let Err(error) = self.protocol.handle(data, &self.engine).await {
                            log_protocol_error(&error);
                        }
                    }
                    Ok(None) => {
                        tracing::debug!("client closed the connection");
                        break;
                    }
                    Err(error) => {
                        let connection = self.connection.clone();
                        self.read_error_timer.start(
                            &self.connection,
                            self.read_error_timeout,
                            move || connection.cancel(),
                        );
                        events.emit(Event::ConnectionError { error });
                    }
                }
            }

            if let Err(error) = self.engine.terminate_all_subscriptions(events.as_ref()) {
                log_protocol_error(&error);
            }
            self.connection.cancel();
        }
        .instrument(span)
        .await
    }
}

fn log_protocol_error(error: &SubscriptionError) {
    if error.is_expected() {
        tracing::debug!(%error, "operation rejected");
    } else {
        tracing::error!(%error, "could not handle client message");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;
    use crate::subscription::EventHandler;
    use crate::subscription::ExecutorPool;
    use crate::subscription::executor::Executor;
    use crate::subscription::test_utils::ChannelClient;
    use crate::subscription::test_utils::ChannelHandler;

    struct Recording {
        messages: Mutex<Vec<Bytes>>,
        events: Arc<ChannelHandler>,
    }

    #[async_trait]
    impl Protocol for Recording {
        async fn handle(&self, data: Bytes, _: &Engine) -> Result<(), SubscriptionError> {
            if data.as_ref() == b"bad" {
                return Err(SubscriptionError::InvalidPayload {
                    reason: "bad".to_string(),
                });
            }
            self.messages.lock().push(data);
            Ok(())
        }

        fn event_handler(&self) -> Arc<dyn EventHandler> {
            self.events.clone()
        }
    }

    struct NoPool;

    impl ExecutorPool for NoPool {
        fn get(
            &self,
            _: crate::graphql::Request,
        ) -> Result<Box<dyn Executor>, SubscriptionError> {
            Err(SubscriptionError::Transport("unused".to_string()))
        }
    }

    fn setup() -> (
        UniversalProtocolHandler<ChannelClient>,
        Arc<Recording>,
        mpsc::UnboundedSender<Result<Bytes, SubscriptionError>>,
        mpsc::UnboundedReceiver<Event>,
        CancellationToken,
    ) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (events, event_receiver) = ChannelHandler::new();
        let protocol = Arc::new(Recording {
            messages: Default::default(),
            events: Arc::new(events),
        });
        let connection = CancellationToken::new();
        let engine = Engine::builder()
            .pool(Arc::new(NoPool) as Arc<dyn ExecutorPool>)
            .build();
        let handler = UniversalProtocolHandler::new(
            ChannelClient(receiver),
            protocol.clone(),
            engine,
            connection.clone(),
        );
        (handler, protocol, sender, event_receiver, connection)
    }

    #[tokio::test]
    async fn forwards_messages_until_the_client_leaves() {
        let (handler, protocol, sender, mut events, connection) = setup();
        sender.send(Ok(Bytes::from_static(b"one"))).unwrap();
        sender.send(Ok(Bytes::from_static(b"two"))).unwrap();
        drop(sender);

        handler.handle().await;
        assert_eq!(events.recv().await, Some(Event::ConnectionOpened));
        assert_eq!(
            *protocol.messages.lock(),
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
        assert!(connection.is_cancelled());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn protocol_errors_are_logged() {
        let (handler, protocol, sender, _events, _connection) = setup();
        sender.send(Ok(Bytes::from_static(b"bad"))).unwrap();
        drop(sender);

        handler.handle().await;
        assert!(protocol.messages.lock().is_empty());
        assert!(logs_contain("could not handle client message"));
    }

    #[tokio::test(start_paused = true)]
    async fn read_errors_close_the_connection_after_a_while() {
        let (handler, _protocol, sender, mut events, connection) = setup();
        let handle = tokio::spawn(handler.handle());

        sender
            .send(Err(SubscriptionError::CouldNotReadMessageFromClient))
            .unwrap();
        assert_eq!(events.recv().await, Some(Event::ConnectionOpened));
        assert_eq!(
            events.recv().await,
            Some(Event::ConnectionError {
                error: SubscriptionError::CouldNotReadMessageFromClient
            })
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(connection.is_cancelled());
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn a_successful_read_stops_the_read_error_timer() {
        let (handler, protocol, sender, _events, connection) = setup();
        let handle = tokio::spawn(handler.handle());

        sender
            .send(Err(SubscriptionError::CouldNotReadMessageFromClient))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        sender.send(Ok(Bytes::from_static(b"{}"))).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!connection.is_cancelled());
        assert_eq!(protocol.messages.lock().len(), 1);

        connection.cancel();
        handle.await.unwrap();
    }
}
