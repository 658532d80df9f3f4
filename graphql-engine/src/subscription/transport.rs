//! Reading and writing frames on a client connection.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use futures::stream::SplitSink;
use futures::stream::SplitStream;
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::error::SubscriptionError;

/// A frame sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(Bytes),
    Close { code: u16, reason: String },
}

/// The reading half of a client connection.
#[async_trait]
pub trait TransportClient: Send {
    /// The next message of the client, `None` once the connection is closed.
    async fn read_message(&mut self) -> Result<Option<Bytes>, SubscriptionError>;
}

/// The writing half of a client connection.
#[async_trait]
pub trait TransportWriter: Send {
    async fn write_frame(&mut self, frame: Frame) -> Result<(), SubscriptionError>;
}

/// Queues frames for the writer task of a connection.
///
/// Frames sent through one call of [`FrameSender::send_all`] are never interleaved with frames
/// of other callers.
#[derive(Debug, Clone)]
pub struct FrameSender {
    sender: Arc<Mutex<mpsc::UnboundedSender<Frame>>>,
}

impl FrameSender {
    pub fn send(&self, message: Bytes) {
        self.send_all([Frame::Message(message)]);
    }

    pub fn send_all(&self, frames: impl IntoIterator<Item = Frame>) {
        let sender = self.sender.lock();
        for frame in frames {
            if sender.send(frame).is_err() {
                tracing::trace!("connection writer is gone, dropping frame");
                return;
            }
        }
    }

    /// Closes the connection. Frames sent afterwards are dropped.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        self.send_all([Frame::Close {
            code,
            reason: reason.into(),
        }]);
    }
}

/// Spawns the task writing every frame sent through the returned [`FrameSender`].
///
/// The task ends after writing a close frame, on the first write error, or once every sender is
/// dropped.
pub fn spawn_writer<W>(mut writer: W) -> (FrameSender, JoinHandle<()>)
where
    W: TransportWriter + 'static,
{
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        while let Some(frame) = receiver.recv().await {
            let closing = matches!(frame, Frame::Close { .. });
            if let Err(error) = writer.write_frame(frame).await {
                tracing::debug!(%error, "could not write frame");
                break;
            }
            if closing {
                break;
            }
        }
    });
    (
        FrameSender {
            sender: Arc::new(Mutex::new(sender)),
        },
        handle,
    )
}

/// Reads client messages from a WebSocket. Ping and pong frames are answered by the socket
/// itself and skipped.
pub struct WebSocketTransportClient<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

/// Writes frames to a WebSocket.
pub struct WebSocketTransportWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> WebSocketTransportClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Splits an accepted WebSocket into its reading and writing halves.
    pub fn split(stream: WebSocketStream<S>) -> (Self, WebSocketTransportWriter<S>) {
        let (sink, stream) = stream.split();
        (Self { stream }, WebSocketTransportWriter { sink })
    }
}

#[async_trait]
impl<S> TransportClient for WebSocketTransportClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_message(&mut self) -> Result<Option<Bytes>, SubscriptionError> {
        loop {
            match self.stream.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Bytes::copy_from_slice(text.as_str().as_bytes())));
                }
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(_)) => continue,
                Some(Err(
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                )) => return Ok(None),
                Some(Err(error)) => {
                    tracing::debug!(%error, "websocket read error");
                    return Err(SubscriptionError::CouldNotReadMessageFromClient);
                }
            }
        }
    }
}

#[async_trait]
impl<S> TransportWriter for WebSocketTransportWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&mut self, frame: Frame) -> Result<(), SubscriptionError> {
        let message = match frame {
            Frame::Message(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => Message::text(text),
                Err(_) => Message::Binary(data),
            },
            Frame::Close { code, reason } => Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })),
        };
        self.sink
            .send(message)
            .await
            .map_err(|error| SubscriptionError::Transport(error.to_string()))
    }
}
