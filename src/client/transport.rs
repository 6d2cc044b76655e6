//! Client connection to the relay.
//!
//! [`RelayConnection`] is transport-agnostic: outbound [`ClientFrame`]s go
//! into a channel, inbound text arrives as [`TransportEvent`]s.
//! [`WebSocketTransport`] backs it with tokio-tungstenite.

use crate::client::error::SessionError;
use crate::protocol::frames::ClientFrame;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text frame from the relay
    Message(String),
    Closed,
    Error(String),
}

/// An open relay connection.
pub struct RelayConnection {
    outgoing: UnboundedSender<ClientFrame>,
    incoming: Option<UnboundedReceiver<TransportEvent>>,
    shutdown: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<()>>,
}

impl RelayConnection {
    /// Assemble a connection from its channels. `reader` is the task feeding
    /// `incoming`, if any; it is aborted on close so no event arrives afterwards.
    pub fn new(
        outgoing: UnboundedSender<ClientFrame>,
        incoming: UnboundedReceiver<TransportEvent>,
        shutdown: oneshot::Sender<()>,
        reader: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outgoing,
            incoming: Some(incoming),
            shutdown: Some(shutdown),
            reader,
        }
    }

    pub fn outgoing(&self) -> UnboundedSender<ClientFrame> {
        self.outgoing.clone()
    }

    pub fn take_incoming(&mut self) -> Option<UnboundedReceiver<TransportEvent>> {
        self.incoming.take()
    }

    /// Detach listeners, then close. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.incoming = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_none()
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<RelayConnection, SessionError>;
}

/// WebSocket transport to the relay's `/ws` endpoint.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl RelayTransport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<RelayConnection, SessionError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| SessionError::Connection(e.to_string()))?;
        info!(url, "Connected to relay");
        let (mut sink, mut source) = stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    frame = outgoing_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let json = match serde_json::to_string(&frame) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("Failed to serialize client frame: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(json)).await {
                            warn!("Relay send failed: {}", e);
                            break;
                        }
                    }
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
            debug!("Relay writer finished");
        });

        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => TransportEvent::Message(text),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => TransportEvent::Message(text),
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = incoming_tx.send(TransportEvent::Error(e.to_string()));
                        return;
                    }
                };
                if incoming_tx.send(event).is_err() {
                    return;
                }
            }
            let _ = incoming_tx.send(TransportEvent::Closed);
        });

        Ok(RelayConnection::new(outgoing_tx, incoming_rx, shutdown_tx, Some(reader)))
    }
}
