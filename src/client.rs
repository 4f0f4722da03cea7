//! WebSocket client for the presence service.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, warn};

use crate::error::PresenceError;
use crate::presence::{ClientEvent, ServerEvent, SessionId};
use crate::sync::PresenceLink;

/// A live connection to a presence server.
///
/// Dropping every clone closes the socket.
#[derive(Clone)]
pub struct PresenceClient {
    session_id: SessionId,
    outbound: mpsc::UnboundedSender<ClientEvent>,
}

impl PresenceClient {
    /// Connect to `url` (e.g. `ws://localhost:3001/ws`) and wait for the
    /// `connected` ack. Later server events arrive on the returned receiver.
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), PresenceError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| PresenceError::Connect(e.to_string()))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let session_id = loop {
            match ws_read.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEvent>(&text)? {
                    ServerEvent::Connected { session_id } => break session_id,
                    other => debug!(?other, "event before connection ack"),
                },
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(PresenceError::Connect(e.to_string())),
                None => return Err(PresenceError::Closed),
            }
        };
        debug!(%session_id, %url, "connected to presence server");

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(event) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("failed to encode client event: {e}");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("invalid server event: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("presence socket error: {e}");
                        break;
                    }
                }
            }
            debug!(%session_id, "presence connection closed");
        });

        Ok((
            Self {
                session_id,
                outbound,
            },
            event_rx,
        ))
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn send(&self, event: ClientEvent) -> Result<(), PresenceError> {
        self.outbound.send(event).map_err(|_| PresenceError::Closed)
    }
}

#[async_trait]
impl PresenceLink for PresenceClient {
    async fn join(&self, project_id: &str) -> Result<(), PresenceError> {
        self.send(ClientEvent::JoinProject(project_id.to_string()))
    }

    async fn leave(&self, project_id: &str) -> Result<(), PresenceError> {
        self.send(ClientEvent::LeaveProject(project_id.to_string()))
    }

    async fn publish_file_change(
        &self,
        project_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), PresenceError> {
        self.send(ClientEvent::FileChange {
            project_id: project_id.to_string(),
            path: path.to_string(),
            content: content.to_string(),
        })
    }

    async fn publish_terminal_data(
        &self,
        project_id: &str,
        data: &str,
    ) -> Result<(), PresenceError> {
        self.send(ClientEvent::TerminalInput {
            project_id: project_id.to_string(),
            data: data.to_string(),
        })
    }
}
