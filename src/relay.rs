//! Room membership and the owned link to the signaling relay.
//!
//! The link is an explicit handle tied to the membership lifecycle: it is
//! brought up on `join` (only while an auth token is present, mirroring the
//! login flow owning the token) and torn down on `leave`. Nothing here is a
//! process-wide singleton.

use crate::error::RelayError;
use crate::signaling::{ClientEvent, ServerEvent};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

/// A live relay link: outbound envelopes go into `tx`, inbound envelopes
/// come out of `rx`. Dropping `tx` closes the link.
pub struct RelayLink {
    pub tx: mpsc::Sender<ClientEvent>,
    pub rx: mpsc::Receiver<ServerEvent>,
}

/// Seam between `RoomMembership` and the actual relay transport, so tests
/// can splice an in-memory relay in place of the WebSocket.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, token: &str) -> Result<RelayLink, RelayError>;
}

/// WebSocket relay transport with bearer-token authorization.
pub struct WsRelayConnector {
    url: String,
}

impl WsRelayConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl RelayConnector for WsRelayConnector {
    async fn connect(&self, token: &str) -> Result<RelayLink, RelayError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::unavailable(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| RelayError::unavailable(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| RelayError::unavailable(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<ClientEvent>(64);
        let (in_tx, in_rx) = mpsc::channel::<ServerEvent>(64);

        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        log::warn!("unserializable outbound relay event: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
            log::debug!("relay write loop ended");
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerEvent>(text.as_str()) {
                            Ok(event) => {
                                if in_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("unparseable relay message: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            log::debug!("relay read loop ended");
        });

        Ok(RelayLink { tx: out_tx, rx: in_rx })
    }
}

/// Which room this participant is registered in, plus the relay link that
/// registration holds open.
pub struct RoomMembership {
    connector: Arc<dyn RelayConnector>,
    token: Option<String>,
    room: Option<String>,
    tx: Option<mpsc::Sender<ClientEvent>>,
}

impl RoomMembership {
    pub fn new(connector: Arc<dyn RelayConnector>, token: Option<String>) -> Self {
        Self {
            connector,
            token,
            room: None,
            tx: None,
        }
    }

    /// Registers with the relay for `room_id`. Joining the current room again
    /// is a no-op; joining a different room leaves the old one first. Returns
    /// the inbound event stream when a fresh link was established.
    pub async fn join(
        &mut self,
        room_id: &str,
    ) -> Result<Option<mpsc::Receiver<ServerEvent>>, RelayError> {
        if self.room.as_deref() == Some(room_id) {
            if let Some(tx) = &self.tx {
                if !tx.is_closed() {
                    log::debug!("already joined to {room_id}");
                    return Ok(None);
                }
            }
            // The link died underneath us; fall through and reconnect.
        } else if self.room.is_some() {
            self.leave();
        }

        let token = self
            .token
            .clone()
            .ok_or_else(|| RelayError::unavailable("no auth token"))?;
        let link = self.connector.connect(&token).await?;
        link.tx
            .send(ClientEvent::JoinChat {
                chat_id: room_id.to_string(),
            })
            .await
            .map_err(|_| RelayError::unavailable("relay link closed during join"))?;

        log::info!("joined room {room_id}");
        self.room = Some(room_id.to_string());
        self.tx = Some(link.tx);
        Ok(Some(link.rx))
    }

    /// Unregisters and drops the link. Always safe, also when not joined.
    pub fn leave(&mut self) {
        if let Some(room) = self.room.take() {
            log::info!("leaving room {room}");
        }
        // Dropping the sender ends the write loop, which closes the socket.
        self.tx = None;
    }

    /// The token going away means the identity went away: disconnect.
    pub fn set_token(&mut self, token: Option<String>) {
        if token.is_none() {
            self.leave();
        }
        self.token = token;
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn sender(&self) -> Option<mpsc::Sender<ClientEvent>> {
        self.tx.clone()
    }
}
