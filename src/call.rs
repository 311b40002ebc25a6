//! One participant's event loop.
//!
//! `CallPeer` owns the room membership, the live session and the local
//! media source, and consumes three inbound streams in a single task:
//! commands from `CallHandle`, envelopes from the relay, and events from
//! the connection resource. One event is processed to completion before
//! the next is taken, so no transition ever races another.

use crate::config::Config;
use crate::error::{MediaError, RelayError, SignalError};
use crate::media::{CaptureDevices, LocalMediaSource, MediaConstraints, SampleCapture};
use crate::peer::connection::{RtcFactory, TransportFactory};
use crate::peer::state::NegotiationState;
use crate::peer::types::{RemoteTrack, TransportEvent};
use crate::relay::{RelayConnector, RoomMembership, WsRelayConnector};
use crate::session::Session;
use crate::signaling::{ClientEvent, ServerEvent};
use crate::utils::random_id;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Requests a `CallHandle` can make of the loop.
enum Command {
    Join {
        room_id: String,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
    StartCall {
        reply: oneshot::Sender<Result<(), SignalError>>,
    },
    AcquireMedia {
        constraints: MediaConstraints,
        reply: oneshot::Sender<Result<usize, MediaError>>,
    },
    ReleaseMedia {
        reply: oneshot::Sender<()>,
    },
    SetToken {
        token: Option<String>,
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<CallStatus>,
    },
    Shutdown,
}

/// Snapshot of the participant for the embedding application.
#[derive(Debug, Clone)]
pub struct CallStatus {
    pub peer_id: String,
    pub room: Option<String>,
    pub negotiation: Option<NegotiationState>,
    pub local_tracks: usize,
    pub remote_tracks: Vec<RemoteTrack>,
    pub buffered_candidates: usize,
}

/// Cloneable command front-end for one `CallPeer`.
#[derive(Clone)]
pub struct CallHandle {
    tx: mpsc::Sender<Command>,
}

impl CallHandle {
    async fn request<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, ()> {
        self.tx.send(command).await.map_err(|_| ())?;
        rx.await.map_err(|_| ())
    }

    pub async fn join(&self, room_id: &str) -> Result<(), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Join {
                room_id: room_id.to_string(),
                reply,
            },
            rx,
        )
        .await
        .unwrap_or_else(|_| Err(RelayError::unavailable("call peer stopped")))
    }

    pub async fn leave(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.request(Command::Leave { reply }, rx).await;
    }

    pub async fn start_call(&self) -> Result<(), SignalError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::StartCall { reply }, rx)
            .await
            .unwrap_or_else(|_| Err(SignalError::Transport("call peer stopped".into())))
    }

    pub async fn acquire_media(&self, constraints: MediaConstraints) -> Result<usize, MediaError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::AcquireMedia { constraints, reply },
            rx,
        )
        .await
        .unwrap_or_else(|_| {
            Err(MediaError::Unavailable {
                reason: "call peer stopped".into(),
            })
        })
    }

    pub async fn release_media(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.request(Command::ReleaseMedia { reply }, rx).await;
    }

    pub async fn set_token(&self, token: Option<String>) {
        let (reply, rx) = oneshot::channel();
        let _ = self.request(Command::SetToken { token, reply }, rx).await;
    }

    pub async fn status(&self) -> Option<CallStatus> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Status { reply }, rx).await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

pub struct CallPeer {
    peer_id: String,
    membership: RoomMembership,
    factory: Arc<dyn TransportFactory>,
    media: LocalMediaSource,
    session: Option<Session>,
    commands: mpsc::Receiver<Command>,
    relay_rx: Option<mpsc::Receiver<ServerEvent>>,
    transport_tx: mpsc::Sender<TransportEvent>,
    transport_rx: mpsc::Receiver<TransportEvent>,
}

async fn recv_relay(rx: &mut Option<mpsc::Receiver<ServerEvent>>) -> Option<ServerEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl CallPeer {
    pub fn new(
        connector: Arc<dyn RelayConnector>,
        factory: Arc<dyn TransportFactory>,
        devices: Arc<dyn CaptureDevices>,
        token: Option<String>,
    ) -> (Self, CallHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (transport_tx, transport_rx) = mpsc::channel(64);
        let peer = Self {
            peer_id: random_id(),
            membership: RoomMembership::new(connector, token),
            factory,
            media: LocalMediaSource::new(devices),
            session: None,
            commands: cmd_rx,
            relay_rx: None,
            transport_tx,
            transport_rx,
        };
        (peer, CallHandle { tx: cmd_tx })
    }

    /// Production wiring: WebSocket relay, `webrtc` transports, sample-fed
    /// capture tracks.
    pub fn from_config(config: Config) -> (Self, CallHandle) {
        Self::new(
            Arc::new(WsRelayConnector::new(config.relay.url)),
            Arc::new(RtcFactory::new(config.ice_servers)),
            Arc::new(SampleCapture),
            config.relay.token,
        )
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Dispatch loop. Runs until `Shutdown` or every handle is dropped.
    pub async fn run(mut self) {
        log::info!("call peer {} running", self.peer_id);
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        None | Some(Command::Shutdown) => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                event = recv_relay(&mut self.relay_rx) => {
                    match event {
                        Some(event) => self.handle_relay_event(event).await,
                        None => {
                            log::warn!("relay link dropped");
                            self.relay_rx = None;
                        }
                    }
                }
                Some(event) = self.transport_rx.recv() => {
                    self.handle_transport_event(event).await;
                }
            }
        }
        self.teardown().await;
        log::info!("call peer {} stopped", self.peer_id);
    }

    async fn teardown(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.close().await;
        }
        self.session = None;
        self.relay_rx = None;
        self.membership.leave();
        self.media.release();
    }

    /// Closes any previous session and installs a fresh one for `room_id`.
    async fn replace_session(&mut self, room_id: &str) {
        if let Some(session) = self.session.as_mut() {
            session.close().await;
        }
        self.session = Some(Session::new(
            room_id,
            self.peer_id.clone(),
            self.factory.clone(),
            self.transport_tx.clone(),
        ));
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join { room_id, reply } => {
                let result = match self.membership.join(&room_id).await {
                    Ok(Some(rx)) => {
                        self.relay_rx = Some(rx);
                        self.replace_session(&room_id).await;
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Leave { reply } => {
                if let Some(session) = self.session.as_mut() {
                    session.close().await;
                }
                self.session = None;
                self.relay_rx = None;
                self.membership.leave();
                let _ = reply.send(());
            }
            Command::StartCall { reply } => {
                let _ = reply.send(self.start_call().await);
            }
            Command::AcquireMedia { constraints, reply } => {
                let result = match self.media.acquire(&constraints).await {
                    Ok(tracks) => Ok(tracks.len()),
                    Err(e) => Err(e),
                };
                if result.is_ok() {
                    if let Some(session) = &self.session {
                        // The replaced source's senders come off first, or
                        // re-acquiring would stack sender sets.
                        if let Err(e) = session.detach_local().await {
                            log::warn!("detaching replaced tracks: {e}");
                        }
                        if let Err(e) = session.attach_local(self.media.tracks()).await {
                            log::warn!("attaching local tracks: {e}");
                        }
                    }
                }
                let _ = reply.send(result);
            }
            Command::ReleaseMedia { reply } => {
                if let Some(session) = &self.session {
                    if let Err(e) = session.detach_local().await {
                        log::warn!("detaching local tracks: {e}");
                    }
                }
                self.media.release();
                let _ = reply.send(());
            }
            Command::SetToken { token, reply } => {
                let cleared = token.is_none();
                self.membership.set_token(token);
                if cleared {
                    if let Some(session) = self.session.as_mut() {
                        session.close().await;
                    }
                    self.session = None;
                    self.relay_rx = None;
                }
                let _ = reply.send(());
            }
            Command::Status { reply } => {
                let _ = reply.send(CallStatus {
                    peer_id: self.peer_id.clone(),
                    room: self.membership.room().map(str::to_string),
                    negotiation: self.session.as_ref().map(Session::state),
                    local_tracks: self.media.track_count(),
                    remote_tracks: self
                        .session
                        .as_ref()
                        .map(|s| s.remote_tracks().to_vec())
                        .unwrap_or_default(),
                    buffered_candidates: self
                        .session
                        .as_ref()
                        .map(Session::buffered_candidates)
                        .unwrap_or(0),
                });
            }
            Command::Shutdown => {}
        }
    }

    async fn start_call(&mut self) -> Result<(), SignalError> {
        let Some(relay_tx) = self.membership.sender() else {
            return Err(SignalError::Transport("not joined to a room".into()));
        };

        // A torn-down session never comes back; starting over means a
        // fresh one for the same room.
        let closed = self
            .session
            .as_ref()
            .map(|s| s.state().is_closed())
            .unwrap_or(true);
        if closed {
            if let Some(room) = self.membership.room().map(str::to_string) {
                self.replace_session(&room).await;
            }
        }
        let Some(session) = self.session.as_mut() else {
            return Err(SignalError::Transport("not joined to a room".into()));
        };

        let Some(payload) = session.start_call(&self.media).await? else {
            return Ok(());
        };
        let chat_id = session.chat_id().to_string();
        relay_tx
            .send(ClientEvent::Offer {
                chat_id,
                offer: payload,
            })
            .await
            .map_err(|_| SignalError::Transport("relay link closed".into()))
    }

    async fn send_to_relay(&self, event: ClientEvent) {
        let Some(tx) = self.membership.sender() else {
            log::warn!("relay link down, outbound envelope dropped");
            return;
        };
        if tx.send(event).await.is_err() {
            log::warn!("relay link closed, outbound envelope dropped");
        }
    }

    async fn handle_relay_event(&mut self, event: ServerEvent) {
        let Some(session) = self.session.as_mut() else {
            log::debug!("relay envelope without a session dropped");
            return;
        };
        match event {
            ServerEvent::Offer { offer } => {
                let from = offer.peer_id.clone();
                match session.handle_offer(offer, &self.media).await {
                    Ok(answer) => {
                        let chat_id = session.chat_id().to_string();
                        self.send_to_relay(ClientEvent::Answer {
                            chat_id,
                            answer,
                        })
                        .await;
                    }
                    Err(e) if e.is_absorbed() => log::info!("offer from {from} ignored: {e}"),
                    Err(e) => {
                        log::warn!("handling offer from {from}: {e}");
                        session.close().await;
                    }
                }
            }
            ServerEvent::Answer { answer } => match session.handle_answer(answer).await {
                Ok(()) => {}
                Err(e) if e.is_absorbed() => log::info!("answer ignored: {e}"),
                Err(e) => {
                    log::warn!("handling answer: {e}");
                    session.close().await;
                }
            },
            ServerEvent::IceCandidate { candidate } => {
                match session.handle_candidate(candidate).await {
                    Ok(()) => {}
                    Err(e) if e.is_absorbed() => log::debug!("candidate ignored: {e}"),
                    Err(e) => log::warn!("applying remote candidate: {e}"),
                }
            }
        }
    }

    /// Transport callbacks arrive tagged with the generation of the
    /// transport that produced them; anything not matching the live
    /// session's transport is a late completion and gets dropped. A room id
    /// would not do here: rejoining the same room, or a glare yield, makes
    /// a new transport under the same id.
    async fn handle_transport_event(&mut self, event: TransportEvent) {
        let live = self.session.as_ref().filter(|s| !s.state().is_closed());
        let live_generation = live.and_then(Session::transport_generation);
        let chat_id = live.map(|s| s.chat_id().to_string());

        match event {
            TransportEvent::LocalCandidate {
                generation,
                candidate,
            } => {
                if live_generation != Some(generation) {
                    log::debug!("local candidate from a stale transport dropped");
                    return;
                }
                let Some(chat_id) = chat_id else {
                    return;
                };
                self.send_to_relay(ClientEvent::IceCandidate { chat_id, candidate })
                    .await;
            }
            TransportEvent::Connectivity { generation, state } => {
                if live_generation != Some(generation) {
                    log::debug!("connectivity from a stale transport dropped");
                    return;
                }
                if let Some(session) = self.session.as_mut() {
                    session.handle_connectivity(state);
                }
            }
            TransportEvent::RemoteTrack { generation, track } => {
                if live_generation != Some(generation) {
                    log::debug!("remote track from a stale transport dropped");
                    return;
                }
                if let Some(session) = self.session.as_mut() {
                    session.record_remote_track(track);
                }
            }
        }
    }
}
