//! Per-room negotiation session.
//!
//! A `Session` owns one connection resource and sequences the offer/answer
//! exchange for one room. Every transition is an explicit method on this
//! type; the dispatch loop in `call` maps each inbound event to exactly one
//! of them, so the legal transitions are readable in one place.

use crate::error::SignalError;
use crate::media::{LocalMediaSource, RemoteMediaSink};
use crate::peer::connection::{PeerTransport, TransportFactory};
use crate::peer::ice::CandidateBuffer;
use crate::peer::state::NegotiationState;
use crate::peer::types::{
    Connectivity, DescriptionPayload, IceCandidate, RemoteTrack, SdpKind, TransportEvent,
};
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Session {
    chat_id: String,
    local_id: String,
    state: NegotiationState,
    created_at: i64,
    factory: Arc<dyn TransportFactory>,
    transport: Option<Arc<dyn PeerTransport>>,
    // Nonce of the live transport; events tagged otherwise are from a
    // predecessor and get dropped upstream.
    generation: Option<u64>,
    buffer: CandidateBuffer,
    remote_media: RemoteMediaSink,
    events: mpsc::Sender<TransportEvent>,
}

impl Session {
    pub fn new(
        chat_id: impl Into<String>,
        local_id: impl Into<String>,
        factory: Arc<dyn TransportFactory>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            local_id: local_id.into(),
            state: NegotiationState::Idle,
            created_at: Utc::now().timestamp_millis(),
            factory,
            transport: None,
            generation: None,
            buffer: CandidateBuffer::new(),
            remote_media: RemoteMediaSink::default(),
            events,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn transport_generation(&self) -> Option<u64> {
        self.generation
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        self.remote_media.tracks()
    }

    pub fn buffered_candidates(&self) -> usize {
        self.buffer.len()
    }

    /// The one place a connection resource comes into existence. Every
    /// signal path goes through here, so a session can never hold two.
    async fn ensure_transport(
        &mut self,
        media: &LocalMediaSource,
    ) -> Result<Arc<dyn PeerTransport>, SignalError> {
        if self.state.is_closed() {
            return Err(SignalError::stale(&self.chat_id, "session closed"));
        }
        if let Some(transport) = &self.transport {
            return Ok(transport.clone());
        }

        let generation = rand::rng().random::<u64>();
        let transport = self
            .factory
            .create(&self.chat_id, generation, self.events.clone())
            .await?;
        for track in media.tracks() {
            transport.attach_track(track.rtc_track()).await?;
        }
        log::debug!(
            "transport for {} created with {} local track(s)",
            self.chat_id,
            media.track_count()
        );
        self.transport = Some(transport.clone());
        self.generation = Some(generation);
        Ok(transport)
    }

    /// Closes and forgets the current transport. Its generation dies with
    /// it, so events it still emits no longer match this session.
    async fn drop_transport(&mut self) {
        self.generation = None;
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                log::warn!("closing transport for {}: {e}", self.chat_id);
            }
        }
    }

    fn payload(&self, description: crate::peer::types::SessionDescription) -> DescriptionPayload {
        DescriptionPayload {
            description,
            peer_id: self.local_id.clone(),
            ts: Utc::now().timestamp_millis(),
        }
    }

    /// Starts the caller side. Only `Idle` produces an offer; in any other
    /// state this is a no-op, so a repeated call can never emit a second
    /// offer envelope.
    pub async fn start_call(
        &mut self,
        media: &LocalMediaSource,
    ) -> Result<Option<DescriptionPayload>, SignalError> {
        if self.state.is_closed() {
            return Err(SignalError::stale(&self.chat_id, "session closed"));
        }
        if self.state != NegotiationState::Idle {
            log::debug!(
                "start_call in {:?} ignored, negotiation already underway",
                self.state
            );
            return Ok(None);
        }

        self.state = NegotiationState::Offering;
        match self.produce_offer(media).await {
            Ok(payload) => {
                self.state = NegotiationState::AwaitingAnswer;
                Ok(Some(payload))
            }
            Err(e) => {
                // Back to Idle means no connection resource: a retry gets
                // a fresh transport.
                self.drop_transport().await;
                self.state = NegotiationState::Idle;
                Err(e)
            }
        }
    }

    async fn produce_offer(
        &mut self,
        media: &LocalMediaSource,
    ) -> Result<DescriptionPayload, SignalError> {
        let transport = self.ensure_transport(media).await?;
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        log::info!("local offer installed for {}", self.chat_id);
        Ok(self.payload(offer))
    }

    /// Callee side, plus glare resolution when both ends offered at once.
    /// Returns the answer envelope to relay back.
    pub async fn handle_offer(
        &mut self,
        payload: DescriptionPayload,
        media: &LocalMediaSource,
    ) -> Result<DescriptionPayload, SignalError> {
        if self.state.is_closed() {
            return Err(SignalError::stale(&self.chat_id, "session closed"));
        }
        if payload.description.kind != SdpKind::Offer {
            return Err(SignalError::stale(&self.chat_id, "offer envelope without an offer"));
        }
        if self.state.remote_installed() {
            return Err(SignalError::stale(
                &self.chat_id,
                "remote description already installed",
            ));
        }

        if self.state.offer_pending() {
            // Both sides offered. The lexicographically smaller identity
            // keeps its offer; the other side yields and answers.
            if self.local_id < payload.peer_id {
                return Err(SignalError::Glare {
                    chat_id: self.chat_id.clone(),
                    local_id: self.local_id.clone(),
                    remote_id: payload.peer_id,
                });
            }
            log::info!(
                "offer glare in {}: yielding to {} and answering",
                self.chat_id,
                payload.peer_id
            );
            self.drop_transport().await;
            self.state = NegotiationState::Idle;
        }

        let transport = self.ensure_transport(media).await?;
        transport
            .set_remote_description(payload.description)
            .await?;
        self.flush_candidates(&transport).await;

        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        self.state = NegotiationState::Negotiating;
        log::info!("answered offer from {} in {}", payload.peer_id, self.chat_id);
        Ok(self.payload(answer))
    }

    /// Caller side completion. Anything outside `AwaitingAnswer` is stale.
    pub async fn handle_answer(&mut self, payload: DescriptionPayload) -> Result<(), SignalError> {
        if self.state != NegotiationState::AwaitingAnswer {
            return Err(SignalError::stale(&self.chat_id, "no offer awaiting this answer"));
        }
        if payload.description.kind != SdpKind::Answer {
            return Err(SignalError::stale(&self.chat_id, "answer envelope without an answer"));
        }
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| SignalError::stale(&self.chat_id, "no transport for answer"))?;

        transport
            .set_remote_description(payload.description)
            .await?;
        self.flush_candidates(&transport).await;
        self.state = NegotiationState::Negotiating;
        log::info!("answer from {} installed for {}", payload.peer_id, self.chat_id);
        Ok(())
    }

    /// Remote candidate: applied directly once the remote description is in,
    /// buffered before that, discarded after close.
    pub async fn handle_candidate(&mut self, candidate: IceCandidate) -> Result<(), SignalError> {
        if self.state.is_closed() {
            return Err(SignalError::stale(&self.chat_id, "candidate for closed session"));
        }
        if self.state.remote_installed() {
            let transport = self
                .transport
                .clone()
                .ok_or_else(|| SignalError::stale(&self.chat_id, "no transport for candidate"))?;
            transport.add_ice_candidate(candidate).await?;
        } else {
            self.buffer.push(candidate);
        }
        Ok(())
    }

    /// Drains the buffer in receipt order. Individual failures are logged
    /// and do not stop the rest of the batch.
    async fn flush_candidates(&mut self, transport: &Arc<dyn PeerTransport>) {
        let pending = self.buffer.take();
        if pending.is_empty() {
            return;
        }
        log::info!(
            "applying {} buffered candidate(s) for {}",
            pending.len(),
            self.chat_id
        );
        for candidate in pending {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                log::warn!("buffered candidate for {} rejected: {e}", self.chat_id);
            }
        }
    }

    /// Connectivity is reported by the transport; the session only records
    /// the `Negotiating → Connected` step and logs the rest.
    pub fn handle_connectivity(&mut self, connectivity: Connectivity) {
        match connectivity {
            Connectivity::Connected => {
                if self.state == NegotiationState::Negotiating {
                    self.state = NegotiationState::Connected;
                    log::info!("{} connected", self.chat_id);
                } else {
                    log::debug!("connected report in {:?} ignored", self.state);
                }
            }
            Connectivity::Disconnected | Connectivity::Failed => {
                log::warn!("{} connectivity degraded: {connectivity:?}", self.chat_id);
            }
            other => log::debug!("{} connectivity: {other:?}", self.chat_id),
        }
    }

    /// Tracks attached while the session is live go straight to the
    /// transport; a session without one picks them up at creation.
    pub async fn attach_local(
        &self,
        tracks: &[Arc<dyn crate::media::CaptureTrack>],
    ) -> Result<(), SignalError> {
        let Some(transport) = &self.transport else {
            return Ok(());
        };
        for track in tracks {
            transport.attach_track(track.rtc_track()).await?;
        }
        Ok(())
    }

    /// Removes every local sender from the live transport. Part of the
    /// release path: stopping capture also stops offering those tracks.
    pub async fn detach_local(&self) -> Result<(), SignalError> {
        let Some(transport) = &self.transport else {
            return Ok(());
        };
        transport.detach_tracks().await
    }

    pub fn record_remote_track(&mut self, track: RemoteTrack) {
        self.remote_media.record(track);
    }

    /// Terminal. Releases the connection resource and drops whatever the
    /// buffer still holds; later signals for this session are stale.
    pub async fn close(&mut self) {
        if self.state.is_closed() {
            return;
        }
        self.drop_transport().await;
        self.buffer.clear();
        self.remote_media.clear();
        self.state = NegotiationState::Closed;
        log::info!(
            "session {} closed after {}ms",
            self.chat_id,
            Utc::now().timestamp_millis() - self.created_at
        );
    }
}
