use crate::config::IceServerConfig;
use crate::error::SignalError;
use crate::peer::types::{
    Connectivity, IceCandidate, MediaKind, RemoteTrack, SdpKind, SessionDescription,
    TransportEvent,
};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

/// The connection resource this core sequences. Its connectivity checks are
/// an external concern; the session only feeds it descriptions, candidates
/// and tracks, and consumes its events. Tests substitute a recording fake.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, SignalError>;
    async fn create_answer(&self) -> Result<SessionDescription, SignalError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), SignalError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SignalError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SignalError>;
    async fn attach_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<(), SignalError>;
    /// Removes every sender added by `attach_track`.
    async fn detach_tracks(&self) -> Result<(), SignalError>;
    async fn close(&self) -> Result<(), SignalError>;
}

/// Builds transports on demand. The session goes through this exactly once
/// per life, so no call site can race-create two resources for one session.
/// `generation` tags every event the new transport emits.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        chat_id: &str,
        generation: u64,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, SignalError>;
}

/// Production transport over `webrtc::RTCPeerConnection`.
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
}

fn transport_err(e: webrtc::Error) -> SignalError {
    SignalError::Transport(e.to_string())
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, SignalError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    }
    .map_err(transport_err)
}

fn from_rtc_description(desc: &RTCSessionDescription) -> SessionDescription {
    let kind = if desc.sdp_type == RTCSdpType::Answer {
        SdpKind::Answer
    } else {
        SdpKind::Offer
    };
    SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, SignalError> {
        let offer = self.pc.create_offer(None).await.map_err(transport_err)?;
        Ok(from_rtc_description(&offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, SignalError> {
        let answer = self.pc.create_answer(None).await.map_err(transport_err)?;
        Ok(from_rtc_description(&answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), SignalError> {
        let desc = to_rtc_description(&desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(transport_err)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SignalError> {
        let desc = to_rtc_description(&desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(transport_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SignalError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await.map_err(transport_err)
    }

    async fn attach_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<(), SignalError> {
        let sender = self.pc.add_track(track).await.map_err(transport_err)?;
        self.senders.lock().await.push(sender.clone());
        // Drain RTCP so the sender's feedback loop keeps running.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
        });
        Ok(())
    }

    async fn detach_tracks(&self) -> Result<(), SignalError> {
        let senders: Vec<_> = self.senders.lock().await.drain(..).collect();
        for sender in senders {
            if let Err(e) = self.pc.remove_track(&sender).await {
                log::warn!("removing track sender: {e}");
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SignalError> {
        self.pc.close().await.map_err(transport_err)
    }
}

/// Factory producing `RtcTransport`s configured with the participant's ICE
/// server table. Every callback of the peer connection is bridged onto the
/// event channel so the dispatch loop sees one ordered stream.
pub struct RtcFactory {
    ice_servers: Vec<IceServerConfig>,
}

impl RtcFactory {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self { ice_servers }
    }

    fn rtc_config(&self) -> RTCConfiguration {
        let ice_servers = self
            .ice_servers
            .iter()
            .filter(|server| {
                let ok = server.is_valid();
                if !ok {
                    log::warn!("skipping invalid ICE server entry '{}'", server.id);
                }
                ok
            })
            .map(|server| RTCIceServer {
                urls: vec![add_ice_url_scheme(server)],
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ice_candidate_pool_size: 10,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

#[async_trait]
impl TransportFactory for RtcFactory {
    async fn create(
        &self,
        chat_id: &str,
        generation: u64,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, SignalError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(transport_err)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(transport_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(self.rtc_config())
                .await
                .map_err(transport_err)?,
        );

        let chat = chat_id.to_string();
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let chat = chat.clone();
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    log::debug!("candidate gathering for {chat} completed");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let event = TransportEvent::LocalCandidate {
                            generation,
                            candidate: IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            },
                        };
                        let _ = tx.send(event).await;
                    }
                    Err(e) => log::warn!("local candidate serialization failed: {e}"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let mapped = match state {
                RTCPeerConnectionState::Connecting => Some(Connectivity::Connecting),
                RTCPeerConnectionState::Connected => Some(Connectivity::Connected),
                RTCPeerConnectionState::Disconnected => Some(Connectivity::Disconnected),
                RTCPeerConnectionState::Failed => Some(Connectivity::Failed),
                RTCPeerConnectionState::Closed => Some(Connectivity::Closed),
                _ => None,
            };
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(state) = mapped {
                    let _ = tx
                        .send(TransportEvent::Connectivity { generation, state })
                        .await;
                }
            })
        }));

        let tx = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(MediaKind::Audio),
                RTPCodecType::Video => Some(MediaKind::Video),
                _ => None,
            };
            let tx = tx.clone();
            Box::pin(async move {
                let Some(kind) = kind else {
                    log::warn!("inbound track of unspecified kind ignored");
                    return;
                };
                let event = TransportEvent::RemoteTrack {
                    generation,
                    track: RemoteTrack {
                        id: track.id(),
                        kind,
                        ssrc: track.ssrc(),
                    },
                };
                let _ = tx.send(event).await;
            })
        }));

        Ok(Arc::new(RtcTransport {
            pc,
            senders: Mutex::new(Vec::new()),
        }))
    }
}
