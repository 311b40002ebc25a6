use serde::{Deserialize, Serialize};

/// Which half of the offer/answer exchange a description belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Opaque session description. The core forwards the SDP body verbatim and
/// never inspects it; only the production transport parses it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

/// A description plus sender metadata, as relayed between the two peers.
/// `peer_id` is the sender's stable identity and breaks offer glare.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DescriptionPayload {
    pub description: SessionDescription,
    pub peer_id: String,
    pub ts: i64,
}

/// Network candidate as exchanged over the relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Read-only descriptor of an inbound track, surfaced to the rendering
/// layer as the transport reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    pub ssrc: u32,
}

/// Connectivity of the underlying transport, as the transport reports it.
/// The state machine consumes these; it never drives connectivity itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events the connection resource pushes back into the dispatch loop. Each
/// carries the generation its transport was created under; a room id alone
/// would let a torn-down transport's late events bleed into a fresh session
/// for the same room.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate {
        generation: u64,
        candidate: IceCandidate,
    },
    Connectivity {
        generation: u64,
        state: Connectivity,
    },
    RemoteTrack {
        generation: u64,
        track: RemoteTrack,
    },
}
