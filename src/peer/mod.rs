pub mod connection;
pub mod ice;
pub mod state;
pub mod types;

pub use connection::{PeerTransport, RtcFactory, RtcTransport, TransportFactory};
pub use ice::CandidateBuffer;
pub use state::NegotiationState;
pub use types::{
    Connectivity, DescriptionPayload, IceCandidate, MediaKind, RemoteTrack, SdpKind,
    SessionDescription, TransportEvent,
};
