//! Two-party call negotiation over a socket relay.
//!
//! The crate sequences the offer/answer exchange and trickle candidates
//! between exactly two peers sharing a room on a forwarding relay. The
//! embedding application supplies rendering and capture; the connection
//! resource is `webrtc` in production and a trait object in tests.
//!
//! Entry point is [`CallPeer`]: spawn its `run` loop and drive it through
//! the cloneable [`CallHandle`].

pub mod call;
pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod utils;

pub use call::{CallHandle, CallPeer, CallStatus};
pub use config::{Config, IceServerConfig, RelayConfig};
pub use error::{MediaError, RelayError, SignalError};
pub use media::{
    CaptureDevices, CaptureTrack, LocalMediaSource, MediaConstraints, RemoteMediaSink,
    SampleCapture, VideoConstraints,
};
pub use peer::{
    CandidateBuffer, Connectivity, DescriptionPayload, IceCandidate, MediaKind, NegotiationState,
    PeerTransport, RemoteTrack, RtcFactory, SdpKind, SessionDescription, TransportEvent,
    TransportFactory,
};
pub use relay::{RelayConnector, RelayLink, RoomMembership, WsRelayConnector};
pub use session::Session;
pub use signaling::{ClientEvent, ServerEvent};
