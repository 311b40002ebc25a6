//! End-to-end negotiation scenarios over an in-memory relay.
//!
//! The relay, the connection resource and the capture devices are all
//! substituted at their trait seams, so these tests drive two full
//! dispatch loops without network, devices or real ICE.

use async_trait::async_trait;
use peerlink::{
    CallHandle, CallPeer, CallStatus, ClientEvent, Connectivity, DescriptionPayload, IceCandidate,
    MediaConstraints, MediaKind, NegotiationState, PeerTransport, RelayConnector, RelayError,
    RelayLink, RemoteTrack, SampleCapture, SdpKind, ServerEvent, SessionDescription, SignalError,
    TransportEvent, TransportFactory,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    Candidate(String),
    Attach,
    Detach,
    Close,
}

struct FakeTransport {
    generation: u64,
    events: mpsc::Sender<TransportEvent>,
    ops: Arc<Mutex<Vec<Op>>>,
    local_set: AtomicBool,
    remote_set: AtomicBool,
    announce: bool,
}

impl FakeTransport {
    /// Reports `Connected` once both descriptions are installed, the way
    /// the production resource does once checks succeed.
    async fn maybe_announce(&self) {
        if self.announce
            && self.local_set.load(Ordering::SeqCst)
            && self.remote_set.load(Ordering::SeqCst)
        {
            let _ = self
                .events
                .send(TransportEvent::Connectivity {
                    generation: self.generation,
                    state: Connectivity::Connected,
                })
                .await;
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription, SignalError> {
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0 offer".into(),
        })
    }
    async fn create_answer(&self) -> Result<SessionDescription, SignalError> {
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0 answer".into(),
        })
    }
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), SignalError> {
        self.ops.lock().unwrap().push(Op::SetLocal(desc.kind));
        self.local_set.store(true, Ordering::SeqCst);
        self.maybe_announce().await;
        Ok(())
    }
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SignalError> {
        self.ops.lock().unwrap().push(Op::SetRemote(desc.kind));
        self.remote_set.store(true, Ordering::SeqCst);
        self.maybe_announce().await;
        Ok(())
    }
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SignalError> {
        self.ops
            .lock()
            .unwrap()
            .push(Op::Candidate(candidate.candidate));
        Ok(())
    }
    async fn attach_track(
        &self,
        _track: Arc<dyn webrtc::track::track_local::TrackLocal + Send + Sync>,
    ) -> Result<(), SignalError> {
        self.ops.lock().unwrap().push(Op::Attach);
        Ok(())
    }
    async fn detach_tracks(&self) -> Result<(), SignalError> {
        self.ops.lock().unwrap().push(Op::Detach);
        Ok(())
    }
    async fn close(&self) -> Result<(), SignalError> {
        self.ops.lock().unwrap().push(Op::Close);
        Ok(())
    }
}

struct FakeFactory {
    created: AtomicUsize,
    ops: Arc<Mutex<Vec<Op>>>,
    // Generation and event sender of every transport handed out, so a test
    // can impersonate a transport that the peer has since discarded.
    links: Mutex<Vec<(u64, mpsc::Sender<TransportEvent>)>>,
    announce: bool,
}

impl FakeFactory {
    fn new(announce: bool) -> Arc<Self> {
        Arc::new(Self {
            created: AtomicUsize::new(0),
            ops: Arc::new(Mutex::new(Vec::new())),
            links: Mutex::new(Vec::new()),
            announce,
        })
    }

    fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    fn link(&self, index: usize) -> (u64, mpsc::Sender<TransportEvent>) {
        self.links.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(
        &self,
        _chat_id: &str,
        generation: u64,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, SignalError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.links
            .lock()
            .unwrap()
            .push((generation, events.clone()));
        Ok(Arc::new(FakeTransport {
            generation,
            events,
            ops: self.ops.clone(),
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            announce: self.announce,
        }))
    }
}

/// Hands out pre-wired links in order; the test (or the pipe below) holds
/// the other ends.
struct ManualConnector(Mutex<VecDeque<RelayLink>>);

impl ManualConnector {
    fn holding(links: Vec<RelayLink>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(links.into())))
    }
}

#[async_trait]
impl RelayConnector for ManualConnector {
    async fn connect(&self, _token: &str) -> Result<RelayLink, RelayError> {
        self.0
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| RelayError::unavailable("no link left"))
    }
}

/// Links whose far ends the test plays directly: read what the peer sends,
/// inject what the "other member" would say. One entry per expected
/// connect.
fn test_relay(
    connects: usize,
) -> (
    Arc<ManualConnector>,
    Vec<(mpsc::Receiver<ClientEvent>, mpsc::Sender<ServerEvent>)>,
) {
    let mut links = Vec::new();
    let mut far_ends = Vec::new();
    for _ in 0..connects {
        let (out_tx, out_rx) = mpsc::channel(32);
        let (in_tx, in_rx) = mpsc::channel(32);
        links.push(RelayLink {
            tx: out_tx,
            rx: in_rx,
        });
        far_ends.push((out_rx, in_tx));
    }
    (ManualConnector::holding(links), far_ends)
}

/// Forwards one direction of the relay: registration is consumed, the rest
/// is delivered to the other member in order.
async fn forward(
    mut out: mpsc::Receiver<ClientEvent>,
    to_other: mpsc::Sender<ServerEvent>,
    answers: Arc<AtomicUsize>,
) {
    while let Some(event) = out.recv().await {
        let forwarded = match event {
            ClientEvent::JoinChat { .. } => continue,
            ClientEvent::Offer { offer, .. } => ServerEvent::Offer { offer },
            ClientEvent::Answer { answer, .. } => {
                answers.fetch_add(1, Ordering::SeqCst);
                ServerEvent::Answer { answer }
            }
            ClientEvent::IceCandidate { candidate, .. } => ServerEvent::IceCandidate { candidate },
        };
        if to_other.send(forwarded).await.is_err() {
            break;
        }
    }
}

/// Two linked connectors forming an in-memory two-member room.
fn relay_pair(answers: Arc<AtomicUsize>) -> (Arc<ManualConnector>, Arc<ManualConnector>) {
    let (a_tx, a_out) = mpsc::channel(32);
    let (a_in_tx, a_rx) = mpsc::channel(32);
    let (b_tx, b_out) = mpsc::channel(32);
    let (b_in_tx, b_rx) = mpsc::channel(32);
    tokio::spawn(forward(a_out, b_in_tx, answers.clone()));
    tokio::spawn(forward(b_out, a_in_tx, answers));
    (
        ManualConnector::holding(vec![RelayLink { tx: a_tx, rx: a_rx }]),
        ManualConnector::holding(vec![RelayLink { tx: b_tx, rx: b_rx }]),
    )
}

fn spawn_peer(connector: Arc<ManualConnector>, factory: Arc<FakeFactory>) -> CallHandle {
    let _ = env_logger::builder().is_test(true).try_init();
    let (peer, handle) = CallPeer::new(connector, factory, Arc::new(SampleCapture), Some("tok".into()));
    tokio::spawn(peer.run());
    handle
}

async fn wait_for(handle: &CallHandle, what: &str, pred: impl Fn(&CallStatus) -> bool) -> CallStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(status) = handle.status().await {
            if pred(&status) {
                return status;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn recv_envelope(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an envelope")
        .expect("relay link closed")
}

fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n}"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }
}

fn answer_payload() -> DescriptionPayload {
    DescriptionPayload {
        description: SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0 remote answer".into(),
        },
        peer_id: "remote".into(),
        ts: 0,
    }
}

#[tokio::test]
async fn caller_buffers_early_candidates_and_flushes_on_answer() {
    let (connector, mut ends) = test_relay(1);
    let (mut outbox, inject) = ends.remove(0);
    let factory = FakeFactory::new(false);
    let handle = spawn_peer(connector, factory.clone());

    handle.join("r1").await.unwrap();
    match recv_envelope(&mut outbox).await {
        ClientEvent::JoinChat { chat_id } => assert_eq!(chat_id, "r1"),
        other => panic!("expected join_chat, got {other:?}"),
    }

    handle.start_call().await.unwrap();
    match recv_envelope(&mut outbox).await {
        ClientEvent::Offer { chat_id, offer } => {
            assert_eq!(chat_id, "r1");
            assert_eq!(offer.description.kind, SdpKind::Offer);
            assert!(!offer.peer_id.is_empty());
        }
        other => panic!("expected offer, got {other:?}"),
    }

    // The other member trickles candidates before its answer arrives.
    for n in 0..3 {
        inject
            .send(ServerEvent::IceCandidate {
                candidate: candidate(n),
            })
            .await
            .unwrap();
    }
    wait_for(&handle, "candidates buffered", |s| s.buffered_candidates == 3).await;
    assert!(!factory.ops().iter().any(|op| matches!(op, Op::Candidate(_))));

    inject
        .send(ServerEvent::Answer {
            answer: answer_payload(),
        })
        .await
        .unwrap();
    wait_for(&handle, "negotiating", |s| {
        s.negotiation == Some(NegotiationState::Negotiating) && s.buffered_candidates == 0
    })
    .await;

    let ops = factory.ops();
    let remote_at = ops
        .iter()
        .position(|op| *op == Op::SetRemote(SdpKind::Answer))
        .expect("remote answer installed");
    let applied: Vec<&Op> = ops
        .iter()
        .filter(|op| matches!(op, Op::Candidate(_)))
        .collect();
    assert_eq!(
        applied,
        vec![
            &Op::Candidate("candidate:0".into()),
            &Op::Candidate("candidate:1".into()),
            &Op::Candidate("candidate:2".into()),
        ]
    );
    let first_candidate_at = ops
        .iter()
        .position(|op| matches!(op, Op::Candidate(_)))
        .unwrap();
    assert!(remote_at < first_candidate_at);

    // Late candidates now take the direct path, bypassing the buffer.
    inject
        .send(ServerEvent::IceCandidate {
            candidate: candidate(9),
        })
        .await
        .unwrap();
    wait_for(&handle, "late candidate applied", |s| s.buffered_candidates == 0).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !factory.ops().contains(&Op::Candidate("candidate:9".into())) {
        assert!(tokio::time::Instant::now() < deadline, "late candidate never applied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn repeated_start_call_emits_exactly_one_offer() {
    let (connector, mut ends) = test_relay(1);
    let (mut outbox, _inject) = ends.remove(0);
    let factory = FakeFactory::new(false);
    let handle = spawn_peer(connector, factory.clone());

    handle.join("r1").await.unwrap();
    recv_envelope(&mut outbox).await; // join_chat

    handle.start_call().await.unwrap();
    handle.start_call().await.unwrap();

    match recv_envelope(&mut outbox).await {
        ClientEvent::Offer { .. } => {}
        other => panic!("expected offer, got {other:?}"),
    }
    // Both commands have been processed; nothing else went out.
    handle.status().await.unwrap();
    assert!(outbox.try_recv().is_err());
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn answer_without_an_offer_changes_nothing() {
    let (connector, mut ends) = test_relay(1);
    let (mut outbox, inject) = ends.remove(0);
    let factory = FakeFactory::new(false);
    let handle = spawn_peer(connector, factory.clone());

    handle.join("r1").await.unwrap();
    recv_envelope(&mut outbox).await; // join_chat

    inject
        .send(ServerEvent::Answer {
            answer: answer_payload(),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = handle.status().await.unwrap();
    assert_eq!(status.negotiation, Some(NegotiationState::Idle));
    assert_eq!(factory.created.load(Ordering::SeqCst), 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn two_members_negotiate_to_connected() {
    let answers = Arc::new(AtomicUsize::new(0));
    let (a_connector, b_connector) = relay_pair(answers.clone());
    let a = spawn_peer(a_connector, FakeFactory::new(true));
    let b = spawn_peer(b_connector, FakeFactory::new(true));

    a.join("r1").await.unwrap();
    b.join("r1").await.unwrap();
    a.start_call().await.unwrap();

    wait_for(&a, "caller connected", |s| {
        s.negotiation == Some(NegotiationState::Connected)
    })
    .await;
    wait_for(&b, "callee connected", |s| {
        s.negotiation == Some(NegotiationState::Connected)
    })
    .await;
    assert_eq!(answers.load(Ordering::SeqCst), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn events_from_a_discarded_transport_never_reach_a_new_session() {
    let (connector, mut ends) = test_relay(2);
    let (_outbox1, _inject1) = ends.remove(0);
    let (_outbox2, _inject2) = ends.remove(0);
    let factory = FakeFactory::new(false);
    let handle = spawn_peer(connector, factory.clone());

    handle.join("r1").await.unwrap();
    handle.start_call().await.unwrap();
    let (old_generation, old_events) = factory.link(0);

    // Rejoining the same room makes a fresh session under the same id.
    handle.leave().await;
    handle.join("r1").await.unwrap();

    // The discarded transport completes late.
    old_events
        .send(TransportEvent::RemoteTrack {
            generation: old_generation,
            track: RemoteTrack {
                id: "ghost".into(),
                kind: MediaKind::Audio,
                ssrc: 1,
            },
        })
        .await
        .unwrap();
    old_events
        .send(TransportEvent::Connectivity {
            generation: old_generation,
            state: Connectivity::Connected,
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = handle.status().await.unwrap();
    assert_eq!(status.negotiation, Some(NegotiationState::Idle));
    assert!(status.remote_tracks.is_empty());

    // Nor can it impersonate the replacement once one exists.
    handle.start_call().await.unwrap();
    old_events
        .send(TransportEvent::Connectivity {
            generation: old_generation,
            state: Connectivity::Connected,
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = handle.status().await.unwrap();
    assert_eq!(status.negotiation, Some(NegotiationState::AwaitingAnswer));

    handle.shutdown().await;
}

#[tokio::test]
async fn releasing_media_detaches_senders_from_the_live_transport() {
    let (connector, mut ends) = test_relay(1);
    let (_outbox, _inject) = ends.remove(0);
    let factory = FakeFactory::new(false);
    let handle = spawn_peer(connector, factory.clone());

    handle.join("r1").await.unwrap();
    let tracks = handle
        .acquire_media(MediaConstraints::default())
        .await
        .unwrap();
    assert_eq!(tracks, 2);
    handle.start_call().await.unwrap();
    let attached = factory.ops().iter().filter(|op| **op == Op::Attach).count();
    assert_eq!(attached, 2);

    handle.release_media().await;
    assert!(factory.ops().contains(&Op::Detach));
    let status = handle.status().await.unwrap();
    assert_eq!(status.local_tracks, 0);

    // Re-acquiring swaps the sender set instead of stacking a second one.
    handle
        .acquire_media(MediaConstraints::default())
        .await
        .unwrap();
    let ops = factory.ops();
    let last_detach = ops
        .iter()
        .rposition(|op| *op == Op::Detach)
        .expect("re-acquire detaches the replaced senders");
    let attached_after = ops[last_detach..]
        .iter()
        .filter(|op| **op == Op::Attach)
        .count();
    assert_eq!(attached_after, 2);

    handle.shutdown().await;
}

#[tokio::test]
async fn simultaneous_offers_converge_with_one_answer() {
    let answers = Arc::new(AtomicUsize::new(0));
    let (a_connector, b_connector) = relay_pair(answers.clone());
    let a = spawn_peer(a_connector, FakeFactory::new(true));
    let b = spawn_peer(b_connector, FakeFactory::new(true));

    a.join("r1").await.unwrap();
    b.join("r1").await.unwrap();

    let (ra, rb) = tokio::join!(a.start_call(), b.start_call());
    ra.unwrap();
    rb.unwrap();

    wait_for(&a, "a connected", |s| {
        s.negotiation == Some(NegotiationState::Connected)
    })
    .await;
    wait_for(&b, "b connected", |s| {
        s.negotiation == Some(NegotiationState::Connected)
    })
    .await;
    assert_eq!(answers.load(Ordering::SeqCst), 1);

    a.shutdown().await;
    b.shutdown().await;
}
