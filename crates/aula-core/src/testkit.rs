//! Test doubles for the session core: an in-memory relay, a scriptable
//! capability gate, and a recording peer connection. Compiled for tests
//! only.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc, watch};
use url::Url;

use crate::capability::{AudioCapability, AudioCapabilityGate, AudioSource, LocalAudioTrack};
use crate::errors::{CapabilityDenied, NegotiationError, TransportError};
use crate::protocol::{Frame, IceCandidate, SdpKind, SessionDescription};
use crate::session::{SessionPhase, SessionState};
use crate::signaling::{
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, PeerEventKind,
};
use crate::transport::{RelayConnector, RelayLink};

const WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

// ---------------------------------------------------------------------------
// In-memory relay

struct LinkHandle {
    to_client: Option<mpsc::UnboundedSender<Frame>>,
    sent: Arc<parking_lot::Mutex<Vec<Frame>>>,
}

struct RelayInner {
    fail_next_dials: u32,
    dials: u32,
    links: Vec<LinkHandle>,
}

/// The relay side of the transport: hands out in-memory links, captures
/// everything the client emits, and can kill a link or refuse dials to
/// exercise the reconnect path.
pub struct MemoryRelay {
    inner: parking_lot::Mutex<RelayInner>,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: parking_lot::Mutex::new(RelayInner {
                fail_next_dials: 0,
                dials: 0,
                links: Vec::new(),
            }),
        })
    }

    pub fn fail_next_dials(&self, n: u32) {
        self.inner.lock().fail_next_dials = n;
    }

    pub fn dial_count(&self) -> u32 {
        self.inner.lock().dials
    }

    pub fn link_count(&self) -> usize {
        self.inner.lock().links.len()
    }

    /// Kill the current link, as an unexpected network drop would.
    pub fn drop_link(&self) {
        let mut inner = self.inner.lock();
        if let Some(link) = inner.links.last_mut() {
            link.to_client = None;
        }
    }

    /// Push an event to the client over the current link.
    pub fn deliver(&self, event: &str, data: serde_json::Value) {
        let inner = self.inner.lock();
        let link = inner.links.last().expect("no link to deliver on");
        let to_client = link.to_client.as_ref().expect("link was dropped");
        to_client
            .send(Frame::new(event, data))
            .expect("client receiver gone");
    }

    /// All frames the client emitted with this event name, across links.
    pub fn frames_named(&self, event: &str) -> Vec<Frame> {
        let inner = self.inner.lock();
        inner
            .links
            .iter()
            .flat_map(|link| link.sent.lock().clone())
            .filter(|frame| frame.event == event)
            .collect()
    }

    pub async fn wait_for_frame(&self, event: &str) -> Frame {
        self.wait_for_frame_count(event, 1).await
    }

    /// Wait until `count` frames with this name were emitted; returns the
    /// last of them.
    pub async fn wait_for_frame_count(&self, event: &str, count: usize) -> Frame {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                let frames = self.frames_named(event);
                if frames.len() >= count {
                    return frames[count - 1].clone();
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {count} '{event}' frame(s)"))
    }

    fn open_link(&self) -> Result<RelayLink, TransportError> {
        let mut inner = self.inner.lock();
        inner.dials += 1;
        if inner.fail_next_dials > 0 {
            inner.fail_next_dials -= 1;
            return Err(TransportError::ConnectFailed("relay refused".into()));
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();
        let sent = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let capture = sent.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                capture.lock().push(frame);
            }
        });

        inner.links.push(LinkHandle {
            to_client: Some(in_tx),
            sent,
        });
        Ok(RelayLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[async_trait]
impl RelayConnector for MemoryRelay {
    async fn dial(&self, _url: &Url) -> Result<RelayLink, TransportError> {
        self.open_link()
    }
}

// ---------------------------------------------------------------------------
// Capability gate

pub struct MockTrack {
    enabled: AtomicBool,
    closed: AtomicBool,
}

impl LocalAudioTrack for MockTrack {
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl MockTrack {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct MockAudioSource {
    tracks: parking_lot::Mutex<Vec<Arc<MockTrack>>>,
}

impl MockAudioSource {
    pub fn new() -> Self {
        Self {
            tracks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn track(&self, index: usize) -> Arc<MockTrack> {
        self.tracks.lock()[index].clone()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.lock().len()
    }
}

impl AudioSource for MockAudioSource {
    fn open_track(&self) -> Arc<dyn LocalAudioTrack> {
        let track = Arc::new(MockTrack {
            enabled: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        });
        self.tracks.lock().push(track.clone());
        track
    }
}

/// A gate that grants or denies, optionally holding individual requests
/// open so tests can race joins against the permission prompt.
pub struct MockGate {
    deny: Option<String>,
    source: Arc<MockAudioSource>,
    holds: parking_lot::Mutex<VecDeque<Arc<Notify>>>,
    requests: AtomicU32,
}

impl MockGate {
    pub fn granting() -> Arc<Self> {
        Arc::new(Self {
            deny: None,
            source: Arc::new(MockAudioSource::new()),
            holds: parking_lot::Mutex::new(VecDeque::new()),
            requests: AtomicU32::new(0),
        })
    }

    pub fn denying(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            deny: Some(reason.to_string()),
            source: Arc::new(MockAudioSource::new()),
            holds: parking_lot::Mutex::new(VecDeque::new()),
            requests: AtomicU32::new(0),
        })
    }

    pub fn source(&self) -> Arc<MockAudioSource> {
        self.source.clone()
    }

    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    /// The next `request()` suspends until the returned handle is notified.
    pub fn hold_next_request(&self) -> Arc<Notify> {
        let hold = Arc::new(Notify::new());
        self.holds.lock().push_back(hold.clone());
        hold
    }

    pub async fn wait_for_requests(&self, count: u32) {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            while self.request_count() < count {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await
        .expect("timed out waiting for capability requests")
    }
}

#[async_trait]
impl AudioCapabilityGate for MockGate {
    async fn request(&self) -> Result<AudioCapability, CapabilityDenied> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let hold = self.holds.lock().pop_front();
        if let Some(hold) = hold {
            hold.notified().await;
        }
        match &self.deny {
            Some(reason) => Err(CapabilityDenied {
                reason: reason.clone(),
            }),
            None => Ok(AudioCapability::new(self.source.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// Peer connection

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    SetRemote,
    CreateOffer,
    CreateAnswer,
    SetLocal,
    AddCandidate,
    AttachTrack,
}

pub struct MockPeer {
    pub generation: u64,
    events: mpsc::UnboundedSender<PeerEvent>,
    calls: parking_lot::Mutex<Vec<PeerCall>>,
    candidates: parking_lot::Mutex<Vec<IceCandidate>>,
    track: parking_lot::Mutex<Option<Arc<dyn LocalAudioTrack>>>,
    closed: AtomicBool,
}

impl MockPeer {
    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().clone()
    }

    pub fn added_candidates(&self) -> Vec<String> {
        self.candidates
            .lock()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn has_track(&self) -> bool {
        self.track.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulate a connectivity report from the platform.
    pub fn report(&self, state: PeerConnectionState) {
        let _ = self.events.send(PeerEvent {
            generation: self.generation,
            kind: PeerEventKind::StateChanged(state),
        });
    }

    /// Simulate a locally gathered ICE candidate.
    pub fn gather(&self, candidate: IceCandidate) {
        let _ = self.events.send(PeerEvent {
            generation: self.generation,
            kind: PeerEventKind::LocalCandidate(candidate),
        });
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn set_remote_description(
        &self,
        _desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.calls.lock().push(PeerCall::SetRemote);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.calls.lock().push(PeerCall::CreateOffer);
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0 mock offer".into(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.calls.lock().push(PeerCall::CreateAnswer);
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0 mock answer".into(),
        })
    }

    async fn set_local_description(
        &self,
        _desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.calls.lock().push(PeerCall::SetLocal);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.calls.lock().push(PeerCall::AddCandidate);
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn attach_local_track(
        &self,
        track: Arc<dyn LocalAudioTrack>,
    ) -> Result<(), NegotiationError> {
        self.calls.lock().push(PeerCall::AttachTrack);
        *self.track.lock() = Some(track);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockPeerFactory {
    peers: parking_lot::Mutex<Vec<Arc<MockPeer>>>,
    fail_create: AtomicBool,
}

impl MockPeerFactory {
    pub fn new() -> Self {
        Self {
            peers: parking_lot::Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
        }
    }

    pub fn fail_creates(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn peer(&self, index: usize) -> Arc<MockPeer> {
        self.peers.lock()[index].clone()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}

impl PeerConnectionFactory for MockPeerFactory {
    fn create(
        &self,
        generation: u64,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(NegotiationError::Peer("create refused".into()));
        }
        let peer = Arc::new(MockPeer {
            generation,
            events,
            calls: parking_lot::Mutex::new(Vec::new()),
            candidates: parking_lot::Mutex::new(Vec::new()),
            track: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

// ---------------------------------------------------------------------------
// State helpers

/// Wait until the published session state satisfies the predicate.
pub async fn wait_for_state(
    rx: &mut watch::Receiver<SessionState>,
    predicate: impl Fn(&SessionState) -> bool,
) -> SessionState {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            {
                let current = rx.borrow_and_update();
                if predicate(&current) {
                    return current.clone();
                }
            }
            rx.changed().await.expect("session state channel closed");
        }
    })
    .await
    .expect("timed out waiting for session state")
}

pub async fn wait_for_phase(
    rx: &mut watch::Receiver<SessionState>,
    phase: SessionPhase,
) -> SessionState {
    wait_for_state(rx, |state| state.phase == phase).await
}
