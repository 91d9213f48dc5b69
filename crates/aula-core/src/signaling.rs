//! WebRTC signaling coordinator.
//!
//! Owns the peer connection and its negotiation state machine. Every method
//! runs on the session event loop, so the coordinator is plain
//! single-threaded state: ordering does the synchronization.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::capability::{AudioCapability, LocalAudioTrack};
use crate::errors::{AulaError, NegotiationError};
use crate::protocol::{
    AnswerPayload, CandidatePayload, ICE_CANDIDATE, IceCandidate, OfferPayload, SdpKind,
    SessionDescription, WEBRTC_ANSWER, WEBRTC_OFFER,
};
use crate::session::SessionIdentity;
use crate::transport::TransportChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Connected,
    Closed,
}

/// Connectivity of the underlying peer connection, as reported by the
/// platform implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Pushed by a peer connection into the session event loop. Tagged with the
/// generation of the peer that produced it; events from a superseded peer
/// are no-ops.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub generation: u64,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    StateChanged(PeerConnectionState),
    LocalCandidate(IceCandidate),
}

/// The platform's peer connection. The media pipeline behind it (codec,
/// capture, playout) is not this crate's concern; the remote track is
/// rendered by the platform side of this trait's implementation.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(&self, desc: SessionDescription)
    -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;
    async fn attach_local_track(
        &self,
        track: Arc<dyn LocalAudioTrack>,
    ) -> Result<(), NegotiationError>;
    fn close(&self);
}

pub trait PeerConnectionFactory: Send + Sync {
    /// Create a peer connection reporting its events on `events`, tagged
    /// with `generation`.
    fn create(
        &self,
        generation: u64,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}

/// Drives offer/answer/candidate exchange for the single remote peer of a
/// joined session (star topology: the broadcaster).
pub struct SignalingCoordinator {
    factory: Arc<dyn PeerConnectionFactory>,
    transport: TransportChannel,
    identity: SessionIdentity,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    generations: Arc<AtomicU64>,
    generation: u64,
    peer: Option<Arc<dyn PeerConnection>>,
    state: NegotiationState,
    remote_user: Option<String>,
    remote_description_set: bool,
    /// Candidates that arrived before a remote description existed. Flushed
    /// in arrival order once one does; never dropped.
    pending_candidates: Vec<IceCandidate>,
    local_track: Option<Arc<dyn LocalAudioTrack>>,
}

impl SignalingCoordinator {
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        transport: TransportChannel,
        identity: SessionIdentity,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
        generations: Arc<AtomicU64>,
    ) -> Self {
        Self {
            factory,
            transport,
            identity,
            peer_events,
            generations,
            generation: 0,
            peer: None,
            state: NegotiationState::Idle,
            remote_user: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            local_track: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn has_remote_user(&self) -> bool {
        self.remote_user.is_some()
    }

    pub fn set_remote_user(&mut self, user_id: String) {
        self.remote_user = Some(user_id);
    }

    /// Apply the local mute intent to the live track, if one exists.
    pub fn apply_mute(&self, muted: bool) {
        if let Some(track) = &self.local_track {
            track.set_enabled(!muted);
        }
    }

    pub fn has_local_track(&self) -> bool {
        self.local_track.is_some()
    }

    /// Initiator path, used by the broadcasting role once a remote
    /// participant is known.
    pub async fn start_negotiation(
        &mut self,
        capability: &AudioCapability,
        muted: bool,
    ) -> Result<(), AulaError> {
        let target = self
            .remote_user
            .clone()
            .ok_or(NegotiationError::NoRemotePeer)?;
        let peer = self.ensure_peer()?;
        self.open_track(capability, muted, &peer).await?;
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        self.transport.emit(
            WEBRTC_OFFER,
            &OfferPayload {
                session_id: self.identity.session_id.clone(),
                target_user_id: target,
                from_user_id: self.identity.local_participant_id.clone(),
                offer,
            },
        )?;
        self.state = NegotiationState::OfferSent;
        Ok(())
    }

    /// Responder path: the common student flow. Sets the remote
    /// description, opens the local track, answers, then flushes any
    /// candidates that raced ahead of the offer.
    pub async fn handle_remote_offer(
        &mut self,
        from_user: String,
        offer: SessionDescription,
        capability: &AudioCapability,
        muted: bool,
    ) -> Result<(), AulaError> {
        if offer.kind != SdpKind::Offer {
            return Err(NegotiationError::Malformed {
                kind: "offer",
                detail: "description is not an offer".into(),
            }
            .into());
        }
        self.remote_user = Some(from_user.clone());
        self.state = NegotiationState::OfferReceived;

        let peer = self.ensure_peer()?;
        peer.set_remote_description(offer).await?;
        self.remote_description_set = true;
        self.open_track(capability, muted, &peer).await?;

        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        self.transport.emit(
            WEBRTC_ANSWER,
            &AnswerPayload {
                session_id: self.identity.session_id.clone(),
                target_user_id: from_user,
                from_user_id: self.identity.local_participant_id.clone(),
                answer,
            },
        )?;
        self.state = NegotiationState::AnswerSent;

        self.flush_pending(&peer).await?;
        Ok(())
    }

    pub async fn handle_remote_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<(), AulaError> {
        if answer.kind != SdpKind::Answer {
            return Err(NegotiationError::Malformed {
                kind: "answer",
                detail: "description is not an answer".into(),
            }
            .into());
        }
        let peer = self
            .peer
            .clone()
            .ok_or_else(|| NegotiationError::Peer("answer without a pending offer".into()))?;
        peer.set_remote_description(answer).await?;
        self.remote_description_set = true;
        self.state = NegotiationState::AnswerReceived;
        self.flush_pending(&peer).await?;
        Ok(())
    }

    /// Candidates may legally arrive before the offer/answer they belong
    /// to; those are queued, never dropped.
    pub async fn handle_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), AulaError> {
        match (&self.peer, self.remote_description_set) {
            (Some(peer), true) => {
                peer.add_ice_candidate(candidate).await?;
            }
            _ => {
                tracing::debug!("queueing ice candidate until a remote description exists");
                self.pending_candidates.push(candidate);
            }
        }
        Ok(())
    }

    /// Handle an event pushed by a peer connection. Events from a
    /// superseded peer are ignored.
    pub fn handle_peer_event(&mut self, event: PeerEvent) {
        if event.generation != self.generation || self.peer.is_none() {
            tracing::debug!(
                "ignoring event from superseded peer generation {}",
                event.generation
            );
            return;
        }
        match event.kind {
            PeerEventKind::StateChanged(PeerConnectionState::Connected) => {
                self.state = NegotiationState::Connected;
            }
            PeerEventKind::StateChanged(
                PeerConnectionState::Failed | PeerConnectionState::Disconnected,
            ) => {
                tracing::warn!("peer connection lost, negotiation returns to idle");
                self.reset();
            }
            PeerEventKind::StateChanged(_) => {}
            PeerEventKind::LocalCandidate(candidate) => {
                let Some(target) = self.remote_user.clone() else {
                    return;
                };
                let payload = CandidatePayload {
                    session_id: self.identity.session_id.clone(),
                    target_user_id: target,
                    from_user_id: self.identity.local_participant_id.clone(),
                    candidate,
                };
                if let Err(e) = self.transport.emit(ICE_CANDIDATE, &payload) {
                    tracing::debug!("local candidate not sent: {e}");
                }
            }
        }
    }

    /// Full renegotiation after a transport drop: close the peer and start
    /// over. No incremental ICE restart.
    pub fn reset(&mut self) {
        self.teardown_peer();
        self.state = NegotiationState::Idle;
    }

    pub fn close(&mut self) {
        self.teardown_peer();
        self.state = NegotiationState::Closed;
    }

    fn teardown_peer(&mut self) {
        if let Some(peer) = self.peer.take() {
            peer.close();
        }
        if let Some(track) = self.local_track.take() {
            track.close();
        }
        self.remote_description_set = false;
        self.pending_candidates.clear();
    }

    fn ensure_peer(&mut self) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        if let Some(peer) = &self.peer {
            return Ok(peer.clone());
        }
        self.generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let peer = self.factory.create(self.generation, self.peer_events.clone())?;
        self.peer = Some(peer.clone());
        Ok(peer)
    }

    async fn open_track(
        &mut self,
        capability: &AudioCapability,
        muted: bool,
        peer: &Arc<dyn PeerConnection>,
    ) -> Result<(), NegotiationError> {
        let track = capability.open_track();
        track.set_enabled(!muted);
        peer.attach_local_track(track.clone()).await?;
        self.local_track = Some(track);
        Ok(())
    }

    async fn flush_pending(
        &mut self,
        peer: &Arc<dyn PeerConnection>,
    ) -> Result<(), NegotiationError> {
        for candidate in self.pending_candidates.drain(..) {
            peer.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }
}
