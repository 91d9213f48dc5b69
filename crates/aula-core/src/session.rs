//! Session state machine.
//!
//! One event-loop task per `SessionManager` serializes user commands,
//! transport events, and peer events; the composite session state is a pure
//! projection of the owned sub-state, published through a watch channel so
//! the UI can never read a stale value. Concurrency is handled by ordering,
//! not mutual exclusion: nothing here is behind a lock.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::BroadcastStream;
use url::Url;
use uuid::Uuid;

use crate::capability::{AudioCapability, AudioCapabilityGate};
use crate::errors::{AulaError, CapabilityDenied, TransportError};
use crate::fanout::{ChatMessage, FanOut, FanOutEvent};
use crate::protocol::{
    AnswerPayload, CHAT_MESSAGE, CandidatePayload, ChatMessagePayload, EventTimestamp,
    Frame, ICE_CANDIDATE, JOIN_SESSION, JoinSessionPayload, LEAVE_SESSION, LeaveSessionPayload,
    OfferPayload, ParticipantRole, RELAY_ERROR, RelayErrorPayload, SESSION_ENDED, SESSION_INFO,
    SUBMIT_POLL_RESPONSE, SessionInfoPayload, SubmitPollResponsePayload, USER_JOINED, USER_LEFT,
    UserJoinedPayload, UserLeftPayload, WEBRTC_ANSWER, WEBRTC_OFFER,
};
use crate::signaling::{
    NegotiationState, PeerConnectionFactory, PeerEvent, SignalingCoordinator,
};
use crate::transport::{
    ConnectionState, ReconnectPolicy, RelayConnector, TransportChannel, TransportEvent,
};

pub type ParticipantId = String;

/// Immutable for the lifetime of one join; discarded on leave or fatal
/// disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: String,
    pub lecture_id: String,
    pub local_participant_id: String,
    pub role: ParticipantRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Joining,
    Negotiating,
    Active,
    Recovering,
    JoinFailed,
    Lost,
}

/// The one composite view presentation code observes. Recomputed from the
/// owned sub-states whenever any of them changes; it carries nothing that
/// is not derivable from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub connection: ConnectionState,
    pub negotiation: NegotiationState,
    pub muted: bool,
    pub participants: BTreeSet<ParticipantId>,
}

impl SessionState {
    fn detached(phase: SessionPhase, muted: bool) -> Self {
        let connection = match phase {
            SessionPhase::Lost => ConnectionState::Failed,
            _ => ConnectionState::Disconnected,
        };
        let negotiation = match phase {
            SessionPhase::Idle => NegotiationState::Idle,
            _ => NegotiationState::Closed,
        };
        Self {
            phase,
            connection,
            negotiation,
            muted,
            participants: BTreeSet::new(),
        }
    }
}

/// User preference that is independent of network state. Survives leaves,
/// joins, and reconnects; re-applied to every newly created local track.
#[derive(Debug, Clone, Default)]
struct LocalIntent {
    muted: bool,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub relay_url: Url,
    pub user_name: String,
    pub role: ParticipantRole,
    pub reconnect: ReconnectPolicy,
}

enum Command {
    Join {
        session_id: String,
        lecture_id: String,
        done: oneshot::Sender<Result<(), AulaError>>,
    },
    Leave,
    SetMuted(bool),
    SendChat {
        text: String,
        done: oneshot::Sender<Result<(), AulaError>>,
    },
    SubmitPollResponse {
        poll_id: String,
        response: String,
        done: oneshot::Sender<Result<(), AulaError>>,
    },
}

/// Public handle to the session core. Presentation code observes exactly
/// one composite state plus the four fan-out streams; everything else is
/// internal.
pub struct SessionManager {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<SessionState>,
    fanout: Arc<FanOut>,
}

impl SessionManager {
    /// Spawns the session event loop; must be called on a tokio runtime.
    pub fn new(
        connector: Arc<dyn RelayConnector>,
        gate: Arc<dyn AudioCapabilityGate>,
        peers: Arc<dyn PeerConnectionFactory>,
        config: SessionConfig,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::detached(SessionPhase::Idle, false));
        let fanout = Arc::new(FanOut::new());

        let session_loop = SessionLoop::new(connector, gate, peers, config, fanout.clone(), state_tx);
        tokio::spawn(session_loop.run(commands_rx));

        Self {
            commands: commands_tx,
            state_rx,
            fanout,
        }
    }

    /// Join a live session. Resolves once the session is joined and
    /// negotiating (or failed). A join superseded by a newer `join` or a
    /// `leave` resolves with [`AulaError::Superseded`].
    pub async fn join(&self, session_id: &str, lecture_id: &str) -> Result<(), AulaError> {
        let (done, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Join {
                session_id: session_id.to_string(),
                lecture_id: lecture_id.to_string(),
                done,
            })
            .map_err(|_| AulaError::Closed)?;
        done_rx.await.map_err(|_| AulaError::Superseded)?
    }

    /// Leave the current session. Fire-and-forget and idempotent; safe to
    /// call in any phase.
    pub fn leave(&self) {
        let _ = self.commands.send(Command::Leave);
    }

    pub fn set_muted(&self, muted: bool) {
        let _ = self.commands.send(Command::SetMuted(muted));
    }

    /// Flip the mute intent. Returns the newly requested value.
    pub fn toggle_mute(&self) -> bool {
        let next = !self.state_rx.borrow().muted;
        let _ = self.commands.send(Command::SetMuted(next));
        next
    }

    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn chat_stream(&self) -> BroadcastStream<FanOutEvent> {
        self.fanout.chat_stream()
    }

    pub fn poll_stream(&self) -> BroadcastStream<FanOutEvent> {
        self.fanout.poll_stream()
    }

    pub fn content_stream(&self) -> BroadcastStream<FanOutEvent> {
        self.fanout.content_stream()
    }

    pub fn presence_stream(&self) -> BroadcastStream<FanOutEvent> {
        self.fanout.presence_stream()
    }

    pub async fn send_chat(&self, text: &str) -> Result<(), AulaError> {
        let (done, done_rx) = oneshot::channel();
        self.commands
            .send(Command::SendChat {
                text: text.to_string(),
                done,
            })
            .map_err(|_| AulaError::Closed)?;
        done_rx.await.map_err(|_| AulaError::Closed)?
    }

    pub async fn submit_poll_response(
        &self,
        poll_id: &str,
        response: &str,
    ) -> Result<(), AulaError> {
        let (done, done_rx) = oneshot::channel();
        self.commands
            .send(Command::SubmitPollResponse {
                poll_id: poll_id.to_string(),
                response: response.to_string(),
                done,
            })
            .map_err(|_| AulaError::Closed)?;
        done_rx.await.map_err(|_| AulaError::Closed)?
    }
}

/// Everything owned by one join attempt, torn down atomically on leave or
/// fatal error.
struct JoinAttempt {
    epoch: u64,
    identity: SessionIdentity,
    transport: TransportChannel,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    connection: ConnectionState,
    capability: Option<AudioCapability>,
    coordinator: SignalingCoordinator,
    participants: BTreeSet<ParticipantId>,
    join_done: Option<oneshot::Sender<Result<(), AulaError>>>,
}

enum LoopInput {
    Command(Command),
    Transport(TransportEvent),
    Peer(PeerEvent),
    Capability(u64, Result<AudioCapability, CapabilityDenied>),
    Connect(u64, Result<(), TransportError>),
}

struct SessionLoop {
    connector: Arc<dyn RelayConnector>,
    gate: Arc<dyn AudioCapabilityGate>,
    peers: Arc<dyn PeerConnectionFactory>,
    config: SessionConfig,
    fanout: Arc<FanOut>,
    state_tx: watch::Sender<SessionState>,
    intent: LocalIntent,
    phase: SessionPhase,
    epoch: u64,
    attempt: Option<JoinAttempt>,
    peer_generations: Arc<AtomicU64>,
    peer_events_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    capability_tx: mpsc::UnboundedSender<(u64, Result<AudioCapability, CapabilityDenied>)>,
    capability_rx: mpsc::UnboundedReceiver<(u64, Result<AudioCapability, CapabilityDenied>)>,
    connect_tx: mpsc::UnboundedSender<(u64, Result<(), TransportError>)>,
    connect_rx: mpsc::UnboundedReceiver<(u64, Result<(), TransportError>)>,
}

/// Pending forever while no attempt exists, so the select below simply
/// ignores the transport arm between sessions.
async fn next_transport_event(attempt: &mut Option<JoinAttempt>) -> TransportEvent {
    match attempt {
        Some(attempt) => match attempt.transport_events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

impl SessionLoop {
    fn new(
        connector: Arc<dyn RelayConnector>,
        gate: Arc<dyn AudioCapabilityGate>,
        peers: Arc<dyn PeerConnectionFactory>,
        config: SessionConfig,
        fanout: Arc<FanOut>,
        state_tx: watch::Sender<SessionState>,
    ) -> Self {
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let (capability_tx, capability_rx) = mpsc::unbounded_channel();
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            gate,
            peers,
            config,
            fanout,
            state_tx,
            intent: LocalIntent::default(),
            phase: SessionPhase::Idle,
            epoch: 0,
            attempt: None,
            peer_generations: Arc::new(AtomicU64::new(0)),
            peer_events_tx,
            peer_events_rx,
            capability_tx,
            capability_rx,
            connect_tx,
            connect_rx,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let input = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => LoopInput::Command(command),
                    None => break,
                },
                event = next_transport_event(&mut self.attempt) => LoopInput::Transport(event),
                Some(event) = self.peer_events_rx.recv() => LoopInput::Peer(event),
                Some((epoch, result)) = self.capability_rx.recv() => {
                    LoopInput::Capability(epoch, result)
                }
                Some((epoch, result)) = self.connect_rx.recv() => {
                    LoopInput::Connect(epoch, result)
                }
            };
            match input {
                LoopInput::Command(command) => self.handle_command(command),
                LoopInput::Transport(TransportEvent::StateChanged(state)) => {
                    self.handle_transport_state(state).await;
                }
                LoopInput::Transport(TransportEvent::Message(frame)) => {
                    self.handle_frame(frame).await;
                }
                LoopInput::Peer(event) => self.handle_peer_event(event),
                LoopInput::Capability(epoch, result) => {
                    self.handle_capability_result(epoch, result).await;
                }
                LoopInput::Connect(epoch, result) => self.handle_connect_result(epoch, result),
            }
        }
        // The manager handle is gone; take the relay link down with it.
        let _ = self.teardown_attempt(true);
        tracing::info!("session loop ended");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join {
                session_id,
                lecture_id,
                done,
            } => self.handle_join(session_id, lecture_id, done),
            Command::Leave => {
                let _ = self.teardown_attempt(true);
                self.phase = SessionPhase::Idle;
                self.publish();
            }
            Command::SetMuted(muted) => {
                self.intent.muted = muted;
                if let Some(attempt) = self.attempt.as_ref() {
                    attempt.coordinator.apply_mute(muted);
                }
                self.publish();
            }
            Command::SendChat { text, done } => {
                let result = self.send_chat(text);
                let _ = done.send(result);
            }
            Command::SubmitPollResponse {
                poll_id,
                response,
                done,
            } => {
                let result = self.submit_poll_response(poll_id, response);
                let _ = done.send(result);
            }
        }
    }

    fn handle_join(
        &mut self,
        session_id: String,
        lecture_id: String,
        done: oneshot::Sender<Result<(), AulaError>>,
    ) {
        // A newer join supersedes whatever was in flight; its pending
        // continuations become no-ops through the epoch guard below.
        let _ = self.teardown_attempt(true);
        self.epoch += 1;
        let epoch = self.epoch;

        let identity = SessionIdentity {
            session_id,
            lecture_id,
            local_participant_id: Uuid::new_v4().to_string(),
            role: self.config.role,
        };
        let (transport, transport_events) =
            TransportChannel::new(self.connector.clone(), self.config.reconnect.clone());
        let coordinator = SignalingCoordinator::new(
            self.peers.clone(),
            transport.clone(),
            identity.clone(),
            self.peer_events_tx.clone(),
            self.peer_generations.clone(),
        );
        self.attempt = Some(JoinAttempt {
            epoch,
            identity,
            transport: transport.clone(),
            transport_events,
            connection: ConnectionState::Connecting,
            capability: None,
            coordinator,
            participants: BTreeSet::new(),
            join_done: Some(done),
        });
        self.phase = SessionPhase::Joining;
        self.publish();

        let gate = self.gate.clone();
        let capability_tx = self.capability_tx.clone();
        tokio::spawn(async move {
            let result = gate.request().await;
            let _ = capability_tx.send((epoch, result));
        });

        let url = self.config.relay_url.clone();
        let connect_tx = self.connect_tx.clone();
        tokio::spawn(async move {
            let result = transport.connect(url).await;
            let _ = connect_tx.send((epoch, result));
        });
    }

    async fn handle_capability_result(
        &mut self,
        epoch: u64,
        result: Result<AudioCapability, CapabilityDenied>,
    ) {
        if self.attempt.as_ref().map(|a| a.epoch) != Some(epoch) {
            tracing::debug!("discarding capability result for superseded join");
            return;
        }
        match result {
            Ok(capability) => {
                if let Some(attempt) = self.attempt.as_mut() {
                    attempt.capability = Some(capability);
                }
                self.maybe_advance_joining().await;
            }
            Err(denied) => {
                tracing::warn!("audio capability denied: {}", denied.reason);
                self.fail_join(AulaError::PermissionDenied(denied));
            }
        }
    }

    fn handle_connect_result(&mut self, epoch: u64, result: Result<(), TransportError>) {
        if self.attempt.as_ref().map(|a| a.epoch) != Some(epoch) {
            tracing::debug!("discarding connect result for superseded join");
            return;
        }
        // Success is observed through StateChanged(Connected); only the
        // first-dial failure needs handling here.
        if let Err(e) = result {
            tracing::warn!("relay connect failed: {e}");
            self.fail_join(AulaError::Transport(e));
        }
    }

    async fn handle_transport_state(&mut self, state: ConnectionState) {
        {
            let Some(attempt) = self.attempt.as_mut() else {
                return;
            };
            attempt.connection = state.clone();
        }
        match state {
            ConnectionState::Connected => match self.phase {
                SessionPhase::Joining => self.maybe_advance_joining().await,
                SessionPhase::Recovering => {
                    // The transport already re-emitted join_session; start
                    // the full renegotiation (no incremental ICE restart).
                    if let Some(attempt) = self.attempt.as_mut() {
                        attempt.coordinator.reset();
                    }
                    self.maybe_start_negotiation().await;
                }
                _ => {}
            },
            ConnectionState::Reconnecting { .. } => {
                if matches!(self.phase, SessionPhase::Negotiating | SessionPhase::Active) {
                    self.phase = SessionPhase::Recovering;
                }
            }
            ConnectionState::Failed => match self.phase {
                SessionPhase::Joining => {
                    let attempts = self.config.reconnect.max_attempts;
                    self.fail_join(AulaError::Transport(TransportError::ReconnectExhausted(
                        attempts,
                    )));
                }
                SessionPhase::Negotiating | SessionPhase::Active | SessionPhase::Recovering => {
                    self.lose_session();
                }
                _ => {}
            },
            ConnectionState::Connecting | ConnectionState::Disconnected => {}
        }
        self.publish();
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match frame.event.as_str() {
            WEBRTC_OFFER => {
                let muted = self.intent.muted;
                let Some(attempt) = self.attempt.as_mut() else {
                    return;
                };
                let Some(payload) = decode::<OfferPayload>(&frame) else {
                    return;
                };
                if payload.session_id != attempt.identity.session_id {
                    tracing::debug!("offer for another session, ignoring");
                    return;
                }
                let Some(capability) = attempt.capability.clone() else {
                    tracing::warn!("offer arrived before the capability grant, ignoring");
                    return;
                };
                if let Err(e) = attempt
                    .coordinator
                    .handle_remote_offer(payload.from_user_id, payload.offer, &capability, muted)
                    .await
                {
                    tracing::warn!("offer handling failed: {e}");
                    attempt.coordinator.reset();
                }
                self.publish();
            }
            WEBRTC_ANSWER => {
                let Some(attempt) = self.attempt.as_mut() else {
                    return;
                };
                let Some(payload) = decode::<AnswerPayload>(&frame) else {
                    return;
                };
                if payload.session_id != attempt.identity.session_id {
                    return;
                }
                if let Err(e) = attempt.coordinator.handle_remote_answer(payload.answer).await {
                    tracing::warn!("answer handling failed: {e}");
                    attempt.coordinator.reset();
                }
                self.publish();
            }
            ICE_CANDIDATE => {
                let Some(attempt) = self.attempt.as_mut() else {
                    return;
                };
                let Some(payload) = decode::<CandidatePayload>(&frame) else {
                    return;
                };
                if payload.session_id != attempt.identity.session_id {
                    return;
                }
                if let Err(e) = attempt
                    .coordinator
                    .handle_remote_candidate(payload.candidate)
                    .await
                {
                    tracing::warn!("candidate handling failed: {e}");
                }
            }
            SESSION_INFO => {
                let local_role = self.config.role;
                let Some(attempt) = self.attempt.as_mut() else {
                    return;
                };
                let Some(payload) = decode::<SessionInfoPayload>(&frame) else {
                    return;
                };
                let local = attempt.identity.local_participant_id.clone();
                for participant in &payload.participants {
                    if participant.user_id != local {
                        attempt.participants.insert(participant.user_id.clone());
                    }
                }
                // The single remote peer of the star topology: prefer the
                // counterpart role, fall back to the first other user.
                if !attempt.coordinator.has_remote_user() {
                    let remote = payload
                        .participants
                        .iter()
                        .filter(|p| p.user_id != local)
                        .find(|p| p.user_type != local_role)
                        .or_else(|| payload.participants.iter().find(|p| p.user_id != local));
                    if let Some(remote) = remote {
                        attempt.coordinator.set_remote_user(remote.user_id.clone());
                    }
                }
                self.publish();
                self.maybe_start_negotiation().await;
            }
            USER_JOINED => {
                let Some(attempt) = self.attempt.as_mut() else {
                    return;
                };
                let Some(payload) = decode::<UserJoinedPayload>(&frame) else {
                    return;
                };
                if payload.user_id == attempt.identity.local_participant_id {
                    return;
                }
                attempt.participants.insert(payload.user_id.clone());
                if !attempt.coordinator.has_remote_user() {
                    attempt.coordinator.set_remote_user(payload.user_id.clone());
                }
                // State first, then the notification: the fan-out never
                // runs ahead of the published state.
                self.publish();
                self.fanout
                    .publish(FanOutEvent::ParticipantJoined(payload.user_id));
                self.maybe_start_negotiation().await;
            }
            USER_LEFT => {
                let Some(attempt) = self.attempt.as_mut() else {
                    return;
                };
                let Some(payload) = decode::<UserLeftPayload>(&frame) else {
                    return;
                };
                attempt.participants.remove(&payload.user_id);
                self.publish();
                self.fanout
                    .publish(FanOutEvent::ParticipantLeft(payload.user_id));
            }
            SESSION_ENDED => {
                tracing::info!("session ended by the relay");
                let _ = self.teardown_attempt(false);
                self.phase = SessionPhase::Idle;
                self.publish();
            }
            RELAY_ERROR => match decode::<RelayErrorPayload>(&frame) {
                Some(payload) => tracing::warn!("relay error: {}", payload.message),
                None => tracing::warn!("relay error with unreadable payload"),
            },
            other => {
                if !self.fanout.dispatch(other, &frame.data) {
                    tracing::debug!("unhandled relay event: {other}");
                }
            }
        }
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        attempt.coordinator.handle_peer_event(event);
        // A peer report alone is not enough: a stale peer may still claim
        // connectivity while the transport is down.
        if attempt.coordinator.state() == NegotiationState::Connected
            && attempt.connection == ConnectionState::Connected
            && matches!(self.phase, SessionPhase::Negotiating | SessionPhase::Recovering)
        {
            self.phase = SessionPhase::Active;
        }
        self.publish();
    }

    /// Joining -> Negotiating once both the transport is up and the
    /// capability is granted.
    async fn maybe_advance_joining(&mut self) {
        if self.phase != SessionPhase::Joining {
            return;
        }
        let done = {
            let Some(attempt) = self.attempt.as_mut() else {
                return;
            };
            if attempt.capability.is_none() || attempt.connection != ConnectionState::Connected {
                return;
            }
            let session_id = attempt.identity.session_id.clone();
            attempt.transport.set_active_session(Some(session_id.clone()));
            if let Err(e) = attempt
                .transport
                .emit(JOIN_SESSION, &JoinSessionPayload { session_id })
            {
                // The link raced away; the supervisor re-joins on reconnect.
                tracing::warn!("join_session not sent: {e}");
            }
            attempt.join_done.take()
        };
        self.phase = SessionPhase::Negotiating;
        self.publish();
        if let Some(done) = done {
            let _ = done.send(Ok(()));
        }
        self.maybe_start_negotiation().await;
    }

    /// The broadcasting role initiates once a remote participant is known;
    /// listeners wait for the offer.
    async fn maybe_start_negotiation(&mut self) {
        if self.config.role != ParticipantRole::Teacher {
            return;
        }
        if !matches!(self.phase, SessionPhase::Negotiating | SessionPhase::Recovering) {
            return;
        }
        let muted = self.intent.muted;
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if attempt.connection != ConnectionState::Connected
            || attempt.coordinator.state() != NegotiationState::Idle
            || !attempt.coordinator.has_remote_user()
        {
            return;
        }
        let Some(capability) = attempt.capability.clone() else {
            return;
        };
        if let Err(e) = attempt.coordinator.start_negotiation(&capability, muted).await {
            tracing::warn!("negotiation start failed: {e}");
            attempt.coordinator.reset();
        }
        self.publish();
    }

    fn send_chat(&mut self, text: String) -> Result<(), AulaError> {
        let Some(attempt) = self.attempt.as_ref() else {
            return Err(TransportError::NotConnected.into());
        };
        let payload = ChatMessagePayload {
            session_id: attempt.identity.session_id.clone(),
            message: text,
            user_name: self.config.user_name.clone(),
            user_type: self.config.role,
            timestamp: EventTimestamp::now(),
        };
        attempt.transport.emit(CHAT_MESSAGE, &payload)?;
        // Local echo; the relay does not loop our own messages back.
        self.fanout.publish(FanOutEvent::Chat(ChatMessage {
            message: payload.message,
            user_name: payload.user_name,
            user_type: payload.user_type,
            timestamp: payload.timestamp,
        }));
        Ok(())
    }

    fn submit_poll_response(&mut self, poll_id: String, response: String) -> Result<(), AulaError> {
        let Some(attempt) = self.attempt.as_ref() else {
            return Err(TransportError::NotConnected.into());
        };
        attempt
            .transport
            .emit(SUBMIT_POLL_RESPONSE, &SubmitPollResponsePayload { poll_id, response })?;
        Ok(())
    }

    fn fail_join(&mut self, error: AulaError) {
        if let Some(done) = self.teardown_attempt(false) {
            let _ = done.send(Err(error));
        }
        self.phase = SessionPhase::JoinFailed;
        self.publish();
    }

    fn lose_session(&mut self) {
        let _ = self.teardown_attempt(false);
        self.phase = SessionPhase::Lost;
        self.publish();
    }

    /// Synchronous teardown of everything a join owns. Returns the pending
    /// join continuation, if any; dropping it resolves the caller with
    /// `Superseded`.
    fn teardown_attempt(
        &mut self,
        emit_leave: bool,
    ) -> Option<oneshot::Sender<Result<(), AulaError>>> {
        let mut attempt = self.attempt.take()?;
        if emit_leave {
            // Fire and forget: the relay times out stale participants.
            let payload = LeaveSessionPayload {
                session_id: attempt.identity.session_id.clone(),
            };
            if let Err(e) = attempt.transport.emit(LEAVE_SESSION, &payload) {
                tracing::debug!("leave_session not delivered: {e}");
            }
        }
        attempt.coordinator.close();
        attempt.transport.set_active_session(None);
        attempt.transport.disconnect();
        attempt.join_done.take()
    }

    fn project(&self) -> SessionState {
        match &self.attempt {
            Some(attempt) => SessionState {
                phase: self.phase,
                connection: attempt.connection.clone(),
                negotiation: attempt.coordinator.state(),
                muted: self.intent.muted,
                participants: attempt.participants.clone(),
            },
            None => SessionState::detached(self.phase, self.intent.muted),
        }
    }

    fn publish(&self) {
        let next = self.project();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

fn decode<T: serde::de::DeserializeOwned>(frame: &Frame) -> Option<T> {
    match serde_json::from_value(frame.data.clone()) {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::warn!("dropping malformed {}: {e}", frame.event);
            None
        }
    }
}
