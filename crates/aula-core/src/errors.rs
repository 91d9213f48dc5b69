use std::time::Duration;

use thiserror::Error;

/// Transport-level failures.
///
/// Mid-session drops are retried internally by the reconnect supervisor and
/// surface only as `Reconnecting`/`Failed` connection states; callers see
/// these errors from `connect` and `emit` only.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("not connected")]
    NotConnected,
    #[error("could not encode payload: {0}")]
    Encode(String),
    #[error("gave up after {0} reconnect attempts")]
    ReconnectExhausted(u32),
}

/// The platform refused microphone access for this join attempt.
#[derive(Debug, Clone, Error)]
#[error("audio capability denied: {reason}")]
pub struct CapabilityDenied {
    pub reason: String,
}

/// Signaling and peer-connection failures. Logged and recovered from by
/// restarting negotiation; never fatal to the session on their own.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("malformed {kind}: {detail}")]
    Malformed { kind: &'static str, detail: String },
    #[error("peer connection: {0}")]
    Peer(String),
    #[error("no remote peer to signal")]
    NoRemotePeer,
}

/// Errors surfaced by the public session API.
#[derive(Debug, Error)]
pub enum AulaError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    PermissionDenied(#[from] CapabilityDenied),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("join attempt superseded by a newer join or leave")]
    Superseded,
    #[error("invalid lecture id: {0}")]
    InvalidLectureId(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("session loop is gone")]
    Closed,
}
