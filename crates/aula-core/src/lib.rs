//! Aula Mobile realtime session core.
//!
//! Pure Rust crate with no platform dependencies: the coordination layer a
//! device runs while attending a live class — relay transport, peer audio
//! signaling, the session state machine, and typed fan-out of classroom
//! events. Consumed by native UI shells via FFI bindings.

pub mod capability;
pub mod discovery;
pub mod errors;
pub mod fanout;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod transport;

#[cfg(test)]
pub(crate) mod testkit;

pub use capability::{AudioCapability, AudioCapabilityGate, CachingGate, LocalAudioTrack};
pub use discovery::SessionDirectory;
pub use errors::{AulaError, CapabilityDenied, NegotiationError, TransportError};
pub use fanout::{ChatMessage, FanOutEvent, Poll, SharedContent};
pub use protocol::ParticipantRole;
pub use session::{SessionConfig, SessionManager, SessionPhase, SessionState};
pub use signaling::{PeerConnection, PeerConnectionFactory, PeerConnectionState};
pub use transport::{ConnectionState, ReconnectPolicy, RelayConnector, WsConnector};
