//! Wire model for the classroom relay.
//!
//! Every WebSocket text message is one JSON frame `{"event": ..., "data": ...}`.
//! This module is pure data; no I/O happens here.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// Outbound event names.
pub const JOIN_SESSION: &str = "join_session";
pub const LEAVE_SESSION: &str = "leave_session";
pub const WEBRTC_OFFER: &str = "webrtc_offer";
pub const WEBRTC_ANSWER: &str = "webrtc_answer";
pub const ICE_CANDIDATE: &str = "ice_candidate";
pub const CHAT_MESSAGE: &str = "chat_message";
pub const SUBMIT_POLL_RESPONSE: &str = "submit_poll_response";

// Inbound event names.
pub const SESSION_INFO: &str = "session_info";
pub const USER_JOINED: &str = "user_joined";
pub const USER_LEFT: &str = "user_left";
pub const NEW_POLL: &str = "new_poll";
pub const POLL_CREATED: &str = "poll_created";
pub const POLL_VOTE: &str = "poll_vote";
pub const CONTENT_SHARED: &str = "content_shared";
pub const RELAY_ERROR: &str = "error";
pub const SESSION_ENDED: &str = "session_ended";

/// One relay message: a named event plus its JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Teacher,
    Student,
}

/// Server timestamp in epoch milliseconds, display ordering only.
///
/// The relay historically sends either an integer or an RFC 3339 string;
/// both deserialize here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct EventTimestamp(pub i64);

impl EventTimestamp {
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }
}

impl<'de> Deserialize<'de> for EventTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        match &raw {
            Value::Number(n) => n
                .as_i64()
                .map(EventTimestamp)
                .ok_or_else(|| D::Error::custom("timestamp out of range")),
            Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                .map(|dt| EventTimestamp(dt.timestamp_millis()))
                .map_err(|e| D::Error::custom(format!("bad timestamp: {e}"))),
            other => Err(D::Error::custom(format!(
                "expected number or string timestamp, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description exchanged during negotiation. The SDP body is
/// opaque to this crate; only the platform media layer interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinSessionPayload {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveSessionPayload {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferPayload {
    pub session_id: String,
    pub target_user_id: String,
    pub from_user_id: String,
    pub offer: SessionDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub session_id: String,
    pub target_user_id: String,
    pub from_user_id: String,
    pub answer: SessionDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub session_id: String,
    pub target_user_id: String,
    pub from_user_id: String,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub session_id: String,
    pub message: String,
    pub user_name: String,
    pub user_type: ParticipantRole,
    #[serde(default)]
    pub timestamp: EventTimestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitPollResponsePayload {
    pub poll_id: String,
    pub response: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfoPayload {
    pub session_id: String,
    #[serde(default)]
    pub participants: Vec<ParticipantPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantPayload {
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    pub user_type: ParticipantRole,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserJoinedPayload {
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    pub user_type: ParticipantRole,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserLeftPayload {
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPollPayload {
    pub poll_id: String,
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub timestamp: EventTimestamp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollVotePayload {
    pub poll_id: String,
    pub result: Value,
    #[serde(default)]
    pub timestamp: EventTimestamp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentSharedPayload {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub timestamp: EventTimestamp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayErrorPayload {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_roundtrip() {
        let frame = Frame::new(CHAT_MESSAGE, json!({"message": "hi"}));
        let text = serde_json::to_string(&frame).unwrap();
        let parsed: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.event, CHAT_MESSAGE);
        assert_eq!(parsed.data["message"], "hi");
    }

    #[test]
    fn frame_without_data_defaults_to_null() {
        let parsed: Frame = serde_json::from_str(r#"{"event":"session_ended"}"#).unwrap();
        assert_eq!(parsed.event, SESSION_ENDED);
        assert!(parsed.data.is_null());
    }

    #[test]
    fn timestamp_accepts_epoch_millis() {
        let ts: EventTimestamp = serde_json::from_value(json!(1700000000123i64)).unwrap();
        assert_eq!(ts.0, 1700000000123);
    }

    #[test]
    fn timestamp_accepts_rfc3339() {
        let ts: EventTimestamp =
            serde_json::from_value(json!("2024-01-01T00:00:00.500Z")).unwrap();
        assert_eq!(ts.0, 1704067200500);
    }

    #[test]
    fn timestamp_rejects_other_shapes() {
        assert!(serde_json::from_value::<EventTimestamp>(json!({"ms": 5})).is_err());
    }

    #[test]
    fn sdp_kind_uses_lowercase_wire_names() {
        let desc = SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0".into(),
        };
        let v = serde_json::to_value(&desc).unwrap();
        assert_eq!(v["type"], "offer");
    }

    #[test]
    fn candidate_omits_absent_mid() {
        let c = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54400 typ host".into(),
            sdp_mid: None,
            sdp_mline_index: None,
        };
        let v = serde_json::to_value(&c).unwrap();
        assert!(v.get("sdp_mid").is_none());
    }

    #[test]
    fn chat_payload_requires_message() {
        let missing = json!({
            "session_id": "s1",
            "user_name": "Alice",
            "user_type": "student",
            "timestamp": 1
        });
        assert!(serde_json::from_value::<ChatMessagePayload>(missing).is_err());
    }
}
