//! Typed fan-out of live classroom events.
//!
//! One broadcast stream per event family (chat, polls, content, presence),
//! fed by the session event loop from raw relay frames. Delivery is
//! at-most-once with no redelivery: the relay does not replay, so messages
//! that arrive while the transport is reconnecting are gone for good —
//! chat and poll history backfill over REST is the app shell's job.
//!
//! A malformed payload is dropped with a logged diagnostic; it never ends
//! the stream.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::protocol::{
    CHAT_MESSAGE, CONTENT_SHARED, ChatMessagePayload, ContentSharedPayload, EventTimestamp,
    NEW_POLL, NewPollPayload, POLL_CREATED, POLL_VOTE, ParticipantRole, PollVotePayload,
};

/// Slow subscribers skip messages rather than applying backpressure to the
/// session loop.
const FANOUT_BUFFER: usize = 128;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub message: String,
    pub user_name: String,
    pub user_type: ParticipantRole,
    pub timestamp: EventTimestamp,
}

#[derive(Debug, Clone)]
pub struct Poll {
    pub poll_id: String,
    pub question: String,
    pub options: Vec<String>,
    pub timestamp: EventTimestamp,
}

#[derive(Debug, Clone)]
pub struct SharedContent {
    pub url: String,
    pub title: Option<String>,
    pub timestamp: EventTimestamp,
}

/// Everything the relay fans out to presentation code. Timestamps are for
/// display ordering only; the channel itself is the ordering authority.
#[derive(Debug, Clone)]
pub enum FanOutEvent {
    Chat(ChatMessage),
    PollCreated(Poll),
    PollVote { poll_id: String, result: Value },
    ContentShared(SharedContent),
    ParticipantJoined(String),
    ParticipantLeft(String),
}

pub struct FanOut {
    chat: broadcast::Sender<FanOutEvent>,
    polls: broadcast::Sender<FanOutEvent>,
    content: broadcast::Sender<FanOutEvent>,
    presence: broadcast::Sender<FanOutEvent>,
}

impl FanOut {
    pub fn new() -> Self {
        Self {
            chat: broadcast::channel(FANOUT_BUFFER).0,
            polls: broadcast::channel(FANOUT_BUFFER).0,
            content: broadcast::channel(FANOUT_BUFFER).0,
            presence: broadcast::channel(FANOUT_BUFFER).0,
        }
    }

    pub fn chat_stream(&self) -> BroadcastStream<FanOutEvent> {
        BroadcastStream::new(self.chat.subscribe())
    }

    pub fn poll_stream(&self) -> BroadcastStream<FanOutEvent> {
        BroadcastStream::new(self.polls.subscribe())
    }

    pub fn content_stream(&self) -> BroadcastStream<FanOutEvent> {
        BroadcastStream::new(self.content.subscribe())
    }

    pub fn presence_stream(&self) -> BroadcastStream<FanOutEvent> {
        BroadcastStream::new(self.presence.subscribe())
    }

    /// Route one already-typed event to its family stream.
    pub(crate) fn publish(&self, event: FanOutEvent) {
        let sender = match &event {
            FanOutEvent::Chat(_) => &self.chat,
            FanOutEvent::PollCreated(_) | FanOutEvent::PollVote { .. } => &self.polls,
            FanOutEvent::ContentShared(_) => &self.content,
            FanOutEvent::ParticipantJoined(_) | FanOutEvent::ParticipantLeft(_) => &self.presence,
        };
        // No subscribers is fine; events are simply not observed.
        let _ = sender.send(event);
    }

    /// Validate and route a raw relay frame. Returns true if the event name
    /// belongs to a fan-out family.
    pub(crate) fn dispatch(&self, event: &str, data: &Value) -> bool {
        match event {
            CHAT_MESSAGE => {
                if let Some(p) = parse::<ChatMessagePayload>(event, data) {
                    self.publish(FanOutEvent::Chat(ChatMessage {
                        message: p.message,
                        user_name: p.user_name,
                        user_type: p.user_type,
                        timestamp: p.timestamp,
                    }));
                }
                true
            }
            NEW_POLL | POLL_CREATED => {
                if let Some(p) = parse::<NewPollPayload>(event, data) {
                    self.publish(FanOutEvent::PollCreated(Poll {
                        poll_id: p.poll_id,
                        question: p.question,
                        options: p.options,
                        timestamp: p.timestamp,
                    }));
                }
                true
            }
            POLL_VOTE => {
                if let Some(p) = parse::<PollVotePayload>(event, data) {
                    self.publish(FanOutEvent::PollVote {
                        poll_id: p.poll_id,
                        result: p.result,
                    });
                }
                true
            }
            CONTENT_SHARED => {
                if let Some(p) = parse::<ContentSharedPayload>(event, data) {
                    self.publish(FanOutEvent::ContentShared(SharedContent {
                        url: p.url,
                        title: p.title,
                        timestamp: p.timestamp,
                    }));
                }
                true
            }
            _ => false,
        }
    }
}

fn parse<T: DeserializeOwned>(event: &str, data: &Value) -> Option<T> {
    match serde_json::from_value(data.clone()) {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::warn!("dropping malformed {event}: {e}");
            None
        }
    }
}
