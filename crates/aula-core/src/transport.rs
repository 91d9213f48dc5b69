//! Transport channel to the classroom relay.
//!
//! Owns one long-lived WebSocket and its reconnect lifecycle. Inbound frames
//! are forwarded in arrival order onto a single event queue whose only
//! consumer is the session event loop; that single ordered queue is what
//! lets the state machine above run without locks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::errors::TransportError;
use crate::protocol::{Frame, JOIN_SESSION, JoinSessionPayload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
}

/// What the transport pushes onto the session event queue.
#[derive(Debug)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    Message(Frame),
}

/// Reconnect tuning. The delay grows as `base_delay * 2^(attempt-1)`, capped
/// at `max_delay`, with a random jitter so clients do not stampede the relay.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl ReconnectPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let exp = self.base_delay.saturating_mul(1u32 << shift);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=250));
        exp.min(self.max_delay) + jitter
    }
}

/// One established link to the relay. The inbound receiver ends when the
/// link dies; dropping the outbound sender closes the link.
pub struct RelayLink {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

/// Dials the relay. The indirection exists so the whole stack above can be
/// exercised against an in-memory relay in tests.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn dial(&self, url: &Url) -> Result<RelayLink, TransportError>;
}

/// Production connector: tokio-tungstenite WebSocket, JSON text frames.
pub struct WsConnector {
    pub connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl RelayConnector for WsConnector {
    async fn dial(&self, url: &Url) -> Result<RelayLink, TransportError> {
        let (ws, _) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))?
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        tracing::debug!("relay websocket connected: {url}");

        let (mut write, mut read) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("skipping unencodable frame: {e}");
                        continue;
                    }
                };
                if write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => {
                            if in_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("discarding unparseable relay frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        Ok(RelayLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

struct Inner {
    connector: Arc<dyn RelayConnector>,
    policy: ReconnectPolicy,
    state: parking_lot::Mutex<ConnectionState>,
    link: parking_lot::Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    active_session: parking_lot::Mutex<Option<String>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    shutdown: AtomicBool,
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.state.lock();
            if *state == next {
                return;
            }
            *state = next.clone();
        }
        let _ = self.events_tx.send(TransportEvent::StateChanged(next));
    }

    /// Re-emit `join_session` on a fresh link so upstream components only
    /// ever observe `Connected` again after a drop.
    fn rejoin(&self, outbound: &mpsc::UnboundedSender<Frame>) {
        let Some(session_id) = self.active_session.lock().clone() else {
            return;
        };
        match serde_json::to_value(JoinSessionPayload { session_id }) {
            Ok(data) => {
                let _ = outbound.send(Frame::new(JOIN_SESSION, data));
            }
            Err(e) => tracing::warn!("could not encode rejoin payload: {e}"),
        }
    }
}

/// The long-lived bidirectional event connection to the relay.
///
/// Cloning is cheap and shares the underlying connection. One channel serves
/// one `connect()`; a session creates a fresh channel per join.
#[derive(Clone)]
pub struct TransportChannel {
    inner: Arc<Inner>,
}

impl TransportChannel {
    pub fn new(
        connector: Arc<dyn RelayConnector>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                state: parking_lot::Mutex::new(ConnectionState::Disconnected),
                link: parking_lot::Mutex::new(None),
                active_session: parking_lot::Mutex::new(None),
                events_tx,
                shutdown: AtomicBool::new(false),
                supervisor: parking_lot::Mutex::new(None),
            }),
        };
        (channel, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().clone()
    }

    /// Session identity the supervisor re-joins after a reconnect.
    pub fn set_active_session(&self, session_id: Option<String>) {
        *self.inner.active_session.lock() = session_id;
    }

    /// Dial the relay. The first dial runs inline so a refused connection
    /// surfaces to the caller; after that a supervisor task owns the link
    /// and its reconnects.
    pub async fn connect(&self, url: Url) -> Result<(), TransportError> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed("channel is shut down".into()));
        }
        self.inner.set_state(ConnectionState::Connecting);
        let link = match self.inner.connector.dial(&url).await {
            Ok(link) => link,
            Err(e) => {
                self.inner.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        if self.inner.shutdown.load(Ordering::SeqCst) {
            // disconnect() raced the dial; drop the link instead of leaking
            // a zombie connection.
            return Err(TransportError::ConnectFailed("channel is shut down".into()));
        }
        *self.inner.link.lock() = Some(link.outbound.clone());
        self.inner.set_state(ConnectionState::Connected);
        self.inner.rejoin(&link.outbound);

        let inner = self.inner.clone();
        let handle = tokio::spawn(supervise(inner, url, link.inbound));
        *self.inner.supervisor.lock() = Some(handle);
        Ok(())
    }

    /// Send a named event. Never suspends; while not `Connected` this is a
    /// reported `NotConnected` error, not a silent drop.
    pub fn emit<T: Serialize>(&self, event: &str, data: &T) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let data = serde_json::to_value(data).map_err(|e| TransportError::Encode(e.to_string()))?;
        let link = self.inner.link.lock();
        match link.as_ref() {
            Some(outbound) => outbound
                .send(Frame::new(event, data))
                .map_err(|_| TransportError::NotConnected),
            None => Err(TransportError::NotConnected),
        }
    }

    /// Tear the connection down. Idempotent.
    pub fn disconnect(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.link.lock().take();
        if let Some(handle) = self.inner.supervisor.lock().take() {
            handle.abort();
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }
}

async fn supervise(inner: Arc<Inner>, url: Url, mut inbound: mpsc::UnboundedReceiver<Frame>) {
    'links: loop {
        while let Some(frame) = inbound.recv().await {
            if inner.events_tx.send(TransportEvent::Message(frame)).is_err() {
                return;
            }
        }
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        inner.link.lock().take();
        tracing::info!("relay link lost, reconnecting");

        let mut attempt = 1u32;
        loop {
            if attempt > inner.policy.max_attempts {
                tracing::warn!(
                    "reconnect attempts exhausted after {}",
                    inner.policy.max_attempts
                );
                inner.set_state(ConnectionState::Failed);
                return;
            }
            inner.set_state(ConnectionState::Reconnecting { attempt });
            tokio::time::sleep(inner.policy.delay_for(attempt)).await;
            if inner.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match inner.connector.dial(&url).await {
                Ok(link) => {
                    inbound = link.inbound;
                    *inner.link.lock() = Some(link.outbound.clone());
                    inner.set_state(ConnectionState::Connected);
                    inner.rejoin(&link.outbound);
                    continue 'links;
                }
                Err(e) => {
                    tracing::warn!("reconnect attempt {attempt} failed: {e}");
                    attempt += 1;
                }
            }
        }
    }
}
