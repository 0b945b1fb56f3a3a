//! Connection management: one negotiated peer link per remote device.
//!
//! The [`ConnectionManager`] owns every live connection, the queue of remote
//! address candidates that arrive before a remote session description, and
//! the open data channel. Links report what happens to them as [`LinkEvent`]s
//! on a single stream; the manager turns those into [`ConnectionEvent`]s for
//! the transfer engine.

mod manager;
pub mod signaling;
pub mod webrtc;

#[cfg(test)]
pub(crate) mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use manager::ConnectionManager;
pub use signaling::{
    IceCandidate, LocalEndpoint, LocalRelay, SdpKind, SessionDescription, SignalingEvent,
    SignalingRelay,
};

use crate::core::error::Result;

/// Opaque identifier of a remote device.
pub type DeviceId = String;

/// `New → Negotiating → Open → Closed | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Prepared for an incoming offer; candidates may already queue.
    New,
    Negotiating,
    /// The data channel is open.
    Open,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A message received on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// Chunk frame.
    Binary(Bytes),
    /// Control message.
    Text(String),
}

/// Emitted by the manager, consumed by the transfer engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged {
        device: DeviceId,
        state: ConnectionState,
    },
    Message {
        device: DeviceId,
        message: ChannelMessage,
    },
}

// ── Link abstraction ─────────────────────────────────────────────────────────

/// Transport-level state reported by a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    /// Transient; the transport may recover on its own.
    Disconnected,
    Failed,
    Closed,
}

pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    StateChanged(LinkState),
    ChannelOpen(Arc<dyn DataChannel>),
    ChannelClosed,
    Message(ChannelMessage),
}

impl fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            LinkEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            LinkEvent::ChannelOpen(ch) => f.debug_tuple("ChannelOpen").field(&ch.label()).finish(),
            LinkEvent::ChannelClosed => f.write_str("ChannelClosed"),
            LinkEvent::Message(m) => f.debug_tuple("Message").field(m).finish(),
        }
    }
}

pub(crate) struct LinkEnvelope {
    pub device: DeviceId,
    pub link_id: u64,
    pub event: LinkEvent,
}

/// Sender half handed to a link. Every event is stamped with the link's
/// generation so the manager can ignore links it already tore down.
#[derive(Clone)]
pub struct LinkEvents {
    device: DeviceId,
    link_id: u64,
    tx: mpsc::UnboundedSender<LinkEnvelope>,
}

impl LinkEvents {
    pub(crate) fn new(
        device: DeviceId,
        link_id: u64,
        tx: mpsc::UnboundedSender<LinkEnvelope>,
    ) -> Self {
        Self {
            device,
            link_id,
            tx,
        }
    }

    /// Remote device this link talks to.
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn emit(&self, event: LinkEvent) {
        let _ = self.tx.send(LinkEnvelope {
            device: self.device.clone(),
            link_id: self.link_id,
            event,
        });
    }
}

/// One ordered, reliable message channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send_binary(&self, data: Bytes) -> Result<()>;

    async fn send_text(&self, text: String) -> Result<()>;

    /// Bytes queued by the transport and not yet sent.
    async fn buffered_amount(&self) -> usize;

    /// Resolves once the buffered amount fell below the low watermark or the
    /// channel closed.
    async fn drained(&self);
}

/// A negotiable peer link.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create the data channel and a local offer.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Apply a remote offer and produce the local answer.
    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription>;

    async fn set_remote_answer(&self, answer: SessionDescription) -> Result<()>;

    /// Only valid once a remote description is set.
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self);
}

#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn create_link(&self, events: LinkEvents) -> Result<Arc<dyn PeerLink>>;
}
