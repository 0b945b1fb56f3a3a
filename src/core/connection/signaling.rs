//! Signaling relay seam.
//!
//! The relay forwards session descriptions and address candidates between
//! devices of a space. It never carries file bytes. Production hosts plug
//! in their own server-backed relay; [`LocalRelay`] connects managers that
//! live in the same process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, RwLock};
use tracing::debug;

use super::{ConnectionManager, DeviceId};
use crate::core::error::{Result, TransferError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A network address candidate (trickle ICE).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Outbound half of the relay, used by the initiating side.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Ask `device` to prepare for an incoming negotiation.
    async fn create_connection(&self, device: &str) -> Result<()>;

    /// Deliver an offer and wait for the answer.
    async fn send_offer(&self, device: &str, offer: SessionDescription)
        -> Result<SessionDescription>;

    /// Forward one local address candidate.
    async fn send_candidate(&self, device: &str, candidate: IceCandidate) -> Result<()>;
}

/// Inbound half of the relay: what a server-backed relay pushes to this
/// device. Fed to [`ConnectionManager::handle_signal`].
#[derive(Debug)]
pub enum SignalingEvent {
    CreateConnection {
        from: DeviceId,
    },
    Offer {
        from: DeviceId,
        offer: SessionDescription,
        reply: oneshot::Sender<SessionDescription>,
    },
    Answer {
        from: DeviceId,
        answer: SessionDescription,
    },
    Candidate {
        from: DeviceId,
        candidate: IceCandidate,
    },
}

// ── In-process relay ─────────────────────────────────────────────────────────

/// Hub routing signaling between managers of one process.
#[derive(Clone, Default)]
pub struct LocalRelay {
    peers: Arc<RwLock<HashMap<DeviceId, Weak<ConnectionManager>>>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay handle for the manager of `local`.
    pub fn endpoint(&self, local: impl Into<DeviceId>) -> Arc<LocalEndpoint> {
        Arc::new(LocalEndpoint {
            hub: self.clone(),
            local: local.into(),
        })
    }

    /// Make `manager` reachable as `device`.
    pub async fn register(&self, device: impl Into<DeviceId>, manager: &Arc<ConnectionManager>) {
        self.peers
            .write()
            .await
            .insert(device.into(), Arc::downgrade(manager));
    }

    async fn lookup(&self, device: &str) -> Result<Arc<ConnectionManager>> {
        self.peers
            .read()
            .await
            .get(device)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransferError::Negotiation(format!("device {device} is not reachable")))
    }
}

pub struct LocalEndpoint {
    hub: LocalRelay,
    local: DeviceId,
}

#[async_trait]
impl SignalingRelay for LocalEndpoint {
    async fn create_connection(&self, device: &str) -> Result<()> {
        let peer = self.hub.lookup(device).await?;
        peer.prepare_incoming(&self.local).await
    }

    async fn send_offer(
        &self,
        device: &str,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        let peer = self.hub.lookup(device).await?;
        peer.accept_incoming(&self.local, offer).await
    }

    async fn send_candidate(&self, device: &str, candidate: IceCandidate) -> Result<()> {
        let peer = self.hub.lookup(device).await?;
        debug!(
            event = "relay_candidate",
            from = %self.local,
            to = %device,
            "Forwarding address candidate"
        );
        peer.add_remote_candidate(&self.local, candidate).await
    }
}
