//! In-memory links for tests.
//!
//! An offer is `memory:<token>`; the answering link looks the offering link
//! up in the shared [`MemoryNet`] and wires a channel pair between them.
//! Channels deliver immediately. Their buffered amount grows with every
//! send and only falls back to zero when a sender parks on `drained()`,
//! which lets tests observe the backpressure loop.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{
    ChannelMessage, DataChannel, IceCandidate, LinkEvent, LinkEvents, LinkFactory, LinkState,
    PeerLink, SessionDescription,
};
use crate::core::config::DATA_CHANNEL_LABEL;
use crate::core::error::{Result, TransferError};

/// Shared "network" of in-memory links plus observation counters.
#[derive(Default)]
pub struct MemoryNet {
    offers: Mutex<HashMap<String, Arc<LinkShared>>>,
    applied: Mutex<Vec<(String, String)>>,
    max_outstanding_at_send: AtomicUsize,
    binary_frames: AtomicUsize,
}

impl MemoryNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Candidates applied by links talking to `device`, in application order.
    pub fn applied_candidates(&self, device: &str) -> Vec<String> {
        self.applied
            .lock()
            .map(|applied| {
                applied
                    .iter()
                    .filter(|(d, _)| d == device)
                    .map(|(_, c)| c.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Largest buffered amount observed right before a binary send.
    pub fn max_outstanding_at_send(&self) -> usize {
        self.max_outstanding_at_send.load(Ordering::SeqCst)
    }

    pub fn binary_frames(&self) -> usize {
        self.binary_frames.load(Ordering::SeqCst)
    }
}

struct LinkShared {
    events: LinkEvents,
    remote_described: AtomicBool,
    closed: AtomicBool,
    channel: Mutex<Option<Arc<MemoryChannel>>>,
    /// Offerer side: channel announced once the answer is applied.
    pending_open: Mutex<Option<Arc<MemoryChannel>>>,
}

pub struct MemoryLinkFactory {
    net: Arc<MemoryNet>,
}

impl MemoryLinkFactory {
    pub fn new(net: Arc<MemoryNet>) -> Self {
        Self { net }
    }
}

#[async_trait]
impl LinkFactory for MemoryLinkFactory {
    async fn create_link(&self, events: LinkEvents) -> Result<Arc<dyn PeerLink>> {
        Ok(Arc::new(MemoryLink {
            net: self.net.clone(),
            shared: Arc::new(LinkShared {
                events,
                remote_described: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                channel: Mutex::new(None),
                pending_open: Mutex::new(None),
            }),
        }))
    }
}

pub struct MemoryLink {
    net: Arc<MemoryNet>,
    shared: Arc<LinkShared>,
}

fn poisoned<T>(_: T) -> TransferError {
    TransferError::Negotiation("memory link state poisoned".into())
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let token = Uuid::new_v4().to_string();
        self.net
            .offers
            .lock()
            .map_err(poisoned)?
            .insert(token.clone(), self.shared.clone());
        self.shared
            .events
            .emit(LinkEvent::LocalCandidate(IceCandidate::new(format!(
                "memory {token} offerer"
            ))));
        Ok(SessionDescription::offer(format!("memory:{token}")))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        let token = offer
            .sdp
            .strip_prefix("memory:")
            .ok_or_else(|| TransferError::Negotiation("not a memory offer".into()))?
            .to_string();
        let offerer = self
            .net
            .offers
            .lock()
            .map_err(poisoned)?
            .remove(&token)
            .ok_or_else(|| TransferError::Negotiation(format!("unknown offer {token}")))?;

        let open = Arc::new(AtomicBool::new(true));
        let ours = Arc::new(MemoryChannel::new(
            open.clone(),
            offerer.events.clone(),
            self.net.clone(),
        ));
        let theirs = Arc::new(MemoryChannel::new(
            open,
            self.shared.events.clone(),
            self.net.clone(),
        ));
        *offerer.channel.lock().map_err(poisoned)? = Some(theirs.clone());
        *offerer.pending_open.lock().map_err(poisoned)? = Some(theirs);
        *self.shared.channel.lock().map_err(poisoned)? = Some(ours.clone());

        self.shared.remote_described.store(true, Ordering::SeqCst);
        self.shared
            .events
            .emit(LinkEvent::LocalCandidate(IceCandidate::new(format!(
                "memory {token} answerer"
            ))));
        self.shared.events.emit(LinkEvent::StateChanged(LinkState::Connected));
        self.shared.events.emit(LinkEvent::ChannelOpen(ours));
        Ok(SessionDescription::answer(format!("memory:{token}")))
    }

    async fn set_remote_answer(&self, answer: SessionDescription) -> Result<()> {
        if !answer.sdp.starts_with("memory:") {
            return Err(TransferError::Negotiation("not a memory answer".into()));
        }
        self.shared.remote_described.store(true, Ordering::SeqCst);
        let pending = self.shared.pending_open.lock().map_err(poisoned)?.take();
        if let Some(channel) = pending {
            self.shared.events.emit(LinkEvent::StateChanged(LinkState::Connected));
            self.shared.events.emit(LinkEvent::ChannelOpen(channel));
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if !self.shared.remote_described.load(Ordering::SeqCst) {
            return Err(TransferError::Negotiation(
                "candidate before remote description".into(),
            ));
        }
        self.net
            .applied
            .lock()
            .map_err(poisoned)?
            .push((self.shared.events.device().to_string(), candidate.candidate));
        Ok(())
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channel = self
            .shared
            .channel
            .lock()
            .ok()
            .and_then(|mut ch| ch.take());
        if let Some(channel) = channel {
            channel.close();
        }
        self.shared.events.emit(LinkEvent::StateChanged(LinkState::Closed));
    }
}

/// One end of an in-memory channel pair.
pub struct MemoryChannel {
    /// Shared by both ends.
    open: Arc<AtomicBool>,
    /// Event stream of the other end's link.
    deliver_to: LinkEvents,
    outstanding: AtomicUsize,
    net: Arc<MemoryNet>,
}

impl MemoryChannel {
    fn new(open: Arc<AtomicBool>, deliver_to: LinkEvents, net: Arc<MemoryNet>) -> Self {
        Self {
            open,
            deliver_to,
            outstanding: AtomicUsize::new(0),
            net,
        }
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.deliver_to.emit(LinkEvent::ChannelClosed);
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransferError::ChannelUnavailable("memory channel closed".into()))
        }
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        DATA_CHANNEL_LABEL
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.ensure_open()?;
        let before = self.outstanding.fetch_add(data.len(), Ordering::SeqCst);
        self.net
            .max_outstanding_at_send
            .fetch_max(before, Ordering::SeqCst);
        self.net.binary_frames.fetch_add(1, Ordering::SeqCst);
        self.deliver_to
            .emit(LinkEvent::Message(ChannelMessage::Binary(data)));
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.ensure_open()?;
        self.deliver_to
            .emit(LinkEvent::Message(ChannelMessage::Text(text)));
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    async fn drained(&self) {
        tokio::task::yield_now().await;
        self.outstanding.store(0, Ordering::SeqCst);
    }
}
