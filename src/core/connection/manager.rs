use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{
    ConnectionEvent, ConnectionState, DataChannel, DeviceId, IceCandidate, LinkEnvelope,
    LinkEvent, LinkEvents, LinkFactory, LinkState, PeerLink, SessionDescription, SignalingEvent,
    SignalingRelay,
};
use crate::core::config::{CONNECTION_TIMEOUT, DATA_CHANNEL_TIMEOUT};
use crate::core::error::{Result, TransferError};

/// One connection attempt. Replaced, never reused, on reconnect.
struct ConnectionSlot {
    link_id: u64,
    link: Arc<dyn PeerLink>,
    state: watch::Sender<ConnectionState>,
    /// Held across "set remote description + flush queue" so candidates are
    /// applied in arrival order.
    inner: Mutex<ConnectionInner>,
}

#[derive(Default)]
struct ConnectionInner {
    remote_described: bool,
    pending_candidates: Vec<IceCandidate>,
    channel: Option<Arc<dyn DataChannel>>,
}

pub struct ConnectionManager {
    relay: Arc<dyn SignalingRelay>,
    factory: Arc<dyn LinkFactory>,
    connections: RwLock<HashMap<DeviceId, Arc<ConnectionSlot>>>,
    next_link_id: AtomicU64,
    link_tx: mpsc::UnboundedSender<LinkEnvelope>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
}

fn negotiation(e: TransferError) -> TransferError {
    match e {
        TransferError::Negotiation(_) => e,
        other => TransferError::Negotiation(other.to_string()),
    }
}

impl ConnectionManager {
    /// Create a manager and the stream of its connection events.
    ///
    /// Must be called from within a tokio runtime: link events are processed
    /// by a task spawned here.
    pub fn new(
        relay: Arc<dyn SignalingRelay>,
        factory: Arc<dyn LinkFactory>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            relay,
            factory,
            connections: RwLock::new(HashMap::new()),
            next_link_id: AtomicU64::new(1),
            link_tx,
            events_tx,
        });
        tokio::spawn(Self::dispatch(Arc::downgrade(&manager), link_rx));
        (manager, events_rx)
    }

    // ── Initiator ────────────────────────────────────────────────────────

    /// Negotiate a fresh connection to `device` and wait for its channel.
    ///
    /// Any existing connection to the device is torn down first.
    pub async fn connect(&self, device: &str) -> Result<()> {
        self.teardown(device, None, ConnectionState::Closed).await;
        info!(event = "connect_start", %device, "Connecting");

        self.relay
            .create_connection(device)
            .await
            .map_err(negotiation)?;
        let slot = self.install(device, ConnectionState::Negotiating).await?;

        match self.negotiate(device, &slot).await {
            Ok(()) => {
                info!(event = "connect_success", %device, "Connection open");
                Ok(())
            }
            Err(e) => {
                warn!(event = "connect_failure", %device, error = %e, "Connection attempt failed");
                self.teardown(device, Some(slot.link_id), ConnectionState::Failed)
                    .await;
                Err(e)
            }
        }
    }

    async fn negotiate(&self, device: &str, slot: &Arc<ConnectionSlot>) -> Result<()> {
        let offer = slot.link.create_offer().await.map_err(negotiation)?;

        let answer = timeout(CONNECTION_TIMEOUT, self.relay.send_offer(device, offer))
            .await
            .map_err(|_| {
                TransferError::Negotiation(format!(
                    "no answer from {device} within {}s",
                    CONNECTION_TIMEOUT.as_secs()
                ))
            })?
            .map_err(negotiation)?;

        self.apply_answer(device, slot, answer).await?;
        self.wait_open(device).await.map(|_| ())
    }

    /// Apply an answer pushed asynchronously by the relay.
    pub async fn set_remote_answer(&self, device: &str, answer: SessionDescription) -> Result<()> {
        let slot = self.slot(device).await.ok_or_else(|| {
            TransferError::Negotiation(format!("no pending negotiation with {device}"))
        })?;
        self.apply_answer(device, &slot, answer).await
    }

    async fn apply_answer(
        &self,
        device: &str,
        slot: &Arc<ConnectionSlot>,
        answer: SessionDescription,
    ) -> Result<()> {
        let mut inner = slot.inner.lock().await;
        if inner.remote_described {
            debug!(event = "answer_ignored", %device, "Remote description already set");
            return Ok(());
        }
        slot.link
            .set_remote_answer(answer)
            .await
            .map_err(negotiation)?;
        inner.remote_described = true;
        Self::flush_candidates(device, slot, &mut inner).await;
        Ok(())
    }

    // ── Responder ────────────────────────────────────────────────────────

    /// Prepare for an incoming offer so early candidates have a queue.
    pub async fn prepare_incoming(&self, device: &str) -> Result<()> {
        self.teardown(device, None, ConnectionState::Closed).await;
        self.install(device, ConnectionState::New).await?;
        debug!(event = "incoming_prepared", %device, "Awaiting offer");
        Ok(())
    }

    /// Apply a remote offer and return the local answer.
    pub async fn accept_incoming(
        &self,
        device: &str,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        let prepared = self.slot(device).await.filter(|slot| {
            let state = *slot.state.borrow();
            state == ConnectionState::New
        });
        let slot = match prepared {
            Some(slot) => slot,
            None => {
                self.teardown(device, None, ConnectionState::Closed).await;
                self.install(device, ConnectionState::New).await?
            }
        };
        self.set_state(device, &slot, ConnectionState::Negotiating);

        let mut inner = slot.inner.lock().await;
        let answer = match slot.link.accept_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                drop(inner);
                warn!(event = "offer_rejected", %device, error = %e, "Failed to apply offer");
                self.teardown(device, Some(slot.link_id), ConnectionState::Failed)
                    .await;
                return Err(negotiation(e));
            }
        };
        inner.remote_described = true;
        Self::flush_candidates(device, &slot, &mut inner).await;
        info!(event = "offer_accepted", %device, "Answer created");
        Ok(answer)
    }

    // ── Candidates ───────────────────────────────────────────────────────

    /// Queue or apply a remote address candidate.
    ///
    /// Candidates for a device without a connection cannot belong to a live
    /// attempt and are discarded.
    pub async fn add_remote_candidate(&self, device: &str, candidate: IceCandidate) -> Result<()> {
        let Some(slot) = self.slot(device).await else {
            warn!(event = "candidate_discarded", %device, "Candidate for unknown device");
            return Ok(());
        };

        let mut inner = slot.inner.lock().await;
        if !inner.remote_described {
            inner.pending_candidates.push(candidate);
            debug!(
                event = "candidate_queued",
                %device,
                queued = inner.pending_candidates.len(),
                "No remote description yet"
            );
            return Ok(());
        }
        slot.link
            .add_remote_candidate(candidate)
            .await
            .map_err(negotiation)
    }

    async fn flush_candidates(device: &str, slot: &ConnectionSlot, inner: &mut ConnectionInner) {
        let queued = std::mem::take(&mut inner.pending_candidates);
        if queued.is_empty() {
            return;
        }
        debug!(event = "candidates_flushed", %device, count = queued.len(), "Applying queued candidates");
        for candidate in queued {
            if let Err(e) = slot.link.add_remote_candidate(candidate).await {
                warn!(event = "candidate_rejected", %device, error = %e, "Queued candidate rejected");
            }
        }
    }

    // ── Signaling push surface ───────────────────────────────────────────

    pub async fn handle_signal(&self, event: SignalingEvent) -> Result<()> {
        match event {
            SignalingEvent::CreateConnection { from } => self.prepare_incoming(&from).await,
            SignalingEvent::Offer { from, offer, reply } => {
                let answer = self.accept_incoming(&from, offer).await?;
                reply
                    .send(answer)
                    .map_err(|_| TransferError::Negotiation("offer reply dropped".into()))
            }
            SignalingEvent::Answer { from, answer } => self.set_remote_answer(&from, answer).await,
            SignalingEvent::Candidate { from, candidate } => {
                self.add_remote_candidate(&from, candidate).await
            }
        }
    }

    // ── Queries / teardown ───────────────────────────────────────────────

    /// Close the connection to `device`. Its transfers are released through
    /// the `Closed` event.
    pub async fn disconnect(&self, device: &str) {
        info!(event = "disconnect", %device, "Closing connection");
        self.teardown(device, None, ConnectionState::Closed).await;
    }

    /// The open data channel to `device`.
    pub async fn channel(&self, device: &str) -> Result<Arc<dyn DataChannel>> {
        let slot = self
            .slot(device)
            .await
            .ok_or_else(|| TransferError::DeviceUnavailable(device.to_string()))?;
        let inner = slot.inner.lock().await;
        inner
            .channel
            .as_ref()
            .filter(|ch| ch.is_open())
            .cloned()
            .ok_or_else(|| TransferError::DeviceUnavailable(device.to_string()))
    }

    /// Wait until the connection to `device` has an open channel.
    pub async fn wait_open(&self, device: &str) -> Result<Arc<dyn DataChannel>> {
        let slot = self
            .slot(device)
            .await
            .ok_or_else(|| TransferError::DeviceUnavailable(device.to_string()))?;
        let mut rx = slot.state.subscribe();
        drop(slot);

        let waited = timeout(DATA_CHANNEL_TIMEOUT, async move {
            rx.wait_for(|s| *s == ConnectionState::Open || s.is_terminal())
                .await
                .map(|s| *s)
        })
        .await;

        match waited {
            Err(_) => Err(TransferError::Negotiation(format!(
                "channel to {device} did not open within {}s",
                DATA_CHANNEL_TIMEOUT.as_secs()
            ))),
            Ok(Ok(ConnectionState::Open)) => self.channel(device).await,
            Ok(Ok(state)) => Err(TransferError::Negotiation(format!(
                "connection to {device} is {state}"
            ))),
            Ok(Err(_)) => Err(TransferError::ChannelUnavailable(format!(
                "connection to {device} was dropped"
            ))),
        }
    }

    pub async fn state(&self, device: &str) -> ConnectionState {
        self.slot(device)
            .await
            .map(|slot| *slot.state.borrow())
            .unwrap_or(ConnectionState::Closed)
    }

    pub async fn devices(&self) -> Vec<DeviceId> {
        self.connections.read().await.keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) async fn pending_candidates(&self, device: &str) -> usize {
        match self.slot(device).await {
            Some(slot) => slot.inner.lock().await.pending_candidates.len(),
            None => 0,
        }
    }

    // ── Internals ────────────────────────────────────────────────────────

    async fn slot(&self, device: &str) -> Option<Arc<ConnectionSlot>> {
        self.connections.read().await.get(device).cloned()
    }

    async fn install(&self, device: &str, state: ConnectionState) -> Result<Arc<ConnectionSlot>> {
        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let events = LinkEvents::new(device.to_string(), link_id, self.link_tx.clone());
        let link = self.factory.create_link(events).await.map_err(negotiation)?;

        let slot = Arc::new(ConnectionSlot {
            link_id,
            link,
            state: watch::channel(state).0,
            inner: Mutex::new(ConnectionInner::default()),
        });
        let previous = self
            .connections
            .write()
            .await
            .insert(device.to_string(), slot.clone());
        if let Some(previous) = previous {
            self.close_slot(device, previous, ConnectionState::Closed).await;
        }
        self.emit_state(device, state);
        Ok(slot)
    }

    /// Remove the connection to `device`, if it is still generation
    /// `link_id` (any generation when `None`).
    async fn teardown(&self, device: &str, link_id: Option<u64>, state: ConnectionState) {
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(device) {
                Some(slot) if link_id.map_or(true, |id| id == slot.link_id) => {
                    connections.remove(device)
                }
                _ => None,
            }
        };
        if let Some(slot) = removed {
            self.close_slot(device, slot, state).await;
        }
    }

    async fn close_slot(&self, device: &str, slot: Arc<ConnectionSlot>, state: ConnectionState) {
        {
            let mut inner = slot.inner.lock().await;
            inner.pending_candidates.clear();
            inner.channel = None;
        }
        slot.link.close().await;
        self.set_state(device, &slot, state);
    }

    fn set_state(&self, device: &str, slot: &ConnectionSlot, state: ConnectionState) {
        let previous = slot.state.send_replace(state);
        if previous != state {
            self.emit_state(device, state);
        }
    }

    fn emit_state(&self, device: &str, state: ConnectionState) {
        debug!(event = "connection_state", %device, %state, "Connection state changed");
        let _ = self.events_tx.send(ConnectionEvent::StateChanged {
            device: device.to_string(),
            state,
        });
    }

    async fn dispatch(manager: Weak<Self>, mut rx: mpsc::UnboundedReceiver<LinkEnvelope>) {
        while let Some(envelope) = rx.recv().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };
            manager.on_link_event(envelope).await;
        }
    }

    async fn on_link_event(&self, envelope: LinkEnvelope) {
        let LinkEnvelope {
            device,
            link_id,
            event,
        } = envelope;

        let slot = match self.slot(&device).await {
            Some(slot) if slot.link_id == link_id => slot,
            _ => {
                debug!(event = "stale_link_event", %device, link_id, ?event, "Ignoring event");
                return;
            }
        };

        match event {
            LinkEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.relay.send_candidate(&device, candidate).await {
                    warn!(event = "candidate_send_failure", %device, error = %e, "Failed to forward candidate");
                }
            }
            LinkEvent::ChannelOpen(channel) => {
                slot.inner.lock().await.channel = Some(channel);
                info!(event = "channel_open", %device, "Data channel open");
                self.set_state(&device, &slot, ConnectionState::Open);
            }
            LinkEvent::Message(message) => {
                let _ = self
                    .events_tx
                    .send(ConnectionEvent::Message { device, message });
            }
            LinkEvent::ChannelClosed => {
                warn!(event = "channel_closed", %device, "Data channel closed by transport");
                self.teardown(&device, Some(link_id), ConnectionState::Closed)
                    .await;
            }
            LinkEvent::StateChanged(LinkState::Failed) => {
                warn!(event = "link_failed", %device, "Peer link failed");
                self.teardown(&device, Some(link_id), ConnectionState::Failed)
                    .await;
            }
            LinkEvent::StateChanged(LinkState::Closed) => {
                self.teardown(&device, Some(link_id), ConnectionState::Closed)
                    .await;
            }
            LinkEvent::StateChanged(LinkState::Disconnected) => {
                warn!(event = "link_disconnected", %device, "Transient disconnect (ICE may recover)");
            }
            LinkEvent::StateChanged(state) => {
                debug!(event = "link_state", %device, ?state, "Link state changed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::memory::{MemoryLinkFactory, MemoryNet};
    use crate::core::connection::{ChannelMessage, LocalRelay};
    use bytes::Bytes;
    use std::time::Duration;

    async fn pair() -> (
        Arc<MemoryNet>,
        (Arc<ConnectionManager>, mpsc::UnboundedReceiver<ConnectionEvent>),
        (Arc<ConnectionManager>, mpsc::UnboundedReceiver<ConnectionEvent>),
    ) {
        let net = MemoryNet::new();
        let hub = LocalRelay::new();
        let a = ConnectionManager::new(hub.endpoint("a"), Arc::new(MemoryLinkFactory::new(net.clone())));
        let b = ConnectionManager::new(hub.endpoint("b"), Arc::new(MemoryLinkFactory::new(net.clone())));
        hub.register("a", &a.0).await;
        hub.register("b", &b.0).await;
        (net, a, b)
    }

    async fn next_state(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>, want: ConnectionState) {
        let wait = async {
            while let Some(ev) = rx.recv().await {
                if let ConnectionEvent::StateChanged { state, .. } = ev {
                    if state == want {
                        return;
                    }
                }
            }
            panic!("event stream ended");
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("state not reached");
    }

    #[tokio::test]
    async fn connect_opens_both_sides() {
        let (_net, (a, _a_rx), (b, mut b_rx)) = pair().await;

        a.connect("b").await.unwrap();
        assert_eq!(a.state("b").await, ConnectionState::Open);
        next_state(&mut b_rx, ConnectionState::Open).await;
        assert_eq!(b.state("a").await, ConnectionState::Open);
        assert_eq!(a.devices().await, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn messages_are_delivered_in_order() {
        let (_net, (a, _a_rx), (_b, mut b_rx)) = pair().await;
        a.connect("b").await.unwrap();

        let ch = a.channel("b").await.unwrap();
        ch.send_text("one".into()).await.unwrap();
        ch.send_binary(Bytes::from_static(b"two")).await.unwrap();

        let mut got = Vec::new();
        while got.len() < 2 {
            if let Some(ConnectionEvent::Message { device, message }) = b_rx.recv().await {
                assert_eq!(device, "a");
                got.push(message);
            }
        }
        assert_eq!(
            got,
            vec![
                ChannelMessage::Text("one".into()),
                ChannelMessage::Binary(Bytes::from_static(b"two"))
            ]
        );
    }

    #[tokio::test]
    async fn candidates_queue_until_remote_description() {
        let (net, (a, _a_rx), (b, _b_rx)) = pair().await;
        b.prepare_incoming("a").await.unwrap();

        b.add_remote_candidate("a", IceCandidate::new("c1")).await.unwrap();
        b.add_remote_candidate("a", IceCandidate::new("c2")).await.unwrap();
        assert_eq!(b.pending_candidates("a").await, 2);
        assert!(net.applied_candidates("a").is_empty());

        // An offer produced by a bare link, outside of `connect`.
        let (tx, _rx) = mpsc::unbounded_channel();
        let offerer = MemoryLinkFactory::new(net.clone())
            .create_link(LinkEvents::new("b".into(), 999, tx))
            .await
            .unwrap();
        let offer = offerer.create_offer().await.unwrap();
        b.accept_incoming("a", offer).await.unwrap();

        assert_eq!(b.pending_candidates("a").await, 0);
        b.add_remote_candidate("a", IceCandidate::new("c3")).await.unwrap();
        assert_eq!(net.applied_candidates("a"), vec!["c1", "c2", "c3"]);
        drop(a);
    }

    #[tokio::test]
    async fn candidate_for_unknown_device_is_discarded() {
        let (net, (a, _a_rx), _b) = pair().await;
        a.add_remote_candidate("nobody", IceCandidate::new("c1"))
            .await
            .unwrap();
        assert_eq!(a.pending_candidates("nobody").await, 0);
        assert!(net.applied_candidates("nobody").is_empty());
    }

    #[tokio::test]
    async fn disconnect_closes_both_sides() {
        let (_net, (a, mut a_rx), (b, mut b_rx)) = pair().await;
        a.connect("b").await.unwrap();
        next_state(&mut b_rx, ConnectionState::Open).await;

        a.disconnect("b").await;
        next_state(&mut a_rx, ConnectionState::Closed).await;
        next_state(&mut b_rx, ConnectionState::Closed).await;
        assert!(a.devices().await.is_empty());
        assert!(b.devices().await.is_empty());
        assert!(matches!(
            a.channel("b").await,
            Err(TransferError::DeviceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn reconnect_replaces_the_connection() {
        let (_net, (a, _a_rx), (b, _b_rx)) = pair().await;
        a.connect("b").await.unwrap();
        let first = a.channel("b").await.unwrap();

        a.connect("b").await.unwrap();
        let second = a.channel("b").await.unwrap();
        assert!(!first.is_open());
        assert!(second.is_open());
        assert_eq!(a.devices().await.len(), 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while b.state("a").await != ConnectionState::Open {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("responder never reopened");
    }

    #[tokio::test]
    async fn unreachable_device_fails_negotiation() {
        let (_net, (a, _a_rx), _b) = pair().await;
        let err = a.connect("ghost").await.unwrap_err();
        assert!(matches!(err, TransferError::Negotiation(_)));
        assert!(err.is_retryable());
        assert_eq!(a.state("ghost").await, ConnectionState::Closed);
    }
}
