//! TransferEngine: sole coordinator of all file transfer logic.
//!
//! This is the single source of truth for:
//! - Transfer lifecycle (`Init → Ongoing ⇄ Paused → Done`, `Failed`)
//! - The device → transfers index
//! - Correlated control requests and their acknowledgments
//! - Receiver-side staging, completion and delivery
//!
//! The connection manager moves raw frames; the engine consumes its event
//! stream in [`TransferEngine::run`], one message at a time in arrival
//! order, and serves transfers multiplexed by id on each device's channel.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::config::{total_chunks, TransferConfig};
use crate::core::connection::{ChannelMessage, ConnectionEvent, ConnectionManager, DeviceId};
use crate::core::error::{Result, TransferError};
use crate::core::pipeline::sender::{FileSource, OutboundPump, PumpExit};
use crate::core::pipeline::sink::DeliverySink;
use crate::core::protocol::{decode_chunk_frame, ChunkFrame, ControlEvent, ControlMessage};
use crate::core::store::LocalBufferStore;
use crate::core::transfer::{
    FileMetadata, Transfer, TransferDirection, TransferEvent, TransferSnapshot, TransferState,
    TransferTable,
};

/// A correlated request waiting for its `message-resolve`.
struct PendingAck {
    device: DeviceId,
    tx: oneshot::Sender<Result<Value>>,
}

pub struct TransferEngine {
    connections: Arc<ConnectionManager>,
    store: Arc<LocalBufferStore>,
    source: Arc<dyn FileSource>,
    sink: Arc<dyn DeliverySink>,
    config: TransferConfig,
    transfers: Arc<RwLock<TransferTable>>,
    pending_acks: Mutex<HashMap<Uuid, PendingAck>>,
    pump_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl TransferEngine {
    pub fn new(
        connections: Arc<ConnectionManager>,
        store: Arc<LocalBufferStore>,
        source: Arc<dyn FileSource>,
        sink: Arc<dyn DeliverySink>,
        config: TransferConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransferEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            connections,
            store,
            source,
            sink,
            config,
            transfers: Arc::new(RwLock::new(TransferTable::default())),
            pending_acks: Mutex::new(HashMap::new()),
            pump_locks: Mutex::new(HashMap::new()),
            events,
        });
        (engine, events_rx)
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self: &Arc<Self>, events: mpsc::UnboundedReceiver<ConnectionEvent>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(events))
    }

    /// Consume connection events until the manager goes away.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Message { device, message } => {
                    self.handle_message(&device, message).await;
                }
                ConnectionEvent::StateChanged { device, state } if state.is_terminal() => {
                    self.release_device(&device).await;
                }
                ConnectionEvent::StateChanged { .. } => {}
            }
        }
        debug!(event = "engine_stopped", "Connection event stream ended");
    }

    // ── Local API ────────────────────────────────────────────────────────

    /// Ask `device` for one of its files. The holder assigns the transfer id.
    pub async fn request_transfer(
        self: &Arc<Self>,
        device: &str,
        file: FileMetadata,
    ) -> Result<TransferSnapshot> {
        let resolved = self
            .request(device, ControlEvent::FileRequest { file: file.clone() })
            .await?;
        let id: Uuid = serde_json::from_value(resolved)?;
        // The connection may have closed while we waited.
        self.connections.channel(device).await?;

        let transfer = Transfer::new_inbound(id, device.to_string(), file);
        let snapshot = transfer.snapshot();
        self.transfers.write().await.insert(transfer);
        info!(
            event = "transfer_requested",
            transfer_id = %id,
            %device,
            name = %snapshot.file.name,
            size = snapshot.file.size,
            "Inbound transfer registered"
        );
        self.emit(TransferEvent::Registered(snapshot.clone()));
        Ok(snapshot)
    }

    /// Start or resume a transfer on both sides.
    pub async fn start_transfer(self: &Arc<Self>, id: Uuid) -> Result<()> {
        let device = self.device_of(id).await?;
        self.request(&device, ControlEvent::TransferStart { transfer_id: id })
            .await?;
        self.begin(id).await;
        Ok(())
    }

    /// Pause a transfer on both sides; the pump stops at its next iteration.
    pub async fn pause_transfer(self: &Arc<Self>, id: Uuid) -> Result<()> {
        let device = self.device_of(id).await?;
        self.request(&device, ControlEvent::TransferPause { transfer_id: id })
            .await?;
        self.pause(id).await;
        Ok(())
    }

    /// Remove a transfer locally right away and tell the peer, without
    /// waiting for its acknowledgment. A `Done` transfer cannot be deleted.
    pub async fn delete_transfer(self: &Arc<Self>, id: Uuid) -> Result<()> {
        let device = self.remove_transfer(id).await?;
        self.notify(&device, ControlEvent::TransferDelete { transfer_id: id });
        Ok(())
    }

    /// The peer's view of the transfers it shares with us.
    pub async fn remote_transfers(self: &Arc<Self>, device: &str) -> Result<Vec<TransferSnapshot>> {
        let resolved = self.request(device, ControlEvent::GetTransfers).await?;
        Ok(serde_json::from_value(resolved)?)
    }

    pub async fn get_transfer(&self, id: Uuid) -> Option<TransferSnapshot> {
        self.transfers.read().await.get(&id).map(Transfer::snapshot)
    }

    pub async fn transfers(&self) -> Vec<TransferSnapshot> {
        self.transfers
            .read()
            .await
            .values()
            .map(Transfer::snapshot)
            .collect()
    }

    pub async fn transfer_states(&self) -> HashMap<Uuid, TransferState> {
        self.transfers
            .read()
            .await
            .values()
            .map(|t| (t.id, t.state))
            .collect()
    }

    /// Whether any transfer is moving bytes; hosts keep the device awake
    /// while this holds.
    pub async fn has_ongoing(&self) -> bool {
        self.transfers
            .read()
            .await
            .values()
            .any(|t| t.state == TransferState::Ongoing)
    }

    // ── Correlated requests ──────────────────────────────────────────────

    /// Send a control request and wait for the peer's `message-resolve`.
    async fn request(&self, device: &str, event: ControlEvent) -> Result<Value> {
        let channel = self.connections.channel(device).await?;
        let message = ControlMessage::request(event);
        let message_id = message.message_id;
        let text = message.encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().await.insert(
            message_id,
            PendingAck {
                device: device.to_string(),
                tx,
            },
        );

        debug!(
            event = "control_request",
            %device,
            %message_id,
            tag = %message.event.tag(),
            "Sending control request"
        );
        if let Err(e) = channel.send_text(text).await {
            self.pending_acks.lock().await.remove(&message_id);
            return Err(e);
        }

        match timeout(self.config.ack_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransferError::ChannelUnavailable(format!(
                "request {message_id} to {device} was dropped"
            ))),
            Err(_) => {
                self.pending_acks.lock().await.remove(&message_id);
                warn!(event = "ack_timeout", %device, %message_id, "No response from peer");
                Err(TransferError::AckTimeout { message_id })
            }
        }
    }

    /// Fire a request and reap its acknowledgment in the background.
    fn notify(self: &Arc<Self>, device: &str, event: ControlEvent) {
        let engine = self.clone();
        let device = device.to_string();
        tokio::spawn(async move {
            let tag = event.tag();
            if let Err(e) = engine.request(&device, event).await {
                debug!(event = "notify_unacknowledged", %device, %tag, error = %e, "Peer did not acknowledge");
            }
        });
    }

    async fn resolve(&self, device: &str, message_id: Uuid, data: Value) {
        let sent = match self.connections.channel(device).await {
            Ok(channel) => match ControlMessage::resolve(message_id, data).encode() {
                Ok(text) => channel.send_text(text).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(event = "resolve_failure", %device, %message_id, error = %e, "Failed to acknowledge request");
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    pub(crate) async fn handle_message(self: &Arc<Self>, device: &str, message: ChannelMessage) {
        match message {
            ChannelMessage::Binary(frame) => match decode_chunk_frame(&frame) {
                Ok(chunk) => self.on_chunk(device, chunk).await,
                Err(e) => warn!(event = "malformed_chunk", %device, error = %e, "Dropping frame"),
            },
            ChannelMessage::Text(text) => match ControlMessage::decode(&text) {
                Ok(control) => self.on_control(device, control).await,
                Err(e) => warn!(event = "malformed_control", %device, error = %e, "Dropping message"),
            },
        }
    }

    async fn on_control(self: &Arc<Self>, device: &str, message: ControlMessage) {
        let ControlMessage { message_id, event } = message;
        debug!(event = "control_received", %device, %message_id, tag = %event.tag(), "Control message");

        // Lifecycle events only apply to this device's own transfers.
        if let Some(id) = event.transfer_id() {
            if !self.belongs_to(id, device).await {
                debug!(event = "unknown_transfer", %device, transfer_id = %id, "Control for unknown transfer");
                self.resolve(device, message_id, Value::Null).await;
                return;
            }
        }

        match event {
            ControlEvent::MessageResolve(data) => {
                let pending = self.pending_acks.lock().await.remove(&message_id);
                match pending {
                    Some(ack) => {
                        let _ = ack.tx.send(Ok(data));
                    }
                    None => debug!(event = "stray_resolve", %device, %message_id, "No pending request"),
                }
            }
            ControlEvent::GetTransfers => {
                let table: Vec<TransferSnapshot> = self
                    .transfers
                    .read()
                    .await
                    .for_device(device)
                    .into_iter()
                    .map(Transfer::snapshot)
                    .collect();
                let data = serde_json::to_value(table).unwrap_or(Value::Null);
                self.resolve(device, message_id, data).await;
            }
            ControlEvent::FileRequest { file } => {
                let transfer = Transfer::new_outbound(Uuid::new_v4(), device.to_string(), file);
                let id = transfer.id;
                let snapshot = transfer.snapshot();
                self.transfers.write().await.insert(transfer);
                info!(
                    event = "file_requested",
                    transfer_id = %id,
                    %device,
                    name = %snapshot.file.name,
                    size = snapshot.file.size,
                    "Outbound transfer registered"
                );
                self.emit(TransferEvent::Registered(snapshot));
                self.resolve(device, message_id, Value::String(id.to_string()))
                    .await;
            }
            ControlEvent::TransferStart { transfer_id } => {
                // Acknowledge first so the ack precedes the first chunk.
                self.resolve(device, message_id, Value::Null).await;
                self.begin(transfer_id).await;
            }
            ControlEvent::TransferPause { transfer_id } => {
                self.pause(transfer_id).await;
                self.resolve(device, message_id, Value::Null).await;
            }
            ControlEvent::TransferDone { transfer_id } => {
                self.mark_done(transfer_id).await;
                self.resolve(device, message_id, Value::Null).await;
            }
            ControlEvent::TransferDelete { transfer_id } => {
                if let Err(e) = self.remove_transfer(transfer_id).await {
                    debug!(event = "delete_ignored", %device, transfer_id = %transfer_id, error = %e, "Peer delete not applied");
                }
                self.resolve(device, message_id, Value::Null).await;
            }
        }
    }

    async fn on_chunk(self: &Arc<Self>, device: &str, chunk: ChunkFrame) {
        let id = chunk.transfer_id;
        let accepts = self
            .transfers
            .read()
            .await
            .get(&id)
            .is_some_and(|t| {
                t.device == device
                    && t.direction == TransferDirection::Inbound
                    && !t.state.is_terminal()
            });
        if !accepts {
            debug!(event = "chunk_discarded", %device, transfer_id = %id, "Chunk for unknown transfer");
            return;
        }

        if let Err(e) = self.store.append(id, &chunk.payload).await {
            self.fail_transfer(id, e).await;
            return;
        }

        let complete = {
            let mut transfers = self.transfers.write().await;
            let Some(t) = transfers.get_mut(&id) else {
                drop(transfers);
                // Deleted while the append was in flight.
                let _ = self.store.discard(id).await;
                return;
            };
            let bytes_moved = t.advance(chunk.payload.len() as u64);
            self.emit(TransferEvent::Progress {
                id,
                bytes_moved,
                size: t.file.size,
                rate_bps: t.rate.bytes_per_sec(),
            });
            t.is_complete()
        };

        if complete {
            self.complete_inbound(id).await;
        }
    }

    // ── Transitions ──────────────────────────────────────────────────────

    /// Move to `Ongoing`; outbound transfers get a fresh pump.
    async fn begin(self: &Arc<Self>, id: Uuid) {
        let (direction, device, file, epoch) = {
            let mut transfers = self.transfers.write().await;
            let Some(t) = transfers.get_mut(&id) else {
                return;
            };
            if !t.state.can_become(TransferState::Ongoing) {
                debug!(event = "start_ignored", transfer_id = %id, state = ?t.state, "Transfer cannot start");
                return;
            }
            t.state = TransferState::Ongoing;
            if t.direction == TransferDirection::Outbound {
                t.pump_epoch += 1;
            }
            (t.direction, t.device.clone(), t.file.clone(), t.pump_epoch)
        };
        info!(
            event = "transfer_started",
            transfer_id = %id,
            %device,
            ?direction,
            chunks = total_chunks(file.size, self.config.chunk_size),
            "Transfer ongoing"
        );
        self.emit(TransferEvent::StateChanged {
            id,
            state: TransferState::Ongoing,
        });

        match direction {
            TransferDirection::Outbound => self.spawn_pump(id, epoch, device, file).await,
            // Nothing will ever arrive for an empty file.
            TransferDirection::Inbound if file.size == 0 => self.complete_inbound(id).await,
            TransferDirection::Inbound => {}
        }
    }

    async fn pause(&self, id: Uuid) {
        let paused = {
            let mut transfers = self.transfers.write().await;
            match transfers.get_mut(&id) {
                Some(t) if t.state.can_become(TransferState::Paused) => {
                    t.state = TransferState::Paused;
                    true
                }
                _ => false,
            }
        };
        if paused {
            info!(event = "transfer_paused", transfer_id = %id, "Transfer paused");
            self.emit(TransferEvent::StateChanged {
                id,
                state: TransferState::Paused,
            });
        }
    }

    /// Sender side: the receiver confirmed every byte.
    async fn mark_done(&self, id: Uuid) {
        let done = {
            let mut transfers = self.transfers.write().await;
            match transfers.get_mut(&id) {
                Some(t) if t.state.can_become(TransferState::Done) => {
                    t.complete();
                    true
                }
                _ => false,
            }
        };
        if done {
            self.pump_locks.lock().await.remove(&id);
            info!(event = "transfer_done", transfer_id = %id, "Peer confirmed completion");
            self.emit(TransferEvent::StateChanged {
                id,
                state: TransferState::Done,
            });
        }
    }

    /// Receiver side: flush, mark done, tell the sender and deliver.
    async fn complete_inbound(self: &Arc<Self>, id: Uuid) {
        if let Err(e) = self.store.flush(id).await {
            self.fail_transfer(id, e).await;
            return;
        }

        let finished = {
            let mut transfers = self.transfers.write().await;
            match transfers.get_mut(&id) {
                Some(t) if t.state.can_become(TransferState::Done) => {
                    t.complete();
                    Some((t.device.clone(), t.file.clone()))
                }
                _ => None,
            }
        };
        let Some((device, file)) = finished else {
            return;
        };

        info!(
            event = "transfer_received",
            transfer_id = %id,
            %device,
            bytes = file.size,
            "All chunks received"
        );
        self.emit(TransferEvent::StateChanged {
            id,
            state: TransferState::Done,
        });
        self.notify(&device, ControlEvent::TransferDone { transfer_id: id });

        let engine = self.clone();
        tokio::spawn(async move { engine.deliver(id, file).await });
    }

    async fn deliver(&self, id: Uuid, file: FileMetadata) {
        match self.stream_to_sink(id, &file).await {
            Ok(()) => {
                if let Err(e) = self.store.discard(id).await {
                    warn!(event = "segment_cleanup_failure", transfer_id = %id, error = %e, "Delivered segments not removed");
                }
                info!(event = "transfer_delivered", transfer_id = %id, name = %file.name, "Delivered to sink");
                self.emit(TransferEvent::Delivered { id });
            }
            Err(e) => {
                error!(event = "delivery_failure", transfer_id = %id, error = %e, "Delivery sink failed");
                self.emit(TransferEvent::DeliveryFailed {
                    id,
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn stream_to_sink(&self, id: Uuid, file: &FileMetadata) -> Result<()> {
        let sequences = self.store.sequences(id).await?;
        let mut writer = self.sink.open(file).await?;
        writer.ready_to_stream().await?;
        for seq in sequences {
            let segment = self.store.segment(id, seq).await?;
            writer.write(segment).await?;
        }
        writer.close().await
    }

    /// Mark a transfer `Failed`, drop its buffers and tell the peer to drop
    /// its side. The failed record stays for reporting.
    async fn fail_transfer(self: &Arc<Self>, id: Uuid, reason: TransferError) {
        let device = {
            let mut transfers = self.transfers.write().await;
            match transfers.get_mut(&id) {
                Some(t) if t.state.can_become(TransferState::Failed) => {
                    t.state = TransferState::Failed;
                    Some(t.device.clone())
                }
                _ => None,
            }
        };
        let Some(device) = device else {
            return;
        };

        self.pump_locks.lock().await.remove(&id);
        if let Err(e) = self.store.discard(id).await {
            warn!(event = "segment_cleanup_failure", transfer_id = %id, error = %e, "Failed transfer buffers not removed");
        }
        error!(event = "transfer_failed", transfer_id = %id, %device, error = %reason, "Transfer failed");
        self.emit(TransferEvent::Failed {
            id,
            reason: reason.to_string(),
        });
        self.notify(&device, ControlEvent::TransferDelete { transfer_id: id });
    }

    /// Forget a transfer and its buffers. Returns the device it was bound to.
    /// A `Done` transfer stays: delivery owns its segments.
    async fn remove_transfer(&self, id: Uuid) -> Result<DeviceId> {
        let removed = {
            let mut transfers = self.transfers.write().await;
            match transfers.get(&id).map(|t| t.state) {
                None => return Err(TransferError::TransferNotFound(id)),
                Some(TransferState::Done) => return Err(TransferError::AlreadyDone(id)),
                Some(_) => transfers.remove(&id),
            }
        }
        .ok_or(TransferError::TransferNotFound(id))?;
        self.pump_locks.lock().await.remove(&id);
        if let Err(e) = self.store.discard(id).await {
            warn!(event = "segment_cleanup_failure", transfer_id = %id, error = %e, "Deleted transfer buffers not removed");
        }
        info!(event = "transfer_removed", transfer_id = %id, device = %removed.device, "Transfer removed");
        self.emit(TransferEvent::Removed { id });
        Ok(removed.device)
    }

    /// The connection to `device` is gone: drop its transfers and fail
    /// every request still waiting on it.
    async fn release_device(&self, device: &str) {
        let removed = self.transfers.write().await.remove_device(device);
        if !removed.is_empty() {
            info!(event = "device_released", %device, transfers = removed.len(), "Releasing transfers of closed connection");
        }
        for transfer in removed {
            self.pump_locks.lock().await.remove(&transfer.id);
            if transfer.state == TransferState::Done {
                // Delivery still owns these segments.
                self.emit(TransferEvent::Removed { id: transfer.id });
                continue;
            }
            if let Err(e) = self.store.discard(transfer.id).await {
                warn!(event = "segment_cleanup_failure", transfer_id = %transfer.id, error = %e, "Released transfer buffers not removed");
            }
            self.emit(TransferEvent::Removed { id: transfer.id });
        }

        let failed: Vec<PendingAck> = {
            let mut pending = self.pending_acks.lock().await;
            let ids: Vec<Uuid> = pending
                .iter()
                .filter(|(_, ack)| ack.device == device)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for ack in failed {
            let _ = ack.tx.send(Err(TransferError::ChannelUnavailable(format!(
                "connection to {device} closed"
            ))));
        }
    }

    // ── Pump ─────────────────────────────────────────────────────────────

    async fn spawn_pump(self: &Arc<Self>, id: Uuid, epoch: u64, device: DeviceId, file: FileMetadata) {
        let channel = match self.connections.channel(&device).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(event = "pump_no_channel", transfer_id = %id, %device, error = %e, "Cannot start pump");
                return;
            }
        };
        let lock = self
            .pump_locks
            .lock()
            .await
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let pump = OutboundPump {
            transfer_id: id,
            epoch,
            file,
            channel,
            source: self.source.clone(),
            transfers: self.transfers.clone(),
            events: self.events.clone(),
            config: self.config,
            lock,
        };
        let engine = self.clone();
        tokio::spawn(async move {
            match pump.run().await {
                PumpExit::SourceFailed(e) => engine.fail_transfer(id, e).await,
                exit => debug!(event = "pump_exit", transfer_id = %id, epoch, ?exit, "Outbound pump exited"),
            }
        });
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    async fn device_of(&self, id: Uuid) -> Result<DeviceId> {
        self.transfers
            .read()
            .await
            .get(&id)
            .map(|t| t.device.clone())
            .ok_or(TransferError::TransferNotFound(id))
    }

    async fn belongs_to(&self, id: Uuid, device: &str) -> bool {
        self.transfers
            .read()
            .await
            .get(&id)
            .is_some_and(|t| t.device == device)
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }
}
