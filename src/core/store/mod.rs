//! Local Buffer Store: receiver-side staging of inbound chunk bytes.
//!
//! Appended payloads accumulate in memory per transfer. Once a transfer's
//! staged bytes reach the flush threshold they are written to the durable
//! store as one segment under the next sequence number, and the staging
//! buffer is cleared. `flush` writes whatever remains. Concatenating a
//! transfer's segments in sequence order yields exactly the appended bytes.

pub mod durable;

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub use durable::{DurableStore, FsStore, MemoryStore};

use crate::core::error::Result;

#[derive(Debug, Default)]
struct Staging {
    buf: BytesMut,
    next_seq: u64,
}

pub struct LocalBufferStore {
    durable: Arc<dyn DurableStore>,
    flush_threshold: usize,
    staging: Mutex<HashMap<Uuid, Staging>>,
}

impl LocalBufferStore {
    pub fn new(durable: Arc<dyn DurableStore>, flush_threshold: usize) -> Self {
        Self {
            durable,
            flush_threshold: flush_threshold.max(1),
            staging: Mutex::new(HashMap::new()),
        }
    }

    /// Stage `payload` for `transfer_id`, persisting a segment when the
    /// threshold is reached. A failed write loses the segment; the caller
    /// must fail the transfer.
    pub async fn append(&self, transfer_id: Uuid, payload: &[u8]) -> Result<()> {
        let ready = {
            let mut staging = self.staging.lock().await;
            let entry = staging.entry(transfer_id).or_default();
            entry.buf.extend_from_slice(payload);
            if entry.buf.len() >= self.flush_threshold {
                let seq = entry.next_seq;
                entry.next_seq += 1;
                Some((seq, entry.buf.split().freeze()))
            } else {
                None
            }
        };

        if let Some((seq, segment)) = ready {
            self.persist(transfer_id, seq, segment).await?;
        }
        Ok(())
    }

    /// Persist whatever is still staged for `transfer_id`.
    pub async fn flush(&self, transfer_id: Uuid) -> Result<()> {
        let ready = {
            let mut staging = self.staging.lock().await;
            match staging.remove(&transfer_id) {
                Some(entry) if !entry.buf.is_empty() => Some((entry.next_seq, entry.buf.freeze())),
                _ => None,
            }
        };

        if let Some((seq, segment)) = ready {
            self.persist(transfer_id, seq, segment).await?;
        }
        Ok(())
    }

    async fn persist(&self, transfer_id: Uuid, seq: u64, segment: Bytes) -> Result<()> {
        let bytes = segment.len();
        self.durable.put(transfer_id, seq, segment).await?;
        info!(
            event = "segment_flushed",
            %transfer_id,
            seq,
            bytes,
            "Staged chunk bytes persisted"
        );
        Ok(())
    }

    /// Persisted sequences of a transfer, ascending.
    pub async fn sequences(&self, transfer_id: Uuid) -> Result<Vec<u64>> {
        self.durable.sequences(transfer_id).await
    }

    /// One persisted segment.
    pub async fn segment(&self, transfer_id: Uuid, seq: u64) -> Result<Bytes> {
        self.durable.get(transfer_id, seq).await
    }

    /// Drop staged bytes and persisted segments of a transfer.
    pub async fn discard(&self, transfer_id: Uuid) -> Result<()> {
        let staged = self
            .staging
            .lock()
            .await
            .remove(&transfer_id)
            .map(|s| s.buf.len())
            .unwrap_or(0);
        self.durable.remove_transfer(transfer_id).await?;
        debug!(
            event = "transfer_buffers_discarded",
            %transfer_id,
            staged,
            "Discarded buffered chunks"
        );
        Ok(())
    }

    /// Bytes currently held in memory for a transfer.
    pub async fn staged_bytes(&self, transfer_id: Uuid) -> usize {
        self.staging
            .lock()
            .await
            .get(&transfer_id)
            .map(|s| s.buf.len())
            .unwrap_or(0)
    }
}
