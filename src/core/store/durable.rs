//! Durable key-value backends for persisted chunk segments.
//!
//! Keys are `(transfer id, sequence)`. Readers list a transfer's sequences
//! and fetch one segment at a time, so a whole file is never held in memory.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::error::{Result, TransferError};
use crate::utils::atomic_write::atomic_write;

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Persist one segment. Overwrites an existing segment at the same key.
    async fn put(&self, transfer_id: Uuid, seq: u64, data: Bytes) -> Result<()>;

    /// Sequences persisted for a transfer, ascending. Empty for an unknown transfer.
    async fn sequences(&self, transfer_id: Uuid) -> Result<Vec<u64>>;

    /// One segment. A missing key is a persistence failure.
    async fn get(&self, transfer_id: Uuid, seq: u64) -> Result<Bytes>;

    /// Remove every segment of a transfer. Removing an unknown transfer is a no-op.
    async fn remove_transfer(&self, transfer_id: Uuid) -> Result<()>;
}

// ── In-memory ────────────────────────────────────────────────────────────────

/// Volatile store, used by tests and short-lived hosts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    segments: Mutex<HashMap<Uuid, BTreeMap<u64, Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transfers with at least one persisted segment.
    pub async fn transfer_count(&self) -> usize {
        self.segments.lock().await.len()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn put(&self, transfer_id: Uuid, seq: u64, data: Bytes) -> Result<()> {
        self.segments
            .lock()
            .await
            .entry(transfer_id)
            .or_default()
            .insert(seq, data);
        Ok(())
    }

    async fn sequences(&self, transfer_id: Uuid) -> Result<Vec<u64>> {
        Ok(self
            .segments
            .lock()
            .await
            .get(&transfer_id)
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn get(&self, transfer_id: Uuid, seq: u64) -> Result<Bytes> {
        self.segments
            .lock()
            .await
            .get(&transfer_id)
            .and_then(|s| s.get(&seq))
            .cloned()
            .ok_or_else(|| TransferError::Persistence(format!("segment {transfer_id}/{seq} missing")))
    }

    async fn remove_transfer(&self, transfer_id: Uuid) -> Result<()> {
        self.segments.lock().await.remove(&transfer_id);
        Ok(())
    }
}

// ── Filesystem ───────────────────────────────────────────────────────────────

/// One directory per transfer under `root`, one file per segment named by
/// its zero-padded sequence so lexical order equals sequence order.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn transfer_dir(&self, transfer_id: Uuid) -> PathBuf {
        self.root.join(transfer_id.to_string())
    }

    fn segment_path(&self, transfer_id: Uuid, seq: u64) -> PathBuf {
        self.transfer_dir(transfer_id).join(format!("{seq:010}.seg"))
    }
}

fn persistence_err(path: &Path, e: impl std::fmt::Display) -> TransferError {
    TransferError::Persistence(format!("{}: {e}", path.display()))
}

#[async_trait]
impl DurableStore for FsStore {
    async fn put(&self, transfer_id: Uuid, seq: u64, data: Bytes) -> Result<()> {
        let path = self.segment_path(transfer_id, seq);
        let target = path.clone();
        tokio::task::spawn_blocking(move || atomic_write(&target, &data))
            .await
            .map_err(|e| persistence_err(&path, e))?
            .map_err(|e| persistence_err(&path, e))?;
        debug!(
            event = "segment_persisted",
            %transfer_id,
            seq,
            path = %path.display(),
            "Segment written"
        );
        Ok(())
    }

    async fn sequences(&self, transfer_id: Uuid) -> Result<Vec<u64>> {
        let dir = self.transfer_dir(transfer_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(persistence_err(&dir, e)),
        };

        let mut seqs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| persistence_err(&dir, e))?
        {
            // Leftover temp files and foreign names are skipped.
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "seg") {
                continue;
            }
            if let Some(seq) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
            {
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();
        Ok(seqs)
    }

    async fn get(&self, transfer_id: Uuid, seq: u64) -> Result<Bytes> {
        let path = self.segment_path(transfer_id, seq);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| persistence_err(&path, e))?;
        Ok(Bytes::from(data))
    }

    async fn remove_transfer(&self, transfer_id: Uuid) -> Result<()> {
        let dir = self.transfer_dir(transfer_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(
                    event = "segment_cleanup_failure",
                    %transfer_id,
                    path = %dir.display(),
                    error = %e,
                    "Failed to remove persisted segments"
                );
                Err(persistence_err(&dir, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(store: &dyn DurableStore, id: Uuid) -> Vec<Bytes> {
        let mut out = Vec::new();
        for seq in store.sequences(id).await.unwrap() {
            out.push(store.get(id, seq).await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn memory_store_orders_by_sequence() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.put(id, 2, Bytes::from_static(b"c")).await.unwrap();
        store.put(id, 0, Bytes::from_static(b"a")).await.unwrap();
        store.put(id, 1, Bytes::from_static(b"b")).await.unwrap();

        assert_eq!(store.sequences(id).await.unwrap(), vec![0, 1, 2]);
        let segs = read_all(&store, id).await;
        assert_eq!(segs, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);

        store.remove_transfer(id).await.unwrap();
        assert!(store.sequences(id).await.unwrap().is_empty());
        assert!(matches!(
            store.get(id, 0).await,
            Err(TransferError::Persistence(_))
        ));
        assert_eq!(store.transfer_count().await, 0);
    }

    #[tokio::test]
    async fn fs_store_round_trips_segments() {
        let root = std::env::temp_dir().join(format!("spacedrop_test_fs_store_{}", Uuid::new_v4()));
        let store = FsStore::new(&root);
        let id = Uuid::new_v4();

        for seq in [10u64, 2, 0] {
            store
                .put(id, seq, Bytes::from(seq.to_string()))
                .await
                .unwrap();
        }
        assert_eq!(store.sequences(id).await.unwrap(), vec![0, 2, 10]);
        let segs = read_all(&store, id).await;
        assert_eq!(segs, vec![Bytes::from("0"), Bytes::from("2"), Bytes::from("10")]);
        assert_eq!(store.get(id, 2).await.unwrap(), Bytes::from("2"));

        store.remove_transfer(id).await.unwrap();
        assert!(!root.join(id.to_string()).exists());
        // Second removal is a no-op.
        store.remove_transfer(id).await.unwrap();

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn fs_store_unknown_transfer_has_no_segments() {
        let root = std::env::temp_dir().join(format!("spacedrop_test_fs_empty_{}", Uuid::new_v4()));
        let store = FsStore::new(&root);
        assert!(store.sequences(Uuid::new_v4()).await.unwrap().is_empty());
        assert!(matches!(
            store.get(Uuid::new_v4(), 0).await,
            Err(TransferError::Persistence(_))
        ));
    }
}
