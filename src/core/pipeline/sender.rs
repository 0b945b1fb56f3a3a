//! Sender pipeline: file sources and the outbound pump.
//!
//! ```text
//! ┌────────────┐  read_chunk   ┌──────────────────────┐  send_binary
//! │ FileSource │ ─────────────►│ OutboundPump (1/tx)  │ ─────────────► DataChannel
//! └────────────┘               │ park while buffered  │
//!                              │ ≥ high watermark     │
//!                              └──────────────────────┘
//! ```
//!
//! One pump task per outbound transfer in `Ongoing`. Pumps of one transfer
//! are serialized by a per-transfer lock, and each carries the epoch it was
//! started with; a pump whose epoch is no longer current exits at its next
//! check. `bytes_moved` advances only after a frame was handed to the
//! channel, so a resumed pump continues exactly where the last send ended.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::{TransferConfig, MAX_MESSAGE_SIZE};
use crate::core::connection::{DataChannel, DeviceId};
use crate::core::error::{Result, TransferError};
use crate::core::protocol::{encode_chunk_frame, TRANSFER_ID_LEN};
use crate::core::transfer::{FileMetadata, TransferEvent, TransferState, TransferTable};

// ── Sources ──────────────────────────────────────────────────────────────────

#[async_trait]
pub trait FileSource: Send + Sync {
    /// Read exactly `len` bytes of `file` at `offset`.
    async fn read_chunk(&self, file: &FileMetadata, offset: u64, len: usize) -> Result<Bytes>;
}

/// Files shared from local disk, keyed by content id.
pub struct SharedFiles {
    device: DeviceId,
    files: RwLock<HashMap<String, SharedEntry>>,
}

struct SharedEntry {
    path: PathBuf,
    handle: Arc<Mutex<Option<tokio::fs::File>>>,
}

impl SharedFiles {
    /// `device` is this process's own device id, recorded as the holder.
    pub fn new(device: impl Into<DeviceId>) -> Self {
        Self {
            device: device.into(),
            files: RwLock::new(HashMap::new()),
        }
    }

    /// Share a file and return the metadata a peer needs to request it.
    pub async fn share(&self, path: &Path) -> Result<FileMetadata> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| TransferError::Source(format!("{}: {e}", path.display())))?;
        if !meta.is_file() {
            return Err(TransferError::Source(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let file = FileMetadata {
            id: Uuid::new_v4().to_string(),
            device_id: self.device.clone(),
            content_type: content_type_for(&name).to_string(),
            name,
            size: meta.len(),
            thumbnail: None,
        };

        self.files.write().await.insert(
            file.id.clone(),
            SharedEntry {
                path: path.to_path_buf(),
                handle: Arc::new(Mutex::new(None)),
            },
        );
        info!(
            event = "file_shared",
            id = %file.id,
            name = %file.name,
            size = file.size,
            "File shared"
        );
        Ok(file)
    }

    pub async fn unshare(&self, id: &str) -> bool {
        self.files.write().await.remove(id).is_some()
    }
}

#[async_trait]
impl FileSource for SharedFiles {
    async fn read_chunk(&self, file: &FileMetadata, offset: u64, len: usize) -> Result<Bytes> {
        let (path, handle) = {
            let files = self.files.read().await;
            let entry = files
                .get(&file.id)
                .ok_or_else(|| TransferError::Source(format!("file {} is not shared", file.id)))?;
            (entry.path.clone(), entry.handle.clone())
        };
        let source_err = |e: std::io::Error| TransferError::Source(format!("{}: {e}", path.display()));

        let mut guard = handle.lock().await;
        if guard.is_none() {
            *guard = Some(tokio::fs::File::open(&path).await.map_err(source_err)?);
        }
        let Some(f) = guard.as_mut() else {
            return Err(TransferError::Source(format!("{}: not open", path.display())));
        };

        f.seek(SeekFrom::Start(offset)).await.map_err(source_err)?;
        let mut buf = BytesMut::zeroed(len);
        f.read_exact(&mut buf).await.map_err(source_err)?;
        Ok(buf.freeze())
    }
}

/// In-memory source; content ids map to whole file bodies.
#[derive(Default)]
pub struct MemoryFiles {
    device: DeviceId,
    files: RwLock<HashMap<String, Bytes>>,
}

impl MemoryFiles {
    pub fn new(device: impl Into<DeviceId>) -> Self {
        Self {
            device: device.into(),
            files: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add(&self, name: &str, body: impl Into<Bytes>) -> FileMetadata {
        let body = body.into();
        let file = FileMetadata {
            id: Uuid::new_v4().to_string(),
            device_id: self.device.clone(),
            name: name.to_string(),
            content_type: content_type_for(name).to_string(),
            size: body.len() as u64,
            thumbnail: None,
        };
        self.files.write().await.insert(file.id.clone(), body);
        file
    }
}

#[async_trait]
impl FileSource for MemoryFiles {
    async fn read_chunk(&self, file: &FileMetadata, offset: u64, len: usize) -> Result<Bytes> {
        let files = self.files.read().await;
        let body = files
            .get(&file.id)
            .ok_or_else(|| TransferError::Source(format!("file {} is not shared", file.id)))?;
        let start = usize::try_from(offset)
            .map_err(|_| TransferError::Source(format!("offset {offset} out of range")))?;
        let end = start.saturating_add(len);
        if end > body.len() {
            return Err(TransferError::Source(format!(
                "read {start}..{end} past end of {} byte file",
                body.len()
            )));
        }
        Ok(body.slice(start..end))
    }
}

fn content_type_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "md" | "log" => "text/plain",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

// ── Pump ─────────────────────────────────────────────────────────────────────

/// Why a pump returned.
#[derive(Debug)]
pub(crate) enum PumpExit {
    /// Every byte was sent; completion waits for the receiver's `transfer-done`.
    AllSent,
    /// Paused, deleted, released or superseded by a newer pump.
    Stopped,
    ChannelClosed,
    SourceFailed(TransferError),
}

pub(crate) struct OutboundPump {
    pub transfer_id: Uuid,
    pub epoch: u64,
    pub file: FileMetadata,
    pub channel: Arc<dyn DataChannel>,
    pub source: Arc<dyn FileSource>,
    pub transfers: Arc<RwLock<TransferTable>>,
    pub events: mpsc::UnboundedSender<TransferEvent>,
    pub config: TransferConfig,
    pub lock: Arc<Mutex<()>>,
}

impl OutboundPump {
    pub async fn run(self) -> PumpExit {
        let _serial = self.lock.lock().await;
        let id = self.transfer_id;
        let size = self.file.size;
        let mut sent: u32 = 0;
        // Frames larger than the transport's message size are rejected.
        let chunk_size = self
            .config
            .chunk_size
            .clamp(1, MAX_MESSAGE_SIZE - TRANSFER_ID_LEN);

        debug!(event = "pump_start", transfer_id = %id, epoch = self.epoch, "Outbound pump started");

        loop {
            let Some(offset) = self.current_offset().await else {
                return PumpExit::Stopped;
            };
            if offset >= size {
                debug!(event = "pump_all_sent", transfer_id = %id, bytes = size, "All chunks sent");
                return PumpExit::AllSent;
            }

            let len = (chunk_size as u64).min(size - offset) as usize;
            let data = match self.source.read_chunk(&self.file, offset, len).await {
                Ok(data) if data.len() == len => data,
                Ok(data) => {
                    return PumpExit::SourceFailed(TransferError::Source(format!(
                        "short read at offset {offset}: {} of {len} bytes",
                        data.len()
                    )))
                }
                Err(e) => return PumpExit::SourceFailed(e),
            };

            // Backpressure: never hand a frame to the channel while it holds
            // at least the high watermark.
            while self.channel.buffered_amount().await >= self.config.high_watermark {
                if !self.channel.is_open() {
                    return PumpExit::ChannelClosed;
                }
                self.channel.drained().await;
                if self.current_offset().await != Some(offset) {
                    return PumpExit::Stopped;
                }
            }

            if self.current_offset().await != Some(offset) {
                return PumpExit::Stopped;
            }
            if let Err(e) = self
                .channel
                .send_binary(encode_chunk_frame(id, &data))
                .await
            {
                warn!(event = "chunk_send_failure", transfer_id = %id, offset, error = %e, "Send failed");
                return PumpExit::ChannelClosed;
            }

            if !self.credit(offset, len as u64).await {
                return PumpExit::Stopped;
            }

            sent = sent.wrapping_add(1);
            if self.config.yield_interval > 0 && sent % self.config.yield_interval == 0 {
                tokio::task::yield_now().await;
            }
        }
    }

    /// `bytes_moved` if this pump may still send for the transfer.
    async fn current_offset(&self) -> Option<u64> {
        let transfers = self.transfers.read().await;
        transfers
            .get(&self.transfer_id)
            .filter(|t| t.pump_epoch == self.epoch && t.state == TransferState::Ongoing)
            .map(|t| t.bytes_moved)
    }

    /// Account for a frame that is already on the wire, then report whether
    /// this pump may go on. A sent frame is always credited, even when a
    /// pause or a newer pump arrived while it was in flight.
    async fn credit(&self, offset: u64, n: u64) -> bool {
        let mut transfers = self.transfers.write().await;
        let Some(t) = transfers.get_mut(&self.transfer_id) else {
            return false;
        };
        if t.bytes_moved != offset {
            warn!(
                event = "pump_offset_mismatch",
                transfer_id = %t.id,
                offset,
                bytes_moved = t.bytes_moved,
                "Transfer moved underneath the pump"
            );
            return false;
        }
        let bytes_moved = t.advance(n);
        let _ = self.events.send(TransferEvent::Progress {
            id: t.id,
            bytes_moved,
            size: t.file.size,
            rate_bps: t.rate.bytes_per_sec(),
        });
        t.pump_epoch == self.epoch && t.state == TransferState::Ongoing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("spacedrop_test")
            .join("sender")
            .join(format!("{name}_{}", Uuid::new_v4()));
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn shared_files_read_at_offsets() {
        let dir = test_dir("offsets");
        let path = dir.join("data.bin");
        let body: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &body).unwrap();

        let files = SharedFiles::new("me");
        let meta = files.share(&path).await.unwrap();
        assert_eq!(meta.size, 50_000);
        assert_eq!(meta.device_id, "me");
        assert_eq!(meta.content_type, "application/octet-stream");

        let tail = files.read_chunk(&meta, 49_000, 1_000).await.unwrap();
        assert_eq!(&tail[..], &body[49_000..]);
        let head = files.read_chunk(&meta, 0, 16).await.unwrap();
        assert_eq!(&head[..], &body[..16]);

        assert!(files.read_chunk(&meta, 49_500, 1_000).await.is_err());

        assert!(files.unshare(&meta.id).await);
        assert!(matches!(
            files.read_chunk(&meta, 0, 1).await,
            Err(TransferError::Source(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn sharing_a_directory_fails() {
        let dir = test_dir("dir");
        let files = SharedFiles::new("me");
        assert!(files.share(&dir).await.is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    /// Channel whose sends park until released.
    struct GatedChannel {
        entered: tokio::sync::Notify,
        release: tokio::sync::Semaphore,
        sent: std::sync::Mutex<Vec<Bytes>>,
    }

    impl GatedChannel {
        fn new() -> Self {
            Self {
                entered: tokio::sync::Notify::new(),
                release: tokio::sync::Semaphore::new(0),
                sent: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DataChannel for GatedChannel {
        fn label(&self) -> &str {
            "gated"
        }

        fn is_open(&self) -> bool {
            true
        }

        async fn send_binary(&self, data: Bytes) -> Result<()> {
            self.entered.notify_one();
            let permit = self
                .release
                .acquire()
                .await
                .map_err(|e| TransferError::ChannelUnavailable(e.to_string()))?;
            permit.forget();
            self.sent.lock().unwrap().push(data);
            Ok(())
        }

        async fn send_text(&self, _: String) -> Result<()> {
            Ok(())
        }

        async fn buffered_amount(&self) -> usize {
            0
        }

        async fn drained(&self) {}
    }

    #[tokio::test]
    async fn frame_in_flight_across_pause_and_resume_is_sent_once() {
        use crate::core::config::CHUNK_SIZE;
        use crate::core::transfer::Transfer;

        let files = Arc::new(MemoryFiles::new("me"));
        let body: Vec<u8> = (0..2 * CHUNK_SIZE).map(|i| (i % 251) as u8).collect();
        let meta = files.add("two.bin", body.clone()).await;
        let id = Uuid::new_v4();

        let mut transfer = Transfer::new_outbound(id, "peer".into(), meta.clone());
        transfer.state = TransferState::Ongoing;
        transfer.pump_epoch = 1;
        let mut table = TransferTable::default();
        table.insert(transfer);
        let transfers = Arc::new(RwLock::new(table));

        let channel = Arc::new(GatedChannel::new());
        let lock = Arc::new(Mutex::new(()));
        let (events, _events_rx) = mpsc::unbounded_channel();
        let pump = |epoch: u64| OutboundPump {
            transfer_id: id,
            epoch,
            file: meta.clone(),
            channel: channel.clone(),
            source: files.clone(),
            transfers: transfers.clone(),
            events: events.clone(),
            config: TransferConfig::default(),
            lock: lock.clone(),
        };

        let first = tokio::spawn(pump(1).run());
        channel.entered.notified().await;
        {
            // Paused and resumed while the first frame is still being sent.
            let mut table = transfers.write().await;
            let t = table.get_mut(&id).unwrap();
            t.state = TransferState::Ongoing;
            t.pump_epoch = 2;
        }
        channel.release.add_permits(1);

        assert!(matches!(first.await.unwrap(), PumpExit::Stopped));
        assert_eq!(
            transfers.read().await.get(&id).unwrap().bytes_moved,
            CHUNK_SIZE as u64
        );

        channel.release.add_permits(10);
        assert!(matches!(pump(2).run().await, PumpExit::AllSent));

        let sent = channel.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        let received: Vec<u8> = sent
            .iter()
            .flat_map(|frame| frame[TRANSFER_ID_LEN..].to_vec())
            .collect();
        assert_eq!(received, body);
    }

    #[tokio::test]
    async fn memory_files_bounds() {
        let files = MemoryFiles::new("me");
        let meta = files.add("notes.txt", &b"hello world"[..]).await;
        assert_eq!(meta.content_type, "text/plain");
        assert_eq!(&files.read_chunk(&meta, 6, 5).await.unwrap()[..], b"world");
        assert!(files.read_chunk(&meta, 6, 6).await.is_err());
    }
}
