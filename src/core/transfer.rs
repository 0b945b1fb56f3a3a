//! Transfer records and their lifecycle.
//!
//! A Transfer represents one file moving in one direction between this
//! process and a single remote device. Both sides keep a record under the
//! same id (assigned by the file holder when it answers a `file-request`):
//! the holder's record is `Outbound`, the requester's is `Inbound`.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;
use uuid::Uuid;

use crate::core::config::RATE_WINDOW;
use crate::core::connection::DeviceId;

// ── File metadata (sent over the wire) ───────────────────────────────────────

/// Description of a shared file, as exchanged in `file-request`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Content identifier of the file on the holder's side.
    pub id: String,
    /// Device that holds the file.
    pub device_id: DeviceId,
    pub name: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

// ── Transfer State Machine ───────────────────────────────────────────────────

/// `Init → Ongoing ⇄ Paused → Done`, with `Failed` as the terminal error state.
/// Deletion is not a state: the record is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    /// Registered, neither side has agreed to move bytes yet.
    Init,
    Ongoing,
    Paused,
    /// All bytes moved. Implies `bytes_moved == file.size`.
    Done,
    /// Data integrity could not be guaranteed (store or source failure).
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Done | TransferState::Failed)
    }

    /// Whether a control message may move a transfer from `self` to `next`.
    pub fn can_become(&self, next: TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (Init | Paused | Ongoing, Ongoing) => true,
            (Init | Ongoing | Paused, Paused) => true,
            (Ongoing | Paused | Init, Done) => true,
            (s, Failed) => !s.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    /// We hold the file and send it.
    #[serde(rename = "out")]
    Outbound,
    /// We requested the file and receive it.
    #[serde(rename = "in")]
    Inbound,
}

// ── Transfer ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Transfer {
    pub id: Uuid,
    pub direction: TransferDirection,
    pub device: DeviceId,
    pub file: FileMetadata,
    pub bytes_moved: u64,
    pub state: TransferState,
    /// Incremented every time a pump is scheduled; stale pumps compare
    /// their epoch and exit.
    pub(crate) pump_epoch: u64,
    pub(crate) rate: RateMeter,
}

impl Transfer {
    pub fn new_outbound(id: Uuid, device: DeviceId, file: FileMetadata) -> Self {
        Self::new(id, TransferDirection::Outbound, device, file)
    }

    pub fn new_inbound(id: Uuid, device: DeviceId, file: FileMetadata) -> Self {
        Self::new(id, TransferDirection::Inbound, device, file)
    }

    fn new(id: Uuid, direction: TransferDirection, device: DeviceId, file: FileMetadata) -> Self {
        Self {
            id,
            direction,
            device,
            file,
            bytes_moved: 0,
            state: TransferState::Init,
            pump_epoch: 0,
            rate: RateMeter::default(),
        }
    }

    /// Record `n` moved bytes, never exceeding the file size.
    pub fn advance(&mut self, n: u64) -> u64 {
        self.bytes_moved = (self.bytes_moved + n).min(self.file.size);
        self.rate.record(n);
        self.bytes_moved
    }

    /// Whether every byte of the file has been moved.
    pub fn is_complete(&self) -> bool {
        self.bytes_moved >= self.file.size
    }

    /// Move to `Done`; keeps `bytes_moved == size` true for done transfers.
    pub fn complete(&mut self) {
        self.bytes_moved = self.file.size;
        self.state = TransferState::Done;
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            id: self.id,
            direction: self.direction,
            device_id: self.device.clone(),
            file: self.file.clone(),
            transfered_bytes: self.bytes_moved,
            state: self.state,
        }
    }
}

/// Read-only copy of a transfer; also the wire shape of one `get-transfers`
/// table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSnapshot {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub direction: TransferDirection,
    pub device_id: DeviceId,
    pub file: FileMetadata,
    pub transfered_bytes: u64,
    pub state: TransferState,
}

/// Notifications for the host (UI, power management, delivery reporting).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Registered(TransferSnapshot),
    StateChanged {
        id: Uuid,
        state: TransferState,
    },
    Progress {
        id: Uuid,
        bytes_moved: u64,
        size: u64,
        /// Throughput over the last couple of seconds.
        rate_bps: u64,
    },
    /// Deleted locally or by the peer, or released with its connection.
    Removed {
        id: Uuid,
    },
    Failed {
        id: Uuid,
        reason: String,
    },
    /// The Delivery Sink accepted every byte of an inbound transfer.
    Delivered {
        id: Uuid,
    },
    DeliveryFailed {
        id: Uuid,
        reason: String,
    },
}

// ── Transfer table ───────────────────────────────────────────────────────────

/// All transfers known to one engine, indexed by id and by device.
#[derive(Debug, Default)]
pub struct TransferTable {
    transfers: HashMap<Uuid, Transfer>,
    by_device: HashMap<DeviceId, HashSet<Uuid>>,
}

impl TransferTable {
    pub fn insert(&mut self, transfer: Transfer) {
        self.by_device
            .entry(transfer.device.clone())
            .or_default()
            .insert(transfer.id);
        self.transfers.insert(transfer.id, transfer);
    }

    pub fn get(&self, id: &Uuid) -> Option<&Transfer> {
        self.transfers.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Transfer> {
        self.transfers.get_mut(id)
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<Transfer> {
        let transfer = self.transfers.remove(id)?;
        if let Some(ids) = self.by_device.get_mut(&transfer.device) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_device.remove(&transfer.device);
            }
        }
        Some(transfer)
    }

    /// Remove every transfer bound to `device`.
    pub fn remove_device(&mut self, device: &str) -> Vec<Transfer> {
        let ids = self.by_device.remove(device).unwrap_or_default();
        ids.iter().filter_map(|id| self.transfers.remove(id)).collect()
    }

    pub fn for_device(&self, device: &str) -> Vec<&Transfer> {
        self.by_device
            .get(device)
            .map(|ids| ids.iter().filter_map(|id| self.transfers.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn values(&self) -> impl Iterator<Item = &Transfer> {
        self.transfers.values()
    }
}

// ── Rate ─────────────────────────────────────────────────────────────────────

/// Sliding-window throughput estimate.
#[derive(Debug, Default)]
pub(crate) struct RateMeter {
    samples: VecDeque<(Instant, u64)>,
}

impl RateMeter {
    pub fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > RATE_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second over the window.
    pub fn bytes_per_sec(&self) -> u64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0;
        };
        let total: u64 = self.samples.iter().map(|(_, n)| n).sum();
        let elapsed = last.0.duration_since(first.0).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return total;
        }
        (total as f64 / elapsed) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(size: u64) -> FileMetadata {
        FileMetadata {
            id: "file-1".into(),
            device_id: "holder".into(),
            name: "notes.txt".into(),
            content_type: "text/plain".into(),
            size,
            thumbnail: None,
        }
    }

    #[test]
    fn advance_is_capped_at_file_size() {
        let mut t = Transfer::new_inbound(Uuid::new_v4(), "dev".into(), file(100));
        assert_eq!(t.advance(60), 60);
        assert!(!t.is_complete());
        assert_eq!(t.advance(60), 100);
        assert!(t.is_complete());
        t.complete();
        assert_eq!(t.state, TransferState::Done);
        assert_eq!(t.bytes_moved, t.file.size);
    }

    #[test]
    fn state_transitions() {
        use TransferState::*;
        assert!(Init.can_become(Ongoing));
        assert!(Ongoing.can_become(Paused));
        assert!(Paused.can_become(Ongoing));
        assert!(Ongoing.can_become(Done));
        assert!(!Done.can_become(Ongoing));
        assert!(!Done.can_become(Failed));
        assert!(!Failed.can_become(Paused));
    }

    #[test]
    fn table_indexes_by_device() {
        let mut table = TransferTable::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        table.insert(Transfer::new_outbound(a, "dev-1".into(), file(10)));
        table.insert(Transfer::new_outbound(b, "dev-2".into(), file(10)));

        assert_eq!(table.for_device("dev-1").len(), 1);
        let removed = table.remove_device("dev-1");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, a);
        assert!(table.get(&a).is_none());
        assert!(table.get(&b).is_some());
        assert!(table.for_device("dev-1").is_empty());
    }

    #[test]
    fn metadata_uses_wire_field_names() {
        let json = serde_json::to_value(file(5)).unwrap();
        assert_eq!(json["deviceId"], "holder");
        assert_eq!(json["type"], "text/plain");
        assert!(json.get("thumbnail").is_none());
    }

    #[test]
    fn snapshot_serializes_direction_as_in_out() {
        let t = Transfer::new_outbound(Uuid::new_v4(), "dev".into(), file(5));
        let json = serde_json::to_value(t.snapshot()).unwrap();
        assert_eq!(json["type"], "out");
        assert_eq!(json["state"], "init");
    }
}
