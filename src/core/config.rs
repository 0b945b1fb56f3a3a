//! Centralized configuration constants for spacedrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (the 36-byte id prefix, control
//! event tags) stay in `core::protocol`.
//!
//! None of these values are negotiated with the peer: both sides of a
//! transfer are expected to run with the same constants.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Nominal chunk size in bytes (16 KB).
///
/// One chunk is one data channel message. 16 KB is the largest message size
/// every WebRTC stack delivers without fragmentation issues, so the frame
/// (36 byte id + payload) stays interoperable with browser peers.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// High water mark for the data channel send buffer (bytes).
/// When `buffered_amount` reaches this value, the pump stops issuing chunks
/// until the buffer drains below [`DC_BUFFERED_AMOUNT_LOW`].
pub const DC_BUFFERED_AMOUNT_HIGH: usize = 4 * 1024 * 1024; // 4 MB

/// Low water mark: the channel signals "drained" once `buffered_amount`
/// falls below this value and parked pumps resume.
pub const DC_BUFFERED_AMOUNT_LOW: usize = 512 * 1024; // 512 KB

/// Upper bound on a single parked wait before the pump re-polls the
/// channel. Guards against a lost buffered-amount-low notification.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Number of chunks a pump sends before yielding to the scheduler so
/// concurrent transfers and inbound handling are not starved.
pub const PUMP_YIELD_INTERVAL: u32 = 100;

// ── Local Buffer Store ───────────────────────────────────────────────────────

/// Receiver staging threshold: inbound chunk bytes are held in memory and
/// written to the durable store as one segment every 64 MB (4096 chunks).
pub const STORE_FLUSH_THRESHOLD: usize = 64 * 1024 * 1024;

// ── Control channel ──────────────────────────────────────────────────────────

/// How long a correlated control request waits for its `message-resolve`
/// before failing with `AckTimeout`.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(30);

// ── Connection / Network ─────────────────────────────────────────────────────

/// Label of the single ordered, reliable data channel.
pub const DATA_CHANNEL_LABEL: &str = "data-channel";

/// Maximum time for a full offer/answer exchange through the relay.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout waiting for the data channel to open after negotiation.
pub const DATA_CHANNEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest message a default SCTP association accepts (64 KB).
///
/// The message size is left at the stack default, so a chunk frame must
/// fit in it.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default STUN server used when the host does not supply any.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

// ── Progress ─────────────────────────────────────────────────────────────────

/// Sliding window over which the transfer rate is computed.
pub const RATE_WINDOW: Duration = Duration::from_secs(2);

// ── Runtime bundle ───────────────────────────────────────────────────────────

/// The constants above gathered into one value handed to the engine.
///
/// Production code always uses [`TransferConfig::default`]; tests shrink the
/// thresholds to exercise backpressure and flushing with small files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub flush_threshold: usize,
    pub ack_timeout: Duration,
    pub yield_interval: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            high_watermark: DC_BUFFERED_AMOUNT_HIGH,
            low_watermark: DC_BUFFERED_AMOUNT_LOW,
            flush_threshold: STORE_FLUSH_THRESHOLD,
            ack_timeout: ACK_TIMEOUT,
            yield_interval: PUMP_YIELD_INTERVAL,
        }
    }
}

/// Number of chunks a file of `size` bytes is split into.
pub fn total_chunks(size: u64, chunk_size: usize) -> u64 {
    size.div_ceil(chunk_size.max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_for_one_megabyte() {
        let size = 1_000_000u64;
        assert_eq!(total_chunks(size, CHUNK_SIZE), 62);
        assert_eq!(size - (CHUNK_SIZE as u64) * (size / CHUNK_SIZE as u64), 9936);
    }

    #[test]
    fn chunk_count_edges() {
        assert_eq!(total_chunks(0, CHUNK_SIZE), 0);
        assert_eq!(total_chunks(CHUNK_SIZE as u64, CHUNK_SIZE), 1);
        assert_eq!(total_chunks(51_200, CHUNK_SIZE), 4);
    }

    #[test]
    fn chunk_frame_fits_default_message_size() {
        let frame = CHUNK_SIZE + crate::core::protocol::TRANSFER_ID_LEN;
        assert!(frame <= MAX_MESSAGE_SIZE);
    }

    #[test]
    fn watermarks_are_ordered() {
        let cfg = TransferConfig::default();
        assert!(cfg.low_watermark < cfg.high_watermark);
        assert!(cfg.chunk_size < cfg.flush_threshold);
    }
}
