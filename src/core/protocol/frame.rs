//! Binary chunk frames.
//!
//! Wire format: `[36 bytes: transfer id, hyphenated UUID text][payload]`.
//! The id prefix lets several transfers interleave on one data channel;
//! the receiver demultiplexes on it and never reorders payloads.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::core::error::{Result, TransferError};

/// Length of the transfer id prefix (canonical hyphenated UUID).
pub const TRANSFER_ID_LEN: usize = uuid::fmt::Hyphenated::LENGTH;

/// A decoded chunk frame. `payload` shares the frame's allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub transfer_id: Uuid,
    pub payload: Bytes,
}

/// Build a chunk frame of exactly `36 + payload.len()` bytes.
pub fn encode_chunk_frame(transfer_id: Uuid, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(TRANSFER_ID_LEN + payload.len());
    let mut id = [0u8; TRANSFER_ID_LEN];
    buf.put_slice(transfer_id.hyphenated().encode_lower(&mut id).as_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a frame into its transfer id and payload without copying the payload.
pub fn decode_chunk_frame(frame: &Bytes) -> Result<ChunkFrame> {
    if frame.len() < TRANSFER_ID_LEN {
        return Err(TransferError::MalformedFrame(format!(
            "chunk frame of {} bytes is shorter than the {TRANSFER_ID_LEN}-byte id prefix",
            frame.len()
        )));
    }
    let prefix = std::str::from_utf8(&frame[..TRANSFER_ID_LEN])
        .map_err(|_| TransferError::MalformedFrame("id prefix is not UTF-8".into()))?;
    let transfer_id = Uuid::try_parse(prefix)
        .map_err(|e| TransferError::MalformedFrame(format!("id prefix is not a UUID: {e}")))?;
    Ok(ChunkFrame {
        transfer_id,
        payload: frame.slice(TRANSFER_ID_LEN..),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        let id = Uuid::new_v4();
        let frame = encode_chunk_frame(id, b"hello");
        assert_eq!(frame.len(), 36 + 5);
        assert_eq!(&frame[..36], id.to_string().as_bytes());
        assert_eq!(&frame[36..], b"hello");

        let decoded = decode_chunk_frame(&frame).unwrap();
        assert_eq!(decoded.transfer_id, id);
        assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
    }

    #[test]
    fn empty_payload_is_legal() {
        let id = Uuid::new_v4();
        let frame = encode_chunk_frame(id, &[]);
        assert_eq!(frame.len(), 36);
        let decoded = decode_chunk_frame(&frame).unwrap();
        assert_eq!(decoded.transfer_id, id);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn short_frame_is_rejected() {
        let frame = Bytes::from_static(b"0123456789");
        assert!(matches!(
            decode_chunk_frame(&frame),
            Err(TransferError::MalformedFrame(_))
        ));
    }

    #[test]
    fn non_uuid_prefix_is_rejected() {
        let mut raw = vec![b'x'; 36];
        raw.extend_from_slice(b"payload");
        assert!(matches!(
            decode_chunk_frame(&Bytes::from(raw)),
            Err(TransferError::MalformedFrame(_))
        ));
    }

    #[test]
    fn payload_bytes_pass_through_untouched() {
        let id = Uuid::new_v4();
        let payload: Vec<u8> = (0..=255u8).collect();
        let decoded = decode_chunk_frame(&encode_chunk_frame(id, &payload)).unwrap();
        assert_eq!(&decoded.payload[..], &payload[..]);
    }
}
