//! Wire codec: binary chunk frames and JSON control messages.
//!
//! Both travel over the same data channel. Binary messages are always chunk
//! frames, text messages are always control messages.

pub mod control;
pub mod frame;

pub use control::{ControlEvent, ControlMessage, EventTag};
pub use frame::{decode_chunk_frame, encode_chunk_frame, ChunkFrame, TRANSFER_ID_LEN};
