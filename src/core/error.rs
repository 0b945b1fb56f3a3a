//! Error taxonomy of the transfer engine.
//!
//! Every fallible library operation returns [`TransferError`]. How each
//! variant is handled:
//!
//! - `Negotiation`: surfaced, the connect attempt is abandoned; callers may retry.
//! - `DeviceUnavailable` / `ChannelUnavailable`: surfaced, never retried automatically.
//! - `MalformedFrame`: logged by the receive path and the frame dropped.
//! - `TransferNotFound`: a no-op on protocol paths, only surfaced by local API calls.
//! - `AlreadyDone`: a finished transfer cannot be deleted; its record goes away with the connection.
//! - `Persistence`: fails the transfer; data integrity can no longer be guaranteed.
//! - `AckTimeout`: the peer did not resolve a correlated request in time.

use thiserror::Error;
use uuid::Uuid;

use crate::core::connection::DeviceId;

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("session negotiation failed: {0}")]
    Negotiation(String),

    #[error("no open channel to device {0}")]
    DeviceUnavailable(DeviceId),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("transfer {0} not found")]
    TransferNotFound(Uuid),

    #[error("transfer {0} is already done")]
    AlreadyDone(Uuid),

    #[error("durable store failure: {0}")]
    Persistence(String),

    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("no response to message {message_id}")]
    AckTimeout { message_id: Uuid },

    #[error("source read failed: {0}")]
    Source(String),

    #[error("delivery sink failed: {0}")]
    Sink(String),
}

impl TransferError {
    /// Whether re-running the failed operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Negotiation(_) | TransferError::AckTimeout { .. }
        )
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        TransferError::MalformedFrame(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(TransferError::Negotiation("no answer".into()).is_retryable());
        assert!(TransferError::AckTimeout { message_id: Uuid::nil() }.is_retryable());
        assert!(!TransferError::Persistence("disk full".into()).is_retryable());
        assert!(!TransferError::DeviceUnavailable("dev".into()).is_retryable());
    }

    #[test]
    fn json_errors_map_to_malformed_frame() {
        let err: TransferError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, TransferError::MalformedFrame(_)));
    }
}
