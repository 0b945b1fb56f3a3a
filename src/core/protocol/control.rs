//! JSON control messages.
//!
//! Every control message is one text frame:
//!
//! ```json
//! {"messageId": "<uuid>", "event": "transfer-start", "data": {"transferId": "<uuid>"}}
//! ```
//!
//! A request is answered by a `message-resolve` carrying the request's
//! `messageId` and an event-specific payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::error::{Result, TransferError};
use crate::core::transfer::FileMetadata;

/// Wire tags of the control events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventTag {
    MessageResolve,
    GetTransfers,
    FileRequest,
    TransferStart,
    TransferPause,
    TransferDone,
    TransferDelete,
}

impl EventTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventTag::MessageResolve => "message-resolve",
            EventTag::GetTransfers => "get-transfers",
            EventTag::FileRequest => "file-request",
            EventTag::TransferStart => "transfer-start",
            EventTag::TransferPause => "transfer-pause",
            EventTag::TransferDone => "transfer-done",
            EventTag::TransferDelete => "transfer-delete",
        }
    }
}

impl std::fmt::Display for EventTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// Answer to a correlated request. The payload shape depends on the
    /// request: a transfer id string for `file-request`, the transfer table
    /// for `get-transfers`, `null` otherwise.
    MessageResolve(Value),
    GetTransfers,
    FileRequest { file: FileMetadata },
    TransferStart { transfer_id: Uuid },
    TransferPause { transfer_id: Uuid },
    TransferDone { transfer_id: Uuid },
    TransferDelete { transfer_id: Uuid },
}

impl ControlEvent {
    pub fn tag(&self) -> EventTag {
        match self {
            ControlEvent::MessageResolve(_) => EventTag::MessageResolve,
            ControlEvent::GetTransfers => EventTag::GetTransfers,
            ControlEvent::FileRequest { .. } => EventTag::FileRequest,
            ControlEvent::TransferStart { .. } => EventTag::TransferStart,
            ControlEvent::TransferPause { .. } => EventTag::TransferPause,
            ControlEvent::TransferDone { .. } => EventTag::TransferDone,
            ControlEvent::TransferDelete { .. } => EventTag::TransferDelete,
        }
    }

    /// The transfer a lifecycle event refers to.
    pub fn transfer_id(&self) -> Option<Uuid> {
        match self {
            ControlEvent::TransferStart { transfer_id }
            | ControlEvent::TransferPause { transfer_id }
            | ControlEvent::TransferDone { transfer_id }
            | ControlEvent::TransferDelete { transfer_id } => Some(*transfer_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub message_id: Uuid,
    pub event: ControlEvent,
}

// ── Wire shapes ──────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    message_id: Uuid,
    event: EventTag,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferRef {
    transfer_id: Uuid,
}

#[derive(Serialize, Deserialize)]
struct FileRequestData {
    file: FileMetadata,
}

impl ControlMessage {
    /// A new request with a fresh message id.
    pub fn request(event: ControlEvent) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            event,
        }
    }

    /// The `message-resolve` answering `message_id`.
    pub fn resolve(message_id: Uuid, data: Value) -> Self {
        Self {
            message_id,
            event: ControlEvent::MessageResolve(data),
        }
    }

    pub fn encode(&self) -> Result<String> {
        let data = match &self.event {
            ControlEvent::MessageResolve(v) => v.clone(),
            ControlEvent::GetTransfers => Value::Null,
            ControlEvent::FileRequest { file } => {
                serde_json::to_value(FileRequestData { file: file.clone() })?
            }
            ControlEvent::TransferStart { transfer_id }
            | ControlEvent::TransferPause { transfer_id }
            | ControlEvent::TransferDone { transfer_id }
            | ControlEvent::TransferDelete { transfer_id } => serde_json::to_value(TransferRef {
                transfer_id: *transfer_id,
            })?,
        };
        let envelope = Envelope {
            message_id: self.message_id,
            event: self.event.tag(),
            data,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        let Envelope {
            message_id,
            event,
            data,
        } = serde_json::from_str(text)?;

        let transfer_ref = |data: Value| -> Result<Uuid> {
            let r: TransferRef = serde_json::from_value(data).map_err(|e| {
                TransferError::MalformedFrame(format!("{event} payload: {e}"))
            })?;
            Ok(r.transfer_id)
        };

        let event = match event {
            EventTag::MessageResolve => ControlEvent::MessageResolve(data),
            EventTag::GetTransfers => ControlEvent::GetTransfers,
            EventTag::FileRequest => {
                let FileRequestData { file } = serde_json::from_value(data).map_err(|e| {
                    TransferError::MalformedFrame(format!("{event} payload: {e}"))
                })?;
                ControlEvent::FileRequest { file }
            }
            EventTag::TransferStart => ControlEvent::TransferStart {
                transfer_id: transfer_ref(data)?,
            },
            EventTag::TransferPause => ControlEvent::TransferPause {
                transfer_id: transfer_ref(data)?,
            },
            EventTag::TransferDone => ControlEvent::TransferDone {
                transfer_id: transfer_ref(data)?,
            },
            EventTag::TransferDelete => ControlEvent::TransferDelete {
                transfer_id: transfer_ref(data)?,
            },
        };

        Ok(Self { message_id, event })
    }
}
