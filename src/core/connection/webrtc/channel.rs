//! Data channel adapter with buffered-amount backpressure.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, error, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use crate::core::config::DRAIN_POLL_INTERVAL;
use crate::core::connection::{ChannelMessage, DataChannel, LinkEvent, LinkEvents};
use crate::core::error::{Result, TransferError};

pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    low_watermark: usize,
    drain: Arc<Notify>,
}

impl WebRtcChannel {
    fn unavailable(&self, e: impl std::fmt::Display) -> TransferError {
        TransferError::ChannelUnavailable(format!("{}: {e}", self.label))
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| self.unavailable(e))
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| self.unavailable(e))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn drained(&self) {
        // The low-threshold callback can fire before we start waiting;
        // re-polling bounds how long a missed notification can park us.
        loop {
            if !self.is_open() || self.dc.buffered_amount().await <= self.low_watermark {
                return;
            }
            let _ = timeout(DRAIN_POLL_INTERVAL, self.drain.notified()).await;
        }
    }
}

/// Wire `dc` into the link's event stream.
pub(super) async fn attach(dc: Arc<RTCDataChannel>, events: LinkEvents, low_watermark: usize) {
    let drain = Arc::new(Notify::new());
    let channel: Arc<dyn DataChannel> = Arc::new(WebRtcChannel {
        dc: dc.clone(),
        label: dc.label().to_string(),
        low_watermark,
        drain: drain.clone(),
    });

    dc.set_buffered_amount_low_threshold(low_watermark).await;
    let low = drain.clone();
    dc.on_buffered_amount_low(Box::new(move || {
        let low = low.clone();
        Box::pin(async move {
            low.notify_waiters();
        })
    }))
    .await;

    let ev = events.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            ev.emit(LinkEvent::ChannelOpen(channel));
        })
    }));

    let ev = events.clone();
    let closed = drain;
    dc.on_close(Box::new(move || {
        let ev = ev.clone();
        let closed = closed.clone();
        Box::pin(async move {
            closed.notify_waiters();
            ev.emit(LinkEvent::ChannelClosed);
        })
    }));

    let label = dc.label().to_string();
    dc.on_error(Box::new(move |err| {
        let label = label.clone();
        Box::pin(async move {
            error!(event = "dc_error", channel = %label, %err, "DataChannel transport error");
        })
    }));

    let ev = events;
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let ev = ev.clone();
        Box::pin(async move {
            if !msg.is_string {
                ev.emit(LinkEvent::Message(ChannelMessage::Binary(msg.data)));
                return;
            }
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => ev.emit(LinkEvent::Message(ChannelMessage::Text(text))),
                Err(e) => warn!(event = "invalid_text_frame", error = %e, "Dropping non UTF-8 text message"),
            }
        })
    }));

    debug!(event = "dc_attached", channel = %dc.label(), "Data channel handlers attached");
}
