//! `spacedrop loopback`: two engines in one process, linked over real WebRTC.
//!
//! The holder shares a file from disk; the requester asks for it, starts the
//! transfer and waits for delivery into `out`. Signaling goes through a
//! [`LocalRelay`]; ICE uses loopback host candidates so no network is needed.

use anyhow::{bail, Context};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

use spacedrop::core::config::{TransferConfig, CONNECTION_TIMEOUT};
use spacedrop::core::connection::webrtc::{WebRtcLinkFactory, WebRtcOptions};
use spacedrop::core::connection::{ConnectionManager, ConnectionState, LocalRelay};
use spacedrop::core::engine::TransferEngine;
use spacedrop::core::pipeline::{FileSink, MemorySink, SharedFiles};
use spacedrop::core::store::{FsStore, LocalBufferStore, MemoryStore};
use spacedrop::core::transfer::TransferEvent;
use spacedrop::utils::sos::SignalOfStop;

const HOLDER: &str = "holder";
const REQUESTER: &str = "requester";

/// Interval between progress lines.
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

pub async fn run(
    file: &Path,
    out: &Path,
    segments: &Path,
    ice_servers: Vec<String>,
    sos: SignalOfStop,
) -> anyhow::Result<()> {
    let config = TransferConfig::default();
    let factory = Arc::new(
        WebRtcLinkFactory::new(WebRtcOptions {
            ice_servers,
            include_loopback: true,
            low_watermark: config.low_watermark,
        })
        .context("failed to build WebRTC API")?,
    );
    let relay = LocalRelay::new();

    // Holder: serves the file, never receives.
    let (holder_conns, holder_conn_events) =
        ConnectionManager::new(relay.endpoint(HOLDER), factory.clone());
    relay.register(HOLDER, &holder_conns).await;
    let shared = Arc::new(SharedFiles::new(HOLDER));
    let meta = shared
        .share(file)
        .await
        .with_context(|| format!("cannot share {}", file.display()))?;
    let (holder, _holder_events) = TransferEngine::new(
        holder_conns.clone(),
        Arc::new(LocalBufferStore::new(
            Arc::new(MemoryStore::new()),
            config.flush_threshold,
        )),
        shared,
        Arc::new(MemorySink::new()),
        config,
    );
    holder.spawn(holder_conn_events);

    // Requester: stages segments under the data directory, delivers to `out`.
    let (requester_conns, requester_conn_events) =
        ConnectionManager::new(relay.endpoint(REQUESTER), factory);
    relay.register(REQUESTER, &requester_conns).await;
    let (requester, mut events) = TransferEngine::new(
        requester_conns.clone(),
        Arc::new(LocalBufferStore::new(
            Arc::new(FsStore::new(segments)),
            config.flush_threshold,
        )),
        Arc::new(SharedFiles::new(REQUESTER)),
        Arc::new(FileSink::new(out)),
        config,
    );
    requester.spawn(requester_conn_events);

    info!(event = "loopback_connect", "Negotiating loopback link");
    sos.select(requester_conns.connect(HOLDER))
        .await
        .context("interrupted")?
        .context("failed to connect peers")?;
    wait_open(&holder_conns, REQUESTER).await?;

    let transfer = requester
        .request_transfer(HOLDER, meta)
        .await
        .context("file request was not answered")?;
    let started = Instant::now();
    requester
        .start_transfer(transfer.id)
        .await
        .context("transfer start was not acknowledged")?;

    let outcome = sos.select(follow(&mut events, transfer.id)).await;
    requester_conns.disconnect(HOLDER).await;

    match outcome {
        None => {
            warn!(event = "loopback_interrupted", transfer_id = %transfer.id, "Interrupted");
            let _ = requester.delete_transfer(transfer.id).await;
            bail!("interrupted");
        }
        Some(result) => result?,
    }

    let elapsed = started.elapsed();
    let size = transfer.file.size;
    println!(
        "{} ({}) delivered to {} in {:.2}s, {}/s",
        transfer.file.name,
        format_file_size(size),
        out.display(),
        elapsed.as_secs_f64(),
        format_file_size(rate(size, elapsed)),
    );
    Ok(())
}

async fn wait_open(connections: &ConnectionManager, device: &str) -> anyhow::Result<()> {
    timeout(CONNECTION_TIMEOUT, async {
        while connections.state(device).await != ConnectionState::Open {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .with_context(|| format!("channel to {device} never opened"))
}

/// Report progress until the transfer is delivered or lost.
async fn follow(
    events: &mut mpsc::UnboundedReceiver<TransferEvent>,
    id: uuid::Uuid,
) -> anyhow::Result<()> {
    let mut last_report = Instant::now();
    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::Progress {
                id: got,
                bytes_moved,
                size,
                rate_bps,
            } if got == id => {
                if last_report.elapsed() >= REPORT_INTERVAL {
                    last_report = Instant::now();
                    info!(
                        event = "loopback_progress",
                        transfer_id = %id,
                        bytes = bytes_moved,
                        size,
                        rate = %format_file_size(rate_bps),
                        "{:.1}%",
                        percent(bytes_moved, size)
                    );
                }
            }
            TransferEvent::Delivered { id: got } if got == id => return Ok(()),
            TransferEvent::DeliveryFailed { id: got, reason } if got == id => {
                bail!("delivery failed: {reason}")
            }
            TransferEvent::Failed { id: got, reason } if got == id => {
                bail!("transfer failed: {reason}")
            }
            TransferEvent::Removed { id: got } if got == id => {
                bail!("transfer was removed before completion")
            }
            _ => {}
        }
    }
    bail!("engine stopped")
}

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        done as f64 * 100.0 / total as f64
    }
}

fn rate(bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        bytes
    } else {
        (bytes as f64 / secs) as u64
    }
}

/// Converts bytes to human-readable file size format
fn format_file_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sizes() {
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(2048), "2.00 KB");
        assert_eq!(format_file_size(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn rates_and_percentages() {
        assert_eq!(rate(1000, Duration::from_secs(2)), 500);
        assert_eq!(percent(0, 0), 100.0);
        assert_eq!(percent(50, 200), 25.0);
    }
}
