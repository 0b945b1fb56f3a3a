mod workers;

use anyhow::Context;
use spacedrop::utils::data_dir;
use spacedrop::utils::sos::SignalOfStop;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use workers::args::{Args, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();

    // Initialize the global data directory (must happen before any persistence access)
    let data = data_dir::init(args.conf.as_deref()).context("cannot resolve data directory")?;

    // Note: webrtc_ice generates many "unknown TransactionID" warnings for late-arriving
    // STUN responses, which are normal. Filter these out to reduce noise.
    let filter = match args.verbose {
        0 => "warn,spacedrop=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    match args.command {
        Some(Command::Loopback { file, out }) => {
            let segments = data_dir::segments_dir()?;
            tracing::debug!(event = "data_dir", path = %data.display(), "Using data directory");
            workers::loopback::run(&file, &out, &segments, args.ice_servers, sos).await
        }
        None => {
            anyhow::bail!("no command given, see `spacedrop --help`")
        }
    }
}
