//! Scream/RTP receiver - CLI binary.
//!
//! Receives L16 RTP streams (unicast, or multicast found via SAP),
//! synchronizes them to the sender clock from RTCP sender reports and
//! plays them through the system audio device or into a WAV file.

use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use receiver::{run_receiver, ReceiverContext};
use scream_rtp_common::sap::SAP_DEFAULT_ADDR;
use scream_rtp_common::{
    init_tracing, BufferConfig, CommonArgs, ConfigHandle, DeviceMode, EventBus, MetricsContext, MetricsServerConfig,
    NetworkInfo, NodeConfig, NodeEvent, Shutdown, SystemClock,
};

/// Scream/RTP Receiver - Receive and play L16 audio streams
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Port to listen on (RTCP uses port + 1)
    #[arg(short, long, default_value = "4010")]
    port: u16,

    /// Output backend
    #[arg(short, long, value_enum, default_value = "receiver-usb")]
    mode: DeviceMode,

    /// Expected sample rate in Hz
    #[arg(short = 'r', long, default_value = "48000")]
    sample_rate: u32,

    /// Playback volume (0.0 - 1.0)
    #[arg(long, default_value = "1.0")]
    volume: f32,

    /// Start muted
    #[arg(long)]
    muted: bool,

    /// Chunks buffered before playout starts
    #[arg(long, default_value = "4")]
    initial_buffer: usize,

    /// Jitter buffer capacity in chunks
    #[arg(long, default_value = "24")]
    max_buffer: usize,

    /// Target fill increase per underrun
    #[arg(long, default_value = "2")]
    grow_step: usize,

    /// Upper bound on the target fill
    #[arg(long, default_value = "16")]
    max_grow: usize,

    /// SAP stream to follow (empty = unicast only)
    #[arg(long, default_value = "")]
    sap_stream: String,

    /// SAP group and port
    #[arg(long, default_value_t = SAP_DEFAULT_ADDR)]
    sap_address: SocketAddrV4,

    /// Name used as RTCP CNAME
    #[arg(long, default_value = "scream-node")]
    device_name: String,

    /// Silence before the sleep signal, in milliseconds
    #[arg(long, default_value = "30000")]
    silence_threshold_ms: u64,

    /// Receiver report interval in milliseconds
    #[arg(long, default_value = "5000")]
    rr_interval_ms: u64,

    /// WAV file written in receiver-spdif mode
    #[arg(long, default_value = "receiver-output.wav")]
    spdif_output: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

impl Args {
    // ---
    fn node_config(&self) -> NodeConfig {
        // ---
        NodeConfig {
            device_mode: self.mode,
            port: self.port,
            sample_rate: self.sample_rate,
            volume: self.volume,
            muted: self.muted,
            buffer: BufferConfig {
                initial_buffer_size: self.initial_buffer,
                max_buffer_size: self.max_buffer,
                buffer_grow_step: self.grow_step,
                max_grow_size: self.max_grow,
            },
            sap_stream_name: self.sap_stream.clone(),
            sap_address: self.sap_address,
            device_name: self.device_name.clone(),
            silence_threshold_ms: self.silence_threshold_ms,
            rr_interval_ms: self.rr_interval_ms,
            ..NodeConfig::default()
        }
    }
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();
    init_tracing(args.common.color)?;
    info!("Starting Scream/RTP receiver v{VERSION}");

    let cfg = args.node_config();
    if !cfg.device_mode.is_receiver() {
        anyhow::bail!("mode {} is not a receiver mode", cfg.device_mode);
    }
    info!("Listening on port: {}", cfg.port);
    info!("Output: {}", cfg.device_mode);
    if !cfg.sap_stream_name.is_empty() {
        info!("Following SAP stream {:?} on {}", cfg.sap_stream_name, cfg.sap_address);
    }
    let config = ConfigHandle::new(cfg).context("invalid configuration")?;

    let metrics = MetricsContext::new("receiver")?;
    if !args.common.no_metrics {
        info!("Metrics bind: {}", args.common.metrics_bind);
        let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(args.common.metrics_bind));
    }

    let network = NetworkInfo::discover();
    if !network.is_ready() {
        warn!("No local IPv4 address found; unicast SAP streams will be rejected");
    }
    let (_network_tx, network_rx) = watch::channel(network);

    let events = EventBus::default();
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            match event {
                NodeEvent::EnterSleep => info!("Playout silent, entering sleep"),
                other => debug!("Event: {:?}", other),
            }
        }
    });

    let shutdown = Shutdown::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
            }
            shutdown.trigger();
        }
    });

    let ctx = ReceiverContext {
        config,
        network: network_rx,
        metrics: metrics.rx.clone(),
        events,
        clock: Arc::new(SystemClock::new()),
        spdif_output: args.spdif_output.clone(),
    };

    info!("Ready to receive audio...");
    run_receiver(ctx, shutdown).await
}
