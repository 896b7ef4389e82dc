//! Scream/RTP sender - CLI binary.
//!
//! Captures audio from the system input device (or loops a WAV file),
//! streams it as L16 stereo RTP, announces it over SAP and sends RTCP
//! sender reports.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use scream_rtp_common::config::{parse_destination, DEFAULT_MULTICAST};
use scream_rtp_common::sap::SAP_DEFAULT_ADDR;
use scream_rtp_common::{
    init_tracing, CommonArgs, ConfigHandle, DeviceMode, MetricsContext, MetricsServerConfig, NetworkInfo, NodeConfig,
    Shutdown, SystemClock,
};
use sender::{run_sender, SenderContext};

/// Scream/RTP Sender - Stream L16 audio over RTP
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Audio input backend
    #[arg(short, long, value_enum, default_value = "sender-usb")]
    mode: DeviceMode,

    /// Destination IP address (unicast or multicast)
    #[arg(short, long, default_value_t = DEFAULT_MULTICAST, value_parser = parse_destination)]
    destination: Ipv4Addr,

    /// Destination RTP port (RTCP uses port + 1)
    #[arg(short, long, default_value = "4010")]
    port: u16,

    /// Sample rate in Hz
    #[arg(short = 'r', long, default_value = "48000")]
    sample_rate: u32,

    /// Send volume (0.0 - 1.0)
    #[arg(long, default_value = "1.0")]
    volume: f32,

    /// Start muted
    #[arg(long)]
    muted: bool,

    /// Name announced in SDP and used as RTCP CNAME
    #[arg(long, default_value = "scream-node")]
    device_name: String,

    /// Sender report interval in milliseconds
    #[arg(long, default_value = "5000")]
    sr_interval_ms: u64,

    /// SAP group and port
    #[arg(long, default_value_t = SAP_DEFAULT_ADDR)]
    sap_address: SocketAddrV4,

    /// WAV file streamed in sender-spdif mode
    #[arg(short, long, default_value = "input.wav")]
    input: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

impl Args {
    // ---
    fn node_config(&self) -> NodeConfig {
        // ---
        NodeConfig {
            device_mode: self.mode,
            sample_rate: self.sample_rate,
            volume: self.volume,
            muted: self.muted,
            sender_destination_ip: self.destination,
            sender_destination_port: self.port,
            sap_address: self.sap_address,
            device_name: self.device_name.clone(),
            sr_interval_ms: self.sr_interval_ms,
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
    info!("Starting Scream/RTP sender v{VERSION}");

    let cfg = args.node_config();
    if !cfg.device_mode.is_sender() {
        anyhow::bail!("mode {} is not a sender mode", cfg.device_mode);
    }
    info!("Destination: {}", cfg.sender_destination());
    info!("Input: {}", cfg.device_mode);
    if cfg.device_mode == DeviceMode::SenderSpdif {
        info!("WAV input: {:?}", args.input);
    }
    let config = ConfigHandle::new(cfg).context("invalid configuration")?;

    let metrics = MetricsContext::new("sender")?;
    if !args.common.no_metrics {
        info!("Metrics bind: {}", args.common.metrics_bind);
        let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(args.common.metrics_bind));
    }

    let network = NetworkInfo::discover();
    if !network.is_ready() {
        warn!("No local IPv4 address found; SAP origin falls back to {}", network.primary());
    }
    let (_network_tx, network_rx) = watch::channel(network);

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

    let ctx = SenderContext {
        config,
        network: network_rx,
        metrics: metrics.tx.clone(),
        clock: Arc::new(SystemClock::new()),
        wav_input: args.input.clone(),
    };

    run_sender(ctx, shutdown).await
}
