//! Scream/RTP sender library.
//!
//! Captures PCM (audio input device or a looped WAV file), paces it into
//! L16 stereo RTP packets at the audio rate, announces the stream over
//! SAP and emits RTCP sender reports. [`run_sender`] wires the pieces
//! together; the pacer and sockets can also be driven directly, which is
//! how the integration tests use them.

pub mod audio;
pub mod error;
pub mod network;
pub mod pacer;
pub mod rtcp;
pub mod sap;

pub use audio::{spawn_capture, CpalSource, PcmRing, RampSource, SampleSource, WavFileSource};
pub use error::{AnnounceError, SourceError};
pub use network::{RtpSender, SendOutcome, SendStats, Transmitter};
pub use pacer::{NoopTap, Pacer, PacerStats, PacerTick, PcmTap, SendSession};
pub use rtcp::{build_sender_report, RtcpSender, SendStatus};
pub use sap::{build_announcement, run_sap_emitter};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use scream_rtp_common::{
    ConfigHandle, ConfigProvider, DeviceMode, NetworkInfo, NodeConfig, SenderMetrics, Shutdown, WallClock,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Chunks of capture audio held between the input device and the pacer.
const CAPTURE_RING_CHUNKS: usize = 16;

/// Everything the send lifecycle needs from the host process.
#[derive(Clone)]
pub struct SenderContext {
    // ---
    pub config: ConfigHandle,
    pub network: watch::Receiver<NetworkInfo>,
    pub metrics: SenderMetrics,
    pub clock: Arc<dyn WallClock>,

    /// Input file for `sender-spdif`.
    pub wav_input: PathBuf,
}

/// Settings that can only change by rebuilding the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PipelineKey {
    // ---
    device_mode: DeviceMode,
    sample_rate: u32,
    sr_interval_ms: u64,
}

impl PipelineKey {
    // ---
    fn of(cfg: &NodeConfig) -> Self {
        // ---
        Self {
            device_mode: cfg.device_mode,
            sample_rate: cfg.sample_rate,
            sr_interval_ms: cfg.sr_interval_ms,
        }
    }
}

/// One running send session: a fresh SSRC, its transmitter, RTCP and SAP.
struct Pipeline {
    // ---
    key: PipelineKey,
    shutdown: Shutdown,
    capture: Option<std::thread::JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    // ---
    fn start(ctx: &SenderContext, cfg: &NodeConfig, parent: &Shutdown) -> Result<Self> {
        // ---
        let format = cfg.audio_format();
        let shutdown = parent.child();
        let session = SendSession::random(format.ticks_per_packet());
        let ssrc = session.ssrc();
        info!(
            "Starting {} pipeline at {} Hz ({} byte chunks every {} us)",
            cfg.device_mode,
            format.sample_rate,
            format.chunk_bytes(),
            format.packet_duration_us()
        );

        let sender = RtpSender::new(cfg.sender_destination(), ctx.metrics.clone())?;
        let status = Arc::new(Mutex::new(SendStatus::default()));
        let period = Duration::from_micros(format.packet_duration_us());

        let mut capture = None;
        let transmit_task = match cfg.device_mode {
            DeviceMode::SenderSpdif => {
                let source = WavFileSource::open(&ctx.wav_input, format.sample_rate)
                    .with_context(|| format!("failed to open WAV input {:?}", ctx.wav_input))?;
                let pacer = Pacer::new(source, NoopTap, session, format.chunk_bytes(), ctx.metrics.clone());
                let tx = Transmitter::new(
                    pacer,
                    sender,
                    ctx.config.clone(),
                    Arc::clone(&status),
                    Arc::clone(&ctx.clock),
                    period,
                );
                tokio::spawn(tx.run(shutdown.clone()))
            }
            _ => {
                let ring = PcmRing::with_chunks(CAPTURE_RING_CHUNKS);
                capture = Some(spawn_capture(format.sample_rate, ring.clone(), shutdown.clone())?);
                let pacer = Pacer::new(ring, NoopTap, session, format.chunk_bytes(), ctx.metrics.clone());
                let tx = Transmitter::new(
                    pacer,
                    sender,
                    ctx.config.clone(),
                    Arc::clone(&status),
                    Arc::clone(&ctx.clock),
                    period,
                );
                tokio::spawn(tx.run(shutdown.clone()))
            }
        };

        let rtcp = RtcpSender::new(
            ssrc,
            status,
            ctx.config.clone(),
            Arc::clone(&ctx.clock),
            ctx.metrics.clone(),
        )?;
        let sr_interval = Duration::from_millis(cfg.sr_interval_ms);

        let sap_task = tokio::spawn({
            let config = ctx.config.clone();
            let network = ctx.network.clone();
            let metrics = ctx.metrics.clone();
            let shutdown = shutdown.clone();
            async move {
                if let Err(e) = run_sap_emitter(config, network, ssrc, metrics, shutdown).await {
                    warn!("SAP emitter unavailable: {:#}", e);
                }
            }
        });

        let tasks = vec![
            transmit_task,
            tokio::spawn(rtcp.run(sr_interval, shutdown.clone())),
            sap_task,
        ];

        Ok(Self {
            key: PipelineKey::of(cfg),
            shutdown,
            capture,
            tasks,
        })
    }

    async fn stop(self) {
        // ---
        self.shutdown.trigger();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Sender task ended abnormally: {}", e);
            }
        }
        if let Some(capture) = self.capture {
            match tokio::task::spawn_blocking(move || capture.join()).await {
                Ok(Ok(())) => {}
                _ => error!("Capture thread panicked"),
            }
        }
        info!("Pipeline stopped");
    }
}

/// Runs the send side until `shutdown` clears.
///
/// Volume, mute and destination changes are applied live by the
/// transmitter. A change of mode, sample rate or SR interval rebuilds the
/// pipeline with a new SSRC; a receiver mode stops it.
///
/// # Errors
///
/// Returns error if the first pipeline cannot be started.
pub async fn run_sender(ctx: SenderContext, shutdown: Shutdown) -> Result<()> {
    // ---
    let mut config_rx = ctx.config.subscribe();
    let cfg = config_rx.borrow_and_update().clone();

    let mut pipeline = if cfg.device_mode.is_sender() {
        Some(Pipeline::start(&ctx, &cfg, &shutdown).context("failed to start send pipeline")?)
    } else {
        None
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = config_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let next = config_rx.borrow_and_update().clone();
        let key = PipelineKey::of(&next);

        match pipeline.take() {
            Some(p) if p.key == key => pipeline = Some(p),
            Some(p) => {
                info!("Rebuilding send pipeline");
                p.stop().await;
            }
            None => {}
        }

        if pipeline.is_none() && next.device_mode.is_sender() {
            match Pipeline::start(&ctx, &next, &shutdown) {
                Ok(p) => pipeline = Some(p),
                Err(e) => error!("Failed to start send pipeline: {:#}", e),
            }
        }
    }

    if let Some(p) = pipeline {
        p.stop().await;
    }
    info!("Sender stopped");
    Ok(())
}
