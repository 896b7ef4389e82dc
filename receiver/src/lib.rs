//! Scream/RTP receiver library.
//!
//! Receives L16 stereo RTP, maps sender time onto local time from RTCP
//! sender reports, buffers chunks and plays them out on schedule.
//! [`run_receiver`] wires the pieces together and follows configuration
//! changes; the modules can also be used on their own, which is how the
//! integration tests drive them.

pub mod audio;
pub mod error;
pub mod jitter_buffer;
pub mod network;
pub mod playout;
pub mod rtcp;
pub mod sap_listener;
pub mod session;
pub mod stats;
pub mod sync;

pub use audio::{CpalSink, MemorySink, SampleSink, WavFileSink};
pub use error::{BufferError, SinkError, SyncError};
pub use jitter_buffer::{JitterBuffer, JitterBufferConfig, JitterEntry, PushOutcome};
pub use network::{Ingress, RtpDispatcher, RtpDisposition, StreamTarget};
pub use playout::{PlayoutConfig, PlayoutControl, PlayoutScheduler};
pub use session::SessionControl;
pub use stats::{IngressStats, StatsSnapshot};
pub use sync::{SyncConfig, SyncEngine};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use scream_rtp_common::{
    ConfigHandle, ConfigProvider, DeviceMode, EventBus, NetworkInfo, NodeConfig, ReceiverMetrics, Shutdown, WallClock,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::jitter_buffer::SharedJitterBuffer;
use crate::rtcp::RtcpReporter;

/// Everything the receive lifecycle needs from the host process.
#[derive(Clone)]
pub struct ReceiverContext {
    // ---
    pub config: ConfigHandle,
    pub network: watch::Receiver<NetworkInfo>,
    pub metrics: ReceiverMetrics,
    pub events: EventBus,
    pub clock: Arc<dyn WallClock>,

    /// Output file for `receiver-spdif`.
    pub spdif_output: PathBuf,
}

/// Settings that can only change by rebuilding the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PipelineKey {
    // ---
    device_mode: DeviceMode,
    sample_rate: u32,
    max_buffer_size: usize,
    silence_threshold_ms: u64,
    rr_interval_ms: u64,
}

impl PipelineKey {
    // ---
    fn of(cfg: &NodeConfig) -> Self {
        // ---
        Self {
            device_mode: cfg.device_mode,
            sample_rate: cfg.sample_rate,
            max_buffer_size: cfg.buffer.max_buffer_size,
            silence_threshold_ms: cfg.silence_threshold_ms,
            rr_interval_ms: cfg.rr_interval_ms,
        }
    }
}

/// One running receive pipeline at a fixed sample rate.
struct Pipeline {
    // ---
    key: PipelineKey,
    shutdown: Shutdown,
    buffer: SharedJitterBuffer,
    control: Arc<PlayoutControl>,
    playout: std::thread::JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    // ---
    fn start(ctx: &ReceiverContext, cfg: &NodeConfig, targets: watch::Receiver<StreamTarget>, parent: &Shutdown) -> Result<Self> {
        // ---
        let format = cfg.audio_format();
        let shutdown = parent.child();
        info!(
            "Starting {} pipeline at {} Hz ({} byte chunks, buffer {}..{} of {})",
            cfg.device_mode,
            format.sample_rate,
            format.chunk_bytes(),
            cfg.buffer.initial_buffer_size,
            cfg.buffer.max_grow_size,
            cfg.buffer.max_buffer_size
        );

        let sync = Arc::new(SyncEngine::new(SyncConfig::default(), format.sample_rate, Arc::clone(&ctx.clock)));
        let buffer = JitterBuffer::shared(JitterBufferConfig::from_buffer_config(&cfg.buffer, format.chunk_bytes()));
        let control = Arc::new(PlayoutControl::new(cfg.effective_volume()));
        let playout_cfg = PlayoutConfig {
            window_us: format.packet_duration_us(),
            silence_threshold_us: cfg.silence_threshold().as_micros() as u64,
            ..PlayoutConfig::default()
        };

        let dispatcher = RtpDispatcher::new(Arc::clone(&sync), Arc::clone(&buffer), ctx.metrics.clone(), ctx.events.clone());
        let ingress = Ingress::bind(dispatcher, ctx.config.clone(), ctx.metrics.clone())?;
        let reporter = RtcpReporter::new(
            Arc::clone(&sync),
            Arc::clone(&buffer),
            ctx.metrics.clone(),
            cfg.device_name.clone(),
        )?;

        let playout = match cfg.device_mode {
            DeviceMode::ReceiverSpdif => {
                let path = ctx.spdif_output.clone();
                let rate = format.sample_rate;
                playout::spawn_playout(
                    move || WavFileSink::create(path, rate),
                    Arc::clone(&buffer),
                    Arc::clone(&sync),
                    Arc::clone(&control),
                    ctx.events.clone(),
                    ctx.metrics.clone(),
                    playout_cfg,
                    shutdown.clone(),
                )?
            }
            _ => {
                let rate = format.sample_rate;
                playout::spawn_playout(
                    move || CpalSink::new(rate),
                    Arc::clone(&buffer),
                    Arc::clone(&sync),
                    Arc::clone(&control),
                    ctx.events.clone(),
                    ctx.metrics.clone(),
                    playout_cfg,
                    shutdown.clone(),
                )?
            }
        };

        let rr_interval = Duration::from_millis(cfg.rr_interval_ms);
        let tasks = vec![
            tokio::spawn(ingress.run(targets, shutdown.clone())),
            tokio::spawn(reporter.run(rr_interval, shutdown.clone())),
        ];

        Ok(Self {
            key: PipelineKey::of(cfg),
            shutdown,
            buffer,
            control,
            playout,
            tasks,
        })
    }

    /// Applies changes that do not need a rebuild.
    fn apply_live(&self, prev: &NodeConfig, cfg: &NodeConfig) {
        // ---
        if prev.effective_volume() != cfg.effective_volume() {
            info!("Volume {:.2}{}", cfg.volume, if cfg.muted { " (muted)" } else { "" });
            self.control.set_volume(cfg.effective_volume());
        }

        if prev.buffer != cfg.buffer {
            let b = cfg.buffer;
            info!(
                "Jitter buffer growth: initial {}, step {}, max {}",
                b.initial_buffer_size, b.buffer_grow_step, b.max_grow_size
            );
            self.control.pause();
            {
                let mut buffer = self.buffer.lock();
                buffer.flush();
                buffer.update_growth_params(b.initial_buffer_size, b.buffer_grow_step, b.max_grow_size);
            }
            self.control.resume();
        }
    }

    async fn stop(self) {
        // ---
        self.shutdown.trigger();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Receiver task ended abnormally: {}", e);
            }
        }
        let playout = self.playout;
        match tokio::task::spawn_blocking(move || playout.join()).await {
            Ok(Ok(())) => {}
            _ => error!("Playout thread panicked"),
        }
        info!("Pipeline stopped");
    }
}

/// Runs the receive side until `shutdown` clears.
///
/// Session control and the SAP listener live for the whole run. The
/// pipeline (sync engine, jitter buffer, sink, ingress, RTCP) is rebuilt
/// whenever the sample rate, device mode or buffer capacity changes, and
/// is stopped while a sender mode is configured.
///
/// # Errors
///
/// Returns error if the first pipeline cannot be started.
pub async fn run_receiver(ctx: ReceiverContext, shutdown: Shutdown) -> Result<()> {
    // ---
    let mut config_rx = ctx.config.subscribe();
    let mut cfg = config_rx.borrow_and_update().clone();

    let (target_tx, target_rx) = watch::channel(StreamTarget::Unicast);
    let (sap_tx, sap_rx) = mpsc::channel(16);

    let session = SessionControl::new(ctx.config.clone(), ctx.network.clone(), target_tx, ctx.events.clone());
    let session_task = tokio::spawn(session.run(sap_rx, shutdown.clone()));
    let sap_task = tokio::spawn({
        let metrics = ctx.metrics.clone();
        let shutdown = shutdown.clone();
        let addr = cfg.sap_address;
        async move {
            if let Err(e) = sap_listener::run_sap_listener(addr, sap_tx, metrics, shutdown).await {
                warn!("SAP listener unavailable: {:#}", e);
            }
        }
    });

    let mut pipeline = if cfg.device_mode.is_receiver() {
        Some(Pipeline::start(&ctx, &cfg, target_rx.clone(), &shutdown).context("failed to start receive pipeline")?)
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
            Some(p) if p.key == key => {
                p.apply_live(&cfg, &next);
                pipeline = Some(p);
            }
            Some(p) => {
                info!("Rebuilding receive pipeline");
                p.stop().await;
            }
            None => {}
        }

        if pipeline.is_none() && next.device_mode.is_receiver() {
            match Pipeline::start(&ctx, &next, target_rx.clone(), &shutdown) {
                Ok(p) => pipeline = Some(p),
                Err(e) => error!("Failed to start receive pipeline: {:#}", e),
            }
        }
        cfg = next;
    }

    if let Some(p) = pipeline {
        p.stop().await;
    }
    shutdown.trigger();
    let _ = session_task.await;
    let _ = sap_task.await;
    info!("Receiver stopped");
    Ok(())
}
