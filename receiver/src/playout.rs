//! Playout scheduler: drains the jitter buffer into a sample sink on time.
//!
//! The scheduler is step-driven. [`PlayoutScheduler::poll`] does at most
//! one unit of work and reports how long the caller may sleep, so tests
//! drive it with a manual clock and the runtime drives it from a dedicated
//! thread.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use scream_rtp_common::observability::ReceiverMetrics;
use scream_rtp_common::{EventBus, NodeEvent, Shutdown};
use tracing::{debug, error, info, warn};

use crate::audio::SampleSink;
use crate::error::SinkError;
use crate::jitter_buffer::{JitterEntry, SharedJitterBuffer};
use crate::sync::SyncEngine;

/// Longest single sleep of the playout thread, so shutdown stays prompt.
const MAX_SLEEP: Duration = Duration::from_millis(2);
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// A gap this long between idle checks restarts silence tracking.
const ABSURD_IDLE_GAP_US: u64 = 30_000_000;

/// Playout timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayoutConfig {
    // ---
    /// Nominal packet duration; also the unsynchronized write cadence.
    pub window_us: u64,
    pub max_early_us: u64,
    pub max_late_us: u64,

    /// Continuous silence before `EnterSleep` is published.
    pub silence_threshold_us: u64,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        // ---
        Self {
            window_us: 6_000,
            max_early_us: 500_000,
            max_late_us: 200_000,
            silence_threshold_us: 30_000_000,
        }
    }
}

/// Pause flag and volume shared with the lifecycle.
#[derive(Debug)]
pub struct PlayoutControl {
    // ---
    paused: AtomicBool,
    volume_bits: AtomicU32,
}

impl PlayoutControl {
    // ---
    pub fn new(volume: f32) -> Self {
        // ---
        Self {
            paused: AtomicBool::new(false),
            volume_bits: AtomicU32::new(volume.to_bits()),
        }
    }

    pub fn pause(&self) {
        // ---
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        // ---
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        // ---
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_volume(&self, volume: f32) {
        // ---
        self.volume_bits.store(volume.to_bits(), Ordering::SeqCst);
    }

    pub fn volume(&self) -> f32 {
        // ---
        f32::from_bits(self.volume_bits.load(Ordering::SeqCst))
    }
}

/// Why a chunk was discarded instead of played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    TooEarly,
    TooLate,
}

/// Result of one scheduler step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing buffered.
    Idle,

    /// Paused by the lifecycle.
    Paused,

    /// A chunk is pending; call again after this many microseconds.
    Wait(u64),

    Wrote { synchronized: bool },
    Dropped(DropReason),

    /// The sink rejected the chunk.
    SinkFailed,
}

/// Playout counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayoutStats {
    pub writes: u64,
    pub unsynchronized_writes: u64,
    pub early_drops: u64,
    pub late_drops: u64,
    pub sink_errors: u64,
    pub sleep_signals: u64,
}

pub struct PlayoutScheduler<K: SampleSink> {
    // ---
    sink: K,
    buffer: SharedJitterBuffer,
    sync: Arc<SyncEngine>,
    control: Arc<PlayoutControl>,
    events: EventBus,
    metrics: ReceiverMetrics,
    config: PlayoutConfig,

    // Popped chunk waiting for its playout time. Reused across polls.
    entry: JitterEntry,
    has_pending: bool,
    pending_wait_us: i64,

    // Due time of the chunk just written, until the next pop.
    last_due_us: Option<u64>,

    next_unsync_write_us: u64,
    silence_started_us: u64,
    last_idle_check_us: u64,
    sleep_signalled: bool,
    applied_volume: Option<f32>,
    stats: PlayoutStats,
}

impl<K: SampleSink> PlayoutScheduler<K> {
    // ---
    pub fn new(
        sink: K,
        buffer: SharedJitterBuffer,
        sync: Arc<SyncEngine>,
        control: Arc<PlayoutControl>,
        events: EventBus,
        metrics: ReceiverMetrics,
        config: PlayoutConfig,
    ) -> Self {
        // ---
        let chunk_bytes = buffer.lock().config().chunk_bytes;
        Self {
            sink,
            buffer,
            sync,
            control,
            events,
            metrics,
            config,
            entry: JitterEntry::with_capacity(chunk_bytes),
            has_pending: false,
            pending_wait_us: 0,
            last_due_us: None,
            next_unsync_write_us: 0,
            silence_started_us: 0,
            last_idle_check_us: 0,
            sleep_signalled: false,
            applied_volume: None,
            stats: PlayoutStats::default(),
        }
    }

    pub fn stats(&self) -> PlayoutStats {
        // ---
        self.stats
    }

    pub fn sink(&self) -> &K {
        // ---
        &self.sink
    }

    fn apply_volume(&mut self) {
        // ---
        let volume = self.control.volume();
        if self.applied_volume != Some(volume) {
            debug!("Sink volume -> {:.2}", volume);
            self.sink.set_volume(volume);
            self.applied_volume = Some(volume);
        }
    }

    fn note_silence(&mut self, now_us: u64) {
        // ---
        if self.silence_started_us == 0
            || (self.last_idle_check_us != 0
                && now_us.saturating_sub(self.last_idle_check_us) >= ABSURD_IDLE_GAP_US)
        {
            self.silence_started_us = now_us;
        }
        self.last_idle_check_us = now_us;
        if !self.sleep_signalled
            && now_us.saturating_sub(self.silence_started_us) > self.config.silence_threshold_us
        {
            info!(
                "No audio for {} s, signalling sleep",
                self.config.silence_threshold_us / 1_000_000
            );
            self.events.publish(NodeEvent::EnterSleep);
            self.sleep_signalled = true;
            self.stats.sleep_signals += 1;
        }
    }

    fn write_pending(&mut self) -> Result<(), SinkError> {
        // ---
        self.has_pending = false;
        match self.sink.write(&self.entry.payload) {
            Ok(()) => {
                self.stats.writes += 1;
                self.metrics.sink_writes_total.inc();
                Ok(())
            }
            Err(e) => {
                self.stats.sink_errors += 1;
                self.metrics.sink_errors_total.inc();
                if self.stats.sink_errors.is_power_of_two() {
                    warn!("{} sink write failed: {}", self.sink.name(), e);
                }
                Err(e)
            }
        }
    }

    /// Runs one scheduling step at monotonic time `now_us`.
    pub fn poll(&mut self, now_us: u64) -> PollOutcome {
        // ---
        if self.control.is_paused() {
            self.has_pending = false;
            self.last_due_us = None;
            self.silence_started_us = 0;
            self.last_idle_check_us = 0;
            return PollOutcome::Paused;
        }
        self.apply_volume();

        if !self.has_pending {
            let behind_write = self.last_due_us.take();
            let popped = {
                let mut buffer = self.buffer.lock();
                let result = buffer.pop_into(&mut self.entry);
                self.metrics.buffer_fill_chunks.set(buffer.len() as i64);
                result
            };
            if popped.is_err() {
                self.note_silence(now_us);
                return PollOutcome::Idle;
            }
            self.has_pending = true;
            self.silence_started_us = 0;
            self.sleep_signalled = false;

            if self.entry.is_synchronized() {
                // Popped straight after a write: headroom counts from that
                // chunk's due time, not from the poll instant.
                let reference = behind_write.map_or(now_us, |due| due.min(now_us));
                self.pending_wait_us = self.entry.playout_mono_us as i64 - reference as i64;
                self.metrics
                    .playout_wait_seconds
                    .observe(self.pending_wait_us.max(0) as f64 / 1e6);
            }
        }

        if !self.entry.is_synchronized() {
            // Fallback cadence: one chunk per window, restarting after a gap.
            if now_us + self.config.window_us * 4 < self.next_unsync_write_us
                || self.next_unsync_write_us + self.config.window_us * 4 < now_us
            {
                self.next_unsync_write_us = now_us;
            }
            if now_us < self.next_unsync_write_us {
                return PollOutcome::Wait(self.next_unsync_write_us - now_us);
            }
            self.next_unsync_write_us += self.config.window_us;
            self.stats.unsynchronized_writes += 1;
            return match self.write_pending() {
                Ok(()) => PollOutcome::Wrote { synchronized: false },
                Err(_) => PollOutcome::SinkFailed,
            };
        }

        let wait_us = self.entry.playout_mono_us as i64 - now_us as i64;
        if wait_us > self.config.max_early_us as i64 {
            self.has_pending = false;
            self.stats.early_drops += 1;
            self.metrics.playout_early_drops_total.inc();
            return PollOutcome::Dropped(DropReason::TooEarly);
        }
        if wait_us < -(self.config.max_late_us as i64) {
            self.has_pending = false;
            self.stats.late_drops += 1;
            self.metrics.playout_late_drops_total.inc();
            return PollOutcome::Dropped(DropReason::TooLate);
        }
        if wait_us > 0 {
            return PollOutcome::Wait(wait_us as u64);
        }

        let ssrc = self.entry.ssrc;
        let due = self.entry.playout_mono_us;
        match self.write_pending() {
            Ok(()) => {
                self.last_due_us = Some(due);
                self.sync.pll_observe(ssrc, self.pending_wait_us, self.config.window_us);
                PollOutcome::Wrote { synchronized: true }
            }
            Err(_) => PollOutcome::SinkFailed,
        }
    }
}

/// Starts the playout loop on its own OS thread.
///
/// The sink is built by `make_sink` on the new thread, since device streams
/// are generally not `Send`. The thread exits when `shutdown` clears.
///
/// # Errors
///
/// Returns error if the thread cannot be spawned.
#[allow(clippy::too_many_arguments)]
pub fn spawn_playout<K, F>(
    make_sink: F,
    buffer: SharedJitterBuffer,
    sync: Arc<SyncEngine>,
    control: Arc<PlayoutControl>,
    events: EventBus,
    metrics: ReceiverMetrics,
    config: PlayoutConfig,
    shutdown: Shutdown,
) -> Result<JoinHandle<()>>
where
    K: SampleSink + 'static,
    F: FnOnce() -> Result<K, SinkError> + Send + 'static,
{
    // ---
    thread::Builder::new()
        .name("playout".into())
        .spawn(move || {
            let sink = match make_sink() {
                Ok(sink) => sink,
                Err(e) => {
                    error!("Failed to open sample sink: {}", e);
                    return;
                }
            };
            info!("Playout started on {} sink", sink.name());

            let clock = Arc::clone(sync.clock());
            let mut scheduler = PlayoutScheduler::new(sink, buffer, sync, control, events, metrics, config);

            while shutdown.is_running() {
                match scheduler.poll(clock.now_monotonic_us()) {
                    PollOutcome::Idle | PollOutcome::Paused | PollOutcome::SinkFailed => thread::sleep(IDLE_SLEEP),
                    PollOutcome::Wait(us) => thread::sleep(Duration::from_micros(us).min(MAX_SLEEP)),
                    PollOutcome::Wrote { .. } | PollOutcome::Dropped(_) => {}
                }
            }

            let stats = scheduler.stats();
            info!(
                "Playout stopped: {} writes ({} unsynchronized), {} early / {} late drops, {} sink errors",
                stats.writes, stats.unsynchronized_writes, stats.early_drops, stats.late_drops, stats.sink_errors
            );
        })
        .context("failed to spawn playout thread")
}
