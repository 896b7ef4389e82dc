//! RTP/RTCP timing: sequence and timestamp extension, the sender-clock to
//! local-monotonic linear map, and the PLL that trims it.
//!
//! All per-SSRC state lives in one [`SyncTable`] behind a single mutex. The
//! ingress task, the RTCP tick and the playout thread reach it through a
//! shared [`SyncEngine`], which also owns the clock.

pub mod pll;
pub mod state;
pub mod table;
pub mod unwrap;

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use scream_rtp_common::rtcp::{ReportBlock, SenderReport};
use scream_rtp_common::WallClock;

pub use pll::{PllConfig, PllOutcome};
pub use state::{SourceSummary, SrOutcome};
pub use table::{RtpAdmission, SyncTable};
pub use unwrap::{SeqUpdate, SequenceTracker, TimestampUnwrapper};

use crate::error::SyncError;

/// Timing constants for mapping and table management.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncConfig {
    // ---
    /// Added to the mapped capture time to get the playout time.
    pub target_latency_us: u64,

    /// An SR older than this no longer anchors playout.
    pub sr_max_age_us: u64,

    /// Offset jump that triggers a reseed.
    pub sr_offset_step_us: f64,

    /// Minimum time since the last PLL update before a reseed.
    pub reseed_holdoff_us: u64,

    /// Slope deviation beyond which a reseed also resets the slope.
    pub reseed_slope_ppm: f64,
    pub stale_timeout_us: u64,
    pub max_early_us: u64,
    pub max_late_us: u64,
    pub max_ssrc: usize,
    pub pll: PllConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        // ---
        Self {
            target_latency_us: 30_000,
            sr_max_age_us: 15_000_000,
            sr_offset_step_us: 100_000.0,
            reseed_holdoff_us: 200_000,
            reseed_slope_ppm: 50.0,
            stale_timeout_us: 30_000_000,
            max_early_us: 500_000,
            max_late_us: 200_000,
            max_ssrc: 4,
            pll: PllConfig::default(),
        }
    }
}

/// Result of admitting one RTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ingested {
    // ---
    pub admission: RtpAdmission,

    /// Playout mapping; only computed for the primary SSRC.
    pub playout: Option<Result<u64, SyncError>>,

    pub arrival_us: u64,
}

/// Thread-safe front of the [`SyncTable`].
pub struct SyncEngine {
    // ---
    table: Mutex<SyncTable>,
    clock: Arc<dyn WallClock>,
}

impl SyncEngine {
    // ---
    pub fn new(cfg: SyncConfig, sample_rate: u32, clock: Arc<dyn WallClock>) -> Self {
        // ---
        Self {
            table: Mutex::new(SyncTable::new(cfg, sample_rate)),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn WallClock> {
        // ---
        &self.clock
    }

    pub fn now_us(&self) -> u64 {
        // ---
        self.clock.now_monotonic_us()
    }

    /// Sequence/timestamp bookkeeping plus, for the primary SSRC, the
    /// playout mapping. One lock acquisition. `None` if untrackable.
    pub fn ingest_rtp(
        &self,
        ssrc: u32,
        seq: u16,
        ts: u32,
        payload_len: usize,
        from: Option<SocketAddr>,
    ) -> Option<Ingested> {
        // ---
        let arrival_us = self.clock.now_monotonic_us();
        let mut table = self.table.lock();
        let admission = table.on_rtp(ssrc, seq, ts, payload_len, arrival_us, from)?;
        let playout = admission
            .is_primary
            .then(|| table.map_unwrapped(ssrc, admission.rtp64, arrival_us));
        Some(Ingested {
            admission,
            playout,
            arrival_us,
        })
    }

    pub fn on_sender_report(&self, sr: &SenderReport, from: Option<SocketAddr>) -> Option<SrOutcome> {
        // ---
        let wall = self.clock.now_wall_us();
        let mono = self.clock.now_monotonic_us();
        self.table.lock().on_sender_report(sr, wall, mono, from)
    }

    pub fn on_bye(&self, ssrcs: &[u32]) -> usize {
        // ---
        self.table.lock().on_bye(ssrcs)
    }

    /// Maps `(ssrc, rtp32)` to a monotonic playout time.
    ///
    /// # Errors
    ///
    /// Returns the [`SyncError`] that prevented the mapping.
    pub fn playout_calculate(&self, ssrc: u32, rtp32: u32) -> Result<u64, SyncError> {
        // ---
        let now = self.clock.now_monotonic_us();
        self.table.lock().playout_calculate(ssrc, rtp32, now)
    }

    /// Feeds the scheduled wait of a written chunk back into the PLL.
    pub fn pll_observe(&self, ssrc: u32, wait_us: i64, window_us: u64) -> Option<PllOutcome> {
        // ---
        let now = self.clock.now_monotonic_us();
        self.table.lock().pll_observe(ssrc, wait_us, window_us, now)
    }

    pub fn report_blocks(&self) -> Vec<(SocketAddr, ReportBlock)> {
        // ---
        let now = self.clock.now_monotonic_us();
        self.table.lock().report_blocks(now)
    }

    pub fn expire_stale(&self) -> Vec<u32> {
        // ---
        let now = self.clock.now_monotonic_us();
        self.table.lock().expire_stale(now)
    }

    pub fn summaries_due(&self, interval_us: u64) -> Vec<SourceSummary> {
        // ---
        let now = self.clock.now_monotonic_us();
        self.table.lock().summaries_due(now, interval_us)
    }

    pub fn set_preferred(&self, ssrc: Option<u32>) {
        // ---
        self.table.lock().set_preferred(ssrc);
    }

    pub fn primary(&self) -> Option<u32> {
        // ---
        self.table.lock().primary()
    }

    pub fn tracked(&self) -> usize {
        // ---
        self.table.lock().len()
    }

    /// Runs `f` with the table locked. Test and diagnostics access.
    pub fn with_table<R>(&self, f: impl FnOnce(&mut SyncTable) -> R) -> R {
        // ---
        f(&mut self.table.lock())
    }
}
