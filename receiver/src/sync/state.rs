//! Timing state tracked for one SSRC.

use std::net::SocketAddr;

use scream_rtp_common::rtcp::{NtpTimestamp, ReportBlock, SenderReport};
use tracing::{debug, info};

use super::pll::{PllOutcome, PllState};
use super::unwrap::{SeqUpdate, SequenceTracker, TimestampUnwrapper};
use super::SyncConfig;
use crate::error::SyncError;

/// The SR that currently anchors the linear map.
#[derive(Debug, Clone, Copy)]
struct SrAnchor {
    // ---
    ntp: NtpTimestamp,
    ntp_us: i64,
    rtp64: u64,
    mono_us: u64,
}

/// Wall/monotonic pair captured at the first SR and kept for the SSRC's lifetime.
#[derive(Debug, Clone, Copy)]
struct Baseline {
    // ---
    wall_us: i64,
    mono_us: u64,
}

/// What a sender report did to the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrOutcome {
    /// First SR: offset, slope and baseline established.
    Seeded,

    /// Offset jumped past the step threshold and was replaced.
    Reseeded { slope_reset: bool },

    /// Anchor refreshed; map left to the PLL.
    Refreshed,

    /// Zero NTP timestamp; nothing recorded.
    Ignored,
}

/// Read-only snapshot for periodic logging.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSummary {
    // ---
    pub ssrc: u32,
    pub primary: bool,
    pub sr_age_ms: Option<u64>,
    pub ppm_deviation: f64,
    pub offset_ms: f64,
    pub jitter_ms: f64,
    pub cumulative_lost: i64,
    pub fraction_lost: u8,
    pub pll_delta_b_us: f64,
    pub pll_delta_ppm: f64,
    pub packets: u64,
    pub octets: u64,
}

#[derive(Debug)]
pub struct SourceState {
    // ---
    pub(crate) ssrc: u32,
    pub(crate) preferred_pin: bool,
    pub(crate) last_activity_us: u64,
    pub(crate) last_summary_us: u64,

    rate: u32,
    seq: SequenceTracker,
    ts: TimestampUnwrapper,

    // Interarrival jitter, RTP ticks.
    transit_prev: Option<f64>,
    jitter: f64,

    sr: Option<SrAnchor>,
    sr_count: u64,
    baseline: Option<Baseline>,

    a0: f64,
    slope_a: f64,
    offset_b_us: f64,
    pll: PllState,

    last_fraction_lost: u8,
    rtp_source: Option<SocketAddr>,
    rtcp_source: Option<SocketAddr>,
    packets: u64,
    octets: u64,
}

impl SourceState {
    // ---
    pub fn new(ssrc: u32, rate: u32, now_us: u64) -> Self {
        // ---
        let a0 = 1e6 / rate as f64;
        Self {
            ssrc,
            preferred_pin: false,
            last_activity_us: now_us,
            last_summary_us: 0,
            rate,
            seq: SequenceTracker::default(),
            ts: TimestampUnwrapper::new((rate / 10) as u64),
            transit_prev: None,
            jitter: 0.0,
            sr: None,
            sr_count: 0,
            baseline: None,
            a0,
            slope_a: a0,
            offset_b_us: 0.0,
            pll: PllState::default(),
            last_fraction_lost: 0,
            rtp_source: None,
            rtcp_source: None,
            packets: 0,
            octets: 0,
        }
    }

    /// Records an RTP arrival and returns the sequence outcome and the
    /// unwrapped timestamp.
    pub fn on_rtp(
        &mut self,
        seq: u16,
        ts: u32,
        payload_len: usize,
        arrival_us: u64,
        from: Option<SocketAddr>,
    ) -> (SeqUpdate, u64) {
        // ---
        let update = self.seq.update(seq);
        let rtp64 = self.ts.unwrap(ts);

        let arrival_ticks = arrival_us as f64 * self.rate as f64 / 1e6;
        let transit = arrival_ticks - rtp64 as f64;
        if let Some(prev) = self.transit_prev {
            let d = (transit - prev).abs();
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.transit_prev = Some(transit);

        self.packets += 1;
        self.octets += payload_len as u64;
        self.last_activity_us = arrival_us;
        if from.is_some() {
            self.rtp_source = from;
        }
        (update, rtp64)
    }

    /// Applies a sender report to the linear map.
    ///
    /// # Arguments
    ///
    /// * `wall_us` / `mono_us` - receiver clocks read at SR arrival
    pub fn on_sender_report(
        &mut self,
        sr: &SenderReport,
        cfg: &SyncConfig,
        wall_us: i64,
        mono_us: u64,
        from: Option<SocketAddr>,
    ) -> SrOutcome {
        // ---
        self.last_activity_us = mono_us;
        if from.is_some() {
            self.rtcp_source = from;
        }
        if sr.ntp.is_zero() {
            debug!("SSRC {:#010x}: ignoring SR with zero NTP timestamp", sr.ssrc);
            return SrOutcome::Ignored;
        }

        let rtp64 = self.ts.unwrap(sr.rtp_timestamp);
        let ntp_us = sr.ntp.to_unix_us();
        let new_b = (wall_us - ntp_us) as f64;

        let outcome = if self.sr_count == 0 {
            self.offset_b_us = new_b;
            self.slope_a = self.a0;
            self.pll.reset();
            if self.baseline.is_none() {
                self.baseline = Some(Baseline { wall_us, mono_us });
            }
            info!(
                "SSRC {:#010x}: clock map seeded, offset {:.3} ms",
                self.ssrc,
                new_b / 1000.0
            );
            SrOutcome::Seeded
        } else {
            let step = (new_b - self.offset_b_us).abs();
            let holdoff_elapsed = self.pll.last_apply_us == 0
                || mono_us.saturating_sub(self.pll.last_apply_us) > cfg.reseed_holdoff_us;

            if step > cfg.sr_offset_step_us && holdoff_elapsed {
                self.offset_b_us = new_b;
                let slope_reset = self.ppm_deviation().abs() > cfg.reseed_slope_ppm;
                if slope_reset {
                    self.slope_a = self.a0;
                }
                info!(
                    "SSRC {:#010x}: clock map reseeded after {:.1} ms step (slope reset: {})",
                    self.ssrc,
                    step / 1000.0,
                    slope_reset
                );
                SrOutcome::Reseeded { slope_reset }
            } else {
                SrOutcome::Refreshed
            }
        };

        self.sr = Some(SrAnchor {
            ntp: sr.ntp,
            ntp_us,
            rtp64,
            mono_us,
        });
        self.sr_count += 1;
        outcome
    }

    /// Maps an unwrapped RTP timestamp to a monotonic playout time.
    ///
    /// # Errors
    ///
    /// `Unseeded` or `Stale` when no usable SR anchors the map, `TooEarly` /
    /// `TooLate` when the result falls outside the playout gates.
    pub fn map_playout(&self, rtp64: u64, cfg: &SyncConfig, now_us: u64) -> Result<u64, SyncError> {
        // ---
        let (sr, baseline) = match (self.sr, self.baseline) {
            (Some(sr), Some(baseline)) => (sr, baseline),
            _ => return Err(SyncError::Unseeded),
        };
        if now_us.saturating_sub(sr.mono_us) > cfg.sr_max_age_us {
            return Err(SyncError::Stale);
        }

        let ticks = (rtp64 as i128 - sr.rtp64 as i128) as f64;
        // Work relative to the baseline to keep f64 precision on large wall times.
        let sr_wall_rel = (sr.ntp_us - baseline.wall_us) as f64 + self.offset_b_us;
        let packet_mono = baseline.mono_us as f64 + sr_wall_rel + ticks * self.slope_a;
        let playout = (packet_mono + cfg.target_latency_us as f64).max(1.0).round() as u64;

        if playout > now_us + cfg.max_early_us {
            return Err(SyncError::TooEarly);
        }
        if playout + cfg.max_late_us < now_us {
            return Err(SyncError::TooLate);
        }
        Ok(playout)
    }

    pub fn unwrap_timestamp(&mut self, ts: u32) -> u64 {
        // ---
        self.ts.unwrap(ts)
    }

    pub fn pll_observe(&mut self, cfg: &SyncConfig, wait_us: i64, window_us: u64, now_us: u64) -> PllOutcome {
        // ---
        let window = window_us as f64;
        let error = wait_us as f64 - window;
        self.pll.observe(
            &cfg.pll,
            error,
            window,
            now_us,
            self.a0,
            &mut self.offset_b_us,
            &mut self.slope_a,
        )
    }

    /// Builds one reception report block and advances the interval snapshot.
    pub fn report_block(&mut self, now_us: u64) -> ReportBlock {
        // ---
        let fraction_lost = self.seq.take_interval_fraction_lost();
        self.last_fraction_lost = fraction_lost;

        let (last_sr, delay_since_last_sr) = match self.sr {
            Some(sr) => {
                let elapsed = now_us.saturating_sub(sr.mono_us) as f64;
                (sr.ntp.middle32(), (elapsed / 1e6 * 65_536.0).round() as u32)
            }
            None => (0, 0),
        };

        ReportBlock {
            ssrc: self.ssrc,
            fraction_lost,
            cumulative_lost: self.seq.cumulative_lost().clamp(-0x80_0000, 0x7F_FFFF) as i32,
            extended_highest_seq: self.seq.ext_max_seq(),
            jitter: self.jitter.round() as u32,
            last_sr,
            delay_since_last_sr,
        }
    }

    /// Where receiver reports for this SSRC go: the RTP origin's port + 1,
    /// else the address its SRs came from.
    pub fn report_destination(&self) -> Option<SocketAddr> {
        // ---
        self.rtp_source
            .map(|mut addr| {
                addr.set_port(addr.port().wrapping_add(1));
                addr
            })
            .or(self.rtcp_source)
    }

    pub fn rtp_source(&self) -> Option<SocketAddr> {
        // ---
        self.rtp_source
    }

    pub fn ppm_deviation(&self) -> f64 {
        // ---
        (self.slope_a / self.a0 - 1.0) * 1e6
    }

    pub fn slope_a(&self) -> f64 {
        // ---
        self.slope_a
    }

    /// Observations the PLL has integrated so far.
    pub fn pll_observations(&self) -> u64 {
        // ---
        self.pll.obs_count
    }

    pub fn offset_b_us(&self) -> f64 {
        // ---
        self.offset_b_us
    }

    pub fn is_seeded(&self) -> bool {
        // ---
        self.sr.is_some() && self.baseline.is_some()
    }

    pub fn last64(&self) -> u64 {
        // ---
        self.ts.last64()
    }

    pub fn summary(&self, primary: bool, now_us: u64) -> SourceSummary {
        // ---
        SourceSummary {
            ssrc: self.ssrc,
            primary,
            sr_age_ms: self.sr.map(|sr| now_us.saturating_sub(sr.mono_us) / 1000),
            ppm_deviation: self.ppm_deviation(),
            offset_ms: self.offset_b_us / 1000.0,
            jitter_ms: self.jitter * 1000.0 / self.rate as f64,
            cumulative_lost: self.seq.cumulative_lost(),
            fraction_lost: self.last_fraction_lost,
            pll_delta_b_us: self.pll.last_delta_b_us,
            pll_delta_ppm: self.pll.last_delta_ppm,
            packets: self.packets,
            octets: self.octets,
        }
    }
}
