//! Bounded set of tracked SSRCs with a primary selection.

use std::net::SocketAddr;

use scream_rtp_common::rtcp::{ReportBlock, SenderReport};
use tracing::{debug, info};

use super::pll::PllOutcome;
use super::state::{SourceState, SourceSummary, SrOutcome};
use super::unwrap::SeqUpdate;
use super::SyncConfig;
use crate::error::SyncError;

/// What the table decided about one RTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpAdmission {
    // ---
    pub is_primary: bool,
    pub seq: SeqUpdate,
    pub rtp64: u64,
}

/// Arena of `max_ssrc` slots. Lookups are linear; the table is tiny.
#[derive(Debug)]
pub struct SyncTable {
    // ---
    cfg: SyncConfig,
    sample_rate: u32,
    slots: Vec<Option<SourceState>>,
    primary: Option<u32>,
    preferred: Option<u32>,
}

impl SyncTable {
    // ---
    pub fn new(cfg: SyncConfig, sample_rate: u32) -> Self {
        // ---
        let slots = (0..cfg.max_ssrc.max(1)).map(|_| None).collect();
        Self {
            cfg,
            sample_rate,
            slots,
            primary: None,
            preferred: None,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        // ---
        &self.cfg
    }

    pub fn primary(&self) -> Option<u32> {
        // ---
        self.primary
    }

    pub fn len(&self) -> usize {
        // ---
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.len() == 0
    }

    pub fn get(&self, ssrc: u32) -> Option<&SourceState> {
        // ---
        self.slots.iter().flatten().find(|s| s.ssrc == ssrc)
    }

    fn get_mut(&mut self, ssrc: u32) -> Option<&mut SourceState> {
        // ---
        self.slots.iter_mut().flatten().find(|s| s.ssrc == ssrc)
    }

    /// Finds or allocates the slot for `ssrc`, evicting the least recently
    /// active unpinned entry when full. `None` if every slot is pinned.
    fn get_or_insert(&mut self, ssrc: u32, now_us: u64) -> Option<&mut SourceState> {
        // ---
        let idx = match self.slots.iter().position(|s| matches!(s, Some(st) if st.ssrc == ssrc)) {
            Some(idx) => idx,
            None => {
                let idx = match self.slots.iter().position(Option::is_none) {
                    Some(free) => free,
                    None => self.evict_lru()?,
                };
                let mut state = SourceState::new(ssrc, self.sample_rate, now_us);
                state.preferred_pin = self.preferred == Some(ssrc);
                debug!("Tracking SSRC {:#010x} in slot {}", ssrc, idx);
                self.slots[idx] = Some(state);
                idx
            }
        };
        self.slots[idx].as_mut()
    }

    fn evict_lru(&mut self) -> Option<usize> {
        // ---
        let (idx, ssrc) = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|st| (i, st)))
            .filter(|(_, st)| !st.preferred_pin)
            .min_by_key(|(_, st)| st.last_activity_us)
            .map(|(i, st)| (i, st.ssrc))?;

        info!("Evicting SSRC {:#010x} (table full)", ssrc);
        self.remove_slot(idx);
        Some(idx)
    }

    fn remove_slot(&mut self, idx: usize) {
        // ---
        if let Some(state) = self.slots[idx].take() {
            if self.primary == Some(state.ssrc) {
                self.primary = None;
            }
        }
    }

    /// Pins `ssrc` as the preferred source, or clears the pin with `None`.
    pub fn set_preferred(&mut self, ssrc: Option<u32>) {
        // ---
        self.preferred = ssrc;
        for state in self.slots.iter_mut().flatten() {
            state.preferred_pin = Some(state.ssrc) == ssrc;
        }
        if let Some(ssrc) = ssrc {
            if self.get(ssrc).is_some() {
                self.primary = Some(ssrc);
            }
        }
    }

    /// Records an RTP packet. `None` when the SSRC cannot be tracked.
    pub fn on_rtp(
        &mut self,
        ssrc: u32,
        seq: u16,
        ts: u32,
        payload_len: usize,
        arrival_us: u64,
        from: Option<SocketAddr>,
    ) -> Option<RtpAdmission> {
        // ---
        let state = self.get_or_insert(ssrc, arrival_us)?;
        let (seq_update, rtp64) = state.on_rtp(seq, ts, payload_len, arrival_us, from);
        let pinned = state.preferred_pin;

        if self.primary.is_none() || (pinned && self.primary != Some(ssrc)) {
            info!("Primary SSRC is now {:#010x}", ssrc);
            self.primary = Some(ssrc);
        }

        Some(RtpAdmission {
            is_primary: self.primary == Some(ssrc),
            seq: seq_update,
            rtp64,
        })
    }

    pub fn on_sender_report(
        &mut self,
        sr: &SenderReport,
        wall_us: i64,
        mono_us: u64,
        from: Option<SocketAddr>,
    ) -> Option<SrOutcome> {
        // ---
        let cfg = self.cfg;
        let state = self.get_or_insert(sr.ssrc, mono_us)?;
        Some(state.on_sender_report(sr, &cfg, wall_us, mono_us, from))
    }

    /// Destroys every listed SSRC. Returns how many were tracked.
    pub fn on_bye(&mut self, ssrcs: &[u32]) -> usize {
        // ---
        let mut removed = 0;
        for &ssrc in ssrcs {
            if let Some(idx) = self.slots.iter().position(|s| matches!(s, Some(st) if st.ssrc == ssrc)) {
                info!("BYE from SSRC {:#010x}", ssrc);
                self.remove_slot(idx);
                removed += 1;
            }
        }
        removed
    }

    /// Unwraps `rtp32` and maps it to a playout time.
    ///
    /// # Errors
    ///
    /// `UnknownSsrc` when untracked, otherwise as [`SourceState::map_playout`].
    pub fn playout_calculate(&mut self, ssrc: u32, rtp32: u32, now_us: u64) -> Result<u64, SyncError> {
        // ---
        let cfg = self.cfg;
        let state = self.get_mut(ssrc).ok_or(SyncError::UnknownSsrc)?;
        let rtp64 = state.unwrap_timestamp(rtp32);
        state.map_playout(rtp64, &cfg, now_us)
    }

    /// Maps an already unwrapped timestamp.
    pub fn map_unwrapped(&self, ssrc: u32, rtp64: u64, now_us: u64) -> Result<u64, SyncError> {
        // ---
        self.get(ssrc)
            .ok_or(SyncError::UnknownSsrc)?
            .map_playout(rtp64, &self.cfg, now_us)
    }

    pub fn pll_observe(&mut self, ssrc: u32, wait_us: i64, window_us: u64, now_us: u64) -> Option<PllOutcome> {
        // ---
        let cfg = self.cfg;
        let state = self.get_mut(ssrc)?;
        Some(state.pll_observe(&cfg, wait_us, window_us, now_us))
    }

    /// One report block per tracked SSRC with a known return address.
    pub fn report_blocks(&mut self, now_us: u64) -> Vec<(SocketAddr, ReportBlock)> {
        // ---
        self.slots
            .iter_mut()
            .flatten()
            .filter_map(|st| st.report_destination().map(|dest| (dest, st.report_block(now_us))))
            .collect()
    }

    /// Drops entries idle longer than the stale timeout. Pinned entries expire too.
    pub fn expire_stale(&mut self, now_us: u64) -> Vec<u32> {
        // ---
        let timeout = self.cfg.stale_timeout_us;
        let stale: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|st| (i, st)))
            .filter(|(_, st)| now_us.saturating_sub(st.last_activity_us) > timeout)
            .map(|(i, _)| i)
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for idx in stale {
            if let Some(st) = self.slots[idx].as_ref() {
                info!("SSRC {:#010x} timed out", st.ssrc);
                expired.push(st.ssrc);
            }
            self.remove_slot(idx);
        }
        expired
    }

    /// Summaries for SSRCs whose last summary is at least `interval_us` old.
    pub fn summaries_due(&mut self, now_us: u64, interval_us: u64) -> Vec<SourceSummary> {
        // ---
        let primary = self.primary;
        self.slots
            .iter_mut()
            .flatten()
            .filter(|st| st.last_summary_us == 0 || now_us.saturating_sub(st.last_summary_us) >= interval_us)
            .map(|st| {
                st.last_summary_us = now_us;
                st.summary(primary == Some(st.ssrc), now_us)
            })
            .collect()
    }
}
