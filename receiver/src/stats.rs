//! Ingress statistics.
//!
//! Loss and reordering come from the per-SSRC sequence extension; this
//! module only accumulates what the ingress saw and logs it periodically.
//! The Prometheus counters in [`ReceiverMetrics`] carry the same numbers
//! for scraping.

use std::time::Instant;

use scream_rtp_common::ReceiverMetrics;
use tracing::info;

use crate::jitter_buffer::JitterBufferStatus;
use crate::sync::SeqUpdate;

/// Packets between two automatic stats lines.
pub const STATS_LOG_EVERY: u64 = 1000;

/// Counters kept by the ingress loop.
#[derive(Debug, Clone)]
pub struct IngressStats {
    // ---
    /// Datagrams accepted into the pipeline
    pub packets_received: u64,

    /// Sequence gaps below the restart threshold
    pub packets_lost: u64,

    /// Packets behind the highest sequence seen
    pub packets_reordered: u64,

    /// Datagrams that failed RTP parsing
    pub packets_malformed: u64,

    /// Payloads that were not exactly one chunk
    pub size_mismatches: u64,

    /// Packets from SSRCs other than the primary
    pub non_primary: u64,

    /// Chunks queued without a clock mapping
    pub unsynchronized: u64,

    start_time: Instant,
    log_every: u64,
}

impl IngressStats {
    // ---
    /// Creates a new stats tracker.
    ///
    /// # Arguments
    ///
    /// * `log_every` - Log automatically after this many packets; 0 disables it
    pub fn new(log_every: u64) -> Self {
        // ---
        Self {
            packets_received: 0,
            packets_lost: 0,
            packets_reordered: 0,
            packets_malformed: 0,
            size_mismatches: 0,
            non_primary: 0,
            unsynchronized: 0,
            start_time: Instant::now(),
            log_every,
        }
    }

    /// Records an admitted packet and what its sequence number revealed.
    pub fn record_packet(&mut self, seq: SeqUpdate) {
        // ---
        self.packets_received += 1;
        self.packets_lost += u64::from(seq.lost);
        if seq.reordered {
            self.packets_reordered += 1;
        }
        self.maybe_log();
    }

    pub fn record_malformed(&mut self) {
        // ---
        self.packets_malformed += 1;
    }

    pub fn record_size_mismatch(&mut self) {
        // ---
        self.size_mismatches += 1;
    }

    pub fn record_non_primary(&mut self) {
        // ---
        self.non_primary += 1;
    }

    pub fn record_unsynchronized(&mut self) {
        // ---
        self.unsynchronized += 1;
    }

    /// Calculates current packet loss percentage.
    pub fn loss_percentage(&self) -> f64 {
        // ---
        let total = self.packets_received + self.packets_lost;
        if total == 0 {
            0.0
        } else {
            (self.packets_lost as f64 / total as f64) * 100.0
        }
    }

    /// Calculates reorder percentage.
    pub fn reorder_percentage(&self) -> f64 {
        // ---
        if self.packets_received == 0 {
            0.0
        } else {
            (self.packets_reordered as f64 / self.packets_received as f64) * 100.0
        }
    }

    /// Calculates packets per second reception rate.
    pub fn packets_per_second(&self) -> f64 {
        // ---
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.packets_received as f64 / elapsed
        }
    }

    /// True when the packet just recorded completes a logging interval.
    fn log_due(&self) -> bool {
        // ---
        self.log_every > 0 && self.packets_received % self.log_every == 0
    }

    fn maybe_log(&self) {
        // ---
        if self.log_due() {
            self.log();
        }
    }

    /// Force log current statistics.
    pub fn log(&self) {
        // ---
        info!(
            "RX Stats: {} pkts ({:.2} pkt/s), {:.2}% loss, {:.2}% reordered, {} malformed, {} size mismatch, {} non-primary, {} unsynchronized",
            self.packets_received,
            self.packets_per_second(),
            self.loss_percentage(),
            self.reorder_percentage(),
            self.packets_malformed,
            self.size_mismatches,
            self.non_primary,
            self.unsynchronized
        );
    }
}

impl Default for IngressStats {
    fn default() -> Self {
        // ---
        Self::new(STATS_LOG_EVERY)
    }
}

/// Point-in-time view of the receive pipeline, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    // ---
    pub packets_received: u64,
    pub packets_lost: u64,
    pub size_mismatches: u64,
    pub non_primary: u64,
    pub unsynchronized: u64,
    pub buffer_fill: usize,
    pub buffer_target: usize,
    pub buffer_overruns: u64,
    pub buffer_underruns: u64,
    pub late_drops: u64,
    pub early_drops: u64,
    pub sink_writes: u64,
}

impl StatsSnapshot {
    // ---
    /// Reads the shared counters and the buffer state.
    pub fn collect(metrics: &ReceiverMetrics, buffer: &JitterBufferStatus) -> Self {
        // ---
        Self {
            packets_received: metrics.packets_received_total.get(),
            packets_lost: metrics.packets_lost_total.get(),
            size_mismatches: metrics.size_mismatch_total.get(),
            non_primary: metrics.non_primary_total.get(),
            unsynchronized: metrics.unsynchronized_total.get(),
            buffer_fill: buffer.size,
            buffer_target: buffer.target_fill,
            buffer_overruns: buffer.overruns,
            buffer_underruns: buffer.underruns,
            late_drops: metrics.playout_late_drops_total.get(),
            early_drops: metrics.playout_early_drops_total.get(),
            sink_writes: metrics.sink_writes_total.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn seq(lost: u32, reordered: bool) -> SeqUpdate {
        // ---
        SeqUpdate { lost, reordered }
    }

    #[test]
    fn test_stats_no_loss() {
        // ---
        let mut stats = IngressStats::default();

        stats.record_packet(seq(0, false));
        stats.record_packet(seq(0, false));
        stats.record_packet(seq(0, false));

        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_lost, 0);
        assert_eq!(stats.loss_percentage(), 0.0);
    }

    #[test]
    fn test_stats_with_loss() {
        // ---
        let mut stats = IngressStats::default();

        stats.record_packet(seq(0, false));
        stats.record_packet(seq(0, false));
        stats.record_packet(seq(3, false)); // 2, 3, 4 missing

        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_lost, 3);
        assert_eq!(stats.loss_percentage(), 50.0);
    }

    #[test]
    fn test_stats_with_reordering() {
        // ---
        let mut stats = IngressStats::default();

        stats.record_packet(seq(0, false));
        stats.record_packet(seq(1, false));
        stats.record_packet(seq(0, true));

        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_reordered, 1);

        let expected = 100.0 / 3.0;
        let actual = stats.reorder_percentage();
        assert!(
            (actual - expected).abs() < 0.001,
            "Expected ~{}, got {}",
            expected,
            actual
        );
    }

    #[test]
    fn test_logs_every_thousand_packets() {
        // ---
        let mut stats = IngressStats::default();

        for _ in 0..STATS_LOG_EVERY - 1 {
            stats.record_packet(seq(0, false));
            assert!(!stats.log_due());
        }
        stats.record_packet(seq(0, false));
        assert!(stats.log_due());

        stats.record_packet(seq(0, false));
        assert!(!stats.log_due());

        let mut quiet = IngressStats::new(0);
        quiet.record_packet(seq(0, false));
        assert!(!quiet.log_due());
    }

    #[test]
    fn test_drop_counters() {
        // ---
        let mut stats = IngressStats::default();

        stats.record_malformed();
        stats.record_size_mismatch();
        stats.record_size_mismatch();
        stats.record_non_primary();
        stats.record_unsynchronized();

        assert_eq!(stats.packets_malformed, 1);
        assert_eq!(stats.size_mismatches, 2);
        assert_eq!(stats.non_primary, 1);
        assert_eq!(stats.unsynchronized, 1);
        assert_eq!(stats.packets_received, 0);
    }
}
