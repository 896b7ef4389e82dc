//! Periodic RTCP work on the receive side.
//!
//! A single tick task sends receiver reports, expires silent SSRCs and
//! writes the rate-limited per-SSRC sync summary together with a
//! [`StatsSnapshot`] of the whole pipeline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use scream_rtp_common::net::bind_sender;
use scream_rtp_common::rtcp::{encode_sdes_cname, ReceiverReport, ReportBlock};
use scream_rtp_common::{ReceiverMetrics, Shutdown};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::jitter_buffer::SharedJitterBuffer;
use crate::stats::StatsSnapshot;
use crate::sync::{SourceSummary, SyncEngine};

/// How often the tick task wakes up.
pub const RTCP_TICK: Duration = Duration::from_millis(500);

/// Minimum spacing of sync summaries per SSRC.
pub const SUMMARY_INTERVAL: Duration = Duration::from_secs(5);

/// Builds one compound RR + SDES datagram per report destination.
pub fn build_reports(receiver_ssrc: u32, cname: &str, blocks: Vec<(SocketAddr, ReportBlock)>) -> Vec<(SocketAddr, Vec<u8>)> {
    // ---
    let mut grouped: Vec<(SocketAddr, Vec<ReportBlock>)> = Vec::new();
    for (dest, block) in blocks {
        match grouped.iter_mut().find(|(d, _)| *d == dest) {
            Some((_, list)) => list.push(block),
            None => grouped.push((dest, vec![block])),
        }
    }

    grouped
        .into_iter()
        .map(|(dest, reports)| {
            let mut out = Vec::with_capacity(8 + 24 * reports.len() + 32);
            ReceiverReport {
                ssrc: receiver_ssrc,
                reports,
            }
            .encode(&mut out);
            encode_sdes_cname(receiver_ssrc, cname, &mut out);
            (dest, out)
        })
        .collect()
}

fn log_summary(s: &SourceSummary, fill: usize, target: usize) {
    // ---
    let sr_age = s
        .sr_age_ms
        .map_or_else(|| "none".to_string(), |ms| format!("{} ms", ms));
    info!(
        "SSRC {:#010x}{}: SR age {}, {:+.1} ppm, offset {:.3} ms, jitter {:.3} ms, lost {} ({}/256), PLL Δb {:+.1} us Δ {:+.2} ppm, {} pkts, buffer {}/{}",
        s.ssrc,
        if s.primary { " (primary)" } else { "" },
        sr_age,
        s.ppm_deviation,
        s.offset_ms,
        s.jitter_ms,
        s.cumulative_lost,
        s.fraction_lost,
        s.pll_delta_b_us,
        s.pll_delta_ppm,
        s.packets,
        fill,
        target
    );
}

fn log_snapshot(s: &StatsSnapshot) {
    // ---
    info!(
        "Pipeline: {} pkts, {} lost, {} size mismatch, {} non-primary, {} unsynchronized, buffer {}/{} ({} overruns, {} underruns), {} late, {} early, {} writes",
        s.packets_received,
        s.packets_lost,
        s.size_mismatches,
        s.non_primary,
        s.unsynchronized,
        s.buffer_fill,
        s.buffer_target,
        s.buffer_overruns,
        s.buffer_underruns,
        s.late_drops,
        s.early_drops,
        s.sink_writes
    );
}

/// Receiver-side RTCP task state.
pub struct RtcpReporter {
    // ---
    sync: Arc<SyncEngine>,
    buffer: SharedJitterBuffer,
    metrics: ReceiverMetrics,
    socket: UdpSocket,
    receiver_ssrc: u32,
    cname: String,
}

impl RtcpReporter {
    // ---
    /// Creates the reporter with a random receiver SSRC and its own send socket.
    ///
    /// # Errors
    ///
    /// Returns error if the send socket cannot be created.
    pub fn new(sync: Arc<SyncEngine>, buffer: SharedJitterBuffer, metrics: ReceiverMetrics, cname: String) -> Result<Self> {
        // ---
        let socket = bind_sender(1)?;
        let receiver_ssrc = rand::random::<u32>();
        debug!("Receiver SSRC {:#010x}", receiver_ssrc);
        Ok(Self {
            sync,
            buffer,
            metrics,
            socket,
            receiver_ssrc,
            cname,
        })
    }

    pub fn receiver_ssrc(&self) -> u32 {
        // ---
        self.receiver_ssrc
    }

    /// Sends one RR per destination. Returns how many were sent.
    pub async fn send_reports(&self) -> usize {
        // ---
        let datagrams = build_reports(self.receiver_ssrc, &self.cname, self.sync.report_blocks());
        let mut sent = 0;
        for (dest, datagram) in datagrams {
            match self.socket.send_to(&datagram, dest).await {
                Ok(_) => {
                    sent += 1;
                    self.metrics.rtcp_rr_sent_total.inc();
                }
                Err(e) => warn!("Sending RR to {} failed: {}", dest, e),
            }
        }
        sent
    }

    /// Current counters and buffer state.
    pub fn snapshot(&self) -> StatsSnapshot {
        // ---
        let status = self.buffer.lock().status();
        StatsSnapshot::collect(&self.metrics, &status)
    }

    /// Expires silent SSRCs and logs the summaries that are due.
    ///
    /// Returns the snapshot logged alongside them, or `None` when no
    /// summary was due.
    pub fn housekeeping(&self) -> Option<StatsSnapshot> {
        // ---
        for ssrc in self.sync.expire_stale() {
            debug!("Forgot SSRC {:#010x}", ssrc);
        }
        let summaries = self.sync.summaries_due(SUMMARY_INTERVAL.as_micros() as u64);
        if summaries.is_empty() {
            return None;
        }
        let snapshot = self.snapshot();
        for summary in &summaries {
            log_summary(summary, snapshot.buffer_fill, snapshot.buffer_target);
        }
        log_snapshot(&snapshot);
        Some(snapshot)
    }

    /// Runs until `shutdown` clears.
    pub async fn run(self, rr_interval: Duration, shutdown: Shutdown) {
        // ---
        let mut ticker = tokio::time::interval(RTCP_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut since_report = Duration::ZERO;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.housekeeping();
            since_report += RTCP_TICK;
            if since_report >= rr_interval {
                since_report = Duration::ZERO;
                self.send_reports().await;
            }
        }
        debug!("RTCP reporter stopped");
    }
}
