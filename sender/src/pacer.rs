//! Turns source PCM into paced RTP packets.
//!
//! One [`Pacer::tick`] per packet period: top up the chunk accumulator from
//! the source, and once a full chunk is there, scale it, hand it to the
//! tap and serialize the RTP packet.

use scream_rtp_common::audio::scale_s16le;
use scream_rtp_common::rtp::write_l16_packet;
use scream_rtp_common::{RtpHeader, SenderMetrics};
use tracing::{debug, info};

use crate::audio::SampleSource;

/// Packets between statistics log lines.
const STATS_LOG_INTERVAL: u64 = 1000;

/// Upper bound on chunks discarded per muted tick.
const MAX_DISCARD_CHUNKS: usize = 4;

/// RTP identity and counters of one send session.
///
/// The SSRC stays constant; sequence and timestamp advance per packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendSession {
    // ---
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    ticks_per_packet: u32,
}

impl SendSession {
    // ---
    /// Random SSRC and starting sequence; the timestamp starts at 0.
    pub fn random(ticks_per_packet: u32) -> Self {
        // ---
        Self::with_start(rand::random(), rand::random(), ticks_per_packet)
    }

    pub fn with_start(ssrc: u32, sequence: u16, ticks_per_packet: u32) -> Self {
        // ---
        Self {
            ssrc,
            sequence,
            timestamp: 0,
            ticks_per_packet,
        }
    }

    pub fn ssrc(&self) -> u32 {
        // ---
        self.ssrc
    }

    /// Header for the next packet; advances sequence and timestamp.
    pub fn next_header(&mut self) -> RtpHeader {
        // ---
        let header = RtpHeader::l16(self.sequence, self.timestamp, self.ssrc);
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.ticks_per_packet);
        header
    }
}

/// Receives every outgoing chunk after volume scaling. Best-effort.
pub trait PcmTap {
    fn write(&mut self, pcm: &[u8]);
}

/// Tap that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTap;

impl PcmTap for NoopTap {
    fn write(&mut self, _pcm: &[u8]) {}
}

/// Result of one pacer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerTick {
    /// A packet is ready in [`Pacer::packet`].
    Ready { sequence: u16, timestamp: u32 },

    /// Not enough source data for a full chunk yet.
    Underflow,

    /// Muted: source drained and discarded.
    Muted,
}

/// Pacer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacerStats {
    pub packets: u64,
    pub underflows: u64,
    pub muted_ticks: u64,
    pub discarded_bytes: u64,
}

pub struct Pacer<S: SampleSource, T: PcmTap> {
    // ---
    source: S,
    tap: T,
    session: SendSession,
    metrics: SenderMetrics,

    // Accumulates source bytes across ticks until a chunk is complete.
    chunk: Vec<u8>,
    filled: usize,
    packet: Vec<u8>,
    stats: PacerStats,
}

impl<S: SampleSource, T: PcmTap> Pacer<S, T> {
    // ---
    pub fn new(source: S, tap: T, session: SendSession, chunk_bytes: usize, metrics: SenderMetrics) -> Self {
        // ---
        info!(
            "RTP session SSRC {:#010x}, {} byte chunks from {} source",
            session.ssrc(),
            chunk_bytes,
            source.name()
        );
        Self {
            source,
            tap,
            session,
            metrics,
            chunk: vec![0u8; chunk_bytes],
            filled: 0,
            packet: Vec::with_capacity(chunk_bytes + 12),
            stats: PacerStats::default(),
        }
    }

    pub fn session(&self) -> &SendSession {
        // ---
        &self.session
    }

    pub fn stats(&self) -> PacerStats {
        // ---
        self.stats
    }

    /// The packet produced by the last `Ready` tick.
    pub fn packet(&self) -> &[u8] {
        // ---
        &self.packet
    }

    /// Runs one pacing step.
    ///
    /// # Arguments
    ///
    /// * `volume` - Linear gain applied to the chunk (1.0 leaves it untouched)
    /// * `muted` - Drain and discard the source instead of sending
    pub fn tick(&mut self, volume: f32, muted: bool) -> PacerTick {
        // ---
        if muted {
            self.discard_source();
            return PacerTick::Muted;
        }

        if self.filled < self.chunk.len() {
            self.filled += self.source.read(&mut self.chunk[self.filled..]);
        }
        if self.filled < self.chunk.len() {
            self.stats.underflows += 1;
            self.metrics.source_underflows_total.inc();
            return PacerTick::Underflow;
        }

        scale_s16le(&mut self.chunk, volume);
        self.tap.write(&self.chunk);

        let header = self.session.next_header();
        write_l16_packet(&header, &self.chunk, &mut self.packet);
        self.filled = 0;

        self.stats.packets += 1;
        if self.stats.packets % STATS_LOG_INTERVAL == 1 {
            info!(
                "RTP TX: seq={} ts={} ssrc={:#010x} ({} packets, {} underflows)",
                header.sequence, header.timestamp, header.ssrc, self.stats.packets, self.stats.underflows
            );
        }

        PacerTick::Ready {
            sequence: header.sequence,
            timestamp: header.timestamp,
        }
    }

    fn discard_source(&mut self) {
        // ---
        let mut discarded = self.filled;
        self.filled = 0;
        // A looping source never runs dry, so the drain is bounded.
        for _ in 0..MAX_DISCARD_CHUNKS {
            let n = self.source.read(&mut self.chunk);
            discarded += n;
            if n < self.chunk.len() {
                break;
            }
        }
        self.stats.muted_ticks += 1;
        self.stats.discarded_bytes += discarded as u64;
        if self.stats.muted_ticks == 1 {
            debug!("Sender muted, discarding source audio");
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::audio::RampSource;
    use scream_rtp_common::{MetricsContext, RtpView, PCM_CHUNK};
    use std::sync::Arc;

    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct RecordingTap(Arc<Mutex<Vec<Vec<u8>>>>);

    impl PcmTap for RecordingTap {
        fn write(&mut self, pcm: &[u8]) {
            // ---
            self.0.lock().push(pcm.to_vec());
        }
    }

    fn pacer(source: RampSource) -> Pacer<RampSource, NoopTap> {
        // ---
        let metrics = MetricsContext::new("pacer-test").expect("metrics failed").tx;
        Pacer::new(source, NoopTap, SendSession::with_start(0xABCD_0001, 65_534, 288), PCM_CHUNK, metrics)
    }

    #[test]
    fn test_session_wraps_sequence() {
        // ---
        let mut session = SendSession::with_start(7, u16::MAX, 288);
        let first = session.next_header();
        let second = session.next_header();
        assert_eq!((first.sequence, first.timestamp), (u16::MAX, 0));
        assert_eq!((second.sequence, second.timestamp), (0, 288));
        assert_eq!(second.ssrc, 7);
    }

    #[test]
    fn test_partial_chunk_underflows_then_completes() {
        // ---
        let mut p = pacer(RampSource::new(0, PCM_CHUNK / 2));
        assert_eq!(p.tick(1.0, false), PacerTick::Underflow);
        assert_eq!(p.stats().underflows, 1);

        p.source.refill(PCM_CHUNK / 2);
        assert_eq!(
            p.tick(1.0, false),
            PacerTick::Ready {
                sequence: 65_534,
                timestamp: 0
            }
        );

        let view = RtpView::parse(p.packet()).expect("parse failed");
        assert_eq!(view.payload.len(), PCM_CHUNK);
        // Sample 1 of the ramp, big-endian on the wire.
        assert_eq!(&view.payload[2..4], &[0, 1]);
    }

    #[test]
    fn test_muted_drains_without_sending() {
        // ---
        let mut p = pacer(RampSource::new(0, PCM_CHUNK + 100));
        assert_eq!(p.tick(1.0, true), PacerTick::Muted);
        assert_eq!(p.stats().packets, 0);
        assert_eq!(p.stats().discarded_bytes, (PCM_CHUNK + 100) as u64);

        p.source.refill(PCM_CHUNK);
        assert!(matches!(p.tick(1.0, false), PacerTick::Ready { .. }));
    }

    #[test]
    fn test_tap_sees_scaled_chunk() {
        // ---
        let tap = RecordingTap::default();
        let metrics = MetricsContext::new("tap-test").expect("metrics failed").tx;
        let mut p = Pacer::new(
            RampSource::new(100, PCM_CHUNK),
            tap.clone(),
            SendSession::with_start(1, 0, 288),
            PCM_CHUNK,
            metrics,
        );
        assert!(matches!(p.tick(0.5, false), PacerTick::Ready { .. }));

        let seen = tap.0.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(i16::from_le_bytes([seen[0][0], seen[0][1]]), 50);
    }
}
