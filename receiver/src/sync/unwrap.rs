//! Per-SSRC extension of 16-bit sequence numbers and 32-bit RTP timestamps.

/// Forward gaps at or above this are treated as a sender restart, not loss.
const MAX_LOSS_GAP: u16 = 1000;

const SEQ_MOD: u32 = 1 << 16;
const HALF_SEQ: u16 = 1 << 15;
const HALF_TS: u32 = 1 << 31;

/// What a single sequence number told us.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqUpdate {
    // ---
    /// Packets skipped by a forward jump.
    pub lost: u32,

    /// Arrived behind the highest sequence seen.
    pub reordered: bool,
}

/// RFC 3550 sequence extension.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    // ---
    initialized: bool,
    seq_base: u32,
    max_seq: u16,
    cycles: u32,
    received: u64,

    // Snapshot from the previous receiver report.
    prev_expected: u64,
    prev_received: u64,
}

impl SequenceTracker {
    // ---
    pub fn update(&mut self, seq: u16) -> SeqUpdate {
        // ---
        self.received += 1;

        if !self.initialized {
            self.initialized = true;
            self.seq_base = seq as u32;
            self.max_seq = seq;
            self.cycles = 0;
            return SeqUpdate::default();
        }

        let udelta = seq.wrapping_sub(self.max_seq);
        if udelta == 0 {
            // duplicate
            return SeqUpdate::default();
        }
        if udelta < HALF_SEQ {
            if seq < self.max_seq {
                // The RR field is 32 bits; the cycle count wraps with it.
                self.cycles = self.cycles.wrapping_add(SEQ_MOD);
            }
            self.max_seq = seq;
            let lost = if udelta < MAX_LOSS_GAP {
                (udelta - 1) as u32
            } else {
                0
            };
            SeqUpdate {
                lost,
                reordered: false,
            }
        } else {
            SeqUpdate {
                lost: 0,
                reordered: true,
            }
        }
    }

    /// `cycles | max_seq`.
    pub fn ext_max_seq(&self) -> u32 {
        // ---
        self.cycles | self.max_seq as u32
    }

    pub fn received(&self) -> u64 {
        // ---
        self.received
    }

    /// `ext_max_seq − seq_base + 1`, or 0 before the first packet.
    pub fn expected(&self) -> u64 {
        // ---
        if !self.initialized {
            return 0;
        }
        (self.ext_max_seq() as u64 + 1).saturating_sub(self.seq_base as u64)
    }

    /// Expected minus received; negative with duplicates.
    pub fn cumulative_lost(&self) -> i64 {
        // ---
        self.expected() as i64 - self.received as i64
    }

    /// Loss fraction over the interval since the previous call, in 1/256 units.
    ///
    /// Advances the interval snapshot.
    pub fn take_interval_fraction_lost(&mut self) -> u8 {
        // ---
        let expected = self.expected();
        let expected_interval = expected.saturating_sub(self.prev_expected);
        let received_interval = self.received.saturating_sub(self.prev_received);
        self.prev_expected = expected;
        self.prev_received = self.received;

        let lost_interval = expected_interval.saturating_sub(received_interval);
        if expected_interval == 0 || lost_interval == 0 {
            return 0;
        }
        ((lost_interval * 256) / expected_interval).min(255) as u8
    }
}

/// 32 → 64 bit RTP timestamp unwrapping with reorder tolerance.
#[derive(Debug, Clone)]
pub struct TimestampUnwrapper {
    // ---
    initialized: bool,
    cycles: u64,
    last32: u32,
    last64: u64,
    reorder_tolerance: u64,
}

impl TimestampUnwrapper {
    // ---
    /// `reorder_tolerance` is in RTP ticks (rate / 10 by default).
    pub fn new(reorder_tolerance: u64) -> Self {
        // ---
        Self {
            initialized: false,
            cycles: 0,
            last32: 0,
            last64: 0,
            reorder_tolerance,
        }
    }

    /// Extends `ts` onto the 64-bit timeline.
    ///
    /// The high-water mark never moves backwards. A packet from before a
    /// wrap is placed in the previous cycle without touching the stored
    /// cycle count; anything further back than the tolerance is clamped to
    /// the high-water mark.
    pub fn unwrap(&mut self, ts: u32) -> u64 {
        // ---
        if !self.initialized {
            self.initialized = true;
            self.cycles = 0;
            self.last32 = ts;
            self.last64 = ts as u64;
            return self.last64;
        }

        let mut candidate_cycles = self.cycles;
        if ts < self.last32 && self.last32 - ts > HALF_TS {
            self.cycles += 1;
            candidate_cycles = self.cycles;
        } else if ts > self.last32 && ts - self.last32 > HALF_TS && self.cycles > 0 {
            candidate_cycles = self.cycles - 1;
        }

        let mut candidate = (candidate_cycles << 32) | ts as u64;
        if candidate + self.reorder_tolerance < self.last64 {
            candidate = self.last64;
        }

        // Only forward progress moves the 32-bit reference, so a late
        // pre-wrap packet cannot trigger a second wrap.
        if candidate >= self.last64 {
            self.last32 = ts;
            self.last64 = candidate;
        }
        candidate
    }

    pub fn last64(&self) -> u64 {
        // ---
        self.last64
    }

    pub fn is_initialized(&self) -> bool {
        // ---
        self.initialized
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    const TOL: u64 = 4_800;

    #[test]
    fn test_sequence_wrap_in_order() {
        // ---
        let mut seq = SequenceTracker::default();
        for s in [0xFFFE, 0xFFFF, 0x0000, 0x0001] {
            seq.update(s);
        }
        assert_eq!(seq.ext_max_seq(), 0x1_0001);
        assert_eq!(seq.received(), 4);
        assert_eq!(seq.expected(), 4);
        assert_eq!(seq.cumulative_lost(), 0);
    }

    #[test]
    fn test_sequence_reorder_across_wrap() {
        // ---
        let mut seq = SequenceTracker::default();
        let updates: Vec<SeqUpdate> = [0xFFFE, 0x0000, 0xFFFF, 0x0001]
            .into_iter()
            .map(|s| seq.update(s))
            .collect();

        assert_eq!(seq.ext_max_seq(), 0x1_0001);
        assert_eq!(updates[1].lost, 1);
        assert!(updates[2].reordered);
        assert_eq!(seq.cumulative_lost(), 0);
    }

    #[test]
    fn test_fraction_lost_interval() {
        // ---
        let mut seq = SequenceTracker::default();
        for s in 0..10u16 {
            if s != 3 && s != 7 {
                seq.update(s);
            }
        }
        // 10 expected, 8 received: 2/10 * 256 = 51
        assert_eq!(seq.take_interval_fraction_lost(), 51);
        assert_eq!(seq.cumulative_lost(), 2);

        seq.update(10);
        assert_eq!(seq.take_interval_fraction_lost(), 0);
    }

    #[test]
    fn test_sequence_cycle_count_wraps_at_32_bits() {
        // ---
        let mut seq = SequenceTracker::default();
        seq.update(0xFFFE);
        seq.cycles = u32::MAX - (SEQ_MOD - 1);
        assert_eq!(seq.ext_max_seq(), 0xFFFF_FFFE);

        let update = seq.update(0x0001);
        assert_eq!(update.lost, 2);
        assert_eq!(seq.ext_max_seq(), 0x0000_0001);

        seq.update(0x0002);
        assert_eq!(seq.ext_max_seq(), 0x0000_0002);
    }

    #[test]
    fn test_large_gap_not_counted_as_loss() {
        // ---
        let mut seq = SequenceTracker::default();
        seq.update(100);
        assert_eq!(seq.update(105).lost, 4);
        assert_eq!(seq.update(5_000).lost, 0);
    }

    #[test]
    fn test_timestamp_wrap() {
        // ---
        let mut ts = TimestampUnwrapper::new(TOL);
        let wrap = 1u64 << 32;
        assert_eq!(ts.unwrap((wrap - 500) as u32), wrap - 500);
        assert_eq!(ts.unwrap((wrap - 250) as u32), wrap - 250);
        assert_eq!(ts.unwrap(250), wrap + 250);
    }

    #[test]
    fn test_timestamp_reorder_across_wrap_keeps_cycles() {
        // ---
        let mut ts = TimestampUnwrapper::new(TOL);
        let wrap = 1u64 << 32;
        ts.unwrap((wrap - 576) as u32);
        assert_eq!(ts.unwrap(0), wrap);
        assert_eq!(ts.unwrap((wrap - 288) as u32), wrap - 288);
        assert_eq!(ts.unwrap(288), wrap + 288);
        assert_eq!(ts.last64(), wrap + 288);
    }

    #[test]
    fn test_timestamp_never_regresses() {
        // ---
        let mut ts = TimestampUnwrapper::new(TOL);
        ts.unwrap(1_000_000);
        let mut high = ts.last64();

        for t in [1_000_288u32, 1_000_000, 900_000, 1_000_576, 1, 1_000_864] {
            let out = ts.unwrap(t);
            assert!(ts.last64() >= high);
            assert!(out + TOL >= high);
            high = ts.last64();
        }
        assert_eq!(ts.unwrap(900_000), ts.last64());
    }
}
