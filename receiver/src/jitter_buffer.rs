//! Fixed-capacity jitter buffer for PCM chunks.
//!
//! A ring of `max_buffer` chunk slots over one contiguous allocation. The
//! buffer absorbs arrival jitter and adapts its refill target: every time
//! it runs dry the target fill grows by `grow_step`, up to `max_grow`.
//! Ordering is arrival order; the playout scheduler handles timing.

use std::sync::Arc;

use parking_lot::Mutex;
use scream_rtp_common::config::BufferConfig;
use scream_rtp_common::PCM_CHUNK;
use tracing::{debug, warn};

use crate::error::BufferError;

/// Jitter buffer sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterBufferConfig {
    // ---
    /// Target fill after start and after each flush.
    pub initial_fill: usize,

    /// Slot count.
    pub max_buffer: usize,

    pub grow_step: usize,

    /// Ceiling for the adaptive target.
    pub max_grow: usize,

    /// Exact payload size accepted by `push`.
    pub chunk_bytes: usize,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        // ---
        Self::from_buffer_config(&BufferConfig::default(), PCM_CHUNK)
    }
}

impl JitterBufferConfig {
    // ---
    pub fn from_buffer_config(cfg: &BufferConfig, chunk_bytes: usize) -> Self {
        // ---
        Self {
            initial_fill: cfg.initial_buffer_size,
            max_buffer: cfg.max_buffer_size,
            grow_step: cfg.buffer_grow_step,
            max_grow: cfg.max_grow_size,
            chunk_bytes,
        }
    }
}

/// One buffered chunk with its timing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JitterEntry {
    // ---
    pub ssrc: u32,

    /// Monotonic playout time; 0 means unsynchronized.
    pub playout_mono_us: u64,
    pub arrival_mono_us: u64,

    /// Host-order PCM.
    pub payload: Vec<u8>,
}

impl JitterEntry {
    // ---
    /// An empty entry whose payload can hold one chunk without reallocating.
    pub fn with_capacity(chunk_bytes: usize) -> Self {
        // ---
        Self {
            payload: Vec::with_capacity(chunk_bytes),
            ..Self::default()
        }
    }

    pub fn is_synchronized(&self) -> bool {
        // ---
        self.playout_mono_us != 0
    }
}

/// What `push` did with a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Stored,

    /// Buffer was full; the oldest chunk was dropped.
    Overwrote,

    /// Payload length differs from the chunk size; nothing stored.
    SizeMismatch,
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotMeta {
    ssrc: u32,
    playout_mono_us: u64,
    arrival_mono_us: u64,
}

/// Adaptive ring buffer of PCM chunks.
///
/// # Example
///
/// ```
/// use receiver::jitter_buffer::{JitterBuffer, JitterBufferConfig, PushOutcome};
///
/// let cfg = JitterBufferConfig { initial_fill: 2, ..JitterBufferConfig::default() };
/// let mut buffer = JitterBuffer::new(cfg);
/// let chunk = vec![0u8; cfg.chunk_bytes];
///
/// assert_eq!(buffer.push(1, 0, 0, &chunk), PushOutcome::Stored);
/// assert!(buffer.pop().is_err()); // still filling
/// buffer.push(1, 0, 0, &chunk);
/// assert!(buffer.pop().is_ok());
/// ```
pub struct JitterBuffer {
    // ---
    config: JitterBufferConfig,
    storage: Vec<u8>,
    meta: Vec<SlotMeta>,

    read_pos: usize,
    write_pos: usize,
    size: usize,

    target_fill: usize,
    underrun: bool,
    received_since_underrun: usize,

    overruns: u64,
    underruns: u64,
}

/// Buffer shared between ingress and playout.
pub type SharedJitterBuffer = Arc<Mutex<JitterBuffer>>;

impl JitterBuffer {
    // ---
    /// Allocates `max_buffer × chunk_bytes` up front. Starts in underrun.
    pub fn new(config: JitterBufferConfig) -> Self {
        // ---
        let slots = config.max_buffer.max(1);
        let max_grow = config.max_grow.clamp(1, slots);
        Self {
            config: JitterBufferConfig {
                max_buffer: slots,
                max_grow,
                ..config
            },
            storage: vec![0u8; slots * config.chunk_bytes],
            meta: vec![SlotMeta::default(); slots],
            read_pos: 0,
            write_pos: 0,
            size: 0,
            target_fill: config.initial_fill.clamp(1, max_grow),
            underrun: true,
            received_since_underrun: 0,
            overruns: 0,
            underruns: 0,
        }
    }

    pub fn shared(config: JitterBufferConfig) -> SharedJitterBuffer {
        // ---
        Arc::new(Mutex::new(Self::new(config)))
    }

    pub fn config(&self) -> &JitterBufferConfig {
        // ---
        &self.config
    }

    /// Copies one chunk in. Never blocks and never fails fatally: a full
    /// buffer drops its oldest chunk.
    pub fn push(&mut self, ssrc: u32, playout_mono_us: u64, arrival_mono_us: u64, payload: &[u8]) -> PushOutcome {
        // ---
        let chunk = self.config.chunk_bytes;
        if payload.len() != chunk {
            return PushOutcome::SizeMismatch;
        }

        let mut outcome = PushOutcome::Stored;
        if self.size == self.config.max_buffer {
            self.read_pos = (self.read_pos + 1) % self.config.max_buffer;
            self.size -= 1;
            self.overruns += 1;
            outcome = PushOutcome::Overwrote;
            if self.overruns.is_power_of_two() {
                warn!("Jitter buffer overrun (total {})", self.overruns);
            }
        }

        let start = self.write_pos * chunk;
        self.storage[start..start + chunk].copy_from_slice(payload);
        self.meta[self.write_pos] = SlotMeta {
            ssrc,
            playout_mono_us,
            arrival_mono_us,
        };
        self.write_pos = (self.write_pos + 1) % self.config.max_buffer;
        self.size += 1;

        self.received_since_underrun = self.received_since_underrun.saturating_add(1);
        if self.underrun && self.received_since_underrun >= self.target_fill {
            self.underrun = false;
            debug!(
                "Jitter buffer refilled ({} chunks, target {})",
                self.size, self.target_fill
            );
        }
        outcome
    }

    fn enter_underrun(&mut self) {
        // ---
        if self.underrun {
            return;
        }
        self.underrun = true;
        self.received_since_underrun = 0;
        self.underruns += 1;

        let grown = (self.target_fill + self.config.grow_step).min(self.config.max_grow);
        if grown != self.target_fill {
            debug!("Jitter buffer underrun, target fill {} -> {}", self.target_fill, grown);
            self.target_fill = grown;
        }
    }

    /// Moves the oldest chunk into `out`, reusing its allocation.
    ///
    /// # Errors
    ///
    /// `Empty` when nothing is buffered (entering underrun), `Underrun` while
    /// refilling to the target.
    pub fn pop_into(&mut self, out: &mut JitterEntry) -> Result<(), BufferError> {
        // ---
        if self.size == 0 {
            self.enter_underrun();
            return Err(BufferError::Empty);
        }
        if self.underrun {
            return Err(BufferError::Underrun);
        }

        let meta = self.meta[self.read_pos];
        out.ssrc = meta.ssrc;
        out.playout_mono_us = meta.playout_mono_us;
        out.arrival_mono_us = meta.arrival_mono_us;
        out.payload.clear();
        let start = self.read_pos * self.config.chunk_bytes;
        out.payload
            .extend_from_slice(&self.storage[start..start + self.config.chunk_bytes]);

        self.read_pos = (self.read_pos + 1) % self.config.max_buffer;
        self.size -= 1;
        Ok(())
    }

    /// Allocating form of [`JitterBuffer::pop_into`].
    ///
    /// # Errors
    ///
    /// As [`JitterBuffer::pop_into`].
    pub fn pop(&mut self) -> Result<JitterEntry, BufferError> {
        // ---
        let mut entry = JitterEntry::with_capacity(self.config.chunk_bytes);
        self.pop_into(&mut entry)?;
        Ok(entry)
    }

    /// Drops every chunk and returns to the refilling state without growing.
    pub fn flush(&mut self) {
        // ---
        self.read_pos = 0;
        self.write_pos = 0;
        self.size = 0;
        self.underrun = true;
        self.received_since_underrun = 0;
    }

    /// Applies new growth settings. Capacity is fixed; changing
    /// `max_buffer` needs a new buffer.
    pub fn update_growth_params(&mut self, initial_fill: usize, grow_step: usize, max_grow: usize) {
        // ---
        self.config.initial_fill = initial_fill;
        self.config.grow_step = grow_step;
        self.config.max_grow = max_grow.clamp(1, self.config.max_buffer);
        self.target_fill = initial_fill.clamp(1, self.config.max_grow);
    }

    pub fn len(&self) -> usize {
        // ---
        self.size
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.size == 0
    }

    pub fn status(&self) -> JitterBufferStatus {
        // ---
        JitterBufferStatus {
            size: self.size,
            capacity: self.config.max_buffer,
            target_fill: self.target_fill,
            underrun: self.underrun,
            received_since_underrun: self.received_since_underrun,
            overruns: self.overruns,
            underruns: self.underruns,
        }
    }
}

/// Jitter buffer status for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterBufferStatus {
    pub size: usize,
    pub capacity: usize,
    pub target_fill: usize,
    pub underrun: bool,
    pub received_since_underrun: usize,
    pub overruns: u64,
    pub underruns: u64,
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const CHUNK: usize = 16;

    fn config(initial: usize, max_buffer: usize, step: usize, max_grow: usize) -> JitterBufferConfig {
        JitterBufferConfig {
            initial_fill: initial,
            max_buffer,
            grow_step: step,
            max_grow,
            chunk_bytes: CHUNK,
        }
    }

    fn chunk(tag: u8) -> Vec<u8> {
        vec![tag; CHUNK]
    }

    #[test]
    fn test_refills_before_playout() {
        // ---
        let mut buffer = JitterBuffer::new(config(3, 8, 2, 6));
        assert_eq!(buffer.pop(), Err(BufferError::Empty));

        buffer.push(1, 0, 0, &chunk(1));
        buffer.push(1, 0, 0, &chunk(2));
        assert_eq!(buffer.pop(), Err(BufferError::Underrun));

        buffer.push(1, 0, 0, &chunk(3));
        for tag in 1..=3 {
            assert_eq!(buffer.pop().expect("pop failed").payload, chunk(tag));
        }
        assert_eq!(buffer.status().underruns, 0);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        // ---
        let mut buffer = JitterBuffer::new(config(1, 4, 1, 4));
        for tag in 0..4 {
            assert_eq!(buffer.push(1, 0, 0, &chunk(tag)), PushOutcome::Stored);
        }
        assert_eq!(buffer.push(1, 0, 0, &chunk(4)), PushOutcome::Overwrote);
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.status().overruns, 1);
        assert_eq!(buffer.pop().expect("pop failed").payload, chunk(1));
    }

    #[test]
    fn test_underrun_grows_target_once_per_episode() {
        // ---
        let mut buffer = JitterBuffer::new(config(4, 24, 2, 8));
        for _ in 0..4 {
            buffer.push(1, 0, 0, &chunk(0));
        }
        for _ in 0..4 {
            buffer.pop().expect("pop failed");
        }

        // Repeated empty polls count as one underrun.
        for _ in 0..10 {
            assert_eq!(buffer.pop(), Err(BufferError::Empty));
        }
        let status = buffer.status();
        assert_eq!(status.target_fill, 6);
        assert_eq!(status.underruns, 1);
        assert!(status.underrun);

        // Second episode reaches the ceiling.
        for _ in 0..6 {
            buffer.push(1, 0, 0, &chunk(0));
        }
        for _ in 0..6 {
            buffer.pop().expect("pop failed");
        }
        buffer.pop().expect_err("buffer should be empty");
        buffer.pop().expect_err("buffer should be empty");
        assert_eq!(buffer.status().target_fill, 8);

        for _ in 0..8 {
            buffer.push(1, 0, 0, &chunk(0));
        }
        for _ in 0..8 {
            buffer.pop().expect("pop failed");
        }
        buffer.pop().expect_err("buffer should be empty");
        assert_eq!(buffer.status().target_fill, 8);
    }

    #[test]
    fn test_wrong_size_is_rejected() {
        // ---
        let mut buffer = JitterBuffer::new(config(1, 4, 1, 4));
        assert_eq!(buffer.push(1, 0, 0, &[0u8; CHUNK - 2]), PushOutcome::SizeMismatch);
        assert!(buffer.is_empty());
        assert_eq!(buffer.status().received_since_underrun, 0);
    }

    #[test]
    fn test_pop_into_reuses_entry() {
        // ---
        let mut buffer = JitterBuffer::new(config(1, 4, 1, 4));
        buffer.push(7, 123, 100, &chunk(9));

        let mut entry = JitterEntry::with_capacity(CHUNK);
        let capacity = entry.payload.capacity();
        buffer.pop_into(&mut entry).expect("pop failed");
        assert_eq!(entry.ssrc, 7);
        assert_eq!(entry.playout_mono_us, 123);
        assert_eq!(entry.arrival_mono_us, 100);
        assert_eq!(entry.payload, chunk(9));
        assert_eq!(entry.payload.capacity(), capacity);
    }

    #[test]
    fn test_flush_and_growth_update() {
        // ---
        let mut buffer = JitterBuffer::new(config(2, 16, 2, 10));
        for _ in 0..5 {
            buffer.push(1, 0, 0, &chunk(0));
        }
        buffer.flush();
        assert!(buffer.is_empty());
        assert!(buffer.status().underrun);
        assert_eq!(buffer.status().target_fill, 2);

        buffer.update_growth_params(6, 4, 40);
        let status = buffer.status();
        assert_eq!(status.target_fill, 6);
        assert_eq!(buffer.config().max_grow, 16);
    }

    #[test]
    fn test_invariants_under_random_traffic() {
        // ---
        let mut rng = StdRng::seed_from_u64(0x5C2E_A4);
        let mut buffer = JitterBuffer::new(config(4, 24, 2, 16));

        for _ in 0..20_000 {
            if rng.gen_bool(0.5) {
                buffer.push(1, 0, 0, &chunk(rng.gen()));
            } else {
                let _ = buffer.pop();
            }
            let s = buffer.status();
            assert!(s.size <= s.capacity);
            assert!((4..=16).contains(&s.target_fill));
            if s.received_since_underrun < s.target_fill {
                assert!(s.underrun);
            }
        }
    }
}
