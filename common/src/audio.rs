//! PCM framing and sample helpers.
//!
//! The stream format is L16 stereo. Internally chunks are kept as
//! little-endian signed 16-bit interleaved samples; the wire carries
//! big-endian samples.

/// Stereo frames per RTP packet.
pub const FRAMES_PER_PACKET: u32 = 288;

/// Interleaved channel count.
pub const CHANNELS: u16 = 2;

/// Sample width in bits.
pub const BIT_DEPTH: u16 = 16;

/// Chunk size in bytes at the fixed framing (288 stereo 16-bit frames).
pub const PCM_CHUNK: usize = (FRAMES_PER_PACKET as usize) * (CHANNELS as usize) * 2;

/// Sample rates accepted from configuration and SAP announcements.
pub const SUPPORTED_RATES: [u32; 5] = [44_100, 48_000, 88_200, 96_000, 192_000];

/// Negotiated audio format and the framing derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    // ---
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub frames_per_packet: u32,
}

impl AudioFormat {
    // ---
    /// L16 stereo with the fixed 288-frame packetization.
    pub fn l16_stereo(sample_rate: u32) -> Self {
        // ---
        Self {
            sample_rate,
            channels: CHANNELS,
            bit_depth: BIT_DEPTH,
            frames_per_packet: FRAMES_PER_PACKET,
        }
    }

    /// Bytes per packet payload.
    pub fn chunk_bytes(&self) -> usize {
        // ---
        self.frames_per_packet as usize * self.channels as usize * (self.bit_depth as usize / 8)
    }

    /// RTP timestamp increment per packet.
    pub fn ticks_per_packet(&self) -> u32 {
        // ---
        self.frames_per_packet
    }

    /// Nominal packet duration in microseconds.
    pub fn packet_duration_us(&self) -> u64 {
        // ---
        (self.frames_per_packet as u64 * 1_000_000) / self.sample_rate.max(1) as u64
    }

    /// Nominal RTP tick duration, `a₀ = 1e6 / rate`.
    pub fn tick_us(&self) -> f64 {
        // ---
        1_000_000.0 / self.sample_rate.max(1) as f64
    }

    /// Upper bound on a received RTP datagram: header, 15 CSRCs, payload, slack.
    pub fn max_datagram(&self) -> usize {
        // ---
        12 + 15 * 4 + self.chunk_bytes() + 512
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        // ---
        Self::l16_stereo(48_000)
    }
}

/// Swaps the byte order of every 16-bit sample while copying.
///
/// `dst` must be at least as long as `src`; a trailing odd byte is copied as-is.
pub fn copy_swap16(src: &[u8], dst: &mut [u8]) {
    // ---
    let even = src.len() & !1;
    for (s, d) in src[..even].chunks_exact(2).zip(dst.chunks_exact_mut(2)) {
        d[0] = s[1];
        d[1] = s[0];
    }
    if even < src.len() {
        dst[even] = src[even];
    }
}

/// Swaps the byte order of every 16-bit sample in place.
pub fn swap16_in_place(buf: &mut [u8]) {
    // ---
    for pair in buf.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

/// Scales little-endian s16 samples in place with saturation.
///
/// A volume of exactly 1.0 leaves the buffer untouched.
pub fn scale_s16le(buf: &mut [u8], volume: f32) {
    // ---
    if volume >= 1.0 {
        return;
    }
    let volume = volume.max(0.0);
    for pair in buf.chunks_exact_mut(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        let scaled = scale_sample(sample, volume);
        pair.copy_from_slice(&scaled.to_le_bytes());
    }
}

/// Saturating per-sample volume multiply.
pub fn scale_sample(sample: i16, volume: f32) -> i16 {
    // ---
    let scaled = (sample as f32 * volume) as i32;
    scaled.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_chunk_framing_at_48k() {
        // ---
        let format = AudioFormat::l16_stereo(48_000);
        assert_eq!(format.chunk_bytes(), PCM_CHUNK);
        assert_eq!(format.chunk_bytes(), 1152);
        assert_eq!(format.packet_duration_us(), 6_000);
        assert_eq!(format.ticks_per_packet(), 288);
        assert!((format.tick_us() - 20.833_333).abs() < 1e-3);
    }

    #[test]
    fn test_copy_swap16() {
        // ---
        let wire = [0x12, 0x34, 0xAB, 0xCD];
        let mut host = [0u8; 4];
        copy_swap16(&wire, &mut host);
        assert_eq!(host, [0x34, 0x12, 0xCD, 0xAB]);

        swap16_in_place(&mut host);
        assert_eq!(host, wire);
    }

    #[test]
    fn test_scale_saturates_and_halves() {
        // ---
        assert_eq!(scale_sample(i16::MIN, 0.5), -16384);
        assert_eq!(scale_sample(i16::MAX, 0.5), 16383);
        assert_eq!(scale_sample(1000, 0.0), 0);

        let mut buf = 1000i16.to_le_bytes().to_vec();
        scale_s16le(&mut buf, 1.0);
        assert_eq!(i16::from_le_bytes([buf[0], buf[1]]), 1000);
        scale_s16le(&mut buf, 0.25);
        assert_eq!(i16::from_le_bytes([buf[0], buf[1]]), 250);
    }
}
