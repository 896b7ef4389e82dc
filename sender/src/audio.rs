//! Sample sources: where outgoing PCM comes from.
//!
//! The pacer drains a [`SampleSource`] once per tick. Sources hand out
//! host-order s16le interleaved stereo at the session sample rate and
//! never block: a source with nothing ready returns 0.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use hound::{SampleFormat, WavReader};
use parking_lot::Mutex;
use scream_rtp_common::audio::{CHANNELS, PCM_CHUNK};
use scream_rtp_common::Shutdown;
use tracing::{debug, error, info, warn};

use crate::error::SourceError;

/// Non-blocking supplier of PCM bytes.
pub trait SampleSource {
    /// Copies up to `dst.len()` bytes of s16le stereo into `dst`.
    ///
    /// Returns how many bytes were written; 0 when nothing is ready.
    fn read(&mut self, dst: &mut [u8]) -> usize;

    fn name(&self) -> &'static str;
}

/// Bounded byte ring between a capture callback and the pacer.
///
/// Clones share the ring. When full, the oldest frames are dropped so the
/// stream stays close to real time.
#[derive(Debug, Clone)]
pub struct PcmRing {
    // ---
    inner: Arc<Mutex<VecDeque<u8>>>,
    capacity: usize,
}

impl PcmRing {
    // ---
    /// `capacity` is rounded down to whole stereo frames.
    pub fn new(capacity: usize) -> Self {
        // ---
        let frame = CHANNELS as usize * 2;
        let capacity = (capacity / frame).max(1) * frame;
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Ring sized for `chunks` packets of audio.
    pub fn with_chunks(chunks: usize) -> Self {
        // ---
        Self::new(chunks * PCM_CHUNK)
    }

    /// Appends `pcm`. Returns the number of old bytes dropped to make room.
    pub fn push(&self, pcm: &[u8]) -> usize {
        // ---
        let mut ring = self.inner.lock();
        let pcm = &pcm[pcm.len().saturating_sub(self.capacity)..];
        let overflow = (ring.len() + pcm.len()).saturating_sub(self.capacity);
        ring.drain(..overflow);
        ring.extend(pcm);
        overflow
    }

    pub fn len(&self) -> usize {
        // ---
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        // ---
        self.capacity
    }
}

impl SampleSource for PcmRing {
    fn read(&mut self, dst: &mut [u8]) -> usize {
        // ---
        let mut ring = self.inner.lock();
        let n = ring.len().min(dst.len());
        for (d, s) in dst.iter_mut().zip(ring.drain(..n)) {
            *d = s;
        }
        n
    }

    fn name(&self) -> &'static str {
        "ring"
    }
}

/// A WAV file played in a loop.
///
/// The whole file is converted to s16le stereo at the session rate when
/// opened; pacing comes from the caller.
#[derive(Debug, Clone)]
pub struct WavFileSource {
    // ---
    pcm: Vec<u8>,
    pos: usize,
    loops: u64,
}

impl WavFileSource {
    // ---
    /// Reads and converts `path` for streaming at `sample_rate`.
    ///
    /// Mono input is duplicated to both channels; inputs with more than
    /// two channels keep the first two. Other rates are resampled.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be opened
    /// - WAV format is invalid
    /// - Sample format is unsupported
    pub fn open<P: AsRef<Path>>(path: P, sample_rate: u32) -> Result<Self, SourceError> {
        // ---
        let path = path.as_ref();
        info!("Reading WAV file: {}", path.display());
        let mut reader = WavReader::open(path)?;

        let spec = reader.spec();
        info!(
            "WAV format: {}Hz, {} channels, {} bits",
            spec.sample_rate, spec.channels, spec.bits_per_sample
        );

        let raw: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Int, 16) => reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?,
            (SampleFormat::Float, 32) => reader
                .samples::<f32>()
                .map(|s| s.map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
                .collect::<Result<Vec<_>, _>>()?,
            (SampleFormat::Int, bits) => {
                return Err(SourceError::Format(format!(
                    "{}-bit integer PCM (only 16-bit is supported)",
                    bits
                )))
            }
            (SampleFormat::Float, bits) => {
                return Err(SourceError::Format(format!(
                    "{}-bit float (only 32-bit is supported)",
                    bits
                )))
            }
        };

        let mut stereo = to_stereo(&raw, spec.channels as usize);
        if spec.sample_rate != sample_rate {
            info!("Resampling from {}Hz to {}Hz", spec.sample_rate, sample_rate);
            stereo = resample_linear_stereo(&stereo, spec.sample_rate, sample_rate);
        }
        if stereo.is_empty() {
            return Err(SourceError::Empty);
        }

        info!(
            "Loaded {:.2}s of audio",
            stereo.len() as f64 / (2.0 * sample_rate as f64)
        );
        Ok(Self::from_samples(&stereo))
    }

    /// Source over interleaved stereo samples already at the session rate.
    pub fn from_samples(samples: &[i16]) -> Self {
        // ---
        Self {
            pcm: samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
            pos: 0,
            loops: 0,
        }
    }

    /// How many times playback has wrapped to the start.
    pub fn loops(&self) -> u64 {
        // ---
        self.loops
    }
}

impl SampleSource for WavFileSource {
    fn read(&mut self, dst: &mut [u8]) -> usize {
        // ---
        if self.pcm.is_empty() {
            return 0;
        }
        let mut written = 0;
        while written < dst.len() {
            let n = (self.pcm.len() - self.pos).min(dst.len() - written);
            dst[written..written + n].copy_from_slice(&self.pcm[self.pos..self.pos + n]);
            written += n;
            self.pos += n;
            if self.pos == self.pcm.len() {
                self.pos = 0;
                self.loops += 1;
                debug!("WAV source looped ({} times)", self.loops);
            }
        }
        written
    }

    fn name(&self) -> &'static str {
        "wav"
    }
}

/// Converts interleaved audio with `channels` channels to stereo.
fn to_stereo(samples: &[i16], channels: usize) -> Vec<i16> {
    // ---
    match channels {
        0 => Vec::new(),
        1 => samples.iter().flat_map(|&s| [s, s]).collect(),
        2 => samples.to_vec(),
        n => {
            info!("Keeping the first two of {} channels", n);
            samples.chunks_exact(n).flat_map(|f| [f[0], f[1]]).collect()
        }
    }
}

/// Resamples interleaved stereo using linear interpolation per channel.
///
/// Adequate for test material; not a high-fidelity converter.
fn resample_linear_stereo(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    // ---
    let frames = samples.len() / 2;
    if from_rate == to_rate || frames == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let new_frames = (frames as f64 / ratio) as usize;
    let mut out = Vec::with_capacity(new_frames * 2);

    for i in 0..new_frames {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        for ch in 0..2 {
            if idx + 1 >= frames {
                out.push(samples[(frames - 1) * 2 + ch]);
            } else {
                let frac = src_pos - idx as f64;
                let s0 = samples[idx * 2 + ch] as f64;
                let s1 = samples[(idx + 1) * 2 + ch] as f64;
                out.push((s0 + (s1 - s0) * frac) as i16);
            }
        }
    }
    out
}

/// Interleaved sample ramp for tests: sample `i` has value `start + i`.
#[derive(Debug, Clone)]
pub struct RampSource {
    // ---
    next: i16,
    available: usize,
}

impl RampSource {
    // ---
    /// Produces `available` bytes in total, starting at `start`.
    pub fn new(start: i16, available: usize) -> Self {
        // ---
        Self {
            next: start,
            available,
        }
    }

    /// Makes `bytes` more bytes available.
    pub fn refill(&mut self, bytes: usize) {
        // ---
        self.available += bytes;
    }
}

impl SampleSource for RampSource {
    fn read(&mut self, dst: &mut [u8]) -> usize {
        // ---
        let n = (dst.len().min(self.available)) & !1;
        for pair in dst[..n].chunks_exact_mut(2) {
            pair.copy_from_slice(&self.next.to_le_bytes());
            self.next = self.next.wrapping_add(1);
        }
        self.available -= n;
        n
    }

    fn name(&self) -> &'static str {
        "ramp"
    }
}

/// Capture from the default cpal input device into a [`PcmRing`].
///
/// The stream is not `Send`; build it on the thread that keeps it alive.
pub struct CpalSource {
    // ---
    _stream: Stream,
    ring: PcmRing,
}

impl CpalSource {
    // ---
    /// Opens the default input device at `sample_rate`, stereo i16.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - No audio input device is available
    /// - Stream creation or start fails
    pub fn new(sample_rate: u32, ring: PcmRing) -> Result<Self, SourceError> {
        // ---
        info!("Initializing audio capture at {} Hz", sample_rate);

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| SourceError::Device("no input device available".into()))?;
        if let Ok(name) = device.name() {
            info!("Using audio device: {}", name);
        }

        let config = StreamConfig {
            channels: CHANNELS,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        debug!("Stream config: {:?}", config);

        let producer = ring.clone();
        let mut scratch = Vec::with_capacity(PCM_CHUNK);
        let mut overruns: u64 = 0;
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    scratch.clear();
                    scratch.extend(data.iter().flat_map(|s| s.to_le_bytes()));
                    if producer.push(&scratch) > 0 {
                        overruns += 1;
                        if overruns.is_power_of_two() {
                            warn!("Capture ring full, dropped audio ({} times)", overruns);
                        }
                    }
                },
                |err| {
                    warn!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| SourceError::Device(format!("failed to build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| SourceError::Device(format!("failed to start audio stream: {e}")))?;
        info!("Audio capture started");

        Ok(Self { _stream: stream, ring })
    }

    pub fn ring(&self) -> &PcmRing {
        // ---
        &self.ring
    }
}

/// How often the capture thread checks for shutdown.
const CAPTURE_POLL: Duration = Duration::from_millis(50);

/// Starts capture on its own OS thread, feeding `ring` until `shutdown`
/// clears.
///
/// # Errors
///
/// Returns error if the thread cannot be spawned or the device fails to
/// open.
pub fn spawn_capture(sample_rate: u32, ring: PcmRing, shutdown: Shutdown) -> Result<JoinHandle<()>> {
    // ---
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let handle = thread::Builder::new()
        .name("capture".into())
        .spawn(move || {
            let source = match CpalSource::new(sample_rate, ring) {
                Ok(source) => {
                    let _ = ready_tx.send(Ok(()));
                    source
                }
                Err(e) => {
                    error!("Failed to open capture device: {}", e);
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            while shutdown.is_running() {
                thread::sleep(CAPTURE_POLL);
            }
            info!("Capture stopped ({} bytes left in ring)", source.ring().len());
        })
        .context("failed to spawn capture thread")?;

    ready_rx
        .recv()
        .context("capture thread exited before reporting")?
        .context("failed to open audio input")?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_to_stereo_duplicates_mono() {
        // ---
        assert_eq!(to_stereo(&[100, 200], 1), vec![100, 100, 200, 200]);
    }

    #[test]
    fn test_to_stereo_keeps_first_two_channels() {
        // ---
        let quad = vec![1, 2, 3, 4, 5, 6, 7, 8];
        assert_eq!(to_stereo(&quad, 4), vec![1, 2, 5, 6]);
    }

    #[test]
    fn test_resample_linear_upsample() {
        // ---
        let samples = vec![0, 0, 1000, -1000, 2000, -2000];
        let resampled = resample_linear_stereo(&samples, 24_000, 48_000);

        assert_eq!(resampled.len(), 12);
        assert_eq!(&resampled[..4], &[0, 0, 500, -500]);
    }

    #[test]
    fn test_resample_linear_same_rate() {
        // ---
        let samples = vec![100, 200, 300, 400];
        assert_eq!(resample_linear_stereo(&samples, 48_000, 48_000), samples);
    }

    #[test]
    fn test_ring_drops_oldest_when_full() {
        // ---
        let mut ring = PcmRing::new(8);
        assert_eq!(ring.push(&[1, 2, 3, 4, 5, 6]), 0);
        assert_eq!(ring.push(&[7, 8, 9, 10]), 2);

        let mut out = [0u8; 16];
        assert_eq!(ring.read(&mut out), 8);
        assert_eq!(&out[..8], &[3, 4, 5, 6, 7, 8, 9, 10]);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_wav_source_loops() {
        // ---
        let mut source = WavFileSource::from_samples(&[1, 2]);
        let mut out = [0u8; 10];
        assert_eq!(source.read(&mut out), 10);
        assert_eq!(out, [1, 0, 2, 0, 1, 0, 2, 0, 1, 0]);
        assert_eq!(source.loops(), 2);
    }

    #[test]
    fn test_wav_source_round_trips_file() {
        // ---
        let path = std::env::temp_dir().join(format!("scream-wav-source-{}.wav", std::process::id()));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).expect("create failed");
        for s in [10i16, -20, 30] {
            writer.write_sample(s).expect("write failed");
        }
        writer.finalize().expect("finalize failed");

        let mut source = WavFileSource::open(&path, 48_000).expect("open failed");
        let mut out = [0u8; 12];
        assert_eq!(source.read(&mut out), 12);
        let samples: Vec<i16> = out.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect();
        assert_eq!(samples, vec![10, 10, -20, -20, 30, 30]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_ramp_source_is_bounded() {
        // ---
        let mut source = RampSource::new(5, 4);
        let mut out = [0u8; 8];
        assert_eq!(source.read(&mut out), 4);
        assert_eq!(&out[..4], &[5, 0, 6, 0]);
        assert_eq!(source.read(&mut out), 0);
        source.refill(2);
        assert_eq!(source.read(&mut out), 2);
        assert_eq!(&out[..2], &[7, 0]);
    }

    #[test]
    fn test_cpal_source_creation() {
        // ---
        // Requires an audio device; skipped in CI and containers.
        let Ok(source) = CpalSource::new(48_000, PcmRing::with_chunks(4)) else {
            println!("Skipping: no audio input device available (expected in CI)");
            return;
        };
        assert_eq!(source.ring().capacity(), 4 * PCM_CHUNK);
    }
}
