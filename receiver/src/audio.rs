//! Sample sinks: where decoded PCM chunks end up.
//!
//! Every sink takes host-order s16le interleaved stereo chunks. The playout
//! scheduler is generic over [`SampleSink`], so the sink is chosen once at
//! pipeline construction from the device mode.

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use hound::{WavSpec, WavWriter};
use parking_lot::Mutex;
use scream_rtp_common::audio::{scale_sample, CHANNELS, PCM_CHUNK};
use tracing::{debug, info, warn};

use crate::error::SinkError;

/// Destination for PCM chunks.
pub trait SampleSink {
    /// Writes one chunk of host-order s16le interleaved stereo.
    ///
    /// # Errors
    ///
    /// Returns `SinkError` if the chunk cannot be delivered.
    fn write(&mut self, pcm: &[u8]) -> Result<(), SinkError>;

    /// Linear gain for subsequent writes.
    fn set_volume(&mut self, volume: f32);

    fn name(&self) -> &'static str;
}

fn check_frames(pcm: &[u8]) -> Result<(), SinkError> {
    // ---
    if pcm.len() % (CHANNELS as usize * 2) != 0 {
        return Err(SinkError::BadLength(pcm.len()));
    }
    Ok(())
}

fn samples(pcm: &[u8]) -> impl Iterator<Item = i16> + '_ {
    // ---
    pcm.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]]))
}

/// Samples queued between the playout thread and the device callback.
const CPAL_QUEUE_CHUNKS: usize = 16;

/// Audio output through the default cpal device.
///
/// The device callback pulls samples from a bounded queue and plays
/// silence when it runs dry. The stream is not `Send`, so a `CpalSink`
/// must be created on the thread that drives it.
pub struct CpalSink {
    // ---
    _stream: Stream,
    queue: Arc<Mutex<VecDeque<i16>>>,
    capacity: usize,
    volume: f32,
    dropped_chunks: u64,
}

impl CpalSink {
    // ---
    /// Opens the default output device at `sample_rate`, stereo i16.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - No audio output device is available
    /// - Stream creation or start fails
    pub fn new(sample_rate: u32) -> Result<Self, SinkError> {
        // ---
        info!("Initializing audio playback at {} Hz", sample_rate);

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| SinkError::Device("no output device available".into()))?;
        if let Ok(name) = device.name() {
            info!("Using audio device: {}", name);
        }

        let capacity = CPAL_QUEUE_CHUNKS * PCM_CHUNK / 2;
        let queue = Arc::new(Mutex::new(VecDeque::with_capacity(capacity)));
        let stream = Self::build_stream(&device, sample_rate, Arc::clone(&queue))?;

        Ok(Self {
            _stream: stream,
            queue,
            capacity,
            volume: 1.0,
            dropped_chunks: 0,
        })
    }

    fn build_stream(device: &Device, sample_rate: u32, queue: Arc<Mutex<VecDeque<i16>>>) -> Result<Stream, SinkError> {
        // ---
        let config = StreamConfig {
            channels: CHANNELS,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        debug!("Stream config: {:?}", config);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let mut queue = queue.lock();
                    for sample in data.iter_mut() {
                        *sample = queue.pop_front().unwrap_or(0);
                    }
                },
                |err| {
                    warn!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| SinkError::Device(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| SinkError::Device(format!("failed to start audio stream: {e}")))?;
        info!("Audio stream started");
        Ok(stream)
    }
}

impl SampleSink for CpalSink {
    fn write(&mut self, pcm: &[u8]) -> Result<(), SinkError> {
        // ---
        check_frames(pcm)?;
        let mut queue = self.queue.lock();
        if queue.len() + pcm.len() / 2 > self.capacity {
            self.dropped_chunks += 1;
            if self.dropped_chunks.is_power_of_two() {
                warn!("Audio device queue full, dropped {} chunks", self.dropped_chunks);
            }
            return Ok(());
        }
        let volume = self.volume;
        queue.extend(samples(pcm).map(|s| scale_sample(s, volume)));
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) {
        // ---
        self.volume = volume;
    }

    fn name(&self) -> &'static str {
        "cpal"
    }
}

/// Writes the played stream to a 16-bit stereo WAV file.
///
/// Stands in for a digital (S/PDIF) output: a clocked bit-exact sink.
pub struct WavFileSink {
    // ---
    writer: Option<WavWriter<BufWriter<File>>>,
    volume: f32,
}

impl WavFileSink {
    // ---
    /// Creates (or truncates) `path`.
    ///
    /// # Errors
    ///
    /// Returns `SinkError::Wav` if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P, sample_rate: u32) -> Result<Self, SinkError> {
        // ---
        let spec = WavSpec {
            channels: CHANNELS,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = WavWriter::create(path.as_ref(), spec)?;
        info!("Writing playout to {}", path.as_ref().display());
        Ok(Self {
            writer: Some(writer),
            volume: 1.0,
        })
    }

    /// Flushes and finalizes the WAV header.
    ///
    /// # Errors
    ///
    /// Returns `SinkError::Wav` if the final write fails.
    pub fn finalize(mut self) -> Result<(), SinkError> {
        // ---
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        }
        Ok(())
    }
}

impl SampleSink for WavFileSink {
    fn write(&mut self, pcm: &[u8]) -> Result<(), SinkError> {
        // ---
        check_frames(pcm)?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SinkError::Device("WAV sink already finalized".into()))?;
        let volume = self.volume;
        for s in samples(pcm) {
            writer.write_sample(scale_sample(s, volume))?;
        }
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) {
        // ---
        self.volume = volume;
    }

    fn name(&self) -> &'static str {
        "wav"
    }
}

/// Everything a [`MemorySink`] has seen.
#[derive(Debug, Default, Clone)]
pub struct MemorySinkLog {
    pub writes: Vec<Vec<u8>>,
    pub volumes: Vec<f32>,
}

/// Recording sink for tests and offline runs. Clones share the log.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    // ---
    log: Arc<Mutex<MemorySinkLog>>,
    fail_writes: bool,
}

impl MemorySink {
    // ---
    pub fn new() -> Self {
        // ---
        Self::default()
    }

    /// A sink whose writes always fail.
    pub fn failing() -> Self {
        // ---
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn log(&self) -> MemorySinkLog {
        // ---
        self.log.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        // ---
        self.log.lock().writes.len()
    }
}

impl SampleSink for MemorySink {
    fn write(&mut self, pcm: &[u8]) -> Result<(), SinkError> {
        // ---
        check_frames(pcm)?;
        if self.fail_writes {
            return Err(SinkError::Device("memory sink set to fail".into()));
        }
        self.log.lock().writes.push(pcm.to_vec());
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) {
        // ---
        self.log.lock().volumes.push(volume);
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_memory_sink_records() {
        // ---
        let handle = MemorySink::new();
        let mut sink = handle.clone();
        sink.write(&[1, 0, 2, 0]).expect("write failed");
        sink.set_volume(0.5);

        let log = handle.log();
        assert_eq!(log.writes, vec![vec![1, 0, 2, 0]]);
        assert_eq!(log.volumes, vec![0.5]);
        assert!(sink.write(&[1, 0, 2]).is_err());
    }

    #[test]
    fn test_wav_sink_writes_scaled_samples() {
        // ---
        let path = std::env::temp_dir().join(format!("scream-wav-sink-{}.wav", std::process::id()));
        let mut sink = WavFileSink::create(&path, 48_000).expect("create failed");
        sink.set_volume(0.5);
        let pcm: Vec<u8> = [1000i16, -1000, 2000, -2000]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        sink.write(&pcm).expect("write failed");
        sink.finalize().expect("finalize failed");

        let mut reader = hound::WavReader::open(&path).expect("open failed");
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 48_000);
        let read: Vec<i16> = reader
            .samples::<i16>()
            .collect::<Result<_, _>>()
            .expect("read failed");
        assert_eq!(read, vec![500, -500, 1000, -1000]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_cpal_sink_creation() {
        // ---
        // Requires an audio device; skipped in CI and containers.
        let Ok(mut sink) = CpalSink::new(48_000) else {
            println!("Skipping: no audio device available (expected in CI)");
            return;
        };
        sink.write(&vec![0u8; PCM_CHUNK]).expect("write failed");
    }
}
