/// Audio source module
///
/// The listener pulls fixed-size chunks from an `AudioSource`. Three sources
/// are provided: the default microphone (cpal), a 16kHz mono WAV file
/// (hound), and an in-memory chunk queue.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::audio_buffer::{
    AudioBuffer, AudioBufferError, AudioChunk, AudioSample, CHANNELS, SAMPLE_RATE,
};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio stream configuration failed: {0}")]
    StreamConfig(String),

    #[error("Audio stream closed: {0}")]
    StreamClosed(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid chunk: expected {expected} samples, got {actual}")]
    ChunkSize { expected: usize, actual: usize },

    #[error("Audio input exhausted")]
    Exhausted,

    #[error("Audio buffer error: {0}")]
    Buffer(#[from] AudioBufferError),

    #[error("WAV read error: {0}")]
    Wav(#[from] hound::Error),
}

/// Blocking source of fixed-length audio chunks
#[cfg_attr(test, mockall::automock)]
pub trait AudioSource {
    /// Block until exactly `chunk_size` samples are available and return them
    fn read_chunk(&mut self, chunk_size: usize) -> Result<AudioChunk, SourceError>;
}

impl<S: AudioSource + ?Sized> AudioSource for Box<S> {
    fn read_chunk(&mut self, chunk_size: usize) -> Result<AudioChunk, SourceError> {
        (**self).read_chunk(chunk_size)
    }
}

/// Default microphone captured through cpal
///
/// The stream callback pushes into a shared ring buffer; `read_chunk`
/// blocks on that buffer. A stream error closes the buffer so the next
/// read fails instead of hanging.
pub struct MicrophoneSource {
    _stream: Stream,
    buffer: Arc<AudioBuffer>,
    device_name: String,
}

impl MicrophoneSource {
    /// Open the default input device at 16kHz mono and start capturing
    ///
    /// The capture ring holds at least two chunks of `chunk_size`.
    pub fn open(chunk_size: usize) -> Result<Self, SourceError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| SourceError::DeviceUnavailable("no input device available".to_string()))?;

        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let candidates: Vec<_> = device
            .supported_input_configs()
            .map_err(|e| SourceError::StreamConfig(e.to_string()))?
            .filter(|c| {
                c.channels() == CHANNELS
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
            .collect();

        // Prefer native i16, otherwise convert from f32
        let range = candidates
            .iter()
            .find(|c| c.sample_format() == SampleFormat::I16)
            .or_else(|| candidates.iter().find(|c| c.sample_format() == SampleFormat::F32))
            .cloned()
            .ok_or_else(|| {
                SourceError::StreamConfig(format!(
                    "no mono {} Hz i16/f32 input config on {}",
                    SAMPLE_RATE, device_name
                ))
            })?;

        let sample_format = range.sample_format();
        let config = range.with_sample_rate(SampleRate(SAMPLE_RATE)).config();
        let buffer = Arc::new(AudioBuffer::for_chunk_size(chunk_size));

        let stream = match sample_format {
            SampleFormat::I16 => build_stream::<i16>(&device, &config, &buffer, |s| s)?,
            _ => build_stream::<f32>(&device, &config, &buffer, f32_to_i16)?,
        };

        stream
            .play()
            .map_err(|e| SourceError::StreamConfig(e.to_string()))?;

        info!(
            "Audio capture started: device={}, format={:?}, rate={} Hz",
            device_name, sample_format, SAMPLE_RATE
        );

        Ok(Self {
            _stream: stream,
            buffer,
            device_name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl AudioSource for MicrophoneSource {
    fn read_chunk(&mut self, chunk_size: usize) -> Result<AudioChunk, SourceError> {
        match self.buffer.read_blocking(chunk_size) {
            Ok(samples) => Ok(AudioChunk::new(samples)),
            Err(AudioBufferError::Closed(_)) => Err(SourceError::StreamClosed(format!(
                "input stream on {} stopped",
                self.device_name
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    buffer: &Arc<AudioBuffer>,
    convert: fn(T) -> AudioSample,
) -> Result<Stream, SourceError>
where
    T: SizedSample + 'static,
{
    let data_buffer = Arc::clone(buffer);
    let err_buffer = Arc::clone(buffer);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<AudioSample> = data.iter().map(|&s| convert(s)).collect();
                data_buffer.write(&samples);
            },
            move |err| {
                error!("Audio stream error: {}", err);
                err_buffer.close();
            },
            None,
        )
        .map_err(|e| SourceError::StreamConfig(e.to_string()))
}

/// Convert f32 [-1.0, 1.0] to i16
fn f32_to_i16(sample: f32) -> AudioSample {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as AudioSample
}

/// 16kHz mono 16-bit WAV file replayed chunk by chunk
pub struct WavFileSource {
    path: PathBuf,
    samples: hound::WavIntoSamples<BufReader<File>, AudioSample>,
}

impl WavFileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let reader = hound::WavReader::open(&path)?;
        let spec = reader.spec();

        if spec.sample_rate != SAMPLE_RATE
            || spec.channels != CHANNELS
            || spec.bits_per_sample != 16
            || spec.sample_format != hound::SampleFormat::Int
        {
            return Err(SourceError::UnsupportedFormat(format!(
                "{}: {} Hz, {} channel(s), {}-bit {:?} (need {} Hz mono 16-bit int)",
                path.display(),
                spec.sample_rate,
                spec.channels,
                spec.bits_per_sample,
                spec.sample_format,
                SAMPLE_RATE
            )));
        }

        info!(
            "Replaying {} ({:.2}s)",
            path.display(),
            reader.duration() as f64 / SAMPLE_RATE as f64
        );

        Ok(Self {
            path,
            samples: reader.into_samples::<AudioSample>(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AudioSource for WavFileSource {
    fn read_chunk(&mut self, chunk_size: usize) -> Result<AudioChunk, SourceError> {
        let mut samples = Vec::with_capacity(chunk_size);

        for sample in self.samples.by_ref().take(chunk_size) {
            samples.push(sample?);
        }

        if samples.len() < chunk_size {
            debug!(
                "Discarding trailing {} samples of {}",
                samples.len(),
                self.path.display()
            );
            return Err(SourceError::Exhausted);
        }

        Ok(AudioChunk::new(samples))
    }
}

/// Pre-recorded chunks served in order
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    chunks: VecDeque<AudioChunk>,
}

impl MemorySource {
    pub fn new(chunks: impl IntoIterator<Item = AudioChunk>) -> Self {
        Self {
            chunks: chunks.into_iter().collect(),
        }
    }

    pub fn push(&mut self, chunk: AudioChunk) {
        self.chunks.push_back(chunk);
    }

    pub fn remaining(&self) -> usize {
        self.chunks.len()
    }
}

impl AudioSource for MemorySource {
    fn read_chunk(&mut self, chunk_size: usize) -> Result<AudioChunk, SourceError> {
        let chunk = self.chunks.pop_front().ok_or(SourceError::Exhausted)?;

        if chunk.len() != chunk_size {
            return Err(SourceError::ChunkSize {
                expected: chunk_size,
                actual: chunk.len(),
            });
        }

        Ok(chunk)
    }
}
