/// Recording export module
///
/// Persists finished recordings. The listener only depends on the
/// `Exporter` capability; `WavExporter` writes 16-bit PCM WAV files.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

use crate::audio_buffer::AudioChunk;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Nothing to export")]
    Empty,

    #[error("Failed to create output directory {0}: {1}")]
    OutputDir(PathBuf, std::io::Error),

    #[error("WAV write error: {0}")]
    Wav(#[from] hound::Error),
}

/// Destination for finished recordings
#[cfg_attr(test, mockall::automock)]
pub trait Exporter {
    /// Persist the chunks in order, returning where they were written
    fn export(
        &mut self,
        name: &str,
        chunks: &[AudioChunk],
        sample_rate: u32,
        channels: u16,
    ) -> Result<PathBuf, ExportError>;
}

impl<E: Exporter + ?Sized> Exporter for Box<E> {
    fn export(
        &mut self,
        name: &str,
        chunks: &[AudioChunk],
        sample_rate: u32,
        channels: u16,
    ) -> Result<PathBuf, ExportError> {
        (**self).export(name, chunks, sample_rate, channels)
    }
}

/// Writes each recording to `<output_dir>/<name>_<unix-millis>.wav`
#[derive(Debug, Clone)]
pub struct WavExporter {
    output_dir: PathBuf,
}

impl WavExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn file_path(&self, name: &str) -> PathBuf {
        let stem: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let stem = if stem.is_empty() { "recording".to_string() } else { stem };

        let mut path = self
            .output_dir
            .join(format!("{}_{}.wav", stem, current_timestamp_millis()));

        // Two sessions inside the same millisecond
        let mut suffix = 1;
        while path.exists() {
            path = self.output_dir.join(format!(
                "{}_{}_{}.wav",
                stem,
                current_timestamp_millis(),
                suffix
            ));
            suffix += 1;
        }

        path
    }
}

impl Exporter for WavExporter {
    fn export(
        &mut self,
        name: &str,
        chunks: &[AudioChunk],
        sample_rate: u32,
        channels: u16,
    ) -> Result<PathBuf, ExportError> {
        if chunks.iter().all(AudioChunk::is_empty) {
            return Err(ExportError::Empty);
        }

        fs::create_dir_all(&self.output_dir)
            .map_err(|e| ExportError::OutputDir(self.output_dir.clone(), e))?;

        let path = self.file_path(name);
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut writer = hound::WavWriter::create(&path, spec)?;
        let mut written = 0usize;

        for chunk in chunks {
            for &sample in chunk.samples() {
                writer.write_sample(sample)?;
            }
            written += chunk.len();
        }

        writer.finalize()?;

        debug!("Wrote {} samples", written);
        info!("Saved recording to {}", path.display());

        Ok(path)
    }
}

/// Get current timestamp in milliseconds
fn current_timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_export_writes_all_chunks_in_order() {
        let dir = tempdir().unwrap();
        let mut exporter = WavExporter::new(dir.path().join("out"));

        let chunks = vec![
            AudioChunk::new(vec![1, 2, 3]),
            AudioChunk::new(vec![4, 5, 6]),
        ];

        let path = exporter.export("hey_jarvis", &chunks, 16000, 1).unwrap();

        assert!(path.starts_with(exporter.output_dir()));
        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("hey_jarvis_"));
        assert!(file_name.ends_with(".wav"));

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, 16000);
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.bits_per_sample, 16);

        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_export_names_do_not_collide() {
        let dir = tempdir().unwrap();
        let mut exporter = WavExporter::new(dir.path());
        let chunks = vec![AudioChunk::constant(7, 16)];

        let first = exporter.export("alexa", &chunks, 16000, 1).unwrap();
        let second = exporter.export("alexa", &chunks, 16000, 1).unwrap();

        assert_ne!(first, second);
        assert!(first.exists());
        assert!(second.exists());
    }

    #[test]
    fn test_export_sanitizes_name() {
        let dir = tempdir().unwrap();
        let mut exporter = WavExporter::new(dir.path());

        let path = exporter
            .export("../evil name", &[AudioChunk::constant(1, 4)], 16000, 1)
            .unwrap();

        assert_eq!(path.parent().unwrap(), dir.path());
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("___evil_name_"));
    }

    #[test]
    fn test_export_rejects_empty_recording() {
        let dir = tempdir().unwrap();
        let mut exporter = WavExporter::new(dir.path());

        assert!(matches!(
            exporter.export("alexa", &[], 16000, 1),
            Err(ExportError::Empty)
        ));
    }
}
