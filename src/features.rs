/// Audio feature pipeline for ONNX wake-word models
///
/// Raw 16kHz samples are turned into mel-spectrogram frames, and windows of
/// mel frames into 96-dimensional speech embeddings. Wake-word classifiers
/// score the most recent run of embeddings.

use anyhow::{bail, Context, Result};
use ndarray::{Array2, Array3, Array4};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::collections::VecDeque;
use std::path::Path;
use tracing::trace;

use crate::audio_buffer::AudioSample;

/// Samples per melspectrogram call (80ms)
pub const FEATURE_CHUNK: usize = 1280;
pub const MEL_BINS: usize = 32;
/// Mel frames per embedding
pub const EMBEDDING_WINDOW: usize = 76;
pub const EMBEDDING_DIM: usize = 96;
/// Embeddings per classifier input
pub const CLASSIFICATION_FRAMES: usize = 16;

pub const MELSPEC_MODEL: &str = "melspectrogram.onnx";
pub const EMBEDDING_MODEL: &str = "embedding_model.onnx";

const MAX_MEL_FRAMES: usize = EMBEDDING_WINDOW * 2;
const MAX_EMBEDDINGS: usize = 120;

/// Build a single-threaded inference session from a model file
pub fn load_session(path: &Path) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(1)?
        .with_inter_threads(1)?
        .commit_from_file(path)
        .with_context(|| format!("Failed to load model {}", path.display()))?;

    Ok(session)
}

/// Streaming melspectrogram + embedding extractor
pub struct FeatureExtractor {
    melspec: Session,
    embedding: Session,
    raw: Vec<AudioSample>,
    mel_frames: VecDeque<[f32; MEL_BINS]>,
    embeddings: VecDeque<[f32; EMBEDDING_DIM]>,
}

impl FeatureExtractor {
    pub fn new(melspec: Session, embedding: Session) -> Self {
        Self {
            melspec,
            embedding,
            raw: Vec::with_capacity(FEATURE_CHUNK * 2),
            mel_frames: VecDeque::with_capacity(MAX_MEL_FRAMES),
            embeddings: VecDeque::with_capacity(MAX_EMBEDDINGS),
        }
    }

    /// Queue samples for `process_block`
    pub fn buffer(&mut self, samples: &[AudioSample]) {
        self.raw.extend_from_slice(samples);
    }

    /// Run the models over the next whole block of queued samples
    ///
    /// Returns `false` once fewer than `FEATURE_CHUNK` samples are queued.
    pub fn process_block(&mut self) -> Result<bool> {
        if self.raw.len() < FEATURE_CHUNK {
            return Ok(false);
        }

        let block: Vec<f32> = self.raw.drain(..FEATURE_CHUNK).map(f32::from).collect();
        let input = Array2::from_shape_vec((1, FEATURE_CHUNK), block)?;
        let tensor = Tensor::from_array(input)?;

        let raw_mel: Vec<f32> = {
            let outputs = self.melspec.run(ort::inputs![tensor])?;
            let output: ndarray::ArrayViewD<f32> = outputs[0]
                .try_extract_array()
                .context("Failed to extract melspec output")?;
            output.iter().copied().collect()
        };

        for frame in scale_mel_frames(&raw_mel) {
            if self.mel_frames.len() >= MAX_MEL_FRAMES {
                self.mel_frames.pop_front();
            }
            self.mel_frames.push_back(frame);
        }

        if self.mel_frames.len() >= EMBEDDING_WINDOW {
            self.extract_embedding()?;
        }

        trace!(
            "mel_frames={}, embeddings={}",
            self.mel_frames.len(),
            self.embeddings.len()
        );

        Ok(true)
    }

    fn extract_embedding(&mut self) -> Result<()> {
        let start = self.mel_frames.len() - EMBEDDING_WINDOW;
        let data: Vec<f32> = self
            .mel_frames
            .range(start..)
            .flat_map(|frame| frame.iter().copied())
            .collect();

        let input = Array4::from_shape_vec((1, EMBEDDING_WINDOW, MEL_BINS, 1), data)?;
        let tensor = Tensor::from_array(input)?;

        let outputs = self.embedding.run(ort::inputs![tensor])?;
        let output: ndarray::ArrayViewD<f32> = outputs[0]
            .try_extract_array()
            .context("Failed to extract embedding output")?;

        if output.len() < EMBEDDING_DIM {
            bail!(
                "Embedding model returned {} values, expected {}",
                output.len(),
                EMBEDDING_DIM
            );
        }

        let mut embedding = [0.0f32; EMBEDDING_DIM];
        for (dst, &value) in embedding.iter_mut().zip(output.iter()) {
            *dst = value;
        }

        if self.embeddings.len() >= MAX_EMBEDDINGS {
            self.embeddings.pop_front();
        }
        self.embeddings.push_back(embedding);

        Ok(())
    }

    /// The latest embeddings shaped `[1, 16, 96]`, once enough exist
    pub fn classifier_input(&self) -> Option<Array3<f32>> {
        if self.embeddings.len() < CLASSIFICATION_FRAMES {
            return None;
        }

        let start = self.embeddings.len() - CLASSIFICATION_FRAMES;
        let data: Vec<f32> = self
            .embeddings
            .range(start..)
            .flat_map(|embedding| embedding.iter().copied())
            .collect();

        Array3::from_shape_vec((1, CLASSIFICATION_FRAMES, EMBEDDING_DIM), data).ok()
    }

    pub fn reset(&mut self) {
        self.raw.clear();
        self.mel_frames.clear();
        self.embeddings.clear();
    }
}

/// Split raw melspectrogram output into frames, rescaled the way the
/// embedding model was trained (`x / 10 + 2`)
fn scale_mel_frames(raw: &[f32]) -> impl Iterator<Item = [f32; MEL_BINS]> + '_ {
    raw.chunks_exact(MEL_BINS).map(|values| {
        let mut frame = [0.0f32; MEL_BINS];
        for (dst, &value) in frame.iter_mut().zip(values) {
            *dst = value / 10.0 + 2.0;
        }
        frame
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mel_frames_are_rescaled() {
        let raw: Vec<f32> = (0..MEL_BINS * 2).map(|i| i as f32 * 10.0).collect();
        let frames: Vec<_> = scale_mel_frames(&raw).collect();

        assert_eq!(frames.len(), 2);
        assert_relative_eq!(frames[0][0], 2.0);
        assert_relative_eq!(frames[0][1], 3.0);
        assert_relative_eq!(frames[1][0], MEL_BINS as f32 + 2.0);
    }

    #[test]
    fn test_partial_mel_frame_is_dropped() {
        let raw = vec![0.0; MEL_BINS + 5];
        assert_eq!(scale_mel_frames(&raw).count(), 1);
    }
}
