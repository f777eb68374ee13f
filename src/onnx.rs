/// ONNX wake-word scorer
///
/// Runs openWakeWord-style models through onnxruntime: shared
/// melspectrogram and embedding models feed one classifier per configured
/// wake-word.

use anyhow::{Context, Result};
use ndarray::Array3;
use ort::session::Session;
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::audio_buffer::AudioChunk;
use crate::features::{self, FeatureExtractor, EMBEDDING_MODEL, MELSPEC_MODEL};
use crate::scorer::{model_display_name, ScorerError, Scores, WakewordScorer};

/// Predictions forced to zero after a reset while the feature windows fill
const WARMUP_PREDICTIONS: usize = 5;

struct Classifier {
    id: String,
    session: Session,
    predictions: usize,
    last_score: f32,
}

impl Classifier {
    fn predict(&mut self, input: &Array3<f32>) -> Result<f32> {
        let tensor = Tensor::from_array(input.clone())?;
        let outputs = self.session.run(ort::inputs![tensor])?;

        let output: ndarray::ArrayViewD<f32> = outputs[0]
            .try_extract_array()
            .context("Failed to extract classifier output")?;

        let mut score = output
            .iter()
            .next()
            .copied()
            .context("Classifier returned no score")?;

        self.predictions += 1;
        if self.predictions <= WARMUP_PREDICTIONS {
            score = 0.0;
        }

        self.last_score = score;
        Ok(score)
    }

    fn reset(&mut self) {
        self.predictions = 0;
        self.last_score = 0.0;
    }
}

/// Wake-word scorer backed by ONNX models
pub struct OnnxScorer {
    features: FeatureExtractor,
    classifiers: Vec<Classifier>,
}

impl OnnxScorer {
    /// Load one classifier per model path plus the shared feature models
    /// found in `feature_dir`
    ///
    /// Every file is checked before any session is built, so a missing
    /// model fails fast.
    pub fn load(model_paths: &[String], feature_dir: &Path) -> Result<Self, ScorerError> {
        if model_paths.is_empty() {
            return Err(ScorerError::ModelLoad(
                "no wake-word models configured".to_string(),
            ));
        }

        let melspec_path = feature_dir.join(MELSPEC_MODEL);
        let embedding_path = feature_dir.join(EMBEDDING_MODEL);

        let required: Vec<PathBuf> = model_paths
            .iter()
            .map(PathBuf::from)
            .chain([melspec_path.clone(), embedding_path.clone()])
            .collect();

        if let Some(missing) = required.iter().find(|path| !path.is_file()) {
            return Err(ScorerError::ModelLoad(format!(
                "model file not found: {}",
                missing.display()
            )));
        }

        let melspec = load(&melspec_path)?;
        let embedding = load(&embedding_path)?;

        let classifiers = model_paths
            .iter()
            .map(|path| {
                debug!("Loading wake-word model {}", path);
                Ok(Classifier {
                    id: path.clone(),
                    session: load(Path::new(path))?,
                    predictions: 0,
                    last_score: 0.0,
                })
            })
            .collect::<Result<Vec<_>, ScorerError>>()?;

        info!(
            "Loaded ONNX wake-word models: {:?}",
            model_paths
                .iter()
                .map(|p| model_display_name(p))
                .collect::<Vec<_>>()
        );

        Ok(Self {
            features: FeatureExtractor::new(melspec, embedding),
            classifiers,
        })
    }

    /// Configured model ids, in load order
    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.classifiers.iter().map(|c| c.id.as_str())
    }

    // Scores every whole feature block in the chunk and keeps the peak per model
    fn infer(&mut self, chunk: &AudioChunk) -> Result<Scores> {
        self.features.buffer(chunk.samples());

        let mut peaks: Vec<Option<f32>> = vec![None; self.classifiers.len()];

        while self.features.process_block()? {
            let Some(input) = self.features.classifier_input() else {
                continue;
            };

            for (classifier, peak) in self.classifiers.iter_mut().zip(peaks.iter_mut()) {
                let score = classifier.predict(&input)?;
                *peak = Some(peak.map_or(score, |p| p.max(score)));
            }
        }

        Ok(self
            .classifiers
            .iter()
            .zip(peaks)
            .map(|(classifier, peak)| {
                (classifier.id.clone(), peak.unwrap_or(classifier.last_score))
            })
            .collect())
    }
}

impl WakewordScorer for OnnxScorer {
    fn score(&mut self, chunk: &AudioChunk) -> Result<Scores, ScorerError> {
        if chunk.is_empty() {
            return Err(ScorerError::InvalidChunk {
                expected: features::FEATURE_CHUNK,
                actual: 0,
            });
        }

        self.infer(chunk)
            .map_err(|e| ScorerError::Inference(format!("{:#}", e)))
    }

    fn reset(&mut self) {
        self.features.reset();
        for classifier in &mut self.classifiers {
            classifier.reset();
        }
    }
}

fn load(path: &Path) -> Result<Session, ScorerError> {
    features::load_session(path).map_err(|e| ScorerError::ModelLoad(format!("{:#}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn touch_feature_models(dir: &Path) {
        fs::write(dir.join(MELSPEC_MODEL), b"not a model").unwrap();
        fs::write(dir.join(EMBEDDING_MODEL), b"not a model").unwrap();
    }

    #[test]
    fn test_missing_model_path_fails_to_load() {
        let dir = tempdir().unwrap();
        touch_feature_models(dir.path());
        let missing = dir.path().join("hey_jarvis.onnx").display().to_string();

        match OnnxScorer::load(&[missing], dir.path()) {
            Err(ScorerError::ModelLoad(reason)) => assert!(reason.contains("hey_jarvis.onnx")),
            Err(other) => panic!("Expected ModelLoad, got {:?}", other),
            Ok(_) => panic!("Expected ModelLoad, got a scorer"),
        }
    }

    #[test]
    fn test_missing_feature_model_fails_to_load() {
        let dir = tempdir().unwrap();
        let model = dir.path().join("alexa.onnx");
        fs::write(&model, b"not a model").unwrap();

        match OnnxScorer::load(&[model.display().to_string()], dir.path()) {
            Err(ScorerError::ModelLoad(reason)) => assert!(reason.contains(MELSPEC_MODEL)),
            Err(other) => panic!("Expected ModelLoad, got {:?}", other),
            Ok(_) => panic!("Expected ModelLoad, got a scorer"),
        }
    }

    #[test]
    fn test_no_models_fails_to_load() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            OnnxScorer::load(&[], dir.path()),
            Err(ScorerError::ModelLoad(_))
        ));
    }

    #[test]
    fn test_broken_model_file_fails_to_load() {
        let dir = tempdir().unwrap();
        touch_feature_models(dir.path());
        let model = dir.path().join("alexa.onnx");
        fs::write(&model, b"not a model").unwrap();

        assert!(matches!(
            OnnxScorer::load(&[model.display().to_string()], dir.path()),
            Err(ScorerError::ModelLoad(_))
        ));
    }
}
