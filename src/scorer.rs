/// Wake-word scoring module
///
/// Defines the scoring capability the detection poller consumes, the rolling
/// per-model score history, scorer selection, and the loudness-based
/// stand-in scorer used when no wake-word model is configured.

use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;
use tracing::{debug, warn};

use crate::audio_buffer::AudioChunk;
use crate::config::{InferenceFramework, ListenerConfig};
use crate::onnx::OnnxScorer;

/// Scores kept per model, newest last
pub const SCORE_HISTORY_LEN: usize = 30;

/// Latest score per model id
pub type Scores = BTreeMap<String, f32>;

#[derive(Error, Debug)]
pub enum ScorerError {
    #[error("Model load failed: {0}")]
    ModelLoad(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Invalid chunk: expected {expected} samples, got {actual}")]
    InvalidChunk { expected: usize, actual: usize },
}

/// Wake-word scoring capability, independent of the inference backend
#[cfg_attr(test, mockall::automock)]
pub trait WakewordScorer {
    /// Score one chunk, returning the latest confidence (0.0 - 1.0) per model
    fn score(&mut self, chunk: &AudioChunk) -> Result<Scores, ScorerError>;

    /// Drop any internal streaming state
    fn reset(&mut self);
}

impl<S: WakewordScorer + ?Sized> WakewordScorer for Box<S> {
    fn score(&mut self, chunk: &AudioChunk) -> Result<Scores, ScorerError> {
        (**self).score(chunk)
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

/// Rolling score history per model
#[derive(Debug, Clone)]
pub struct ScoreHistory {
    capacity: usize,
    models: BTreeMap<String, VecDeque<f32>>,
}

impl ScoreHistory {
    pub fn new() -> Self {
        Self::with_capacity(SCORE_HISTORY_LEN)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            models: BTreeMap::new(),
        }
    }

    /// Append the latest scores, evicting the oldest past capacity
    pub fn push(&mut self, scores: &Scores) {
        let capacity = self.capacity;

        for (model, &score) in scores {
            let history = self
                .models
                .entry(model.clone())
                .or_insert_with(|| VecDeque::with_capacity(capacity));

            if history.len() >= capacity {
                history.pop_front();
            }
            history.push_back(score);
        }
    }

    /// Most recent score for a model
    pub fn latest(&self, model: &str) -> Option<f32> {
        self.models.get(model).and_then(|h| h.back().copied())
    }

    /// Full history for a model, oldest first
    pub fn scores(&self, model: &str) -> Option<&VecDeque<f32>> {
        self.models.get(model)
    }

    /// Model ids in sorted order
    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// First model (by id) whose latest score is strictly above `threshold`
    pub fn first_above(&self, threshold: f32) -> Option<(&str, f32)> {
        self.models.iter().find_map(|(model, history)| {
            history
                .back()
                .copied()
                .filter(|&score| score > threshold)
                .map(|score| (model.as_str(), score))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn clear(&mut self) {
        self.models.clear();
    }
}

impl Default for ScoreHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable model name derived from a model id or path
///
/// Takes the last path component (either separator) and cuts it at the
/// first `.`, so `C:\models\hey_jarvis.v1.onnx` becomes `hey_jarvis`.
pub fn model_display_name(model_id: &str) -> &str {
    let file_name = model_id
        .rsplit(['\\', '/'])
        .next()
        .unwrap_or(model_id);

    file_name.split('.').next().unwrap_or(file_name)
}

/// Pick the scorer for a configuration
///
/// Configured ONNX models are loaded with [`OnnxScorer`]. With no models the
/// [`LoudnessScorer`] stands in.
pub fn build_scorer(config: &ListenerConfig) -> Result<Box<dyn WakewordScorer>, ScorerError> {
    if config.model_paths.is_empty() {
        warn!("No wake-word model configured; using the loudness stand-in scorer");
        return Ok(Box::new(LoudnessScorer::new(Vec::new())));
    }

    match config.inference_framework {
        InferenceFramework::Onnx => Ok(Box::new(OnnxScorer::load(
            &config.model_paths,
            &config.feature_model_dir(),
        )?)),
        InferenceFramework::Tflite => Err(ScorerError::ModelLoad(
            "tflite models need a TensorFlow Lite runtime, which is not linked in; \
             convert the models to onnx"
                .to_string(),
        )),
    }
}

/// Stand-in scorer for running without a wake-word model
///
/// Every model scores the fraction of the most recent window of chunks
/// whose RMS reaches `activation_rms`, so a sustained loud sound detects
/// while short clicks do not.
pub struct LoudnessScorer {
    models: Vec<String>,
    activation_rms: f64,
    window: VecDeque<bool>,
    window_len: usize,
}

impl LoudnessScorer {
    /// Default activation level in raw RMS units
    pub const DEFAULT_ACTIVATION_RMS: f64 = 2000.0;

    /// Default window, 0.8s at 1280-sample chunks
    pub const DEFAULT_WINDOW: usize = 10;

    /// Scorer for the given model ids; a single `default` model if none
    pub fn new(models: Vec<String>) -> Self {
        let models = if models.is_empty() {
            vec!["default".to_string()]
        } else {
            models
        };

        debug!("Loudness scorer models: {:?}", models);

        Self {
            models,
            activation_rms: Self::DEFAULT_ACTIVATION_RMS,
            window: VecDeque::with_capacity(Self::DEFAULT_WINDOW),
            window_len: Self::DEFAULT_WINDOW,
        }
    }

    pub fn with_activation_rms(mut self, activation_rms: f64) -> Self {
        self.activation_rms = activation_rms;
        self
    }

    pub fn with_window(mut self, window_len: usize) -> Self {
        self.window_len = window_len.max(1);
        self
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }
}

impl WakewordScorer for LoudnessScorer {
    fn score(&mut self, chunk: &AudioChunk) -> Result<Scores, ScorerError> {
        if chunk.is_empty() {
            return Err(ScorerError::InvalidChunk {
                expected: 1,
                actual: 0,
            });
        }

        if self.window.len() >= self.window_len {
            self.window.pop_front();
        }
        self.window.push_back(chunk.rms() >= self.activation_rms);

        let loud = self.window.iter().filter(|&&loud| loud).count();
        let score = loud as f32 / self.window_len as f32;

        Ok(self
            .models
            .iter()
            .map(|model| (model.clone(), score))
            .collect())
    }

    fn reset(&mut self) {
        self.window.clear();
    }
}
