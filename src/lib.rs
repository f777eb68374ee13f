/// Wake-word recorder library
///
/// This library listens for wake-words on a chunked audio stream and records
/// the utterance that follows, ending on silence or a no-speech timeout.

pub mod audio_buffer;
pub mod capture;
pub mod config;
pub mod controller;
pub mod energy;
pub mod export;
pub mod features;
pub mod listener;
pub mod onnx;
pub mod poller;
pub mod scorer;

// Re-export main types
pub use audio_buffer::{AudioBuffer, AudioChunk, AudioSample, CHANNELS, SAMPLE_RATE};
pub use capture::{AudioSource, MemorySource, MicrophoneSource, SourceError, WavFileSource};
pub use config::{
    ConfigError, InferenceFramework, ListenerConfig, Overrides, Settings, SettingsStore,
    DEFAULT_CHUNK_SIZE,
};
pub use controller::{
    ControllerStep, FinishedSession, RecorderState, RecordingController, SessionEnd,
};
pub use export::{ExportError, Exporter, WavExporter};
pub use listener::{Listener, ListenerError, ListenerEvent, ListenerStats, SessionReport};
pub use onnx::OnnxScorer;
pub use poller::{DetectionPoller, WakewordDetection};
pub use scorer::{
    build_scorer, LoudnessScorer, ScoreHistory, ScorerError, Scores, WakewordScorer,
};
