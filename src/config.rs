/// Configuration module
///
/// Loads the JSON settings file (creating or repairing it as needed), applies
/// command-line overrides, and resolves everything into the immutable
/// `ListenerConfig` the loop runs with.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::audio_buffer::{CHANNELS, SAMPLE_RATE};

/// Default location of the settings file
pub const DEFAULT_SETTINGS_PATH: &str = "settings.json";

/// Settings category consumed by the listener
pub const WAKEWORD_CATEGORY: &str = "wakeword_settings";

/// Chunk size used when none (or an unusable one) is configured
pub const DEFAULT_CHUNK_SIZE: usize = 1280; // 80ms at 16kHz

/// Trailing score a model must exceed to count as a detection
pub const DETECTION_THRESHOLD: f32 = 0.5;

/// Default directory for exported recordings
pub const DEFAULT_OUTPUT_DIR: &str = "recordings";

/// Settings keys holding model paths, in priority order
pub const MODEL_PATH_KEYS: [&str; 3] = ["model_path1", "model_path2", "model_path3"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(String),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("Unsupported inference framework: {0} (expected 'onnx' or 'tflite')")]
    UnsupportedFramework(String),

    #[error("Settings file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Default settings document
pub fn default_settings() -> Value {
    json!({
        "wakeword_settings": {
            "model_path1": "",
            "model_path2": "",
            "model_path3": "",
            "chunk_size": DEFAULT_CHUNK_SIZE,
            "inference_framework": "onnx",
            "silence_threshold": 500,
            "silence_duration_seconds": 1.0,
            "no_speech_timeout_seconds": 4.0
        }
    })
}

/// A loaded settings document, always shaped like `default_settings()`
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    document: Value,
}

impl Settings {
    pub fn defaults() -> Self {
        Self {
            document: default_settings(),
        }
    }

    /// Merge a raw document over the defaults
    ///
    /// Known keys present in `loaded` win, missing known keys take their
    /// default, and unknown keys or categories are dropped.
    pub fn merged(loaded: &Value) -> Self {
        let defaults = default_settings();
        let mut merged = Map::new();

        if let Value::Object(categories) = &defaults {
            for (category, default_value) in categories {
                let loaded_value = loaded.get(category);

                let value = match (default_value, loaded_value) {
                    (Value::Object(default_keys), Some(Value::Object(loaded_keys))) => {
                        let keys = default_keys
                            .iter()
                            .map(|(key, default)| {
                                let value = loaded_keys.get(key).unwrap_or(default);
                                (key.clone(), value.clone())
                            })
                            .collect();
                        Value::Object(keys)
                    }
                    (Value::Object(_), _) => default_value.clone(),
                    (_, Some(loaded_value)) => loaded_value.clone(),
                    (_, None) => default_value.clone(),
                };

                merged.insert(category.clone(), value);
            }
        }

        Self {
            document: Value::Object(merged),
        }
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Raw value of a key in the wakeword category
    ///
    /// `None` for both absent keys and explicit `null`.
    pub fn wakeword_value(&self, key: &str) -> Option<&Value> {
        self.document
            .get(WAKEWORD_CATEGORY)
            .and_then(|category| category.get(key))
            .filter(|value| !value.is_null())
    }

    /// Replace a key in the wakeword category
    pub fn set_wakeword_value(&mut self, key: &str, value: Value) {
        if let Some(Value::Object(category)) = self.document.get_mut(WAKEWORD_CATEGORY) {
            category.insert(key.to_string(), value);
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Reads and writes the settings file
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the settings, creating or repairing the file on disk
    ///
    /// A missing or unparsable file is replaced by the defaults. A file
    /// whose merged form differs from what was read is rewritten. Failure
    /// to write is logged and never fails the load.
    pub fn load(&self) -> Settings {
        if !self.path.exists() {
            info!(
                "Settings file not found at {}. Creating with default settings.",
                self.path.display()
            );
            let settings = Settings::defaults();
            self.save_or_warn(&settings);
            return settings;
        }

        let loaded = match self.read_document() {
            Ok(document) => document,
            Err(e) => {
                warn!(
                    "Error loading or parsing {}: {}. Using default settings and overwriting.",
                    self.path.display(),
                    e
                );
                let settings = Settings::defaults();
                self.save_or_warn(&settings);
                return settings;
            }
        };

        let settings = Settings::merged(&loaded);

        if settings.document() != &loaded {
            debug!("Settings file differs from merged settings, rewriting");
            self.save_or_warn(&settings);
        }

        settings
    }

    /// Write settings to the file as indented JSON
    pub fn save(&self, settings: &Settings) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(settings.document())?;
        fs::write(&self.path, contents)?;

        info!("Settings saved to {}", self.path.display());
        Ok(())
    }

    fn read_document(&self) -> Result<Value, ConfigError> {
        let contents = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save_or_warn(&self, settings: &Settings) {
        if let Err(e) = self.save(settings) {
            warn!("Error saving settings to {}: {}", self.path.display(), e);
        }
    }
}

/// Backend the wake-word models are meant to run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InferenceFramework {
    #[default]
    Onnx,
    Tflite,
}

impl FromStr for InferenceFramework {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "onnx" => Ok(Self::Onnx),
            "tflite" => Ok(Self::Tflite),
            other => Err(ConfigError::UnsupportedFramework(other.to_string())),
        }
    }
}

impl fmt::Display for InferenceFramework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Onnx => write!(f, "onnx"),
            Self::Tflite => write!(f, "tflite"),
        }
    }
}

/// Values supplied on the command line, each taking precedence over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub chunk_size: Option<i64>,
    pub model_paths: [Option<String>; 3],
    pub inference_framework: Option<String>,
    pub silence_threshold: Option<i64>,
    pub silence_duration_seconds: Option<f64>,
    pub no_speech_timeout_seconds: Option<f64>,
    pub output_dir: Option<PathBuf>,
    pub feature_model_dir: Option<PathBuf>,
    pub export_timeouts: bool,
}

/// Immutable runtime configuration, built once at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Samples per chunk
    pub chunk_size: usize,

    /// RMS level below which a chunk is silence
    pub silence_threshold: u32,

    /// Silence after speech that ends a recording
    pub silence_duration_seconds: f64,

    /// Time allowed for speech to begin after the wake-word
    pub no_speech_timeout_seconds: f64,

    pub inference_framework: InferenceFramework,

    /// Configured wake-word model paths (empty entries removed)
    pub model_paths: Vec<String>,

    /// Directory holding the shared melspectrogram and embedding models
    #[serde(default)]
    pub feature_model_dir: Option<PathBuf>,

    /// Fixed at 16kHz
    pub sample_rate: u32,

    /// Fixed at mono
    pub channels: u16,

    pub detection_threshold: f32,

    /// Directory recordings are exported into
    pub output_dir: PathBuf,

    /// Also export sessions abandoned because speech never started
    pub export_timeouts: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            silence_threshold: 500,
            silence_duration_seconds: 1.0,
            no_speech_timeout_seconds: 4.0,
            inference_framework: InferenceFramework::Onnx,
            model_paths: Vec::new(),
            feature_model_dir: None,
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            detection_threshold: DETECTION_THRESHOLD,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            export_timeouts: false,
        }
    }
}

impl ListenerConfig {
    /// Resolve settings and overrides into a validated configuration
    pub fn resolve(settings: &Settings, overrides: &Overrides) -> Result<Self, ConfigError> {
        let chunk_size = resolve_chunk_size(settings, overrides);

        let silence_threshold = match overrides.silence_threshold {
            Some(value) => threshold_from_i64(value)?,
            None => {
                let value = required(settings, "silence_threshold")?;
                let value = whole_number(value).ok_or_else(|| {
                    ConfigError::invalid("silence_threshold", format!("expected an integer, got {}", value))
                })?;
                threshold_from_i64(value)?
            }
        };

        let silence_duration_seconds = match overrides.silence_duration_seconds {
            Some(value) => value,
            None => required_seconds(settings, "silence_duration_seconds")?,
        };

        let no_speech_timeout_seconds = match overrides.no_speech_timeout_seconds {
            Some(value) => value,
            None => required_seconds(settings, "no_speech_timeout_seconds")?,
        };

        let inference_framework = match &overrides.inference_framework {
            Some(name) => name.parse()?,
            None => match settings.wakeword_value("inference_framework") {
                Some(Value::String(name)) => name.parse()?,
                Some(other) => {
                    return Err(ConfigError::invalid(
                        "inference_framework",
                        format!("expected a string, got {}", other),
                    ))
                }
                None => InferenceFramework::default(),
            },
        };

        let model_paths = MODEL_PATH_KEYS
            .iter()
            .zip(overrides.model_paths.iter())
            .filter_map(|(key, overridden)| match overridden {
                Some(path) => Some(path.clone()),
                None => settings
                    .wakeword_value(key)
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
            .filter(|path| !path.trim().is_empty())
            .collect();

        let config = Self {
            chunk_size,
            silence_threshold,
            silence_duration_seconds,
            no_speech_timeout_seconds,
            inference_framework,
            model_paths,
            feature_model_dir: overrides.feature_model_dir.clone(),
            output_dir: overrides
                .output_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            export_timeouts: overrides.export_timeouts,
            ..Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::invalid("chunk_size", "must be greater than 0"));
        }

        validate_seconds("silence_duration_seconds", self.silence_duration_seconds)?;
        validate_seconds("no_speech_timeout_seconds", self.no_speech_timeout_seconds)?;

        if self.sample_rate != SAMPLE_RATE {
            return Err(ConfigError::invalid(
                "sample_rate",
                format!("must be {} Hz", SAMPLE_RATE),
            ));
        }

        if self.channels != CHANNELS {
            return Err(ConfigError::invalid("channels", "only mono audio is supported"));
        }

        if !(0.0..=1.0).contains(&self.detection_threshold) {
            return Err(ConfigError::invalid(
                "detection_threshold",
                "must be between 0.0 and 1.0",
            ));
        }

        if self.model_paths.len() > MODEL_PATH_KEYS.len() {
            return Err(ConfigError::invalid(
                "model_paths",
                format!("at most {} models are supported", MODEL_PATH_KEYS.len()),
            ));
        }

        Ok(())
    }

    /// Consecutive silent chunks after speech that end a recording
    pub fn speech_end_chunks(&self) -> usize {
        chunks_for_duration(self.silence_duration_seconds, self.sample_rate, self.chunk_size)
    }

    /// Consecutive silent chunks before speech that abandon a recording
    pub fn no_speech_timeout_chunks(&self) -> usize {
        chunks_for_duration(self.no_speech_timeout_seconds, self.sample_rate, self.chunk_size)
    }

    /// Where the shared feature models live: the explicit directory, else
    /// the directory of the first wake-word model
    pub fn feature_model_dir(&self) -> PathBuf {
        if let Some(dir) = &self.feature_model_dir {
            return dir.clone();
        }

        self.model_paths
            .first()
            .and_then(|path| Path::new(path).parent())
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Duration of one chunk in seconds
    pub fn chunk_duration_secs(&self) -> f64 {
        self.chunk_size as f64 / self.sample_rate as f64
    }
}

/// Number of whole chunks that fit in `seconds` of audio (rounded down)
pub fn chunks_for_duration(seconds: f64, sample_rate: u32, chunk_size: usize) -> usize {
    (seconds * sample_rate as f64 / chunk_size as f64).floor() as usize
}

fn resolve_chunk_size(settings: &Settings, overrides: &Overrides) -> usize {
    let (raw, source) = match overrides.chunk_size {
        Some(value) => (Some(Value::from(value)), "command line"),
        None => (settings.wakeword_value("chunk_size").cloned(), "settings"),
    };

    match raw {
        None => {
            warn!(
                "chunk_size not found in settings or command line. Using default value of {}.",
                DEFAULT_CHUNK_SIZE
            );
            DEFAULT_CHUNK_SIZE
        }
        Some(value) => match value.as_u64().and_then(|v| usize::try_from(v).ok()) {
            Some(size) if size > 0 => size,
            _ => {
                warn!(
                    "Invalid chunk_size {} from {}. Using default value of {}.",
                    value, source, DEFAULT_CHUNK_SIZE
                );
                DEFAULT_CHUNK_SIZE
            }
        },
    }
}

fn required<'a>(settings: &'a Settings, key: &str) -> Result<&'a Value, ConfigError> {
    settings
        .wakeword_value(key)
        .ok_or_else(|| ConfigError::Missing(key.to_string()))
}

fn required_seconds(settings: &Settings, key: &str) -> Result<f64, ConfigError> {
    let value = required(settings, key)?;
    value
        .as_f64()
        .ok_or_else(|| ConfigError::invalid(key, format!("expected a number, got {}", value)))
}

/// Integer value of `value`, accepting floats with no fractional part
fn whole_number(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|v| v.fract() == 0.0 && *v >= i64::MIN as f64 && *v <= i64::MAX as f64)
            .map(|v| v as i64)
    })
}

fn threshold_from_i64(value: i64) -> Result<u32, ConfigError> {
    u32::try_from(value).map_err(|_| {
        ConfigError::invalid(
            "silence_threshold",
            format!("must be between 0 and {}, got {}", u32::MAX, value),
        )
    })
}

fn validate_seconds(key: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::invalid(
            key,
            format!("must be a non-negative number of seconds, got {}", value),
        ));
    }
    Ok(())
}
