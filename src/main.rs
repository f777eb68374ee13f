/// Wake-word recorder binary
///
/// Listens on the default microphone (or replays a WAV file), waits for a
/// wake-word, and records the utterance that follows.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wakeword_recorder::config::{DEFAULT_OUTPUT_DIR, DEFAULT_SETTINGS_PATH};
use wakeword_recorder::scorer::{build_scorer, model_display_name};
use wakeword_recorder::{
    AudioSource, ListenerConfig, ListenerError, Listener, MicrophoneSource, Overrides,
    SettingsStore, SourceError, WavExporter, WavFileSource,
};

#[derive(Parser)]
#[command(name = "wakeword-recorder")]
#[command(about = "Record what is said after a wake-word", long_about = None)]
struct Args {
    /// Settings file (created with defaults if missing)
    #[arg(long, default_value = DEFAULT_SETTINGS_PATH)]
    settings: PathBuf,

    /// How much audio (in number of samples) to predict on at once
    #[arg(long)]
    chunk_size: Option<i64>,

    /// The path of a specific model to load
    #[arg(long)]
    model_path: Option<String>,

    /// The path of a second specific model to load
    #[arg(long)]
    model_path2: Option<String>,

    /// The path of a third specific model to load
    #[arg(long)]
    model_path3: Option<String>,

    /// Directory with melspectrogram.onnx and embedding_model.onnx
    /// (defaults to the directory of the first model)
    #[arg(long)]
    feature_model_dir: Option<PathBuf>,

    /// The inference framework to use (either 'onnx' or 'tflite')
    #[arg(long)]
    inference_framework: Option<String>,

    /// RMS audio level below which audio is considered silent
    #[arg(long)]
    silence_threshold: Option<i64>,

    /// Duration of silence in seconds to stop recording after speech has started
    #[arg(long)]
    silence_duration_seconds: Option<f64>,

    /// Duration in seconds to wait for speech after wakeword detection before timing out
    #[arg(long)]
    no_speech_timeout_seconds: Option<f64>,

    /// Replay a 16kHz mono 16-bit WAV file instead of the microphone
    #[arg(long)]
    input: Option<PathBuf>,

    /// Directory recordings are written to
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,

    /// Also save recordings abandoned because no speech followed the wake-word
    #[arg(long)]
    export_timeouts: bool,

    /// Print the resolved configuration as JSON and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            chunk_size: self.chunk_size,
            model_paths: [
                self.model_path.clone(),
                self.model_path2.clone(),
                self.model_path3.clone(),
            ],
            inference_framework: self.inference_framework.clone(),
            silence_threshold: self.silence_threshold,
            silence_duration_seconds: self.silence_duration_seconds,
            no_speech_timeout_seconds: self.no_speech_timeout_seconds,
            output_dir: Some(self.output_dir.clone()),
            feature_model_dir: self.feature_model_dir.clone(),
            export_timeouts: self.export_timeouts,
        }
    }
}

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("wakeword_recorder=info")),
        )
        .init();

    if let Err(e) = run(Args::parse()) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let settings = SettingsStore::new(&args.settings).load();
    let config = ListenerConfig::resolve(&settings, &args.overrides())
        .with_context(|| format!("Invalid configuration in {}", args.settings.display()))?;

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    info!("Starting wake-word recorder");

    let names: Vec<&str> = config
        .model_paths
        .iter()
        .map(|m| model_display_name(m))
        .collect();
    info!("Inference framework: {}", config.inference_framework);
    info!("Models: {:?}", names);
    let scorer = build_scorer(&config).context("Failed to load wake-word models")?;

    let source: Box<dyn AudioSource> = match &args.input {
        Some(path) => Box::new(
            WavFileSource::open(path)
                .with_context(|| format!("Failed to open input {}", path.display()))?,
        ),
        None => Box::new(
            MicrophoneSource::open(config.chunk_size).context("Failed to open microphone")?,
        ),
    };

    let exporter = WavExporter::new(config.output_dir.clone());

    let mut listener = Listener::new(config, source, scorer, Box::new(exporter));

    match listener.run() {
        Err(ListenerError::Source(SourceError::Exhausted)) => {
            let stats = listener.stats();
            info!(
                "Input finished: {} chunks, {} wake-words, {} recordings, {} timeouts",
                stats.chunks_processed,
                stats.wakewords_detected,
                stats.sessions_completed,
                stats.sessions_timed_out
            );
            Ok(())
        }
        Err(e) => Err(e).context("Listener stopped"),
        Ok(()) => Ok(()),
    }
}
