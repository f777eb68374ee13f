/// Listener main module
///
/// Runs the single-threaded read loop: one blocking chunk read per
/// iteration, then either wake-word polling (idle) or the recording state
/// controller (recording). Any collaborator failure ends the loop.

use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

use crate::capture::{AudioSource, SourceError};
use crate::config::ListenerConfig;
use crate::controller::{
    ControllerStep, FinishedSession, RecorderState, RecordingController, SessionEnd,
};
use crate::export::{ExportError, Exporter};
use crate::poller::{DetectionPoller, WakewordDetection};
use crate::scorer::{ScorerError, WakewordScorer};

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Audio source failed: {0}")]
    Source(#[from] SourceError),

    #[error("Wake-word scorer failed: {0}")]
    Scorer(#[from] ScorerError),

    #[error("Export failed: {0}")]
    Export(#[from] ExportError),
}

/// Summary of a finished recording session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    /// Display name of the model that triggered the session
    pub trigger: String,
    pub reason: SessionEnd,
    pub chunks: usize,
    pub duration_secs: f64,
    /// Where the audio was written, if it was exported
    pub exported: Option<PathBuf>,
}

/// What happened on one loop iteration
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    /// Idle, no wake-word in this chunk
    Listening,
    /// Wake-word detected, recording armed
    WakewordDetected(WakewordDetection),
    /// Recording, and speech just started
    SpeechStarted,
    /// Recording, state unchanged
    Recording,
    /// Recording ended on this chunk
    SessionFinished(SessionReport),
}

/// Listener statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub chunks_processed: u64,
    pub wakewords_detected: u64,
    pub sessions_completed: u64,
    pub sessions_timed_out: u64,
}

/// Main wake-word listener
pub struct Listener {
    config: ListenerConfig,
    source: Box<dyn AudioSource>,
    poller: DetectionPoller,
    controller: RecordingController,
    exporter: Box<dyn Exporter>,
    stats: ListenerStats,
}

impl Listener {
    /// Create a new listener around its collaborators
    pub fn new(
        config: ListenerConfig,
        source: Box<dyn AudioSource>,
        scorer: Box<dyn WakewordScorer>,
        exporter: Box<dyn Exporter>,
    ) -> Self {
        info!("Initializing wake-word listener");
        info!(
            "Chunk size: {} samples ({:.0} ms)",
            config.chunk_size,
            config.chunk_duration_secs() * 1000.0
        );
        info!("Silence threshold: {}", config.silence_threshold);
        info!(
            "Silence duration: {}s, no-speech timeout: {}s",
            config.silence_duration_seconds, config.no_speech_timeout_seconds
        );

        let poller = DetectionPoller::with_threshold(scorer, config.detection_threshold);
        let controller = RecordingController::new(&config);

        Self {
            config,
            source,
            poller,
            controller,
            exporter,
            stats: ListenerStats::default(),
        }
    }

    /// Read and process chunks until a collaborator fails
    pub fn run(&mut self) -> Result<(), ListenerError> {
        info!("Listening for wakewords");

        loop {
            self.step()?;
        }
    }

    /// Read one chunk and run it through detection or recording
    pub fn step(&mut self) -> Result<ListenerEvent, ListenerError> {
        let chunk = self.source.read_chunk(self.config.chunk_size)?;

        self.stats.chunks_processed += 1;
        if self.stats.chunks_processed % 1000 == 0 {
            debug!(
                "Processed {} chunks, detected {} wake-words",
                self.stats.chunks_processed, self.stats.wakewords_detected
            );
        }

        if !self.controller.is_recording() {
            return match self.poller.poll(&chunk)? {
                Some(detection) => {
                    self.stats.wakewords_detected += 1;
                    self.controller.arm(detection.model_name.clone());
                    Ok(ListenerEvent::WakewordDetected(detection))
                }
                None => Ok(ListenerEvent::Listening),
            };
        }

        match self.controller.process(chunk) {
            ControllerStep::Ignored | ControllerStep::Recording => Ok(ListenerEvent::Recording),
            ControllerStep::SpeechStarted => Ok(ListenerEvent::SpeechStarted),
            ControllerStep::Finished(session) => {
                let report = self.finish_session(session)?;
                Ok(ListenerEvent::SessionFinished(report))
            }
        }
    }

    fn finish_session(&mut self, session: FinishedSession) -> Result<SessionReport, ListenerError> {
        // Stale scores must not re-trigger immediately
        self.poller.reset();

        let export = match session.reason {
            SessionEnd::SpeechEnded => {
                info!(
                    "Silence detected for {}s after speech, stopping recording.",
                    self.config.silence_duration_seconds
                );
                info!("Recorded {:.2} seconds of audio.", session.duration_secs);
                self.stats.sessions_completed += 1;
                true
            }
            SessionEnd::NoSpeech => {
                info!(
                    "No speech detected for {}s after wakeword, stopping recording.",
                    self.config.no_speech_timeout_seconds
                );
                info!(
                    "Recorded {:.2} seconds of audio (mostly silence).",
                    session.duration_secs
                );
                self.stats.sessions_timed_out += 1;
                self.config.export_timeouts
            }
        };

        let exported = if export {
            Some(self.exporter.export(
                &session.trigger,
                &session.frames,
                self.config.sample_rate,
                self.config.channels,
            )?)
        } else {
            debug!("Discarding {} recorded chunks", session.frames.len());
            None
        };

        info!("Listening for wakewords");

        Ok(SessionReport {
            trigger: session.trigger,
            reason: session.reason,
            chunks: session.frames.len(),
            duration_secs: session.duration_secs,
            exported,
        })
    }

    pub fn state(&self) -> RecorderState {
        self.controller.state()
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_buffer::AudioChunk;
    use crate::capture::{MemorySource, MockAudioSource};
    use crate::export::MockExporter;
    use crate::scorer::{MockWakewordScorer, Scores};
    use std::collections::VecDeque;

    const CHUNK: usize = 1280;

    fn scores(score: f32) -> Scores {
        [("models/alexa.onnx".to_string(), score)].into_iter().collect()
    }

    /// Scorer that detects on the chunks flagged `true`
    fn scripted_scorer(pattern: Vec<bool>) -> MockWakewordScorer {
        let mut pattern: VecDeque<bool> = pattern.into();
        let mut scorer = MockWakewordScorer::new();
        scorer.expect_score().returning(move |_| {
            let hit = pattern.pop_front().unwrap_or(false);
            Ok(scores(if hit { 0.9 } else { 0.0 }))
        });
        scorer.expect_reset().return_const(());
        scorer
    }

    fn chunks(amplitude: i16, count: usize) -> Vec<AudioChunk> {
        vec![AudioChunk::constant(amplitude, CHUNK); count]
    }

    fn config() -> ListenerConfig {
        ListenerConfig {
            chunk_size: CHUNK,
            silence_threshold: 500,
            silence_duration_seconds: 1.0,
            no_speech_timeout_seconds: 4.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_idle_without_detection() {
        let source = MemorySource::new(chunks(9000, 20));
        let mut exporter = MockExporter::new();
        exporter.expect_export().never();

        let mut listener = Listener::new(
            config(),
            Box::new(source),
            Box::new(scripted_scorer(vec![])),
            Box::new(exporter),
        );

        for _ in 0..20 {
            assert_eq!(listener.step().unwrap(), ListenerEvent::Listening);
            assert_eq!(listener.state(), RecorderState::Idle);
        }
        assert_eq!(listener.stats().chunks_processed, 20);
        assert_eq!(listener.stats().wakewords_detected, 0);
    }

    #[test]
    fn test_detection_arms_recording_and_export_on_speech_end() {
        let mut audio = chunks(0, 1);
        audio.extend(chunks(800, 5));
        audio.extend(chunks(100, 12));

        let mut exporter = MockExporter::new();
        exporter
            .expect_export()
            .withf(|name, chunks, rate, channels| {
                name == "alexa" && chunks.len() == 17 && *rate == 16000 && *channels == 1
            })
            .times(1)
            .returning(|_, _, _, _| Ok(PathBuf::from("recordings/alexa_1.wav")));

        let mut listener = Listener::new(
            config(),
            Box::new(MemorySource::new(audio)),
            Box::new(scripted_scorer(vec![true])),
            Box::new(exporter),
        );

        match listener.step().unwrap() {
            ListenerEvent::WakewordDetected(detection) => {
                assert_eq!(detection.model_name, "alexa");
            }
            other => panic!("Expected detection, got {:?}", other),
        }
        assert_eq!(listener.state(), RecorderState::AwaitingSpeech);

        assert_eq!(listener.step().unwrap(), ListenerEvent::SpeechStarted);
        for _ in 0..4 {
            assert_eq!(listener.step().unwrap(), ListenerEvent::Recording);
        }
        for _ in 0..11 {
            assert_eq!(listener.step().unwrap(), ListenerEvent::Recording);
        }

        match listener.step().unwrap() {
            ListenerEvent::SessionFinished(report) => {
                assert_eq!(report.reason, SessionEnd::SpeechEnded);
                assert_eq!(report.chunks, 17);
                assert_eq!(report.exported, Some(PathBuf::from("recordings/alexa_1.wav")));
            }
            other => panic!("Expected SessionFinished, got {:?}", other),
        }

        assert_eq!(listener.state(), RecorderState::Idle);
        assert_eq!(listener.stats().sessions_completed, 1);
    }

    #[test]
    fn test_timeout_discards_by_default() {
        let mut audio = chunks(0, 1);
        audio.extend(chunks(100, 50));

        let mut exporter = MockExporter::new();
        exporter.expect_export().never();

        let mut listener = Listener::new(
            config(),
            Box::new(MemorySource::new(audio)),
            Box::new(scripted_scorer(vec![true])),
            Box::new(exporter),
        );

        listener.step().unwrap();
        for _ in 0..49 {
            assert_eq!(listener.step().unwrap(), ListenerEvent::Recording);
        }

        match listener.step().unwrap() {
            ListenerEvent::SessionFinished(report) => {
                assert_eq!(report.reason, SessionEnd::NoSpeech);
                assert_eq!(report.chunks, 50);
                assert!(report.exported.is_none());
            }
            other => panic!("Expected SessionFinished, got {:?}", other),
        }
        assert_eq!(listener.stats().sessions_timed_out, 1);
    }

    #[test]
    fn test_timeout_exported_when_enabled() {
        let mut audio = chunks(0, 1);
        audio.extend(chunks(100, 50));

        let mut exporter = MockExporter::new();
        exporter
            .expect_export()
            .times(1)
            .returning(|_, _, _, _| Ok(PathBuf::from("recordings/alexa_2.wav")));

        let config = ListenerConfig {
            export_timeouts: true,
            ..config()
        };

        let mut listener = Listener::new(
            config,
            Box::new(MemorySource::new(audio)),
            Box::new(scripted_scorer(vec![true])),
            Box::new(exporter),
        );

        let mut last = ListenerEvent::Listening;
        for _ in 0..51 {
            last = listener.step().unwrap();
        }
        assert!(matches!(
            last,
            ListenerEvent::SessionFinished(SessionReport { exported: Some(_), .. })
        ));
    }

    #[test]
    fn test_scorer_reset_on_session_end() {
        let mut scorer = MockWakewordScorer::new();
        let mut first = true;
        scorer.expect_score().returning(move |_| {
            let score = if first { 0.9 } else { 0.0 };
            first = false;
            Ok(scores(score))
        });
        // Once on detection, once when the session ends
        scorer.expect_reset().times(2).return_const(());

        let mut audio = chunks(0, 1);
        audio.extend(chunks(100, 50));
        audio.extend(chunks(0, 1));

        let mut listener = Listener::new(
            config(),
            Box::new(MemorySource::new(audio)),
            Box::new(scorer),
            Box::new(MockExporter::new()),
        );

        for _ in 0..52 {
            listener.step().unwrap();
        }
        assert_eq!(listener.state(), RecorderState::Idle);
    }

    #[test]
    fn test_source_failure_is_fatal() {
        let mut source = MockAudioSource::new();
        source
            .expect_read_chunk()
            .returning(|_| Err(SourceError::StreamClosed("device unplugged".to_string())));

        let mut listener = Listener::new(
            config(),
            Box::new(source),
            Box::new(scripted_scorer(vec![])),
            Box::new(MockExporter::new()),
        );

        assert!(matches!(
            listener.run(),
            Err(ListenerError::Source(SourceError::StreamClosed(_)))
        ));
    }

    #[test]
    fn test_export_failure_is_fatal() {
        let mut audio = chunks(0, 1);
        audio.extend(chunks(800, 1));
        audio.extend(chunks(100, 12));

        let mut exporter = MockExporter::new();
        exporter
            .expect_export()
            .returning(|_, _, _, _| Err(ExportError::Empty));

        let mut listener = Listener::new(
            config(),
            Box::new(MemorySource::new(audio)),
            Box::new(scripted_scorer(vec![true])),
            Box::new(exporter),
        );

        assert!(matches!(listener.run(), Err(ListenerError::Export(_))));
    }

    #[test]
    fn test_recording_chunks_are_not_scored() {
        let mut scorer = MockWakewordScorer::new();
        scorer
            .expect_score()
            .times(1)
            .returning(|_| Ok(scores(0.9)));
        scorer.expect_reset().return_const(());

        let mut audio = chunks(0, 1);
        audio.extend(chunks(800, 10));

        let mut listener = Listener::new(
            config(),
            Box::new(MemorySource::new(audio)),
            Box::new(scorer),
            Box::new(MockExporter::new()),
        );

        for _ in 0..11 {
            listener.step().unwrap();
        }
        assert_eq!(listener.state(), RecorderState::InSpeech);
    }
}
