/// Recording state controller
///
/// Decides chunk by chunk whether the listener is idle, waiting for speech
/// to start after a wake-word, or waiting for speech to end. The controller
/// is pure: it never touches the audio source, scorer, or exporter, and
/// hands finished sessions back to the caller instead.

use tracing::{debug, info, trace};

use crate::audio_buffer::AudioChunk;
use crate::config::ListenerConfig;
use crate::energy;

/// Recorder state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    /// Listening for a wake-word, nothing buffered
    Idle,

    /// Wake-word heard, buffering until speech starts
    AwaitingSpeech,

    /// Speech started, buffering until it ends
    InSpeech,
}

/// Why a recording session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Enough silence followed speech
    SpeechEnded,

    /// Speech never started before the timeout
    NoSpeech,
}

/// The live recording buffer and its counters
#[derive(Debug, Clone)]
pub struct RecordingSession {
    trigger: String,
    recorded_frames: Vec<AudioChunk>,
    speech_has_started: bool,
    consecutive_silent_chunks: usize,
}

impl RecordingSession {
    fn new(trigger: String) -> Self {
        Self {
            trigger,
            recorded_frames: Vec::new(),
            speech_has_started: false,
            consecutive_silent_chunks: 0,
        }
    }

    /// Name of the wake-word model that opened the session
    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    pub fn recorded_frames(&self) -> &[AudioChunk] {
        &self.recorded_frames
    }

    pub fn speech_has_started(&self) -> bool {
        self.speech_has_started
    }

    pub fn consecutive_silent_chunks(&self) -> usize {
        self.consecutive_silent_chunks
    }
}

/// A session handed back when it ends
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedSession {
    pub trigger: String,
    pub reason: SessionEnd,
    pub frames: Vec<AudioChunk>,
    pub duration_secs: f64,
}

/// Outcome of feeding one chunk to the controller
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerStep {
    /// No session active; the chunk was dropped
    Ignored,

    /// Chunk buffered, state unchanged
    Recording,

    /// Chunk buffered and speech has now started
    SpeechStarted,

    /// Chunk buffered and the session ended
    Finished(FinishedSession),
}

/// Chunk-count limits derived from the configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SilencePolicy {
    pub silence_threshold: f64,
    pub speech_end_chunks: usize,
    pub no_speech_timeout_chunks: usize,
}

impl SilencePolicy {
    pub fn from_config(config: &ListenerConfig) -> Self {
        Self {
            silence_threshold: config.silence_threshold as f64,
            speech_end_chunks: config.speech_end_chunks(),
            no_speech_timeout_chunks: config.no_speech_timeout_chunks(),
        }
    }

    /// Buffer `chunk` into `session` and report what it changed
    fn advance(&self, session: &mut RecordingSession, chunk: AudioChunk) -> Transition {
        let rms = chunk.rms();
        session.recorded_frames.push(chunk);

        trace!(
            "rms={:.1}, silent_chunks={}, frames={}",
            rms,
            session.consecutive_silent_chunks,
            session.recorded_frames.len()
        );

        if !session.speech_has_started {
            if energy::is_speech(rms, self.silence_threshold) {
                session.speech_has_started = true;
                session.consecutive_silent_chunks = 0;
                info!("Speech started.");
                return Transition::SpeechStarted;
            }

            session.consecutive_silent_chunks += 1;
            if session.consecutive_silent_chunks >= self.no_speech_timeout_chunks {
                return Transition::Ended(SessionEnd::NoSpeech);
            }
        } else if energy::is_silence(rms, self.silence_threshold) {
            session.consecutive_silent_chunks += 1;
            if session.consecutive_silent_chunks >= self.speech_end_chunks {
                return Transition::Ended(SessionEnd::SpeechEnded);
            }
        } else {
            session.consecutive_silent_chunks = 0;
        }

        Transition::Continue
    }
}

pub struct RecordingController {
    policy: SilencePolicy,
    chunk_size: usize,
    sample_rate: u32,
    session: Option<RecordingSession>,
}

impl RecordingController {
    pub fn new(config: &ListenerConfig) -> Self {
        let policy = SilencePolicy::from_config(config);

        debug!(
            "Recording controller: threshold={}, speech_end_chunks={}, no_speech_timeout_chunks={}",
            policy.silence_threshold, policy.speech_end_chunks, policy.no_speech_timeout_chunks
        );

        Self {
            policy,
            chunk_size: config.chunk_size,
            sample_rate: config.sample_rate,
            session: None,
        }
    }

    pub fn state(&self) -> RecorderState {
        match &self.session {
            None => RecorderState::Idle,
            Some(session) if session.speech_has_started => RecorderState::InSpeech,
            Some(_) => RecorderState::AwaitingSpeech,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&RecordingSession> {
        self.session.as_ref()
    }

    pub fn policy(&self) -> &SilencePolicy {
        &self.policy
    }

    /// Start a fresh session after a wake-word
    ///
    /// Any session already in progress is replaced.
    pub fn arm(&mut self, trigger: impl Into<String>) {
        let trigger = trigger.into();
        info!("Starting recording (waiting for speech)... trigger={}", trigger);
        self.session = Some(RecordingSession::new(trigger));
    }

    /// Buffer one chunk and advance the state machine
    pub fn process(&mut self, chunk: AudioChunk) -> ControllerStep {
        let Some(mut session) = self.session.take() else {
            return ControllerStep::Ignored;
        };

        match self.policy.advance(&mut session, chunk) {
            Transition::Ended(reason) => ControllerStep::Finished(self.finish(session, reason)),
            Transition::SpeechStarted => {
                self.session = Some(session);
                ControllerStep::SpeechStarted
            }
            Transition::Continue => {
                self.session = Some(session);
                ControllerStep::Recording
            }
        }
    }

    /// Abandon any active session without a report
    pub fn cancel(&mut self) {
        if self.session.take().is_some() {
            debug!("Recording session cancelled");
        }
    }

    /// Duration in seconds of `frames` chunks
    pub fn duration_secs(&self, frames: usize) -> f64 {
        frames as f64 * self.chunk_size as f64 / self.sample_rate as f64
    }

    fn finish(&self, session: RecordingSession, reason: SessionEnd) -> FinishedSession {
        let duration_secs = self.duration_secs(session.recorded_frames.len());

        FinishedSession {
            trigger: session.trigger,
            reason,
            frames: session.recorded_frames,
            duration_secs,
        }
    }
}

/// Outcome of buffering one chunk into a live session
enum Transition {
    Continue,
    SpeechStarted,
    Ended(SessionEnd),
}
