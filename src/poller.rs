/// Detection poller
///
/// Feeds idle-time chunks to the wake-word scorer, keeps the rolling score
/// history per model, and reports a detection when the newest score of any
/// model crosses the detection threshold.

use tracing::{info, trace};

use crate::audio_buffer::AudioChunk;
use crate::config::DETECTION_THRESHOLD;
use crate::scorer::{model_display_name, ScoreHistory, ScorerError, WakewordScorer};

/// Wake-word detection result
#[derive(Debug, Clone, PartialEq)]
pub struct WakewordDetection {
    /// Model id as reported by the scorer
    pub model_id: String,

    /// Display name of the model (file stem)
    pub model_name: String,

    /// Score that triggered the detection (0.0 - 1.0)
    pub score: f32,
}

pub struct DetectionPoller {
    scorer: Box<dyn WakewordScorer>,
    history: ScoreHistory,
    threshold: f32,
}

impl DetectionPoller {
    pub fn new(scorer: Box<dyn WakewordScorer>) -> Self {
        Self::with_threshold(scorer, DETECTION_THRESHOLD)
    }

    pub fn with_threshold(scorer: Box<dyn WakewordScorer>, threshold: f32) -> Self {
        Self {
            scorer,
            history: ScoreHistory::new(),
            threshold,
        }
    }

    /// Score one chunk and check every model's newest score
    ///
    /// On detection the scorer and all histories are reset before
    /// returning, so the next idle period starts from a clean slate.
    pub fn poll(&mut self, chunk: &AudioChunk) -> Result<Option<WakewordDetection>, ScorerError> {
        let scores = self.scorer.score(chunk)?;
        trace!("Wake-word scores: {:?}", scores);

        self.history.push(&scores);

        let detection = self
            .history
            .first_above(self.threshold)
            .map(|(model_id, score)| WakewordDetection {
                model_id: model_id.to_string(),
                model_name: model_display_name(model_id).to_string(),
                score,
            });

        if let Some(detection) = &detection {
            info!(
                "Wakeword Detected! - {} (score={:.2})",
                detection.model_name, detection.score
            );
            self.reset();
        }

        Ok(detection)
    }

    /// Reset the scorer and drop all score history
    pub fn reset(&mut self) {
        self.scorer.reset();
        self.history.clear();
    }

    pub fn history(&self) -> &ScoreHistory {
        &self.history
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::{MockWakewordScorer, Scores};
    use mockall::Sequence;

    fn scores(pairs: &[(&str, f32)]) -> Scores {
        pairs.iter().map(|(m, s)| (m.to_string(), *s)).collect()
    }

    fn chunk() -> AudioChunk {
        AudioChunk::constant(0, 1280)
    }

    #[test]
    fn test_no_detection_below_threshold() {
        let mut scorer = MockWakewordScorer::new();
        scorer
            .expect_score()
            .times(3)
            .returning(|_| Ok(scores(&[("models/alexa.onnx", 0.5)])));
        scorer.expect_reset().never();

        let mut poller = DetectionPoller::new(Box::new(scorer));

        for _ in 0..3 {
            assert!(poller.poll(&chunk()).unwrap().is_none());
        }
        assert_eq!(poller.history().scores("models/alexa.onnx").unwrap().len(), 3);
    }

    #[test]
    fn test_detection_resets_scorer_and_history() {
        let mut seq = Sequence::new();
        let mut scorer = MockWakewordScorer::new();
        scorer
            .expect_score()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(scores(&[("models/alexa.onnx", 0.1), ("models/hey_jarvis.onnx", 0.2)])));
        scorer
            .expect_score()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(scores(&[("models/alexa.onnx", 0.1), ("models/hey_jarvis.onnx", 0.93)])));
        scorer
            .expect_reset()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let mut poller = DetectionPoller::new(Box::new(scorer));

        assert!(poller.poll(&chunk()).unwrap().is_none());

        let detection = poller.poll(&chunk()).unwrap().unwrap();
        assert_eq!(detection.model_id, "models/hey_jarvis.onnx");
        assert_eq!(detection.model_name, "hey_jarvis");
        assert_eq!(detection.score, 0.93);
        assert!(poller.history().is_empty());
    }

    #[test]
    fn test_scorer_failure_propagates() {
        let mut scorer = MockWakewordScorer::new();
        scorer
            .expect_score()
            .returning(|_| Err(ScorerError::Inference("session crashed".to_string())));

        let mut poller = DetectionPoller::new(Box::new(scorer));

        assert!(matches!(
            poller.poll(&chunk()),
            Err(ScorerError::Inference(_))
        ));
    }

    #[test]
    fn test_custom_threshold() {
        let mut scorer = MockWakewordScorer::new();
        scorer
            .expect_score()
            .returning(|_| Ok(scores(&[("alexa", 0.6)])));
        scorer.expect_reset().return_const(());

        let mut strict = DetectionPoller::with_threshold(Box::new(scorer), 0.7);
        assert_eq!(strict.threshold(), 0.7);
        assert!(strict.poll(&chunk()).unwrap().is_none());
    }
}
