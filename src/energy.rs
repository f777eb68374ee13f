/// Chunk energy module
///
/// Computes root-mean-square energy over raw 16-bit samples and classifies
/// chunks against the configured silence threshold. Speech onset and
/// continued speech use `>=`, silence uses strict `<`; a chunk sitting
/// exactly on the threshold therefore counts as speech.

use crate::audio_buffer::AudioSample;

/// Root-mean-square of the samples, in raw sample units
///
/// Squares are accumulated in `f64` so full-scale input cannot overflow.
/// An empty slice has zero energy.
pub fn rms(samples: &[AudioSample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let s = s as f64;
            s * s
        })
        .sum();

    (sum_squares / samples.len() as f64).sqrt()
}

/// True when the energy is loud enough to count as speech
pub fn is_speech(rms: f64, silence_threshold: f64) -> bool {
    rms >= silence_threshold
}

/// True when the energy is below the silence threshold
pub fn is_silence(rms: f64, silence_threshold: f64) -> bool {
    rms < silence_threshold
}
