/// Audio-event classifier boundary
///
/// A classifier maps one fixed-length window to per-class confidences. The
/// trained model lives outside this crate; `EnergyClassifier` is a loudness
/// stand-in that lets the pipeline run end to end without one.

use crate::score::ClassScores;
use crate::window::Window;
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Invalid window: expected {expected} samples, got {actual}")]
    InvalidWindow { expected: usize, actual: usize },

    #[error("Inference failed: {0}")]
    Inference(String),
}

/// Maps a waveform window to class confidences in [0, 1]
#[cfg_attr(test, mockall::automock)]
pub trait Classifier: Send + Sync {
    fn classify(&self, window: &Window) -> Result<ClassScores, ClassifierError>;

    /// Display names, indexed by class
    fn class_names(&self) -> Vec<String>;
}

/// Root-mean-square level of a block of samples
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Scores every class by the window's loudness
///
/// Every class reports `rms * gain` clamped to [0, 1]. With a frame length
/// set, each frame is scored on its own and the frames are averaged per
/// class, the way frame-based models report a window. Tells nothing about
/// *what* is playing.
#[derive(Debug, Clone)]
pub struct EnergyClassifier {
    class_names: Vec<String>,
    gain: f32,
    window_samples: Option<usize>,
    frame_samples: Option<usize>,
}

impl EnergyClassifier {
    pub fn new<S: AsRef<str>>(categories: &[S], gain: f32) -> Self {
        Self {
            class_names: categories.iter().map(|c| c.as_ref().to_string()).collect(),
            gain,
            window_samples: None,
            frame_samples: None,
        }
    }

    /// Score the window in frames of `frame_samples` and average them
    pub fn with_frame_samples(mut self, frame_samples: usize) -> Self {
        self.frame_samples = Some(frame_samples.max(1));
        self
    }

    fn frame_score(&self, frame: &[f32]) -> f32 {
        (rms(frame) * self.gain).clamp(0.0, 1.0)
    }

    /// Reject windows that are not exactly `window_samples` long
    pub fn with_window_samples(mut self, window_samples: usize) -> Self {
        self.window_samples = Some(window_samples);
        self
    }
}

impl Classifier for EnergyClassifier {
    fn classify(&self, window: &Window) -> Result<ClassScores, ClassifierError> {
        if let Some(expected) = self.window_samples {
            if window.len() != expected {
                return Err(ClassifierError::InvalidWindow {
                    expected,
                    actual: window.len(),
                });
            }
        }

        let classes = self.class_names.len();
        if window.is_empty() {
            return Ok(ClassScores::new(vec![0.0; classes]));
        }

        let frame_len = self.frame_samples.unwrap_or(window.len());
        let frames: Vec<Vec<f32>> = window
            .chunks(frame_len)
            .map(|frame| vec![self.frame_score(frame); classes])
            .collect();

        let scores = ClassScores::mean_of_frames(&frames);
        trace!(
            "Energy classifier: {} frames, score={:.3}",
            frames.len(),
            scores.get(0).unwrap_or(0.0)
        );

        Ok(scores)
    }

    fn class_names(&self) -> Vec<String> {
        self.class_names.clone()
    }
}
