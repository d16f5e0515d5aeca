/// Detection state machine
///
/// Turns a stream of noisy per-window scores into a debounced two-state mode.
/// Every accepted score lands in a fixed-size boolean history; once the
/// history is full, the fraction of detections in it decides whether the
/// target sound is present.

use crate::config::{ConfigError, FilterConfig};
use parking_lot::Mutex;
use std::fmt;
use tracing::{debug, info, trace};

/// Current pipeline mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Target sound absent, original level applies
    Normal,

    /// Target sound present, reduced level applies
    Suppressed,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Suppressed => "suppressed",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one `update` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: Mode,
    pub current: Mode,
}

impl Transition {
    fn hold(mode: Mode) -> Self {
        Self {
            previous: mode,
            current: mode,
        }
    }

    pub fn is_change(&self) -> bool {
        self.previous != self.current
    }
}

/// Fixed-capacity boolean ring with a running count of `true` entries
#[derive(Debug, Clone)]
struct DetectionHistory {
    slots: Vec<bool>,
    cursor: usize,
    len: usize,
    detections: usize,
}

impl DetectionHistory {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![false; capacity],
            cursor: 0,
            len: 0,
            detections: 0,
        }
    }

    fn push(&mut self, detected: bool) {
        if self.len == self.slots.len() {
            if self.slots[self.cursor] {
                self.detections -= 1;
            }
        } else {
            self.len += 1;
        }

        self.slots[self.cursor] = detected;
        if detected {
            self.detections += 1;
        }
        self.cursor = (self.cursor + 1) % self.slots.len();
    }

    fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    fn ratio(&self) -> f64 {
        self.detections as f64 / self.slots.len() as f64
    }

    /// Oldest to newest
    fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        let start = (self.cursor + self.slots.len() - self.len) % self.slots.len();
        (0..self.len).map(move |i| self.slots[(start + i) % self.slots.len()])
    }

    fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = false);
        self.cursor = 0;
        self.len = 0;
        self.detections = 0;
    }
}

struct MachineState {
    mode: Mode,
    history: DetectionHistory,
}

/// Debounced two-state detector
///
/// `update` is safe to call from several classification tasks at once: the
/// history append and the mode transition happen under one lock.
pub struct DetectionStateMachine {
    detection_threshold: f32,
    history_size: usize,
    restore_ratio: f32,
    state: Mutex<MachineState>,
}

impl DetectionStateMachine {
    /// Create a state machine
    ///
    /// `restore_ratio` is the fraction of non-detections required to leave
    /// suppressed mode; its complement is the detection density needed to
    /// enter or stay in it.
    pub fn new(
        detection_threshold: f32,
        history_size: usize,
        restore_ratio: f32,
    ) -> Result<Self, ConfigError> {
        if !(detection_threshold > 0.0 && detection_threshold <= 1.0) {
            return Err(ConfigError::Invalid(
                "detection_threshold must be in (0.0, 1.0]".to_string(),
            ));
        }
        if history_size == 0 {
            return Err(ConfigError::Invalid(
                "history_size must be at least 1".to_string(),
            ));
        }
        if !(restore_ratio > 0.0 && restore_ratio <= 1.0) {
            return Err(ConfigError::Invalid(
                "restore_ratio must be in (0.0, 1.0]".to_string(),
            ));
        }

        Ok(Self {
            detection_threshold,
            history_size,
            restore_ratio,
            state: Mutex::new(MachineState {
                mode: Mode::Normal,
                history: DetectionHistory::new(history_size),
            }),
        })
    }

    pub fn from_config(config: &FilterConfig) -> Result<Self, ConfigError> {
        Self::new(
            config.detection_threshold,
            config.history_size,
            config.restore_ratio,
        )
    }

    /// Feed one score; `None` (not enough audio yet) changes nothing
    pub fn update(&self, score: Option<f32>) -> Transition {
        let mut state = self.state.lock();

        let Some(score) = score else {
            return Transition::hold(state.mode);
        };

        let detected = score > self.detection_threshold;
        state.history.push(detected);

        let previous = state.mode;
        let active = self.is_active(&state);

        state.mode = match (previous, active) {
            (Mode::Normal, true) => Mode::Suppressed,
            (Mode::Suppressed, false) => Mode::Normal,
            (mode, _) => mode,
        };

        let transition = Transition {
            previous,
            current: state.mode,
        };

        if transition.is_change() {
            info!(
                "Mode {} -> {} (detection ratio {:.2})",
                previous,
                state.mode,
                state.history.ratio()
            );
        } else {
            trace!("score={:.3} detected={} mode={}", score, detected, state.mode);
        }

        transition
    }

    fn is_active(&self, state: &MachineState) -> bool {
        // Warm-up holds the current mode rather than deciding on a few samples.
        if !state.history.is_full() {
            return state.mode == Mode::Suppressed;
        }

        state.history.ratio() >= 1.0 - self.restore_ratio as f64
    }

    pub fn mode(&self) -> Mode {
        self.state.lock().mode
    }

    /// Detection history, oldest first. Diagnostics only.
    pub fn history_snapshot(&self) -> Vec<bool> {
        self.state.lock().history.iter().collect()
    }

    /// History rendered as one block glyph per entry
    pub fn history_bar(&self) -> String {
        self.state
            .lock()
            .history
            .iter()
            .map(|d| if d { '█' } else { '░' })
            .collect()
    }

    /// Fraction of detections in a full history, `None` during warm-up
    pub fn detection_ratio(&self) -> Option<f64> {
        let state = self.state.lock();
        state.history.is_full().then(|| state.history.ratio())
    }

    pub fn detection_threshold(&self) -> f32 {
        self.detection_threshold
    }

    pub fn history_size(&self) -> usize {
        self.history_size
    }

    pub fn restore_ratio(&self) -> f32 {
        self.restore_ratio
    }

    /// Clear history and return to `Normal`
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.history.clear();
        state.mode = Mode::Normal;
        debug!("Detection state reset");
    }
}
