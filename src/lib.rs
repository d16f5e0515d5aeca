/// Audio ducker library
///
/// Listens to a live audio stream, classifies overlapping windows, debounces
/// the per-window scores into a Normal/Suppressed mode and lowers playback
/// volume while the target sound is present.

pub mod capture;
pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod score;
pub mod state;
pub mod volume;
pub mod window;

// Re-export main types
pub use capture::{AudioSource, CaptureError, CpalSource, FrameCallback, WavSource};
pub use classifier::{Classifier, ClassifierError, EnergyClassifier};
pub use config::{ConfigError, FilterConfig};
pub use coordinator::{ModeEvent, PipelineCoordinator, PipelineError, PipelineStats};
pub use score::{ClassMap, ClassMapError, ClassScores};
pub use state::{DetectionStateMachine, Mode, Transition};
pub use volume::{MemoryVolume, PulseVolume, VolumeError, VolumeSink};
pub use window::{AudioSample, Window, WindowAssembler};
