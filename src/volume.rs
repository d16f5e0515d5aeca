/// Playback volume control
///
/// The pipeline reads the output level once at startup and writes it on every
/// mode change. `PulseVolume` drives the default PulseAudio/PipeWire sink via
/// `pactl`; `MemoryVolume` keeps the level in process for dry runs and tests.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, info};

/// PulseAudio's 100% volume in raw units
const PA_VOLUME_NORM: f64 = 65536.0;

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("Volume control unavailable: {0}")]
    Unavailable(String),

    #[error("Volume level out of range: {0}")]
    OutOfRange(f32),

    #[error("Volume command failed: {0}")]
    CommandFailed(String),

    #[error("Unexpected volume output: {0}")]
    Parse(String),
}

/// Output whose playback level can be read and written
#[cfg_attr(test, mockall::automock)]
pub trait VolumeSink: Send + Sync {
    /// Current level in [0, 1]
    fn get_level(&self) -> Result<f32, VolumeError>;

    /// Set the level, in [0, 1]
    fn set_level(&self, level: f32) -> Result<(), VolumeError>;
}

fn check_level(level: f32) -> Result<f32, VolumeError> {
    if level.is_finite() && (0.0..=1.0).contains(&level) {
        Ok(level)
    } else {
        Err(VolumeError::OutOfRange(level))
    }
}

/// In-process volume level
///
/// Records every accepted `set_level` call and can be told to fail the next
/// few writes.
#[derive(Debug)]
pub struct MemoryVolume {
    level: AtomicU32,
    failures_pending: AtomicUsize,
    history: Mutex<Vec<f32>>,
}

impl MemoryVolume {
    pub fn new(level: f32) -> Self {
        Self {
            level: AtomicU32::new(level.clamp(0.0, 1.0).to_bits()),
            failures_pending: AtomicUsize::new(0),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::SeqCst))
    }

    /// Make the next `count` `set_level` calls fail
    pub fn fail_next_sets(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Levels written so far, oldest first
    pub fn history(&self) -> Vec<f32> {
        self.history.lock().clone()
    }
}

impl Default for MemoryVolume {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl VolumeSink for MemoryVolume {
    fn get_level(&self) -> Result<f32, VolumeError> {
        Ok(self.level())
    }

    fn set_level(&self, level: f32) -> Result<(), VolumeError> {
        let level = check_level(level)?;

        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(VolumeError::CommandFailed("injected failure".to_string()));
        }

        self.level.store(level.to_bits(), Ordering::SeqCst);
        self.history.lock().push(level);
        debug!("[VOLUME] Set to {:.0}%", level * 100.0);
        Ok(())
    }
}

/// Default PulseAudio/PipeWire sink driven through `pactl`
#[derive(Debug, Clone)]
pub struct PulseVolume {
    pactl: PathBuf,
    sink: String,
}

impl PulseVolume {
    /// Locate `pactl` and target the default sink
    pub fn new() -> Result<Self, VolumeError> {
        Self::with_sink("@DEFAULT_SINK@")
    }

    pub fn with_sink(sink: impl Into<String>) -> Result<Self, VolumeError> {
        let pactl = which::which("pactl")
            .map_err(|e| VolumeError::Unavailable(format!("pactl not found: {}", e)))?;

        let sink = sink.into();
        info!("Volume control via {} (sink {})", pactl.display(), sink);
        Ok(Self { pactl, sink })
    }

    fn run(&self, args: &[&str]) -> Result<String, VolumeError> {
        let output = Command::new(&self.pactl)
            .args(args)
            .output()
            .map_err(|e| VolumeError::CommandFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(VolumeError::CommandFailed(format!(
                "pactl {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl VolumeSink for PulseVolume {
    fn get_level(&self) -> Result<f32, VolumeError> {
        let output = self.run(&["get-sink-volume", &self.sink])?;
        parse_pactl_volume(&output)
    }

    fn set_level(&self, level: f32) -> Result<(), VolumeError> {
        let raw = level_to_raw(check_level(level)?);
        self.run(&["set-sink-volume", &self.sink, &raw.to_string()])?;
        debug!("[VOLUME] Set to {:.0}%", level * 100.0);
        Ok(())
    }
}

/// Raw PulseAudio volume for a level in [0, 1]
pub fn level_to_raw(level: f32) -> u32 {
    (level as f64 * PA_VOLUME_NORM).round() as u32
}

/// Level in [0, 1] for a raw PulseAudio volume
///
/// Every raw value up to 100% maps to an exact `f32`, so
/// `level_to_raw(raw_to_level(raw)) == raw`.
pub fn raw_to_level(raw: u32) -> f32 {
    (raw as f64 / PA_VOLUME_NORM).min(1.0) as f32
}

/// First channel's level from `pactl get-sink-volume` output
///
/// e.g. `Volume: front-left: 40000 /  61% / -12.88 dB, ...` yields
/// `40000 / 65536`. The raw value is read rather than the rounded
/// percentage so the level can be written back unchanged. Levels above
/// 100% are clamped.
pub fn parse_pactl_volume(output: &str) -> Result<f32, VolumeError> {
    let malformed = || VolumeError::Parse(output.trim().to_string());

    let raw = output
        .split('/')
        .next()
        .and_then(|head| head.split_whitespace().last())
        .ok_or_else(malformed)?;

    let raw: u32 = raw.parse().map_err(|_| malformed())?;
    Ok(raw_to_level(raw))
}
