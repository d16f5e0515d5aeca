/// Pipeline coordinator
///
/// Bridges the push-based capture callback to windowing, classification and
/// the state machine, and applies mode changes to the volume sink.
///
/// The capture thread only appends samples and, when a worker slot is free,
/// hands a window snapshot to tokio's blocking pool. At most `max_in_flight`
/// classifications run at once. When every slot is busy the block's samples
/// stay in the rolling buffer and no window is dispatched for it; the next
/// dispatched window overlaps and covers them.

use crate::capture::FrameCallback;
use crate::classifier::Classifier;
use crate::config::{ConfigError, FilterConfig};
use crate::score::{self, resolve_target_indices};
use crate::state::{DetectionStateMachine, Mode, Transition};
use crate::volume::{VolumeError, VolumeSink};
use crate::window::{Window, WindowAssembler};
use cache_padded::CachePadded;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, trace, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Volume error: {0}")]
    Volume(#[from] VolumeError),

    #[error("Pipeline must be started from within a tokio runtime")]
    NoRuntime,

    #[error("Volume task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Emitted whenever the detected mode changes
#[derive(Debug, Clone)]
pub struct ModeEvent {
    pub previous: Mode,
    pub current: Mode,

    /// Score of the window that caused the change
    pub score: f32,

    /// Level written to the sink
    pub level: f32,

    /// Whether the sink accepted the level
    pub applied: bool,

    /// Microseconds since epoch
    pub timestamp: i64,
}

/// Pipeline statistics
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub frames_received: u64,
    pub windows_classified: u64,
    pub windows_skipped: u64,
    pub classifier_errors: u64,
    pub transitions: u64,
    pub sink_failures: u64,
    pub in_flight: usize,
    pub is_running: bool,
    pub mode: Mode,
}

#[derive(Default)]
struct Counters {
    frames_received: AtomicU64,
    windows_classified: AtomicU64,
    windows_skipped: AtomicU64,
    classifier_errors: AtomicU64,
    transitions: AtomicU64,
    sink_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Shared {
    config: FilterConfig,
    classifier: Arc<dyn Classifier>,
    sink: Arc<dyn VolumeSink>,
    target_indices: Vec<usize>,
    assembler: CachePadded<Mutex<WindowAssembler>>,
    machine: DetectionStateMachine,
    workers: Arc<Semaphore>,
    running: AtomicBool,
    generation: AtomicU64,
    /// Held shared while a result updates the machine, exclusively by start/stop
    run_lock: RwLock<()>,
    original_level: OnceLock<f32>,
    sink_lock: Mutex<()>,
    runtime: Mutex<Option<Handle>>,
    events: mpsc::UnboundedSender<ModeEvent>,
    counters: Counters,
}

impl Shared {
    /// Still running in the run that dispatched the work
    fn is_current(&self, generation: u64) -> bool {
        self.running.load(Ordering::Acquire) && self.generation.load(Ordering::Acquire) == generation
    }

    fn level_for(&self, mode: Mode) -> Option<f32> {
        match mode {
            Mode::Suppressed => Some(self.config.reduced_level),
            Mode::Normal => self.original_level.get().copied(),
        }
    }

    fn process_window(&self, window: Window, generation: u64) {
        let scores = match self.classifier.classify(&window) {
            Ok(scores) => scores,
            Err(e) => {
                warn!("Classification failed: {}", e);
                Counters::bump(&self.counters.classifier_errors);
                return;
            }
        };
        drop(window);
        Counters::bump(&self.counters.windows_classified);

        let score = score::extract(&scores, &self.target_indices);

        let transition = {
            let _run = self.run_lock.read();
            if !self.is_current(generation) {
                debug!("Discarding score {:.3} from a stopped run", score);
                return;
            }
            self.machine.update(Some(score))
        };

        let status = if score > self.config.detection_threshold {
            "DETECTED"
        } else {
            "listening"
        };
        debug!(
            "[{}] score={:.3} | history={} | mode={}",
            status,
            score,
            self.machine.history_bar(),
            transition.current
        );

        if transition.is_change() {
            self.apply_transition(transition, score, generation);
        }
    }

    fn apply_transition(&self, transition: Transition, score: f32, generation: u64) {
        Counters::bump(&self.counters.transitions);

        let _guard = self.sink_lock.lock();
        if !self.is_current(generation) {
            debug!("Pipeline stopped, discarding transition to {}", transition.current);
            return;
        }

        // Completions can arrive out of order: write the level for the
        // machine's latest mode, not for this transition's.
        let mode = self.machine.mode();
        let Some(level) = self.level_for(mode) else {
            error!("Original volume unknown, cannot apply {} mode", mode);
            return;
        };

        let applied = match self.sink.set_level(level) {
            Ok(()) => {
                match mode {
                    Mode::Suppressed => {
                        info!("Target sound detected, reducing volume to {:.0}%", level * 100.0)
                    }
                    Mode::Normal => {
                        info!("Target sound stopped, restoring volume to {:.0}%", level * 100.0)
                    }
                }
                true
            }
            Err(e) => {
                warn!("Failed to set volume to {:.0}%: {}", level * 100.0, e);
                Counters::bump(&self.counters.sink_failures);
                false
            }
        };

        let event = ModeEvent {
            previous: transition.previous,
            current: transition.current,
            score,
            level,
            applied,
            timestamp: current_timestamp_micros(),
        };
        if self.events.send(event).is_err() {
            trace!("No mode event receiver");
        }
    }
}

/// Streaming detection pipeline
pub struct PipelineCoordinator {
    shared: Arc<Shared>,
    event_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ModeEvent>>,
}

impl PipelineCoordinator {
    /// Build a pipeline scoring the given classifier classes
    pub fn new(
        config: FilterConfig,
        classifier: Arc<dyn Classifier>,
        sink: Arc<dyn VolumeSink>,
        target_indices: Vec<usize>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let machine = DetectionStateMachine::from_config(&config)?;

        if target_indices.is_empty() {
            warn!(
                "No classifier classes match {:?}; every window will score 0.0",
                config.target_categories
            );
        }

        let (events, event_rx) = mpsc::unbounded_channel();

        let shared = Shared {
            assembler: CachePadded::new(Mutex::new(WindowAssembler::new(config.window_samples()))),
            workers: Arc::new(Semaphore::new(config.max_in_flight)),
            machine,
            classifier,
            sink,
            target_indices,
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            run_lock: RwLock::new(()),
            original_level: OnceLock::new(),
            sink_lock: Mutex::new(()),
            runtime: Mutex::new(None),
            events,
            counters: Counters::default(),
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
            event_rx: tokio::sync::Mutex::new(event_rx),
        })
    }

    /// Build a pipeline, matching `config.target_categories` against the
    /// classifier's class names
    pub fn for_categories(
        config: FilterConfig,
        classifier: Arc<dyn Classifier>,
        sink: Arc<dyn VolumeSink>,
    ) -> Result<Self, PipelineError> {
        let class_names = classifier.class_names();
        let target_indices = resolve_target_indices(&class_names, &config.target_categories);

        let matched: Vec<&str> = target_indices
            .iter()
            .filter_map(|&i| class_names.get(i).map(String::as_str))
            .collect();
        info!("Target classes: {:?}", matched);

        Self::new(config, classifier, sink, target_indices)
    }

    /// Save the original volume (first start only) and begin accepting frames
    pub async fn start(&self) -> Result<(), PipelineError> {
        let shared = &self.shared;

        if shared.running.load(Ordering::Acquire) {
            warn!("Pipeline already running");
            return Ok(());
        }

        let handle = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;

        let original = match shared.original_level.get() {
            Some(&level) => level,
            None => {
                let sink = Arc::clone(&shared.sink);
                let level = tokio::task::spawn_blocking(move || sink.get_level()).await??;
                let level = *shared.original_level.get_or_init(|| level);
                info!("Original volume saved: {:.0}%", level * 100.0);
                level
            }
        };

        {
            let _run = shared.run_lock.write();
            shared.machine.reset();
            shared.assembler.lock().clear();
            *shared.runtime.lock() = Some(handle);
            shared.generation.fetch_add(1, Ordering::AcqRel);
            shared.running.store(true, Ordering::Release);
        }

        let config = &shared.config;
        info!("Detection threshold: {}", config.detection_threshold);
        info!("Normal volume: {:.0}%", original * 100.0);
        info!("Reduced volume: {:.0}%", config.reduced_level * 100.0);
        info!("Detection history: {} windows", config.history_size);
        info!(
            "Restore threshold: {:.0}% non-detections",
            config.restore_ratio * 100.0
        );
        if config.restore_ratio >= 1.0 {
            warn!("restore_ratio of 1.0 treats every full history as active; volume will stay reduced");
        }
        info!("Pipeline started");

        Ok(())
    }

    /// Stop accepting frames and restore the original volume
    ///
    /// Classifications still in flight finish, but their results are
    /// dropped.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        let shared = &self.shared;

        let was_running = {
            let _run = shared.run_lock.write();
            shared.running.swap(false, Ordering::AcqRel)
        };
        if !was_running {
            warn!("Pipeline not running");
            return Ok(());
        }

        let Some(&original) = shared.original_level.get() else {
            return Ok(());
        };

        info!("Restoring normal volume...");
        let restore = Arc::clone(shared);
        let restored = tokio::task::spawn_blocking(move || {
            let _guard = restore.sink_lock.lock();
            restore.sink.set_level(original)
        })
        .await?;

        if let Err(e) = restored {
            error!("Failed to restore volume to {:.0}%: {}", original * 100.0, e);
            Counters::bump(&shared.counters.sink_failures);
            return Err(e.into());
        }

        info!("Pipeline stopped");
        Ok(())
    }

    /// Accept a block of mono samples from the capture thread
    ///
    /// Never waits on classification.
    pub fn on_frames(&self, frames: &[f32]) {
        let shared = &self.shared;

        if frames.is_empty() || !shared.running.load(Ordering::Acquire) {
            return;
        }
        shared
            .counters
            .frames_received
            .fetch_add(frames.len() as u64, Ordering::Relaxed);

        let (window, permit) = {
            let mut assembler = shared.assembler.lock();
            assembler.append(frames);

            if assembler.len() < assembler.window_samples() {
                trace!(
                    "Buffering: {}/{} samples",
                    assembler.len(),
                    assembler.window_samples()
                );
                return;
            }

            let permit = match Arc::clone(&shared.workers).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    Counters::bump(&shared.counters.windows_skipped);
                    trace!("All classification slots busy, merging block into next window");
                    return;
                }
            };

            match assembler.try_extract_window() {
                Some(window) => (window, permit),
                None => return,
            }
        };

        self.dispatch(window, permit);
    }

    fn dispatch(&self, window: Window, permit: OwnedSemaphorePermit) {
        let Some(handle) = self.shared.runtime.lock().clone() else {
            return;
        };

        let shared = Arc::clone(&self.shared);
        let generation = shared.generation.load(Ordering::Acquire);

        handle.spawn_blocking(move || {
            let _permit = permit;
            shared.process_window(window, generation);
        });
    }

    /// Callback for an `AudioSource` that forwards into `on_frames`
    pub fn frame_callback(self: &Arc<Self>) -> FrameCallback {
        let pipeline = Arc::clone(self);
        Box::new(move |frames: &[f32]| pipeline.on_frames(frames))
    }

    /// Wait until no classification is in flight
    pub async fn wait_idle(&self) {
        let slots = u32::try_from(self.shared.config.max_in_flight).unwrap_or(u32::MAX);
        if let Ok(permits) = self.shared.workers.acquire_many(slots).await {
            drop(permits);
        }
    }

    /// Get the next mode event (non-blocking)
    pub async fn try_recv_event(&self) -> Option<ModeEvent> {
        let mut rx = self.event_rx.lock().await;
        rx.try_recv().ok()
    }

    /// Get the next mode event (blocking)
    pub async fn recv_event(&self) -> Option<ModeEvent> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await
    }

    pub fn mode(&self) -> Mode {
        self.shared.machine.mode()
    }

    /// Detection history, oldest first
    pub fn history_snapshot(&self) -> Vec<bool> {
        self.shared.machine.history_snapshot()
    }

    pub fn history_bar(&self) -> String {
        self.shared.machine.history_bar()
    }

    /// Volume saved at first start
    pub fn original_level(&self) -> Option<f32> {
        self.shared.original_level.get().copied()
    }

    pub fn target_indices(&self) -> &[usize] {
        &self.shared.target_indices
    }

    pub fn config(&self) -> &FilterConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Get current statistics
    pub fn stats(&self) -> PipelineStats {
        let shared = &self.shared;
        let counters = &shared.counters;

        PipelineStats {
            frames_received: counters.frames_received.load(Ordering::Relaxed),
            windows_classified: counters.windows_classified.load(Ordering::Relaxed),
            windows_skipped: counters.windows_skipped.load(Ordering::Relaxed),
            classifier_errors: counters.classifier_errors.load(Ordering::Relaxed),
            transitions: counters.transitions.load(Ordering::Relaxed),
            sink_failures: counters.sink_failures.load(Ordering::Relaxed),
            in_flight: shared
                .config
                .max_in_flight
                .saturating_sub(shared.workers.available_permits()),
            is_running: self.is_running(),
            mode: shared.machine.mode(),
        }
    }
}

fn current_timestamp_micros() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
