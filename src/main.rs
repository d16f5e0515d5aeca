/// Audio ducker service binary
///
/// Listens to the input device and lowers playback volume while the target
/// sound plays. Usage: `ducker-service [config.json | --list-devices]`.

use anyhow::{Context, Result};
use audio_ducker::{
    AudioSource, ClassMap, CpalSource, EnergyClassifier, FilterConfig, MemoryVolume, ModeEvent,
    PipelineCoordinator, PulseVolume, VolumeSink, WavSource,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "audio_ducker=info,ducker_service=info";

/// Loudness-to-confidence scale for the stand-in classifier
const ENERGY_GAIN: f32 = 4.0;

/// Frame hop of YAMNet-style models
const FRAME_SECONDS: f32 = 0.48;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    info!("Starting audio ducker service");

    if let Err(e) = run().await {
        error!("{:#}", e);
        std::process::exit(1);
    }

    info!("Audio ducker service stopped");
}

async fn run() -> Result<()> {
    let arg = std::env::args().nth(1);

    if arg.as_deref() == Some("--list-devices") {
        for name in CpalSource::list_devices()? {
            println!("{}", name);
        }
        return Ok(());
    }

    let config = load_config(arg.as_deref())?;

    let sink: Arc<dyn VolumeSink> = if env_flag("DUCKER_DRY_RUN") {
        info!("Dry run: volume changes stay in process");
        Arc::new(MemoryVolume::default())
    } else {
        Arc::new(PulseVolume::new().context("Failed to open volume control")?)
    };

    let pipeline = Arc::new(build_pipeline(&config, sink)?);
    pipeline.start().await?;

    let result = match std::env::var_os("DUCKER_REPLAY_WAV") {
        Some(path) => replay(&pipeline, Path::new(&path), &config).await,
        None => listen(&pipeline, &config).await,
    };

    let stopped = pipeline.stop().await.context("Failed to restore volume");

    let stats = pipeline.stats();
    info!(
        "Classified {} windows ({} skipped, {} classifier errors), {} transitions, {} volume failures",
        stats.windows_classified,
        stats.windows_skipped,
        stats.classifier_errors,
        stats.transitions,
        stats.sink_failures
    );

    result?;
    stopped?;
    Ok(())
}

/// Optional JSON file, then `DUCKER_*` environment overrides
fn load_config(path: Option<&str>) -> Result<FilterConfig> {
    let mut config = match path {
        Some(path) => FilterConfig::from_json_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => FilterConfig::default(),
    };

    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

/// Classes come from `DUCKER_CLASS_MAP` when set, else one per category
fn build_pipeline(config: &FilterConfig, sink: Arc<dyn VolumeSink>) -> Result<PipelineCoordinator> {
    let frame_samples = (FRAME_SECONDS * config.sample_rate as f32).round() as usize;

    let pipeline = match std::env::var_os("DUCKER_CLASS_MAP") {
        Some(path) => {
            let path = Path::new(&path);
            let class_map = ClassMap::from_path(path)
                .with_context(|| format!("Failed to load class map from {}", path.display()))?;
            info!("Loaded {} classes from {}", class_map.len(), path.display());

            let target_indices = class_map.resolve(&config.target_categories);
            let matched: Vec<&str> = target_indices
                .iter()
                .filter_map(|&i| class_map.name(i))
                .collect();
            info!("Target classes: {:?}", matched);

            let classifier = Arc::new(
                EnergyClassifier::new(class_map.names(), ENERGY_GAIN)
                    .with_window_samples(config.window_samples())
                    .with_frame_samples(frame_samples),
            );
            PipelineCoordinator::new(config.clone(), classifier, sink, target_indices)?
        }
        None => {
            let classifier = Arc::new(
                EnergyClassifier::new(&config.target_categories, ENERGY_GAIN)
                    .with_window_samples(config.window_samples())
                    .with_frame_samples(frame_samples),
            );
            PipelineCoordinator::for_categories(config.clone(), classifier, sink)?
        }
    };

    Ok(pipeline)
}

fn env_flag(var: &str) -> bool {
    std::env::var(var)
        .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "" | "0" | "false" | "no"))
        .unwrap_or(false)
}

/// Live capture until Ctrl+C
async fn listen(pipeline: &Arc<PipelineCoordinator>, config: &FilterConfig) -> Result<()> {
    let mut source = CpalSource::open(config)?;
    info!("Listening on {}", source.device_name());
    source.start(pipeline.frame_callback())?;

    info!("Audio ducker running. Press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            event = pipeline.recv_event() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
        }
    }

    source.stop()?;
    Ok(())
}

/// Feed a WAV file at its own pace until it ends or Ctrl+C
async fn replay(
    pipeline: &Arc<PipelineCoordinator>,
    path: &Path,
    config: &FilterConfig,
) -> Result<()> {
    let mut source = WavSource::open(path, config)?.realtime(true);
    source.start(pipeline.frame_callback())?;

    let mut ticker = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            Some(event) = pipeline.recv_event() => log_event(&event),
            _ = ticker.tick() => {
                if source.is_finished() {
                    info!("Replay of {} finished", path.display());
                    break;
                }
            }
        }
    }

    source.stop()?;
    pipeline.wait_idle().await;
    while let Some(event) = pipeline.try_recv_event().await {
        log_event(&event);
    }

    Ok(())
}

fn log_event(event: &ModeEvent) {
    if event.applied {
        info!(
            "Mode changed: {} -> {} (score={:.3}, volume={:.0}%)",
            event.previous,
            event.current,
            event.score,
            event.level * 100.0
        );
    } else {
        warn!(
            "Mode changed: {} -> {} but volume stayed put (score={:.3})",
            event.previous, event.current, event.score
        );
    }
}
