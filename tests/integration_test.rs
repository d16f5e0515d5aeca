/// Integration tests for the audio ducker
///
/// Drives the full pipeline with synthetic audio, the loudness classifier and
/// an in-memory volume sink.

use audio_ducker::{
    AudioSource, ClassMap, EnergyClassifier, FilterConfig, MemoryVolume, Mode,
    PipelineCoordinator, WavSource,
};
use parking_lot::Mutex;
use std::f32::consts::PI;
use std::sync::Arc;

const SAMPLE_RATE: u32 = 16_000;
const BLOCK: usize = 800;
const WINDOW_SECONDS: f32 = 0.1;

fn test_config() -> FilterConfig {
    FilterConfig {
        detection_threshold: 0.25,
        history_size: 5,
        restore_ratio: 0.8,
        reduced_level: 0.2,
        sample_rate: SAMPLE_RATE,
        window_seconds: WINDOW_SECONDS,
        block_size: BLOCK,
        max_in_flight: 1,
        ..Default::default()
    }
}

/// Generate synthetic audio tone
fn generate_tone(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;

    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * PI * frequency * t).sin()
        })
        .collect()
}

fn silence(duration_secs: f32) -> Vec<f32> {
    vec![0.0; (SAMPLE_RATE as f32 * duration_secs) as usize]
}

fn build(config: FilterConfig, sink: Arc<MemoryVolume>) -> PipelineCoordinator {
    let classifier = Arc::new(
        EnergyClassifier::new(&["Piano"], 4.0).with_window_samples(config.window_samples()),
    );
    PipelineCoordinator::for_categories(config, classifier, sink).unwrap()
}

/// Feed block by block, letting each window finish before the next block
async fn feed(pipeline: &PipelineCoordinator, audio: &[f32]) {
    for block in audio.chunks(BLOCK) {
        pipeline.on_frames(block);
        pipeline.wait_idle().await;
    }
}

#[tokio::test]
async fn test_ducks_while_tone_plays() {
    let sink = Arc::new(MemoryVolume::new(0.9));
    let pipeline = build(test_config(), sink.clone());
    pipeline.start().await.unwrap();

    feed(&pipeline, &generate_tone(440.0, 0.6, 0.5)).await;
    assert_eq!(pipeline.mode(), Mode::Suppressed);
    assert_eq!(sink.level(), 0.2);

    feed(&pipeline, &silence(1.0)).await;
    assert_eq!(pipeline.mode(), Mode::Normal);
    assert_eq!(sink.level(), 0.9);

    let first = pipeline.try_recv_event().await.unwrap();
    assert_eq!((first.previous, first.current), (Mode::Normal, Mode::Suppressed));
    assert_eq!(first.level, 0.2);

    let second = pipeline.try_recv_event().await.unwrap();
    assert_eq!((second.previous, second.current), (Mode::Suppressed, Mode::Normal));
    assert_eq!(second.level, 0.9);

    assert!(pipeline.try_recv_event().await.is_none());

    pipeline.stop().await.unwrap();
    assert_eq!(sink.history(), vec![0.2, 0.9, 0.9]);
}

#[tokio::test]
async fn test_quiet_input_never_ducks() {
    let sink = Arc::new(MemoryVolume::new(0.7));
    let pipeline = build(test_config(), sink.clone());
    pipeline.start().await.unwrap();

    feed(&pipeline, &generate_tone(440.0, 1.0, 0.02)).await;

    assert_eq!(pipeline.mode(), Mode::Normal);
    assert_eq!(pipeline.history_snapshot(), vec![false; 5]);
    assert_eq!(pipeline.stats().transitions, 0);
    assert!(sink.history().is_empty());
}

#[tokio::test]
async fn test_unmatched_categories_never_duck() {
    let config = FilterConfig {
        target_categories: vec!["violin".to_string()],
        ..test_config()
    };
    let sink = Arc::new(MemoryVolume::new(0.7));
    let pipeline = build(config, sink.clone());
    assert!(pipeline.target_indices().is_empty());

    pipeline.start().await.unwrap();
    feed(&pipeline, &generate_tone(440.0, 1.0, 0.5)).await;

    assert_eq!(pipeline.mode(), Mode::Normal);
    assert!(sink.history().is_empty());
}

#[tokio::test]
async fn test_stop_restores_volume_while_suppressed() {
    let sink = Arc::new(MemoryVolume::new(0.6));
    let pipeline = build(test_config(), sink.clone());
    pipeline.start().await.unwrap();

    feed(&pipeline, &generate_tone(440.0, 0.6, 0.5)).await;
    assert_eq!(sink.level(), 0.2);

    pipeline.stop().await.unwrap();
    assert_eq!(sink.level(), 0.6);

    // Frames after stop are ignored
    pipeline.on_frames(&generate_tone(440.0, 0.6, 0.5));
    pipeline.wait_idle().await;
    assert_eq!(sink.level(), 0.6);
}

#[tokio::test]
async fn test_start_stop_without_transitions_keeps_level() {
    let sink = Arc::new(MemoryVolume::new(0.42));
    let pipeline = build(test_config(), sink.clone());

    pipeline.start().await.unwrap();
    pipeline.stop().await.unwrap();

    assert_eq!(sink.level(), 0.42);
    assert_eq!(sink.history(), vec![0.42]);
}

#[tokio::test]
async fn test_sink_failure_does_not_roll_back_mode() {
    let sink = Arc::new(MemoryVolume::new(0.9));
    sink.fail_next_sets(1);

    let pipeline = build(test_config(), sink.clone());
    pipeline.start().await.unwrap();

    feed(&pipeline, &generate_tone(440.0, 0.6, 0.5)).await;

    assert_eq!(pipeline.mode(), Mode::Suppressed);
    assert_eq!(sink.level(), 0.9);
    assert_eq!(pipeline.stats().sink_failures, 1);

    let event = pipeline.try_recv_event().await.unwrap();
    assert!(!event.applied);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_every_full_block_is_classified_or_skipped() {
    let config = FilterConfig {
        max_in_flight: 2,
        ..test_config()
    };
    let pipeline = build(config, Arc::new(MemoryVolume::default()));
    pipeline.start().await.unwrap();

    let audio = generate_tone(440.0, 2.0, 0.5);
    let blocks = audio.chunks(BLOCK).count() as u64;
    for block in audio.chunks(BLOCK) {
        pipeline.on_frames(block);
    }
    pipeline.wait_idle().await;

    let stats = pipeline.stats();
    assert_eq!(stats.frames_received, audio.len() as u64);
    // The first block only fills half a window
    assert_eq!(stats.windows_classified + stats.windows_skipped, blocks - 1);
    assert_eq!(stats.classifier_errors, 0);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn test_class_map_targets_drive_ducking() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("class_map.csv");
    std::fs::write(
        &path,
        "index,mid,display_name\n\
         0,/m/09x0r,Speech\n\
         1,/m/05r5c,Piano\n\
         2,/m/01s0ps,\"Electric piano\"\n\
         3,/m/07r4wb8,\"Knock, knock\"\n",
    )
    .unwrap();

    let class_map = ClassMap::from_path(&path).unwrap();
    let config = test_config();
    let target_indices = class_map.resolve(&config.target_categories);
    assert_eq!(target_indices, vec![1, 2]);

    let classifier = Arc::new(
        EnergyClassifier::new(class_map.names(), 4.0)
            .with_window_samples(config.window_samples())
            .with_frame_samples(400),
    );
    let sink = Arc::new(MemoryVolume::new(0.9));
    let pipeline =
        PipelineCoordinator::new(config, classifier, sink.clone(), target_indices).unwrap();
    pipeline.start().await.unwrap();

    feed(&pipeline, &generate_tone(440.0, 0.6, 0.5)).await;

    assert_eq!(pipeline.mode(), Mode::Suppressed);
    assert_eq!(sink.level(), 0.2);
}

#[tokio::test]
async fn test_wav_replay_through_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("recital.wav");

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for sample in generate_tone(440.0, 0.6, 0.5) {
        writer.write_sample((sample * i16::MAX as f32) as i16).unwrap();
    }
    writer.finalize().unwrap();

    let config = test_config();
    let mut source = WavSource::open(&path, &config).unwrap();

    let blocks = Arc::new(Mutex::new(Vec::new()));
    let collected = Arc::clone(&blocks);
    source
        .start(Box::new(move |block: &[f32]| collected.lock().push(block.to_vec())))
        .unwrap();
    source.wait();

    let sink = Arc::new(MemoryVolume::new(0.8));
    let pipeline = build(config, sink.clone());
    pipeline.start().await.unwrap();

    let blocks = blocks.lock().clone();
    assert_eq!(blocks.len(), 12);
    for block in &blocks {
        pipeline.on_frames(block);
        pipeline.wait_idle().await;
    }

    assert_eq!(pipeline.mode(), Mode::Suppressed);
    assert_eq!(sink.level(), 0.2);

    pipeline.stop().await.unwrap();
    assert_eq!(sink.level(), 0.8);
}
