/// Audio capture boundary
///
/// Sources push mono `f32` blocks into a callback. Multi-channel input is
/// averaged down to mono here, before the pipeline ever sees it.

use crate::config::FilterConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No default input device available")]
    NoDevice,

    #[error("Input device '{0}' not found")]
    DeviceNotFound(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Source already started")]
    AlreadyStarted,
}

/// Receives each mono block as it arrives
pub type FrameCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Push-based producer of mono audio blocks
pub trait AudioSource {
    /// Begin delivering blocks to `on_frames`
    fn start(&mut self, on_frames: FrameCallback) -> Result<(), CaptureError>;

    /// Stop delivering blocks
    fn stop(&mut self) -> Result<(), CaptureError>;

    fn sample_rate(&self) -> u32;
}

/// Average interleaved frames into mono, appending to `buf`
///
/// A trailing partial frame is averaged over the channels it has.
pub fn append_downmixed<T, F>(buf: &mut Vec<f32>, data: &[T], channels: usize, mut convert: F)
where
    T: Copy,
    F: FnMut(T) -> f32,
{
    if channels <= 1 {
        buf.extend(data.iter().copied().map(&mut convert));
        return;
    }

    buf.extend(data.chunks(channels).map(|frame| {
        let sum: f32 = frame.iter().copied().map(&mut convert).sum();
        sum / frame.len() as f32
    }));
}

/// Interleaved samples to mono by channel averaging
pub fn downmix_to_mono(data: &[f32], channels: usize) -> Vec<f32> {
    let mut mono = Vec::with_capacity(data.len() / channels.max(1) + 1);
    append_downmixed(&mut mono, data, channels, |s| s);
    mono
}

/// Live input device via cpal
pub struct CpalSource {
    device: cpal::Device,
    sample_rate: u32,
    block_size: usize,
    stream: Option<cpal::Stream>,
}

impl CpalSource {
    /// Names of the host's input devices
    pub fn list_devices() -> Result<Vec<String>, CaptureError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| CaptureError::Stream(e.to_string()))?;

        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    /// Open the configured device, or the default input device
    pub fn open(config: &FilterConfig) -> Result<Self, CaptureError> {
        let host = cpal::default_host();

        let device = match config.input_device.as_deref() {
            Some(name) => host
                .input_devices()
                .map_err(|e| CaptureError::Stream(e.to_string()))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| CaptureError::DeviceNotFound(name.to_string()))?,
            None => host.default_input_device().ok_or(CaptureError::NoDevice)?,
        };

        let source = Self {
            device,
            sample_rate: config.sample_rate,
            block_size: config.block_size,
            stream: None,
        };
        info!("Using input device: {}", source.device_name());

        Ok(source)
    }

    pub fn device_name(&self) -> String {
        self.device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string())
    }

    fn build_stream<T, F>(
        &self,
        config: &cpal::StreamConfig,
        convert: F,
        mut on_frames: FrameCallback,
    ) -> Result<cpal::Stream, CaptureError>
    where
        T: SizedSample,
        F: Fn(T) -> f32 + Send + 'static,
    {
        let channels = usize::from(config.channels.max(1));
        let mut mono = Vec::with_capacity(self.block_size);

        self.device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    mono.clear();
                    append_downmixed(&mut mono, data, channels, &convert);
                    on_frames(&mono);
                },
                |err| warn!("Audio stream error: {}", err),
                None,
            )
            .map_err(|e| CaptureError::Stream(e.to_string()))
    }
}

impl AudioSource for CpalSource {
    fn start(&mut self, on_frames: FrameCallback) -> Result<(), CaptureError> {
        if self.stream.is_some() {
            return Err(CaptureError::AlreadyStarted);
        }

        let default_config = self
            .device
            .default_input_config()
            .map_err(|e| CaptureError::UnsupportedFormat(e.to_string()))?;
        let format = default_config.sample_format();
        let channels = default_config.channels().clamp(1, 2);

        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(self.block_size as u32),
        };

        info!(
            "Opening input stream: format={:?} channels={} sample_rate={}Hz block={}",
            format, channels, self.sample_rate, self.block_size
        );

        let stream = match format {
            SampleFormat::F32 => self.build_stream::<f32, _>(&config, |s| s, on_frames)?,
            SampleFormat::I16 => {
                self.build_stream::<i16, _>(&config, |s| s as f32 / 32_768.0, on_frames)?
            }
            SampleFormat::U16 => self.build_stream::<u16, _>(
                &config,
                |s| (s as f32 - 32_768.0) / 32_768.0,
                on_frames,
            )?,
            other => {
                return Err(CaptureError::UnsupportedFormat(format!(
                    "sample format {:?}",
                    other
                )))
            }
        };

        stream
            .play()
            .map_err(|e| CaptureError::Stream(e.to_string()))?;
        self.stream = Some(stream);

        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                warn!("Failed to pause input stream: {}", e);
            }
            info!("Input stream stopped");
        }
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Replays a WAV file as if it were a live device
pub struct WavSource {
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
    block_size: usize,
    realtime: bool,
    stop_flag: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl WavSource {
    /// Decode `path` to mono `f32`
    ///
    /// The file must already be at `config.sample_rate`.
    pub fn open(path: impl AsRef<Path>, config: &FilterConfig) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();

        if spec.sample_rate != config.sample_rate {
            return Err(CaptureError::UnsupportedFormat(format!(
                "{} is {} Hz, expected {} Hz",
                path.display(),
                spec.sample_rate,
                config.sample_rate
            )));
        }

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1u64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<Result<_, _>>()?
            }
        };

        let samples = downmix_to_mono(&interleaved, usize::from(spec.channels));
        info!(
            "Loaded {} ({} channels, {:.1}s)",
            path.display(),
            spec.channels,
            samples.len() as f32 / spec.sample_rate as f32
        );

        Ok(Self {
            samples: Arc::new(samples),
            sample_rate: spec.sample_rate,
            block_size: config.block_size.max(1),
            realtime: false,
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    /// Pace blocks at the file's sample rate instead of as fast as possible
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Total mono samples in the file
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Block until every block has been delivered (or the source stopped)
    pub fn wait(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("WAV replay thread panicked");
            }
        }
    }

    /// Whether replay has delivered its last block
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl AudioSource for WavSource {
    fn start(&mut self, mut on_frames: FrameCallback) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            return Err(CaptureError::AlreadyStarted);
        }

        self.stop_flag.store(false, Ordering::SeqCst);
        let samples = Arc::clone(&self.samples);
        let stop_flag = Arc::clone(&self.stop_flag);
        let block_size = self.block_size;
        let pace = self
            .realtime
            .then(|| Duration::from_secs_f64(block_size as f64 / self.sample_rate as f64));

        let worker = std::thread::Builder::new()
            .name("wav-replay".to_string())
            .spawn(move || {
                for block in samples.chunks(block_size) {
                    if stop_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    on_frames(block);
                    if let Some(pace) = pace {
                        std::thread::sleep(pace);
                    }
                }
                debug!("WAV replay finished");
            })
            .map_err(|e| CaptureError::Stream(e.to_string()))?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.wait();
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
