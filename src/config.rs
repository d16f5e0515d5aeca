/// Filter configuration
///
/// Holds the detection, volume and audio settings shared by every pipeline
/// stage. Loaded from a JSON file and/or `DUCKER_*` environment variables and
/// validated once before the pipeline is built.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// YAMNet consumes 0.975 s of audio per inference
pub const DEFAULT_WINDOW_SECONDS: f32 = 0.975;

/// Default capture sample rate in Hz
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// Default capture block size in frames
pub const DEFAULT_BLOCK_SIZE: usize = 2048;

/// Upper bound on concurrent classifications
pub const MAX_IN_FLIGHT: usize = 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {var}: {value}")]
    Env { var: String, value: String },
}

/// Configuration for the ducking filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Score above which a window counts as a detection (0.0 - 1.0]
    pub detection_threshold: f32,

    /// Number of recent detections kept for the moving-ratio decision
    pub history_size: usize,

    /// Fraction of non-detections needed to leave suppressed mode (0.0 - 1.0]
    pub restore_ratio: f32,

    /// Playback level applied while the target sound is present [0.0 - 1.0]
    pub reduced_level: f32,

    /// Capture sample rate in Hz
    pub sample_rate: u32,

    /// Classification window length in seconds
    pub window_seconds: f32,

    /// Frames per capture block
    pub block_size: usize,

    /// Category keywords matched against classifier class names
    pub target_categories: Vec<String>,

    /// Maximum classification tasks running at once
    pub max_in_flight: usize,

    /// Exact input device name (None = default input device)
    pub input_device: Option<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            detection_threshold: 0.25,
            history_size: 10,
            restore_ratio: 0.8,
            reduced_level: 0.2,
            sample_rate: DEFAULT_SAMPLE_RATE,
            window_seconds: DEFAULT_WINDOW_SECONDS,
            block_size: DEFAULT_BLOCK_SIZE,
            target_categories: vec!["piano".to_string()],
            max_in_flight: 4,
            input_device: None,
        }
    }
}

impl FilterConfig {
    /// Classification window length in samples
    pub fn window_samples(&self) -> usize {
        (self.sample_rate as f64 * self.window_seconds as f64).round() as usize
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.detection_threshold > 0.0 && self.detection_threshold <= 1.0) {
            return Err(ConfigError::Invalid(
                "detection_threshold must be in (0.0, 1.0]".to_string(),
            ));
        }

        if self.history_size == 0 {
            return Err(ConfigError::Invalid(
                "history_size must be at least 1".to_string(),
            ));
        }

        if !(self.restore_ratio > 0.0 && self.restore_ratio <= 1.0) {
            return Err(ConfigError::Invalid(
                "restore_ratio must be in (0.0, 1.0]".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.reduced_level) {
            return Err(ConfigError::Invalid(
                "reduced_level must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid(
                "sample_rate must be greater than 0".to_string(),
            ));
        }

        if !(self.window_seconds > 0.0 && self.window_seconds.is_finite()) {
            return Err(ConfigError::Invalid(
                "window_seconds must be greater than 0".to_string(),
            ));
        }

        if self.window_samples() == 0 {
            return Err(ConfigError::Invalid(format!(
                "window of {}s at {} Hz holds no samples",
                self.window_seconds, self.sample_rate
            )));
        }

        if self.block_size == 0 {
            return Err(ConfigError::Invalid(
                "block_size must be greater than 0".to_string(),
            ));
        }

        if self.max_in_flight == 0 || self.max_in_flight > MAX_IN_FLIGHT {
            return Err(ConfigError::Invalid(format!(
                "max_in_flight must be between 1 and {}, got {}",
                MAX_IN_FLIGHT, self.max_in_flight
            )));
        }

        Ok(())
    }

    /// Load configuration from a JSON file
    ///
    /// Missing fields take their default values.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let config: FilterConfig = serde_json::from_str(&raw)?;
        debug!("Loaded config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    /// Override fields from `DUCKER_*` environment variables
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, "DUCKER_DETECTION_THRESHOLD")? {
            self.detection_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "DUCKER_HISTORY_SIZE")? {
            self.history_size = v;
        }
        if let Some(v) = parse_var(&lookup, "DUCKER_RESTORE_RATIO")? {
            self.restore_ratio = v;
        }
        if let Some(v) = parse_var(&lookup, "DUCKER_REDUCED_LEVEL")? {
            self.reduced_level = v;
        }
        if let Some(v) = parse_var(&lookup, "DUCKER_SAMPLE_RATE")? {
            self.sample_rate = v;
        }
        if let Some(v) = parse_var(&lookup, "DUCKER_WINDOW_SECONDS")? {
            self.window_seconds = v;
        }
        if let Some(v) = parse_var(&lookup, "DUCKER_BLOCK_SIZE")? {
            self.block_size = v;
        }
        if let Some(v) = parse_var(&lookup, "DUCKER_MAX_IN_FLIGHT")? {
            self.max_in_flight = v;
        }
        if let Some(raw) = lookup("DUCKER_TARGET_CATEGORIES") {
            self.target_categories = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(name) = lookup("DUCKER_INPUT_DEVICE") {
            self.input_device = Some(name).filter(|n| !n.trim().is_empty());
        }

        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Env {
                var: var.to_string(),
                value,
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = FilterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.window_samples(), 15_600);
        assert_eq!(config.target_categories, vec!["piano".to_string()]);
    }

    #[test]
    fn test_config_validation() {
        let mut config = FilterConfig::default();

        config.detection_threshold = 0.0;
        assert!(config.validate().is_err());
        config.detection_threshold = 1.0;
        assert!(config.validate().is_ok());

        config.restore_ratio = 0.0;
        assert!(config.validate().is_err());
        config.restore_ratio = 1.0;
        assert!(config.validate().is_ok());

        config.history_size = 0;
        assert!(config.validate().is_err());
        config.history_size = 1;

        config.reduced_level = 1.5;
        assert!(config.validate().is_err());
        config.reduced_level = 0.0;
        assert!(config.validate().is_ok());

        config.window_seconds = 0.00001;
        assert!(config.validate().is_err());
        config.window_seconds = 0.5;

        config.sample_rate = 0;
        assert!(config.validate().is_err());
        config.sample_rate = 8000;

        config.max_in_flight = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_in_flight_upper_bound() {
        let mut config = FilterConfig {
            max_in_flight: MAX_IN_FLIGHT,
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.max_in_flight = MAX_IN_FLIGHT + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.max_in_flight = usize::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_huge_max_in_flight_from_env_is_rejected() {
        let mut config = FilterConfig::default();
        config
            .apply_overrides(|var| {
                (var == "DUCKER_MAX_IN_FLIGHT").then(|| "18446744073709551615".to_string())
            })
            .unwrap();

        assert_eq!(config.max_in_flight, usize::MAX);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nan_threshold_rejected() {
        let config = FilterConfig {
            detection_threshold: f32::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "detection_threshold": 0.001, "history_size": 15, "restore_ratio": 0.9 }}"#
        )
        .unwrap();

        let config = FilterConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.history_size, 15);
        assert_eq!(config.restore_ratio, 0.9);
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = FilterConfig::from_json_file("/nonexistent/ducker.json");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = FilterConfig::default();
        let lookup = lookup_from(&[
            ("DUCKER_HISTORY_SIZE", "4"),
            ("DUCKER_REDUCED_LEVEL", "0.1"),
            ("DUCKER_TARGET_CATEGORIES", "piano, keyboard ,"),
            ("DUCKER_INPUT_DEVICE", "Stereo Mix"),
        ]);

        config.apply_overrides(lookup).unwrap();

        assert_eq!(config.history_size, 4);
        assert_eq!(config.reduced_level, 0.1);
        assert_eq!(config.target_categories, vec!["piano", "keyboard"]);
        assert_eq!(config.input_device.as_deref(), Some("Stereo Mix"));
    }

    #[test]
    fn test_env_override_parse_error() {
        let mut config = FilterConfig::default();
        let result = config.apply_overrides(lookup_from(&[("DUCKER_HISTORY_SIZE", "ten")]));

        match result {
            Err(ConfigError::Env { var, value }) => {
                assert_eq!(var, "DUCKER_HISTORY_SIZE");
                assert_eq!(value, "ten");
            }
            _ => panic!("Expected Env error"),
        }
    }
}
