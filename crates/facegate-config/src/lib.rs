use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const PRIMARY_CONFIG_PATH: &str = "/etc/facegate/config.toml";
pub const SECONDARY_CONFIG_PATH: &str = "/usr/local/etc/facegate/config.toml";

pub const DEFAULT_VIDEO_DEVICE: &str = "/dev/video0";
pub const DEFAULT_FRAME_WIDTH: u32 = 2304;
pub const DEFAULT_FRAME_HEIGHT: u32 = 1296;
pub const DEFAULT_FPS: u32 = 30;
pub const DEFAULT_PIXEL_FORMAT: &str = "RGB3";
pub const DEFAULT_WARMUP_FRAMES: u32 = 0;
pub const DEFAULT_SETTLE_MILLIS: u64 = 2000;
pub const DEFAULT_CAPTURE_TIMEOUT_MILLIS: u64 = 5000;

pub const DETECTOR_MODEL_ENV: &str = "FACEGATE_DETECTOR_MODEL";
pub const DEFAULT_SCALE_FACTOR: f64 = 1.2;
pub const DEFAULT_MIN_NEIGHBORS: u32 = 6;
pub const DEFAULT_MIN_SIZE: (u32, u32) = (100, 100);
pub const DEFAULT_MAX_SIZE: (u32, u32) = (300, 300);

pub const DEFAULT_IDENTITY_STORE: &str = "authorized_faces.json";
pub const DEFAULT_TOLERANCE: f64 = 0.5;
pub const DEFAULT_JITTERS: u32 = 1;

pub const DEFAULT_SERIAL_PORT: &str = "/dev/ttyACM0";
pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_WRITE_TIMEOUT_MILLIS: u64 = 1000;
pub const DEFAULT_DOOR_OPEN_SECS: u64 = 5;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INIT_RETRY_DELAY_MILLIS: u64 = 100;
pub const DEFAULT_FRAME_INTERVAL_MILLIS: u64 = 100;
pub const DEFAULT_FAULT_BACKOFF_MILLIS: u64 = 500;

pub const DEFAULT_LOG_FILE: &str = "sys.log";
pub const DEFAULT_LOG_LEVEL: &str = "debug";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub camera: CameraSection,
    #[serde(default)]
    pub detector: DetectorSection,
    #[serde(default)]
    pub verifier: VerifierSection,
    #[serde(default)]
    pub actuator: ActuatorSection,
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct CameraSection {
    pub device: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub pixel_format: Option<String>,
    pub warmup_frames: Option<u32>,
    pub settle_millis: Option<u64>,
    pub capture_timeout_millis: Option<u64>,
    #[serde(default)]
    pub controls: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DetectorSection {
    pub model: Option<PathBuf>,
    pub scale_factor: Option<f64>,
    pub min_neighbors: Option<u32>,
    pub min_size: Option<(u32, u32)>,
    pub max_size: Option<(u32, u32)>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct VerifierSection {
    pub identity_store: Option<PathBuf>,
    pub tolerance: Option<f64>,
    pub landmark_model: Option<PathBuf>,
    pub encoder_model: Option<PathBuf>,
    pub jitters: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ActuatorSection {
    pub port: Option<String>,
    pub baud_rate: Option<u32>,
    pub write_timeout_millis: Option<u64>,
    pub door_open_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ControllerSection {
    pub max_attempts: Option<u32>,
    pub init_retry_delay_millis: Option<u64>,
    pub frame_interval_millis: Option<u64>,
    pub fault_backoff_millis: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    pub file: Option<PathBuf>,
    pub level: Option<String>,
}

/// Camera session parameters. `controls` are handed to the driver by name, unmodified.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pixel_format: String,
    pub warmup_frames: u32,
    pub settle: Duration,
    /// Longest wait for a single frame before capture reports a timeout.
    pub capture_timeout: Duration,
    pub controls: BTreeMap<String, i64>,
}

/// Cascade classifier tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    pub model: Option<PathBuf>,
    /// Geometric step between successive window sizes; must exceed 1.0.
    pub scale_factor: f64,
    /// Post-merge confidence floor.
    pub min_neighbors: u32,
    pub min_size: (u32, u32),
    pub max_size: (u32, u32),
}

impl DetectorSettings {
    /// Explicit model path, then `$FACEGATE_DETECTOR_MODEL`.
    pub fn model_path(&self) -> Option<PathBuf> {
        self.model
            .clone()
            .or_else(|| env::var(DETECTOR_MODEL_ENV).ok().map(PathBuf::from))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifierSettings {
    pub identity_store: PathBuf,
    /// Maximum Euclidean distance accepted as a match (strictly less than).
    pub tolerance: f64,
    pub landmark_model: Option<PathBuf>,
    pub encoder_model: Option<PathBuf>,
    pub jitters: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorSettings {
    pub port: String,
    pub baud_rate: u32,
    pub write_timeout: Duration,
    /// Consumed by the lock firmware; only reported here.
    pub door_open: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    pub max_attempts: u32,
    pub init_retry_delay: Duration,
    pub frame_interval: Duration,
    pub fault_backoff: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggingSettings {
    pub file: Option<PathBuf>,
    pub level: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub camera: CameraSettings,
    pub detector: DetectorSettings,
    pub verifier: VerifierSettings,
    pub actuator: ActuatorSettings,
    pub controller: ControllerSettings,
    pub logging: LoggingSettings,
}

impl ResolvedConfig {
    pub fn from_raw(raw: ConfigFile) -> Self {
        let ConfigFile {
            camera,
            detector,
            verifier,
            actuator,
            controller,
            logging,
        } = raw;

        Self {
            camera: CameraSettings {
                device: camera
                    .device
                    .unwrap_or_else(|| DEFAULT_VIDEO_DEVICE.to_string()),
                width: camera.width.unwrap_or(DEFAULT_FRAME_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_FRAME_HEIGHT),
                fps: camera.fps.unwrap_or(DEFAULT_FPS),
                pixel_format: camera
                    .pixel_format
                    .unwrap_or_else(|| DEFAULT_PIXEL_FORMAT.to_string()),
                warmup_frames: camera.warmup_frames.unwrap_or(DEFAULT_WARMUP_FRAMES),
                settle: Duration::from_millis(camera.settle_millis.unwrap_or(DEFAULT_SETTLE_MILLIS)),
                capture_timeout: Duration::from_millis(
                    camera
                        .capture_timeout_millis
                        .unwrap_or(DEFAULT_CAPTURE_TIMEOUT_MILLIS),
                ),
                controls: camera.controls,
            },
            detector: DetectorSettings {
                model: detector.model,
                scale_factor: detector.scale_factor.unwrap_or(DEFAULT_SCALE_FACTOR),
                min_neighbors: detector.min_neighbors.unwrap_or(DEFAULT_MIN_NEIGHBORS),
                min_size: detector.min_size.unwrap_or(DEFAULT_MIN_SIZE),
                max_size: detector.max_size.unwrap_or(DEFAULT_MAX_SIZE),
            },
            verifier: VerifierSettings {
                identity_store: verifier
                    .identity_store
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_IDENTITY_STORE)),
                tolerance: verifier.tolerance.unwrap_or(DEFAULT_TOLERANCE),
                landmark_model: verifier.landmark_model,
                encoder_model: verifier.encoder_model,
                jitters: verifier.jitters.unwrap_or(DEFAULT_JITTERS),
            },
            actuator: ActuatorSettings {
                port: actuator
                    .port
                    .unwrap_or_else(|| DEFAULT_SERIAL_PORT.to_string()),
                baud_rate: actuator.baud_rate.unwrap_or(DEFAULT_BAUD_RATE),
                write_timeout: Duration::from_millis(
                    actuator
                        .write_timeout_millis
                        .unwrap_or(DEFAULT_WRITE_TIMEOUT_MILLIS),
                ),
                door_open: Duration::from_secs(
                    actuator.door_open_secs.unwrap_or(DEFAULT_DOOR_OPEN_SECS),
                ),
            },
            controller: ControllerSettings {
                max_attempts: controller.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
                init_retry_delay: Duration::from_millis(
                    controller
                        .init_retry_delay_millis
                        .unwrap_or(DEFAULT_INIT_RETRY_DELAY_MILLIS),
                ),
                frame_interval: Duration::from_millis(
                    controller
                        .frame_interval_millis
                        .unwrap_or(DEFAULT_FRAME_INTERVAL_MILLIS),
                ),
                fault_backoff: Duration::from_millis(
                    controller
                        .fault_backoff_millis
                        .unwrap_or(DEFAULT_FAULT_BACKOFF_MILLIS),
                ),
            },
            logging: LoggingSettings {
                // An empty path disables the file sink.
                file: match logging.file {
                    Some(path) if path.as_os_str().is_empty() => None,
                    Some(path) => Some(path),
                    None => Some(PathBuf::from(DEFAULT_LOG_FILE)),
                },
                level: logging
                    .level
                    .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let detector = &self.detector;
        if !(detector.scale_factor.is_finite() && detector.scale_factor > 1.0) {
            return Err(invalid(
                "detector.scale_factor",
                format!("must be greater than 1.0, got {}", detector.scale_factor),
            ));
        }
        if detector.min_neighbors < 1 {
            return Err(invalid("detector.min_neighbors", "must be at least 1"));
        }
        if detector.min_size.0 > detector.max_size.0 || detector.min_size.1 > detector.max_size.1 {
            return Err(invalid(
                "detector.min_size",
                format!(
                    "{:?} exceeds detector.max_size {:?}",
                    detector.min_size, detector.max_size
                ),
            ));
        }
        let tolerance = self.verifier.tolerance;
        if !(tolerance.is_finite() && tolerance > 0.0) {
            return Err(invalid(
                "verifier.tolerance",
                format!("must be a positive number, got {tolerance}"),
            ));
        }
        if self.controller.max_attempts < 1 {
            return Err(invalid("controller.max_attempts", "must be at least 1"));
        }
        if self.actuator.baud_rate == 0 {
            return Err(invalid("actuator.baud_rate", "must be positive"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(invalid("camera.width", "frame dimensions must be positive"));
        }
        let timeout = self.camera.capture_timeout.as_millis();
        if timeout == 0 || timeout > i32::MAX as u128 {
            return Err(invalid(
                "camera.capture_timeout_millis",
                format!("must be between 1 and {}, got {timeout}", i32::MAX),
            ));
        }
        Ok(())
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self::from_raw(ConfigFile::default())
    }
}

fn invalid(key: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        message: message.into(),
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub contents: ConfigFile,
    pub source: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfigWithSource {
    pub resolved: ResolvedConfig,
    pub source: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Resolve configuration from an explicit path, or the system locations when none is given.
///
/// An explicit path must exist; the system locations are optional.
pub fn load_resolved_config(
    explicit: Option<&Path>,
) -> Result<ResolvedConfigWithSource, ConfigError> {
    if let Some(path) = explicit {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed = parse_config(&contents, path)?;
        let resolved = ResolvedConfig::from_raw(parsed);
        resolved.validate()?;
        return Ok(ResolvedConfigWithSource {
            resolved,
            source: Some(path.to_path_buf()),
        });
    }

    let sources = [
        PathBuf::from(PRIMARY_CONFIG_PATH),
        PathBuf::from(SECONDARY_CONFIG_PATH),
    ];
    load_resolved_from_paths(&sources)
}

pub fn load_from_paths(paths: &[PathBuf]) -> Result<Option<LoadedConfig>, ConfigError> {
    for path in paths {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let parsed = parse_config(&contents, path)?;
                return Ok(Some(LoadedConfig {
                    contents: parsed,
                    source: path.clone(),
                }));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(ConfigError::Read {
                    path: path.clone(),
                    source: err,
                })
            }
        }
    }

    Ok(None)
}

pub fn load_resolved_from_paths(
    paths: &[PathBuf],
) -> Result<ResolvedConfigWithSource, ConfigError> {
    let with_source = match load_from_paths(paths)? {
        Some(entry) => ResolvedConfigWithSource {
            resolved: ResolvedConfig::from_raw(entry.contents),
            source: Some(entry.source),
        },
        None => ResolvedConfigWithSource {
            resolved: ResolvedConfig::default(),
            source: None,
        },
    };
    with_source.resolved.validate()?;
    Ok(with_source)
}

fn parse_config(contents: &str, path: &Path) -> Result<ConfigFile, ConfigError> {
    toml::from_str::<ConfigFile>(contents).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}
