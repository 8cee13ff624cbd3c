use serde::Deserialize;
use std::path::Path;

/// Shared configuration for the streamer and admin binaries.
///
/// Every section is optional; a missing section or field falls back to the
/// defaults below, so an empty file is a valid local setup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub placement: PlacementConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_port")]
    pub port: u16,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_port")]
    pub port: u16,
    /// Base URL of the admin service; its `/api/filters` is the catalog source.
    #[serde(default = "default_catalog_url")]
    pub catalog_url: String,
    /// Seconds between background catalog refreshes. 0 disables the task.
    #[serde(default = "default_catalog_refresh_secs")]
    pub catalog_refresh_secs: u64,
    /// Directory that relative `image_path` values are resolved against.
    #[serde(default = "default_asset_root")]
    pub asset_root: String,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_mirror")]
    pub mirror: bool,
    #[serde(default = "default_composite_mode")]
    pub composite_mode: String,
    #[serde(default = "default_resample")]
    pub resample: String,
    #[serde(default = "default_max_faces")]
    pub max_faces: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// One of `mjpeg`, `polling` or `directory`.
    #[serde(default = "default_capture_mode")]
    pub mode: String,
    #[serde(default = "default_capture_url")]
    pub url: String,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_capture_directory")]
    pub directory: String,
    #[serde(default)]
    pub loop_directory: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// One of `none`, `fixed` or `http`.
    #[serde(default = "default_detector_kind")]
    pub kind: String,
    #[serde(default)]
    pub url: String,
    /// Channel order the detector expects: `rgb` or `bgr`.
    #[serde(default = "default_channel_order")]
    pub channel_order: String,
    #[serde(default = "default_detector_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub fixed: FixedFaceConfig,
}

/// Normalized landmark positions reported by the `fixed` detector.
#[derive(Debug, Clone, Deserialize)]
pub struct FixedFaceConfig {
    #[serde(default = "default_left_eye_outer")]
    pub left_eye_outer: [f32; 2],
    #[serde(default = "default_right_eye_outer")]
    pub right_eye_outer: [f32; 2],
    #[serde(default = "default_nose_tip")]
    pub nose_tip: [f32; 2],
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlacementConfig {
    #[serde(default = "default_width_multiplier")]
    pub width_multiplier: f32,
    #[serde(default = "default_vertical_offset")]
    pub vertical_offset: f32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            port: default_admin_port(),
            database_path: default_database_path(),
            uploads_dir: default_uploads_dir(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            port: default_stream_port(),
            catalog_url: default_catalog_url(),
            catalog_refresh_secs: default_catalog_refresh_secs(),
            asset_root: default_asset_root(),
            jpeg_quality: default_jpeg_quality(),
            mirror: default_mirror(),
            composite_mode: default_composite_mode(),
            resample: default_resample(),
            max_faces: default_max_faces(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: default_capture_mode(),
            url: default_capture_url(),
            fps: default_fps(),
            directory: default_capture_directory(),
            loop_directory: false,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            kind: default_detector_kind(),
            url: String::new(),
            channel_order: default_channel_order(),
            timeout_ms: default_detector_timeout_ms(),
            fixed: FixedFaceConfig::default(),
        }
    }
}

impl Default for FixedFaceConfig {
    fn default() -> Self {
        Self {
            left_eye_outer: default_left_eye_outer(),
            right_eye_outer: default_right_eye_outer(),
            nose_tip: default_nose_tip(),
        }
    }
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            width_multiplier: default_width_multiplier(),
            vertical_offset: default_vertical_offset(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

// Default value functions
fn default_log_level() -> String {
    "info".into()
}
fn default_admin_port() -> u16 {
    8000
}
fn default_database_path() -> String {
    "filters.db".into()
}
fn default_uploads_dir() -> String {
    "uploads".into()
}
fn default_stream_port() -> u16 {
    8001
}
fn default_catalog_url() -> String {
    "http://localhost:8000".into()
}
fn default_catalog_refresh_secs() -> u64 {
    30
}
fn default_asset_root() -> String {
    ".".into()
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_mirror() -> bool {
    true
}
fn default_composite_mode() -> String {
    "binary".into()
}
fn default_resample() -> String {
    "bilinear".into()
}
fn default_max_faces() -> usize {
    1
}
fn default_capture_mode() -> String {
    "mjpeg".into()
}
fn default_capture_url() -> String {
    "http://localhost:8080/stream".into()
}
fn default_fps() -> f64 {
    15.0
}
fn default_capture_directory() -> String {
    "frames".into()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_detector_kind() -> String {
    "none".into()
}
fn default_channel_order() -> String {
    "rgb".into()
}
fn default_detector_timeout_ms() -> u64 {
    500
}
fn default_left_eye_outer() -> [f32; 2] {
    [0.4, 0.4]
}
fn default_right_eye_outer() -> [f32; 2] {
    [0.6, 0.4]
}
fn default_nose_tip() -> [f32; 2] {
    [0.5, 0.55]
}
fn default_width_multiplier() -> f32 {
    2.0
}
fn default_vertical_offset() -> f32 {
    2.0 / 3.0
}
