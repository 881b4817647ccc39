// src/config.rs
//
// YAML configuration with environment-variable overrides. A missing file is
// not fatal (defaults apply, env/CLI may fill the gaps); an invalid one is.

use crate::tracker::TrackerConfig;
use crate::types::CalibrationConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device_id: String,
    pub log_level: String,
    /// Reported in the registration payload
    pub hardware_type: String,
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    pub tracker: TrackerConfig,
    pub calibration: CalibrationConfig,
    pub backend: BackendConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            log_level: "info".to_string(),
            hardware_type: "GENERIC_X86".to_string(),
            camera: CameraConfig::default(),
            detection: DetectionConfig::default(),
            tracker: TrackerConfig::default(),
            calibration: CalibrationConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub url: String,
    pub width: usize,
    pub height: usize,
    /// Target processing rate; also paces the main loop
    pub fps: u32,
    pub reconnect_delay_ms: u64,
    /// Frame buffer capacity between capture and processing
    pub buffer_size: usize,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            width: 1280,
            height: 720,
            fps: 15,
            reconnect_delay_ms: 5000,
            buffer_size: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Detections below this confidence are discarded by the detector
    pub confidence_threshold: f32,
    /// Motion-detector cell edge in pixels
    pub cell_size: usize,
    /// Mean per-cell luminance delta that marks a cell active
    pub diff_threshold: f32,
    /// Minimum active cells for a region to become a detection
    pub min_region_cells: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            cell_size: 16,
            diff_threshold: 12.0,
            min_region_cells: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    pub auth_token: String,
    pub tenant_id: String,
    pub camera_id: String,
    pub heartbeat_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub health_report_interval_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            auth_token: String::new(),
            tenant_id: String::new(),
            camera_id: String::new(),
            heartbeat_interval_ms: 30_000,
            reconnect_delay_ms: 5000,
            health_report_interval_ms: 60_000,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path))?;
        Ok(config)
    }

    pub fn exists(path: &str) -> bool {
        Path::new(path).exists()
    }

    /// Environment variables take precedence over file and CLI values
    pub fn merge_env(&mut self) {
        if let Ok(value) = std::env::var("EDGE_DEVICE_ID") {
            self.device_id = value;
        }
        if let Ok(value) = std::env::var("EDGE_LOG_LEVEL") {
            self.log_level = value;
        }
        if let Ok(value) = std::env::var("EDGE_CAMERA_URL") {
            self.camera.url = value;
        }
        if let Ok(value) = std::env::var("EDGE_BACKEND_URL") {
            self.backend.url = value;
        }
        if let Ok(value) = std::env::var("EDGE_AUTH_TOKEN") {
            self.backend.auth_token = value;
        }
        if let Ok(value) = std::env::var("EDGE_TENANT_ID") {
            self.backend.tenant_id = value;
        }
        if let Ok(value) = std::env::var("EDGE_CAMERA_ID") {
            self.backend.camera_id = value;
        }
    }

    /// Fail-fast validation before the pipeline starts
    pub fn validate(&self) -> bool {
        let mut valid = true;

        if self.device_id.is_empty() {
            error!("device_id is required");
            valid = false;
        }
        if self.camera.url.is_empty() {
            error!("camera.url is required");
            valid = false;
        }
        if self.backend.url.is_empty() {
            error!("backend.url is required");
            valid = false;
        }
        if self.backend.auth_token.is_empty() {
            error!("backend.auth_token is required");
            valid = false;
        }
        if self.backend.tenant_id.is_empty() {
            error!("backend.tenant_id is required");
            valid = false;
        }
        if self.backend.camera_id.is_empty() {
            error!("backend.camera_id is required");
            valid = false;
        }
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            error!("detection.confidence_threshold must be between 0 and 1");
            valid = false;
        }
        if !(0.0..=1.0).contains(&self.tracker.iou_threshold) {
            error!("tracker.iou_threshold must be between 0 and 1");
            valid = false;
        }
        if self.calibration.grid_size <= 0 {
            error!("calibration.grid_size must be positive");
            valid = false;
        }

        valid
    }
}
