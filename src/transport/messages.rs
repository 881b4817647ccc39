// src/transport/messages.rs
//
// Wire payloads exchanged with the backend over the analytics-edge
// namespace. Field names are camelCase on the wire.

use crate::types::{CalibrationConfig, OccupancyBatch};
use serde::{Deserialize, Serialize};

// ============================================================================
// Outbound (client -> server)
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub device_id: String,
    pub tenant_id: String,
    pub camera_id: String,
    /// Nanoseconds since the Unix epoch
    pub timestamp: i64,
    pub firmware_version: String,
    pub hardware_type: String,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub yolov8: bool,
    pub pose: bool,
    pub tracking: bool,
    pub gpu_accel: bool,
}

pub const FIRMWARE_VERSION: &str = "1.0.0";

impl RegisterPayload {
    pub fn new(
        device_id: String,
        tenant_id: String,
        camera_id: String,
        hardware_type: String,
    ) -> Self {
        Self {
            device_id,
            tenant_id,
            camera_id,
            timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            firmware_version: FIRMWARE_VERSION.to_string(),
            hardware_type,
            capabilities: Capabilities {
                yolov8: true,
                pose: false,
                tracking: true,
                gpu_accel: false,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OccupancyPayload {
    pub camera_id: String,
    pub tenant_id: String,
    /// ISO-8601 UTC millisecond precision
    pub timestamp: String,
    pub detections: Vec<OccupancyDetection>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OccupancyDetection {
    pub tracking_id: String,
    pub position_x: f32,
    pub position_z: f32,
    pub grid_x: i32,
    pub grid_z: i32,
    pub state: String,
    pub confidence: f32,
    pub velocity_x: f32,
    pub velocity_z: f32,
}

impl From<&OccupancyBatch> for OccupancyPayload {
    fn from(batch: &OccupancyBatch) -> Self {
        Self {
            camera_id: batch.camera_id.clone(),
            tenant_id: batch.tenant_id.clone(),
            timestamp: batch.timestamp.clone(),
            detections: batch
                .records
                .iter()
                .map(|record| OccupancyDetection {
                    tracking_id: record.tracking_id.clone(),
                    position_x: record.position.x,
                    position_z: record.position.z,
                    grid_x: record.position.grid_x,
                    grid_z: record.position.grid_z,
                    state: record.state.as_str().to_string(),
                    confidence: record.confidence,
                    velocity_x: record.velocity.x,
                    velocity_z: record.velocity.y,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub device_id: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthPayload {
    pub device_id: String,
    pub timestamp: String,
    /// Seconds since pipeline start
    pub uptime: i64,
    pub frames_processed: u64,
    pub detections_total: u64,
    pub fps: f32,
    pub cpu_usage: f32,
    pub memory_usage: f32,
    pub gpu_usage: f32,
    pub temperature: f32,
    pub camera: CameraHealth,
    pub tracker: TrackerHealth,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraHealth {
    pub state: String,
    pub url: String,
    pub reconnect_count: u32,
    pub actual_fps: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerHealth {
    pub active_tracks: usize,
    pub total_tracked: u64,
}

// ============================================================================
// Inbound (server -> client)
// ============================================================================

/// Configuration pushed by the backend. All fields optional on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EdgeDeviceConfig {
    pub camera_id: String,
    pub camera_url: String,
    pub fps: Option<u32>,
    pub confidence_threshold: Option<f32>,
    pub calibration: EdgeCalibration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EdgeCalibration {
    pub homography_matrix: Vec<Vec<f64>>,
    pub floor_plan_width: f32,
    pub floor_plan_height: f32,
    pub grid_size: i32,
}

impl Default for EdgeCalibration {
    fn default() -> Self {
        Self {
            homography_matrix: Vec::new(),
            floor_plan_width: 20.0,
            floor_plan_height: 20.0,
            grid_size: 20,
        }
    }
}

impl EdgeDeviceConfig {
    /// The pushed calibration as a core calibration config, when a matrix is
    /// present.
    pub fn calibration_config(&self) -> Option<CalibrationConfig> {
        if self.calibration.homography_matrix.is_empty() {
            return None;
        }
        Some(CalibrationConfig {
            homography_matrix: Some(self.calibration.homography_matrix.clone()),
            points: Vec::new(),
            floor_plan_width: self.calibration.floor_plan_width,
            floor_plan_height: self.calibration.floor_plan_height,
            grid_size: self.calibration.grid_size,
        })
    }
}

/// Runtime command pushed by the backend:
/// START, STOP, RESTART, RECALIBRATE, UPDATE_CONFIG
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EdgeDeviceCommand {
    pub command: String,
    pub params: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FloorPosition, OccupancyRecord, PersonState, Point};

    #[test]
    fn test_occupancy_payload_field_names() {
        let batch = OccupancyBatch {
            camera_id: "cam-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            timestamp: "2026-01-01T00:00:00.000Z".to_string(),
            records: vec![OccupancyRecord {
                tracking_id: "track_3".to_string(),
                position: FloorPosition {
                    x: 1.5,
                    z: 2.5,
                    grid_x: 3,
                    grid_z: 5,
                },
                state: PersonState::Standing,
                confidence: 0.92,
                velocity: Point::new(0.5, -0.25),
            }],
        };

        let json = serde_json::to_value(OccupancyPayload::from(&batch)).unwrap();
        assert_eq!(json["cameraId"], "cam-1");
        assert_eq!(json["tenantId"], "tenant-1");
        let det = &json["detections"][0];
        assert_eq!(det["trackingId"], "track_3");
        assert_eq!(det["positionX"], 1.5);
        assert_eq!(det["gridZ"], 5);
        assert_eq!(det["state"], "STANDING");
        assert_eq!(det["velocityZ"], -0.25);
    }

    #[test]
    fn test_register_payload_capabilities() {
        let payload = RegisterPayload::new(
            "dev-1".into(),
            "tenant-1".into(),
            "cam-1".into(),
            "GENERIC_X86".into(),
        );
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["deviceId"], "dev-1");
        assert_eq!(json["firmwareVersion"], FIRMWARE_VERSION);
        assert_eq!(json["capabilities"]["tracking"], true);
        assert_eq!(json["capabilities"]["gpuAccel"], false);
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_edge_config_partial_deserialization() {
        let config: EdgeDeviceConfig = serde_json::from_value(serde_json::json!({
            "cameraUrl": "rtsp://10.0.0.9/stream"
        }))
        .unwrap();
        assert_eq!(config.camera_url, "rtsp://10.0.0.9/stream");
        assert!(config.fps.is_none());
        assert!(config.calibration_config().is_none());
    }

    #[test]
    fn test_edge_config_with_matrix() {
        let config: EdgeDeviceConfig = serde_json::from_value(serde_json::json!({
            "calibration": {
                "homographyMatrix": [[0.01, 0.0, 0.0], [0.0, 0.01, 0.0], [0.0, 0.0, 1.0]],
                "floorPlanWidth": 12.0,
                "floorPlanHeight": 8.0,
                "gridSize": 16
            }
        }))
        .unwrap();
        let cal = config.calibration_config().unwrap();
        assert_eq!(cal.grid_size, 16);
        assert_eq!(cal.floor_plan_width, 12.0);
        assert_eq!(cal.homography_matrix.unwrap()[0][0], 0.01);
    }

    #[test]
    fn test_command_deserialization() {
        let cmd: EdgeDeviceCommand = serde_json::from_value(serde_json::json!({
            "command": "RECALIBRATE",
            "params": {"reason": "drift"}
        }))
        .unwrap();
        assert_eq!(cmd.command, "RECALIBRATE");
        assert_eq!(cmd.params["reason"], "drift");
    }
}
