// src/types.rs

use serde::{Deserialize, Serialize};
use std::time::Instant;

// ============================================================================
// Geometry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn zero() -> Self {
        Self { x: 0.0, y: 0.0 }
    }

    /// Euclidean norm; speed when the point is a velocity vector
    pub fn norm(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }
}

/// Axis-aligned bounding box, top-left origin, pixel units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x: cx - w / 2.0,
            y: cy - h / 2.0,
            w,
            h,
        }
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    /// Foot point proxy: horizontal center of the bottom edge
    pub fn bottom_center(&self) -> Point {
        Point::new(self.x + self.w / 2.0, self.y + self.h)
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }
}

// ============================================================================
// Frames and detections
// ============================================================================

/// One decoded video frame: BGR 3-channel interleaved bytes
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub frame_number: u64,
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: usize, height: usize, frame_number: u64) -> Self {
        Self {
            data,
            width,
            height,
            frame_number,
            timestamp: Instant::now(),
        }
    }
}

/// One model-detected object in image coordinates. Persons are class 0.
#[derive(Debug, Clone, Copy)]
pub struct Detection {
    pub bbox: Rect,
    pub confidence: f32,
    pub class_id: i32,
}

pub const PERSON_CLASS_ID: i32 = 0;

// ============================================================================
// Person state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PersonState {
    Standing,
    Sitting,
    Moving,
    Waiting,
    Unknown,
}

impl PersonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersonState::Standing => "STANDING",
            PersonState::Sitting => "SITTING",
            PersonState::Moving => "MOVING",
            PersonState::Waiting => "WAITING",
            PersonState::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for PersonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Floor plan
// ============================================================================

/// Position on the floor plan: meters plus quantized grid cell
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FloorPosition {
    pub x: f32,
    pub z: f32,
    pub grid_x: i32,
    pub grid_z: i32,
}

// ============================================================================
// Occupancy output
// ============================================================================

/// Per-person output record for one processed frame
#[derive(Debug, Clone)]
pub struct OccupancyRecord {
    pub tracking_id: String,
    pub position: FloorPosition,
    pub state: PersonState,
    pub confidence: f32,
    pub velocity: Point,
}

/// A frame's worth of occupancy records bound to camera/tenant identity
#[derive(Debug, Clone)]
pub struct OccupancyBatch {
    pub camera_id: String,
    pub tenant_id: String,
    /// ISO-8601 UTC, millisecond precision, "Z" suffix
    pub timestamp: String,
    pub records: Vec<OccupancyRecord>,
}

impl OccupancyBatch {
    pub fn new(camera_id: String, tenant_id: String, records: Vec<OccupancyRecord>) -> Self {
        Self {
            camera_id,
            tenant_id,
            timestamp: iso_timestamp(),
            records,
        }
    }
}

/// ISO-8601 UTC timestamp with millisecond precision
pub fn iso_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

// ============================================================================
// Calibration
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub image_x: f32,
    pub image_y: f32,
    pub floor_x: f32,
    pub floor_z: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Explicit 3x3 homography; takes precedence over point correspondences
    pub homography_matrix: Option<Vec<Vec<f64>>>,
    /// Image <-> floor point correspondences (at least 4 to calibrate)
    pub points: Vec<CalibrationPoint>,
    /// Floor plan extent in meters
    pub floor_plan_width: f32,
    pub floor_plan_height: f32,
    /// Occupancy grid resolution per axis
    pub grid_size: i32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            homography_matrix: None,
            points: Vec::new(),
            floor_plan_width: 20.0,
            floor_plan_height: 20.0,
            grid_size: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_bottom_center() {
        let r = Rect::new(100.0, 100.0, 50.0, 150.0);
        let foot = r.bottom_center();
        assert_eq!(foot.x, 125.0);
        assert_eq!(foot.y, 250.0);
    }

    #[test]
    fn test_rect_from_center_round_trips() {
        let r = Rect::from_center(125.0, 175.0, 50.0, 150.0);
        assert_eq!(r.x, 100.0);
        assert_eq!(r.y, 100.0);
        let c = r.center();
        assert_eq!(c.x, 125.0);
        assert_eq!(c.y, 175.0);
    }

    #[test]
    fn test_iso_timestamp_shape() {
        let ts = iso_timestamp();
        // e.g. 2026-01-02T03:04:05.678Z
        assert_eq!(ts.len(), 24);
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[10..11], "T");
        assert_eq!(&ts[19..20], ".");
    }

    #[test]
    fn test_person_state_wire_strings() {
        assert_eq!(PersonState::Standing.as_str(), "STANDING");
        assert_eq!(PersonState::Unknown.as_str(), "UNKNOWN");
    }
}
