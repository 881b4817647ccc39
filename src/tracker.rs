// src/tracker.rs
//
// SORT-style multi-person tracker: greedy IoU association, velocity EMA,
// coarse activity classification.
//
// Design:
//   - Greedy matching over admissible pairs sorted by ascending cost
//     (1 - IoU). Deliberately not optimal-assignment: ties resolve the same
//     way on every platform, which the downstream tests rely on.
//   - Tracks coast (predicted forward) through detection gaps and die after
//     max_age unmatched frames.
//   - The Kalman state is a bare constant-velocity 6-vector, not a full
//     filter. Do not add covariance.

use crate::types::{Detection, PersonState, Point, Rect};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Frames a track survives without a matching detection before deletion
    pub max_age: u32,
    /// Matched frames required before a track is reported
    pub min_hits: u32,
    /// Minimum IoU for a track/detection pair to be admissible
    pub iou_threshold: f32,
    /// Predict with the constant-velocity state vector instead of the
    /// smoothed velocity
    pub use_kalman: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_age: 30,
            min_hits: 3,
            iou_threshold: 0.3,
            use_kalman: true,
        }
    }
}

/// Bounded per-track center history used for velocity smoothing
const MAX_HISTORY: usize = 10;

/// Velocity EMA smoothing factor
const VELOCITY_ALPHA: f32 = 0.5;

/// Speed thresholds in pixels/frame
const MOVING_SPEED: f32 = 5.0;
const WAITING_SPEED: f32 = 2.0;

/// Aspect ratio (w/h) above which a slow person reads as sitting
const SITTING_ASPECT_MIN: f32 = 0.6;

// ============================================================================
// TRACK
// ============================================================================

/// A hypothesis that one physical person is being observed across frames
#[derive(Debug, Clone)]
pub struct Track {
    /// Unique for the tracker's lifetime, never reused
    pub id: u32,
    pub bbox: Rect,
    /// Smoothed velocity in pixels/frame
    pub velocity: Point,
    pub confidence: f32,
    pub state: PersonState,
    /// Frames since the last matched detection
    pub age: u32,
    /// Total matched frames
    pub hits: u32,
    pub confirmed: bool,
    /// Constant-velocity state [cx, cy, w, h, vx, vy]
    kalman: Option<[f32; 6]>,
    /// Most recent bbox centers, newest last
    history: VecDeque<Point>,
}

impl Track {
    fn new(id: u32, det: &Detection, use_kalman: bool) -> Self {
        let center = det.bbox.center();
        let kalman = use_kalman.then(|| {
            [
                center.x,
                center.y,
                det.bbox.w,
                det.bbox.h,
                0.0,
                0.0,
            ]
        });
        let mut history = VecDeque::with_capacity(MAX_HISTORY);
        history.push_back(center);
        Self {
            id,
            bbox: det.bbox,
            velocity: Point::zero(),
            confidence: det.confidence,
            state: PersonState::Unknown,
            age: 0,
            hits: 1,
            confirmed: false,
            kalman,
            history,
        }
    }

    /// Advance the predicted bbox one frame forward and age the track
    fn predict(&mut self) {
        if let Some(k) = self.kalman.as_mut() {
            k[0] += k[4];
            k[1] += k[5];
            self.bbox = Rect::from_center(k[0], k[1], k[2], k[3]);
        } else {
            self.bbox.x += self.velocity.x;
            self.bbox.y += self.velocity.y;
        }
        self.age += 1;
    }

    fn update(&mut self, det: &Detection, min_hits: u32) {
        self.bbox = det.bbox;
        self.confidence = det.confidence;
        self.age = 0;
        self.hits += 1;
        if self.hits >= min_hits {
            self.confirmed = true;
        }

        let center = self.bbox.center();
        self.history.push_back(center);
        if self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }

        self.velocity = smoothed_velocity(&self.history);

        if let Some(k) = self.kalman.as_mut() {
            k[4] = center.x - k[0];
            k[5] = center.y - k[1];
            k[0] = center.x;
            k[1] = center.y;
            k[2] = det.bbox.w;
            k[3] = det.bbox.h;
        }
    }

    fn classify(&mut self) {
        let speed = self.velocity.norm();
        let aspect = self.bbox.w / (self.bbox.h + 1e-6);

        self.state = if speed > MOVING_SPEED {
            PersonState::Moving
        } else if speed > WAITING_SPEED {
            PersonState::Waiting
        } else if aspect > SITTING_ASPECT_MIN {
            PersonState::Sitting
        } else {
            PersonState::Standing
        };
    }
}

/// Exponential moving average over consecutive history deltas.
/// Zero with fewer than two points.
fn smoothed_velocity(history: &VecDeque<Point>) -> Point {
    if history.len() < 2 {
        return Point::zero();
    }
    let mut velocity = Point::zero();
    for window in 1..history.len() {
        let prev = history[window - 1];
        let cur = history[window];
        velocity.x = VELOCITY_ALPHA * (cur.x - prev.x) + (1.0 - VELOCITY_ALPHA) * velocity.x;
        velocity.y = VELOCITY_ALPHA * (cur.y - prev.y) + (1.0 - VELOCITY_ALPHA) * velocity.y;
    }
    velocity
}

// ============================================================================
// IoU
// ============================================================================

/// Intersection over union of two boxes; zero when disjoint or degenerate
pub fn iou(a: &Rect, b: &Rect) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.w).min(b.x + b.w);
    let y2 = (a.y + a.h).min(b.y + b.h);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let union = a.area() + b.area() - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

// ============================================================================
// TRACKER
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub active_tracks: usize,
    pub confirmed_tracks: usize,
    /// Tracks ever created over the tracker's lifetime
    pub total_tracked: u64,
}

pub struct Tracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u32,
    total_tracked: u64,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::with_capacity(32),
            next_id: 1,
            total_tracked: 0,
        }
    }

    /// Process one frame of detections. Returns the tracks that are confirmed
    /// and were matched in this call.
    pub fn update(&mut self, detections: &[Detection]) -> Vec<Track> {
        // 1. Predict forward and age every track
        for track in &mut self.tracks {
            track.predict();
        }

        // 2. Greedy association over admissible pairs, cheapest first
        let cost_threshold = 1.0 - self.config.iou_threshold;
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                let cost = 1.0 - iou(&track.bbox, &det.bbox);
                if cost < cost_threshold {
                    pairs.push((cost, ti, di));
                }
            }
        }
        pairs.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut track_matched = vec![false; self.tracks.len()];
        let mut det_matched = vec![false; detections.len()];

        // 3. Update matched tracks
        for (_, ti, di) in &pairs {
            if track_matched[*ti] || det_matched[*di] {
                continue;
            }
            track_matched[*ti] = true;
            det_matched[*di] = true;
            self.tracks[*ti].update(&detections[*di], self.config.min_hits);
        }

        // 4. Birth: every unmatched detection starts a new track
        for (di, det) in detections.iter().enumerate() {
            if det_matched[di] {
                continue;
            }
            let track = Track::new(self.next_id, det, self.config.use_kalman);
            debug!("new track created: id={}", track.id);
            self.next_id += 1;
            self.total_tracked += 1;
            self.tracks.push(track);
        }

        // 5. Death: drop tracks unmatched for longer than max_age
        let max_age = self.config.max_age;
        self.tracks.retain(|t| {
            if t.age > max_age {
                debug!("track removed: id={} (age={})", t.id, t.age);
                return false;
            }
            true
        });

        // 6. Classify activity for every surviving track
        for track in &mut self.tracks {
            track.classify();
        }

        // 7. Report confirmed tracks observed in this frame
        self.tracks
            .iter()
            .filter(|t| t.confirmed && t.age == 0)
            .cloned()
            .collect()
    }

    /// Discard all state and restart ids from 1. Used after long camera
    /// outages, when re-associating stale tracks would be wrong.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 1;
        self.total_tracked = 0;
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            active_tracks: self.tracks.len(),
            confirmed_tracks: self.tracks.iter().filter(|t| t.confirmed).count(),
            total_tracked: self.total_tracked,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
