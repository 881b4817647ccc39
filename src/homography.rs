// src/homography.rs
//
// Image-plane to floor-plane projective transform.
//
// Estimation is a normalized DLT least-squares fit over all point
// correspondences, followed by one outlier-rejecting refit: residuals beyond
// 3x the median are dropped and the remaining inliers refit. Deterministic,
// which keeps calibration reproducible across runs.
//
// Concurrency: the control-plane thread may swap the calibration while the
// processing thread is mid-transform. All state lives behind one RwLock;
// transforms copy the 3x3 matrices under a short read lock so every transform
// observes a consistent (H, H_inv) pair.

use crate::types::{CalibrationConfig, FloorPosition, Rect};
use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector3};
use std::sync::RwLock;
use tracing::{error, info, warn};

/// Fallback scale when uncalibrated: 100 pixels per meter
const FALLBACK_PIXELS_PER_METER: f32 = 100.0;

/// Residual multiple of the median beyond which a correspondence is an outlier
const OUTLIER_MEDIAN_FACTOR: f64 = 3.0;

#[derive(Debug, Clone, Copy)]
struct Mapping {
    h: Matrix3<f64>,
    h_inv: Matrix3<f64>,
}

struct Inner {
    config: CalibrationConfig,
    mapping: Option<Mapping>,
    /// Calibration image points kept for reprojection-error reporting
    image_points: Vec<(f64, f64)>,
}

pub struct Homography {
    inner: RwLock<Inner>,
}

impl Homography {
    /// Build from config: an explicit matrix wins, otherwise point
    /// correspondences are fit. With neither, the instance is uncalibrated
    /// and transforms fall back to a fixed linear mapping.
    pub fn new(config: CalibrationConfig) -> Self {
        let homography = Self {
            inner: RwLock::new(Inner {
                config: config.clone(),
                mapping: None,
                image_points: Vec::new(),
            }),
        };

        if let Some(matrix) = &config.homography_matrix {
            if homography.set_matrix_rows(matrix) {
                info!("homography loaded from config matrix");
            }
        }
        if !homography.is_calibrated() && !config.points.is_empty() {
            homography.calibrate();
        }

        homography
    }

    pub fn is_calibrated(&self) -> bool {
        self.inner.read().unwrap().mapping.is_some()
    }

    /// Fit H from the configured point correspondences. On failure the
    /// previous calibration (if any) is retained.
    pub fn calibrate(&self) -> bool {
        let points = self.inner.read().unwrap().config.points.clone();
        if points.len() < 4 {
            error!(
                "need at least 4 calibration points, got {}",
                points.len()
            );
            return false;
        }
        let image: Vec<(f64, f64)> = points
            .iter()
            .map(|p| (p.image_x as f64, p.image_y as f64))
            .collect();
        let floor: Vec<(f64, f64)> = points
            .iter()
            .map(|p| (p.floor_x as f64, p.floor_z as f64))
            .collect();
        self.calibrate_points(&image, &floor)
    }

    /// Fit H from explicit correspondences, bypassing the stored config
    /// points. Both slices must have the same length >= 4.
    pub fn calibrate_points(&self, image: &[(f64, f64)], floor: &[(f64, f64)]) -> bool {
        if image.len() < 4 || floor.len() < 4 {
            error!("need at least 4 calibration points");
            return false;
        }
        if image.len() != floor.len() {
            error!(
                "image/floor point count mismatch: {} vs {}",
                image.len(),
                floor.len()
            );
            return false;
        }

        let Some(h) = estimate_robust(image, floor) else {
            error!("homography estimation produced no solution");
            return false;
        };
        let Some(h_inv) = h.try_inverse() else {
            error!("estimated homography is singular");
            return false;
        };

        {
            let mut inner = self.inner.write().unwrap();
            inner.mapping = Some(Mapping { h, h_inv });
            inner.image_points = image.to_vec();
        }

        info!(
            "homography calibrated with {} points, reprojection error {:.3} px",
            image.len(),
            self.reprojection_error()
        );
        true
    }

    /// Install an explicit 3x3 matrix. Fails on malformed shape or a
    /// non-invertible matrix.
    pub fn set_matrix_rows(&self, rows: &[Vec<f64>]) -> bool {
        if rows.len() != 3 || rows.iter().any(|r| r.len() != 3) {
            error!("invalid homography matrix shape");
            return false;
        }
        let mut h = Matrix3::zeros();
        for (i, row) in rows.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                h[(i, j)] = *v;
            }
        }
        let Some(h_inv) = h.try_inverse() else {
            error!("homography matrix is not invertible");
            return false;
        };
        let mut inner = self.inner.write().unwrap();
        inner.mapping = Some(Mapping { h, h_inv });
        true
    }

    /// Replace the calibration config live. Recomputes the mapping when the
    /// new config carries a matrix or enough points; otherwise the previous
    /// mapping stays in place.
    pub fn set_config(&self, config: CalibrationConfig) {
        {
            let mut inner = self.inner.write().unwrap();
            inner.config = config.clone();
        }
        if let Some(matrix) = &config.homography_matrix {
            if self.set_matrix_rows(matrix) {
                info!("homography matrix updated from backend config");
                return;
            }
        }
        if !config.points.is_empty() && !self.calibrate() {
            warn!("homography reconfiguration kept previous calibration");
        }
    }

    /// Project an image point to the floor plane. Uncalibrated instances use
    /// the fixed fallback mapping; callers treat that output as advisory.
    pub fn transform_point(&self, image_x: f32, image_y: f32) -> FloorPosition {
        let (mapping, grid) = {
            let inner = self.inner.read().unwrap();
            (inner.mapping, GridSpec::from_config(&inner.config))
        };

        let (x, z) = match mapping {
            Some(m) => project(&m.h, image_x as f64, image_y as f64),
            None => (
                (image_x / FALLBACK_PIXELS_PER_METER) as f64,
                (image_y / FALLBACK_PIXELS_PER_METER) as f64,
            ),
        };

        grid.position(x as f32, z as f32)
    }

    /// Batch form of `transform_point` with a single matrix snapshot.
    pub fn transform_points(&self, points: &[(f32, f32)]) -> Vec<FloorPosition> {
        let (mapping, grid) = {
            let inner = self.inner.read().unwrap();
            (inner.mapping, GridSpec::from_config(&inner.config))
        };

        points
            .iter()
            .map(|&(u, v)| {
                let (x, z) = match mapping {
                    Some(m) => project(&m.h, u as f64, v as f64),
                    None => (
                        (u / FALLBACK_PIXELS_PER_METER) as f64,
                        (v / FALLBACK_PIXELS_PER_METER) as f64,
                    ),
                };
                grid.position(x as f32, z as f32)
            })
            .collect()
    }

    /// Project the bbox bottom-center: the foot point of a standing person on
    /// the ground plane.
    pub fn transform_bbox_bottom(&self, bbox: &Rect) -> FloorPosition {
        let foot = bbox.bottom_center();
        self.transform_point(foot.x, foot.y)
    }

    /// Floor position back to image pixels
    pub fn inverse_transform(&self, position: &FloorPosition) -> (f32, f32) {
        let mapping = self.inner.read().unwrap().mapping;
        match mapping {
            Some(m) => {
                let (u, v) = project(&m.h_inv, position.x as f64, position.z as f64);
                (u as f32, v as f32)
            }
            None => (
                position.x * FALLBACK_PIXELS_PER_METER,
                position.z * FALLBACK_PIXELS_PER_METER,
            ),
        }
    }

    /// RMS pixel distance after mapping the stored calibration image points
    /// through H then H_inv. Negative sentinel when uncalibrated or no points
    /// are stored.
    pub fn reprojection_error(&self) -> f32 {
        let inner = self.inner.read().unwrap();
        let Some(mapping) = inner.mapping else {
            return -1.0;
        };
        if inner.image_points.is_empty() {
            return -1.0;
        }

        let mut total = 0.0;
        for &(u, v) in &inner.image_points {
            let (fx, fz) = project(&mapping.h, u, v);
            let (bu, bv) = project(&mapping.h_inv, fx, fz);
            total += (u - bu).powi(2) + (v - bv).powi(2);
        }
        (total / inner.image_points.len() as f64).sqrt() as f32
    }

    pub fn matrix(&self) -> Option<[[f64; 3]; 3]> {
        self.inner.read().unwrap().mapping.map(|m| to_rows(&m.h))
    }

    pub fn inverse_matrix(&self) -> Option<[[f64; 3]; 3]> {
        self.inner.read().unwrap().mapping.map(|m| to_rows(&m.h_inv))
    }
}

fn to_rows(m: &Matrix3<f64>) -> [[f64; 3]; 3] {
    [
        [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
        [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
        [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
    ]
}

/// Apply the perspective transform and homogenize
fn project(h: &Matrix3<f64>, x: f64, y: f64) -> (f64, f64) {
    let p = h * Vector3::new(x, y, 1.0);
    if p.z.abs() < 1e-12 {
        return (0.0, 0.0);
    }
    (p.x / p.z, p.y / p.z)
}

// ============================================================================
// Grid quantization
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct GridSpec {
    floor_width: f32,
    floor_height: f32,
    grid_size: i32,
}

impl GridSpec {
    fn from_config(config: &CalibrationConfig) -> Self {
        Self {
            floor_width: config.floor_plan_width,
            floor_height: config.floor_plan_height,
            grid_size: config.grid_size,
        }
    }

    fn position(&self, x: f32, z: f32) -> FloorPosition {
        FloorPosition {
            x,
            z,
            grid_x: self.cell(x, self.floor_width),
            grid_z: self.cell(z, self.floor_height),
        }
    }

    fn cell(&self, coord: f32, extent: f32) -> i32 {
        if extent <= 0.0 || self.grid_size <= 0 {
            return 0;
        }
        let cell = ((coord / extent) * self.grid_size as f32).floor() as i32;
        cell.clamp(0, self.grid_size - 1)
    }
}

// ============================================================================
// DLT estimation
// ============================================================================

/// Least-squares fit with one median-based outlier rejection pass
fn estimate_robust(image: &[(f64, f64)], floor: &[(f64, f64)]) -> Option<Matrix3<f64>> {
    let h = estimate_dlt(image, floor)?;
    if image.len() == 4 {
        return Some(h);
    }

    let mut residuals: Vec<f64> = image
        .iter()
        .zip(floor)
        .map(|(&(u, v), &(fx, fz))| {
            let (px, pz) = project(&h, u, v);
            ((px - fx).powi(2) + (pz - fz).powi(2)).sqrt()
        })
        .collect();

    let mut sorted = residuals.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = sorted[sorted.len() / 2];
    let threshold = (median * OUTLIER_MEDIAN_FACTOR).max(1e-9);

    let mut inlier_image = Vec::with_capacity(image.len());
    let mut inlier_floor = Vec::with_capacity(floor.len());
    for (i, residual) in residuals.drain(..).enumerate() {
        if residual <= threshold {
            inlier_image.push(image[i]);
            inlier_floor.push(floor[i]);
        }
    }

    if inlier_image.len() == image.len() || inlier_image.len() < 4 {
        return Some(h);
    }
    warn!(
        "homography refit rejected {} outlier correspondence(s)",
        image.len() - inlier_image.len()
    );
    estimate_dlt(&inlier_image, &inlier_floor).or(Some(h))
}

/// Normalized direct linear transform. Returns None when the system is
/// degenerate (collinear points, coincident points).
fn estimate_dlt(image: &[(f64, f64)], floor: &[(f64, f64)]) -> Option<Matrix3<f64>> {
    let n = image.len();
    let (t_image, norm_image) = normalize(image)?;
    let (t_floor, norm_floor) = normalize(floor)?;

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for i in 0..n {
        let (x, y) = norm_image[i];
        let (fx, fy) = norm_floor[i];
        a[(2 * i, 0)] = -x;
        a[(2 * i, 1)] = -y;
        a[(2 * i, 2)] = -1.0;
        a[(2 * i, 6)] = fx * x;
        a[(2 * i, 7)] = fx * y;
        a[(2 * i, 8)] = fx;
        a[(2 * i + 1, 3)] = -x;
        a[(2 * i + 1, 4)] = -y;
        a[(2 * i + 1, 5)] = -1.0;
        a[(2 * i + 1, 6)] = fy * x;
        a[(2 * i + 1, 7)] = fy * y;
        a[(2 * i + 1, 8)] = fy;
    }

    // Null vector of A via the smallest eigenpair of A^T A; works for the
    // minimal 4-point system where a thin SVD would not expose the null space
    let ata = a.transpose() * &a;
    let eigen = SymmetricEigen::new(ata);
    let mut min_index = 0;
    for i in 1..eigen.eigenvalues.len() {
        if eigen.eigenvalues[i] < eigen.eigenvalues[min_index] {
            min_index = i;
        }
    }
    let hvec = eigen.eigenvectors.column(min_index);
    if hvec.iter().all(|v| v.abs() < 1e-12) {
        return None;
    }

    let h_norm = Matrix3::new(
        hvec[0], hvec[1], hvec[2],
        hvec[3], hvec[4], hvec[5],
        hvec[6], hvec[7], hvec[8],
    );

    // Denormalize: H = T_floor^-1 * H_norm * T_image
    let t_floor_inv = t_floor.try_inverse()?;
    let mut h = t_floor_inv * h_norm * t_image;

    if h[(2, 2)].abs() < 1e-12 {
        return None;
    }
    h /= h[(2, 2)];
    Some(h)
}

/// Hartley normalization: translate to the centroid and scale so the average
/// distance from the origin is sqrt(2)
fn normalize(points: &[(f64, f64)]) -> Option<(Matrix3<f64>, Vec<(f64, f64)>)> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.0).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.1).sum::<f64>() / n;

    let mean_dist = points
        .iter()
        .map(|&(x, y)| ((x - cx).powi(2) + (y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < 1e-12 {
        return None;
    }
    let scale = std::f64::consts::SQRT_2 / mean_dist;

    let t = Matrix3::new(
        scale, 0.0, -scale * cx,
        0.0, scale, -scale * cy,
        0.0, 0.0, 1.0,
    );
    let normalized = points
        .iter()
        .map(|&(x, y)| (scale * (x - cx), scale * (y - cy)))
        .collect();
    Some((t, normalized))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CalibrationPoint;

    fn corner_config() -> CalibrationConfig {
        // 640x480 image covering a 10x10 m floor patch
        let corners = [
            (0.0, 0.0, 0.0, 0.0),
            (640.0, 0.0, 10.0, 0.0),
            (640.0, 480.0, 10.0, 10.0),
            (0.0, 480.0, 0.0, 10.0),
        ];
        CalibrationConfig {
            homography_matrix: None,
            points: corners
                .iter()
                .map(|&(ix, iy, fx, fz)| CalibrationPoint {
                    image_x: ix,
                    image_y: iy,
                    floor_x: fx,
                    floor_z: fz,
                })
                .collect(),
            floor_plan_width: 10.0,
            floor_plan_height: 10.0,
            grid_size: 20,
        }
    }

    #[test]
    fn test_calibrate_and_transform_center() {
        let homography = Homography::new(corner_config());
        assert!(homography.is_calibrated());

        let pos = homography.transform_point(320.0, 240.0);
        assert!((pos.x - 5.0).abs() < 1e-3);
        assert!((pos.z - 5.0).abs() < 1e-3);
        assert_eq!(pos.grid_x, 10);
        assert_eq!(pos.grid_z, 10);
    }

    #[test]
    fn test_forward_backward_recovers_input() {
        let homography = Homography::new(corner_config());
        for &(u, v) in &[(12.0f32, 37.0f32), (320.0, 240.0), (601.5, 455.25)] {
            let pos = homography.transform_point(u, v);
            let (bu, bv) = homography.inverse_transform(&pos);
            assert!((bu - u).abs() < 1e-3, "u {} -> {}", u, bu);
            assert!((bv - v).abs() < 1e-3, "v {} -> {}", v, bv);
        }
        let err = homography.reprojection_error();
        assert!(err >= 0.0 && err < 1e-3);
    }

    #[test]
    fn test_grid_cells_clamped_to_range() {
        let homography = Homography::new(corner_config());
        // Points far outside the calibrated patch still land in [0, grid)
        for &(u, v) in &[(-500.0f32, -500.0f32), (5000.0, 5000.0), (0.0, 5000.0)] {
            let pos = homography.transform_point(u, v);
            assert!(pos.grid_x >= 0 && pos.grid_x < 20);
            assert!(pos.grid_z >= 0 && pos.grid_z < 20);
        }
    }

    #[test]
    fn test_batch_transform_matches_single() {
        let homography = Homography::new(corner_config());
        let points = [(12.0f32, 37.0f32), (320.0, 240.0), (601.5, 455.25)];
        let batch = homography.transform_points(&points);
        assert_eq!(batch.len(), 3);
        for (&(u, v), pos) in points.iter().zip(&batch) {
            let single = homography.transform_point(u, v);
            assert!((pos.x - single.x).abs() < 1e-6);
            assert!((pos.z - single.z).abs() < 1e-6);
            assert_eq!(pos.grid_x, single.grid_x);
        }
    }

    #[test]
    fn test_matrix_and_inverse_maintained_together() {
        let homography = Homography::new(CalibrationConfig::default());
        assert!(homography.matrix().is_none());
        assert!(homography.inverse_matrix().is_none());

        let homography = Homography::new(corner_config());
        assert!(homography.matrix().is_some());
        assert!(homography.inverse_matrix().is_some());
    }

    #[test]
    fn test_uncalibrated_fallback_mapping() {
        let homography = Homography::new(CalibrationConfig::default());
        assert!(!homography.is_calibrated());

        let pos = homography.transform_point(250.0, 120.0);
        assert!((pos.x - 2.5).abs() < 1e-6);
        assert!((pos.z - 1.2).abs() < 1e-6);
        assert_eq!(homography.reprojection_error(), -1.0);
    }

    #[test]
    fn test_too_few_points_fails_and_stays_uncalibrated() {
        let mut config = corner_config();
        config.points.truncate(3);
        let homography = Homography::new(config);
        assert!(!homography.is_calibrated());
        assert!(!homography.calibrate());
    }

    #[test]
    fn test_point_count_mismatch_fails() {
        let homography = Homography::new(CalibrationConfig::default());
        let image = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0), (0.5, 0.5)];
        let floor = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)];
        assert!(!homography.calibrate_points(&image, &floor));
    }

    #[test]
    fn test_degenerate_points_fail() {
        let homography = Homography::new(CalibrationConfig::default());
        // All image points coincident: no projective solution
        let image = [(5.0, 5.0), (5.0, 5.0), (5.0, 5.0), (5.0, 5.0)];
        let floor = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)];
        assert!(!homography.calibrate_points(&image, &floor));
        assert!(!homography.is_calibrated());
    }

    #[test]
    fn test_explicit_matrix_from_config() {
        // Pure scale: 100 px per meter, so (200, 300) -> (2, 3)
        let config = CalibrationConfig {
            homography_matrix: Some(vec![
                vec![0.01, 0.0, 0.0],
                vec![0.0, 0.01, 0.0],
                vec![0.0, 0.0, 1.0],
            ]),
            ..CalibrationConfig::default()
        };
        let homography = Homography::new(config);
        assert!(homography.is_calibrated());

        let pos = homography.transform_point(200.0, 300.0);
        assert!((pos.x - 2.0).abs() < 1e-6);
        assert!((pos.z - 3.0).abs() < 1e-6);

        let (u, v) = homography.inverse_transform(&pos);
        assert!((u - 200.0).abs() < 1e-3);
        assert!((v - 300.0).abs() < 1e-3);
    }

    #[test]
    fn test_singular_matrix_rejected() {
        let homography = Homography::new(CalibrationConfig::default());
        let rows = vec![
            vec![1.0, 0.0, 0.0],
            vec![2.0, 0.0, 0.0],
            vec![0.0, 0.0, 1.0],
        ];
        assert!(!homography.set_matrix_rows(&rows));
        assert!(!homography.is_calibrated());
    }

    #[test]
    fn test_bbox_bottom_center_projection() {
        let homography = Homography::new(corner_config());
        // Bottom center of (288, 90, 64, 150) is (320, 240): floor center
        let pos = homography.transform_bbox_bottom(&Rect::new(288.0, 90.0, 64.0, 150.0));
        assert!((pos.x - 5.0).abs() < 1e-3);
        assert!((pos.z - 5.0).abs() < 1e-3);
    }

    #[test]
    fn test_outlier_rejected_in_refit() {
        let homography = Homography::new(CalibrationConfig::default());
        // 8 consistent correspondences of x/64, y/48 scaling plus one wild one
        let mut image: Vec<(f64, f64)> = vec![
            (0.0, 0.0),
            (640.0, 0.0),
            (640.0, 480.0),
            (0.0, 480.0),
            (320.0, 0.0),
            (0.0, 240.0),
            (640.0, 240.0),
            (320.0, 480.0),
        ];
        let mut floor: Vec<(f64, f64)> = image.iter().map(|&(x, y)| (x / 64.0, y / 48.0)).collect();
        image.push((320.0, 240.0));
        floor.push((9.0, 1.0)); // should be (5, 5)

        assert!(homography.calibrate_points(&image, &floor));
        let pos = homography.transform_point(320.0, 240.0);
        assert!((pos.x - 5.0).abs() < 1e-2);
        assert!((pos.z - 5.0).abs() < 1e-2);
    }

    #[test]
    fn test_live_reconfiguration_swaps_mapping() {
        let homography = Homography::new(corner_config());
        let before = homography.transform_point(320.0, 240.0);
        assert!((before.x - 5.0).abs() < 1e-3);

        let update = CalibrationConfig {
            homography_matrix: Some(vec![
                vec![0.01, 0.0, 0.0],
                vec![0.0, 0.01, 0.0],
                vec![0.0, 0.0, 1.0],
            ]),
            ..corner_config()
        };
        homography.set_config(update);

        let after = homography.transform_point(320.0, 240.0);
        assert!((after.x - 3.2).abs() < 1e-6);
        assert!((after.z - 2.4).abs() < 1e-6);
    }
}
