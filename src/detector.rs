// src/detector.rs
//
// Detector seam between the pipeline and whatever produces detections.
// The neural engine lives outside this crate; anything implementing
// `Detector` can be wired into the pipeline. The in-tree `MotionDetector`
// is a frame-differencing blob detector: it quantizes each frame into a
// luminance cell grid, diffs against the previous frame, and groups active
// cells into connected regions.

use crate::config::DetectionConfig;
use crate::types::{Detection, Frame, Rect, PERSON_CLASS_ID};
use tracing::debug;

/// Produces detections in the frame's native pixel coordinates, confidence
/// and class pre-filtered. Thread-confined to the processing thread.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Vec<Detection>;
}

// ============================================================================
// Motion detector
// ============================================================================

/// Scale turning a mean per-cell luminance delta into a confidence
const CONFIDENCE_DELTA_SCALE: f32 = 64.0;

pub struct MotionDetector {
    config: DetectionConfig,
    prev_grid: Option<LuminanceGrid>,
}

struct LuminanceGrid {
    cells: Vec<f32>,
    grid_w: usize,
    grid_h: usize,
}

impl MotionDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            config,
            prev_grid: None,
        }
    }
}

impl Detector for MotionDetector {
    fn detect(&mut self, frame: &Frame) -> Vec<Detection> {
        let grid = luminance_grid(frame, self.config.cell_size);

        let prev = match self.prev_grid.take() {
            Some(prev) if prev.grid_w == grid.grid_w && prev.grid_h == grid.grid_h => prev,
            _ => {
                // First frame (or resolution change): nothing to diff against
                self.prev_grid = Some(grid);
                return Vec::new();
            }
        };

        let deltas: Vec<f32> = grid
            .cells
            .iter()
            .zip(&prev.cells)
            .map(|(cur, old)| (cur - old).abs())
            .collect();

        let detections = find_regions(
            &deltas,
            grid.grid_w,
            grid.grid_h,
            &self.config,
            frame.width,
            frame.height,
        );

        self.prev_grid = Some(grid);
        if !detections.is_empty() {
            debug!("motion detector found {} region(s)", detections.len());
        }
        detections
    }
}

/// Mean luminance per cell (ITU-R 601 weights, BGR byte order)
fn luminance_grid(frame: &Frame, cell_size: usize) -> LuminanceGrid {
    let cell_size = cell_size.max(1);
    let grid_w = frame.width.div_ceil(cell_size);
    let grid_h = frame.height.div_ceil(cell_size);
    let mut sums = vec![0.0f32; grid_w * grid_h];
    let mut counts = vec![0u32; grid_w * grid_h];

    for y in 0..frame.height {
        let cell_row = y / cell_size;
        for x in 0..frame.width {
            let idx = (y * frame.width + x) * 3;
            if idx + 2 >= frame.data.len() {
                continue;
            }
            let b = frame.data[idx] as f32;
            let g = frame.data[idx + 1] as f32;
            let r = frame.data[idx + 2] as f32;
            let luminance = 0.114 * b + 0.587 * g + 0.299 * r;

            let cell = cell_row * grid_w + x / cell_size;
            sums[cell] += luminance;
            counts[cell] += 1;
        }
    }

    let cells = sums
        .iter()
        .zip(&counts)
        .map(|(sum, count)| if *count > 0 { sum / *count as f32 } else { 0.0 })
        .collect();

    LuminanceGrid {
        cells,
        grid_w,
        grid_h,
    }
}

/// Group active cells into 4-connected regions and emit one detection per
/// region that clears the size and confidence gates
fn find_regions(
    deltas: &[f32],
    grid_w: usize,
    grid_h: usize,
    config: &DetectionConfig,
    frame_w: usize,
    frame_h: usize,
) -> Vec<Detection> {
    let active: Vec<bool> = deltas.iter().map(|d| *d > config.diff_threshold).collect();
    let mut visited = vec![false; deltas.len()];
    let mut detections = Vec::new();

    for start in 0..deltas.len() {
        if !active[start] || visited[start] {
            continue;
        }

        let mut stack = vec![start];
        visited[start] = true;
        let mut cells = Vec::new();
        let mut delta_sum = 0.0f32;

        while let Some(cell) = stack.pop() {
            cells.push(cell);
            delta_sum += deltas[cell];

            let x = cell % grid_w;
            let y = cell / grid_w;
            let mut neighbors = Vec::with_capacity(4);
            if x > 0 {
                neighbors.push(cell - 1);
            }
            if x + 1 < grid_w {
                neighbors.push(cell + 1);
            }
            if y > 0 {
                neighbors.push(cell - grid_w);
            }
            if y + 1 < grid_h {
                neighbors.push(cell + grid_w);
            }
            for neighbor in neighbors {
                if active[neighbor] && !visited[neighbor] {
                    visited[neighbor] = true;
                    stack.push(neighbor);
                }
            }
        }

        if cells.len() < config.min_region_cells {
            continue;
        }

        let mut min_x = usize::MAX;
        let mut min_y = usize::MAX;
        let mut max_x = 0usize;
        let mut max_y = 0usize;
        for &cell in &cells {
            let x = cell % grid_w;
            let y = cell / grid_w;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }

        let cell_size = config.cell_size.max(1);
        let px = (min_x * cell_size) as f32;
        let py = (min_y * cell_size) as f32;
        let pw = (((max_x - min_x + 1) * cell_size) as f32).min(frame_w as f32 - px);
        let ph = (((max_y - min_y + 1) * cell_size) as f32).min(frame_h as f32 - py);

        let mean_delta = delta_sum / cells.len() as f32;
        let confidence = (mean_delta / CONFIDENCE_DELTA_SCALE).min(1.0);
        if confidence < config.confidence_threshold {
            continue;
        }

        detections.push(Detection {
            bbox: Rect::new(px, py, pw, ph),
            confidence,
            class_id: PERSON_CLASS_ID,
        });
    }

    detections
}
