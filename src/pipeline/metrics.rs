// src/pipeline/metrics.rs
//
// Shared pipeline counters. Cloned into the health reporter and the final
// session summary; counters are atomics so any thread can read a consistent
// value without locking the pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub frames_processed: Arc<AtomicU64>,
    pub detections_total: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            frames_processed: Arc::new(AtomicU64::new(0)),
            detections_total: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn detections(&self) -> u64 {
        self.detections_total.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn fps(&self) -> f32 {
        let elapsed = self.uptime_secs();
        if elapsed > 0.01 {
            (self.frames() as f64 / elapsed) as f32
        } else {
            0.0
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
