// src/pipeline/orchestrator.rs
//
// Wires source -> detector -> tracker -> homography -> transport and drives
// them at the target frame rate on the processing thread.
//
// Control-plane changes (backend config pushes, commands, calibration) are
// posted by the socket task onto a bounded channel and applied here at the
// top of each loop iteration, so no callback ever touches processing-thread
// state directly.

use crate::camera::FrameSource;
use crate::config::Config;
use crate::detector::Detector;
use crate::frame_buffer::FrameBuffer;
use crate::health::HealthCollector;
use crate::homography::Homography;
use crate::pipeline::metrics::PipelineMetrics;
use crate::tracker::{Tracker, TrackerStats};
use crate::transport::messages::{
    CameraHealth, EdgeDeviceCommand, EdgeDeviceConfig, HealthPayload, TrackerHealth,
};
use crate::transport::TransportSession;
use crate::types::{iso_timestamp, CalibrationConfig, OccupancyBatch, OccupancyRecord};
use anyhow::{bail, Result};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Idle wait when no frame is available
const IDLE_POLL: Duration = Duration::from_millis(10);

// ============================================================================
// Control plane
// ============================================================================

#[derive(Debug)]
pub enum ControlRequest {
    ApplyConfig(EdgeDeviceConfig),
    Command(EdgeDeviceCommand),
    Calibration(serde_json::Value),
}

pub fn control_channel() -> (Sender<ControlRequest>, Receiver<ControlRequest>) {
    crossbeam_channel::bounded(16)
}

/// Route inbound transport events onto the control channel. Callbacks run on
/// the socket task and must not block: a full queue drops the request.
pub fn wire_control_callbacks(session: &TransportSession, sender: Sender<ControlRequest>) {
    let config_tx = sender.clone();
    session.set_config_callback(move |config| {
        if config_tx
            .try_send(ControlRequest::ApplyConfig(config))
            .is_err()
        {
            warn!("control queue full, dropping config update");
        }
    });

    let command_tx = sender.clone();
    session.set_command_callback(move |command| {
        if command_tx.try_send(ControlRequest::Command(command)).is_err() {
            warn!("control queue full, dropping command");
        }
    });

    session.set_calibration_callback(move |raw| {
        if sender.try_send(ControlRequest::Calibration(raw)).is_err() {
            warn!("control queue full, dropping calibration");
        }
    });
}

// ============================================================================
// Orchestrator
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct PipelineSummary {
    pub frames_processed: u64,
    pub detections_total: u64,
    pub average_fps: f32,
    pub tracker: TrackerStats,
}

pub struct PipelineOrchestrator {
    config: Config,
    buffer: Arc<FrameBuffer>,
    source: Box<dyn FrameSource>,
    detector: Box<dyn Detector>,
    tracker: Tracker,
    homography: Arc<Homography>,
    session: Arc<TransportSession>,
    metrics: PipelineMetrics,
    health: HealthCollector,
    control_rx: Receiver<ControlRequest>,
    shutdown: Arc<AtomicBool>,
}

impl PipelineOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        buffer: Arc<FrameBuffer>,
        source: Box<dyn FrameSource>,
        detector: Box<dyn Detector>,
        homography: Arc<Homography>,
        session: Arc<TransportSession>,
        metrics: PipelineMetrics,
        control_rx: Receiver<ControlRequest>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let tracker = Tracker::new(config.tracker.clone());
        Self {
            config,
            buffer,
            source,
            detector,
            tracker,
            homography,
            session,
            metrics,
            health: HealthCollector::new(),
            control_rx,
            shutdown,
        }
    }

    /// Blocking main loop; returns when the shutdown flag is raised
    pub fn run(&mut self) -> Result<PipelineSummary> {
        if !self.source.start() {
            bail!("failed to start frame source");
        }

        info!("processing loop started ({} fps target)", self.config.camera.fps);
        let target_frame_time =
            Duration::from_secs_f64(1.0 / self.config.camera.fps.max(1) as f64);
        let heartbeat_interval = Duration::from_millis(self.config.backend.heartbeat_interval_ms);
        let health_interval =
            Duration::from_millis(self.config.backend.health_report_interval_ms);
        let mut last_heartbeat = Instant::now();
        let mut last_health = Instant::now();

        while !self.shutdown.load(Ordering::Acquire) {
            let loop_start = Instant::now();

            self.drain_control();
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let Some(frame) = self.buffer.pop_timeout(IDLE_POLL) else {
                continue;
            };
            self.metrics.frames_processed.fetch_add(1, Ordering::Relaxed);

            let detections = self.detector.detect(&frame);
            let tracked = self.tracker.update(&detections);

            if !tracked.is_empty() {
                let records: Vec<OccupancyRecord> = tracked
                    .iter()
                    .map(|track| OccupancyRecord {
                        tracking_id: format!("track_{}", track.id),
                        position: self.homography.transform_bbox_bottom(&track.bbox),
                        state: track.state,
                        confidence: track.confidence,
                        velocity: track.velocity,
                    })
                    .collect();
                self.metrics
                    .detections_total
                    .fetch_add(records.len() as u64, Ordering::Relaxed);

                if self.session.is_registered() {
                    let batch = OccupancyBatch::new(
                        self.config.backend.camera_id.clone(),
                        self.config.backend.tenant_id.clone(),
                        records,
                    );
                    self.session.send_occupancy(&batch);
                }
            }

            if last_heartbeat.elapsed() >= heartbeat_interval {
                if self.session.send_heartbeat() {
                    debug!("heartbeat sent");
                }
                last_heartbeat = Instant::now();
            }

            if last_health.elapsed() >= health_interval {
                self.send_health_report();
                last_health = Instant::now();
            }

            // Pace to the frame boundary so detector latency variance does
            // not change the effective rate
            let elapsed = loop_start.elapsed();
            if elapsed < target_frame_time {
                std::thread::sleep(target_frame_time - elapsed);
            }
        }

        info!("processing loop stopping");
        self.source.stop();
        self.buffer.close();

        Ok(PipelineSummary {
            frames_processed: self.metrics.frames(),
            detections_total: self.metrics.detections(),
            average_fps: self.metrics.fps(),
            tracker: self.tracker.stats(),
        })
    }

    fn drain_control(&mut self) {
        while let Ok(request) = self.control_rx.try_recv() {
            match request {
                ControlRequest::ApplyConfig(update) => self.apply_config(update),
                ControlRequest::Command(command) => self.apply_command(command),
                ControlRequest::Calibration(raw) => self.apply_calibration(raw),
            }
        }
    }

    fn apply_config(&mut self, update: EdgeDeviceConfig) {
        info!("applying configuration update from backend");

        if !update.camera_url.is_empty() && update.camera_url != self.config.camera.url {
            info!("camera url changed, reconnecting camera");
            self.source.set_url(update.camera_url.clone());
            self.config.camera.url = update.camera_url.clone();
        }

        if let Some(calibration) = update.calibration_config() {
            self.homography.set_config(calibration);
            info!("homography calibration updated");
        }
    }

    fn apply_command(&mut self, command: EdgeDeviceCommand) {
        info!("received command: {}", command.command);
        match command.command.as_str() {
            "STOP" | "RESTART" => {
                self.shutdown.store(true, Ordering::Release);
            }
            "RECALIBRATE" => {
                if !self.homography.calibrate() {
                    warn!("recalibration failed, keeping previous mapping");
                }
            }
            "START" | "UPDATE_CONFIG" => {
                debug!("command {} is a no-op while running", command.command);
            }
            other => warn!("unknown command: {}", other),
        }
    }

    fn apply_calibration(&mut self, raw: serde_json::Value) {
        match serde_json::from_value::<CalibrationConfig>(raw) {
            Ok(calibration) => {
                self.homography.set_config(calibration);
                info!("calibration replaced from backend push");
            }
            Err(err) => warn!("invalid calibration payload: {}", err),
        }
    }

    fn send_health_report(&mut self) {
        let system = self.health.collect();
        let camera = self.source.stats();
        let tracker = self.tracker.stats();

        let payload = HealthPayload {
            device_id: self.config.device_id.clone(),
            timestamp: iso_timestamp(),
            uptime: self.metrics.uptime_secs() as i64,
            frames_processed: self.metrics.frames(),
            detections_total: self.metrics.detections(),
            fps: self.metrics.fps(),
            cpu_usage: system.cpu_usage,
            memory_usage: system.memory_usage,
            gpu_usage: system.gpu_usage,
            temperature: system.temperature,
            camera: CameraHealth {
                state: camera.state,
                url: camera.url,
                reconnect_count: camera.reconnect_count,
                actual_fps: camera.actual_fps,
            },
            tracker: TrackerHealth {
                active_tracks: tracker.active_tracks,
                total_tracked: tracker.total_tracked,
            },
        };

        if self.session.send_health(&payload) {
            debug!("health report sent");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
