mod camera;
mod config;
mod detector;
mod frame_buffer;
mod health;
mod homography;
mod pipeline;
mod tracker;
mod transport;
mod types;

use anyhow::Result;
use camera::{FrameSource, RtspCamera};
use clap::Parser;
use config::Config;
use detector::MotionDetector;
use frame_buffer::FrameBuffer;
use homography::Homography;
use pipeline::{control_channel, wire_control_callbacks, PipelineMetrics, PipelineOrchestrator};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use transport::TransportSession;

/// Edge-device occupancy analytics
#[derive(Parser, Debug)]
#[command(author, version, about = "RTSP person analytics edge device", long_about = None)]
struct Args {
    /// Path to the YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: String,

    /// Device ID (overrides config)
    #[arg(long)]
    device_id: Option<String>,

    /// Camera RTSP URL (overrides config)
    #[arg(long)]
    camera: Option<String>,

    /// Backend websocket URL (overrides config)
    #[arg(long)]
    backend: Option<String>,

    /// Log level: debug, info, warn, error
    #[arg(long)]
    log_level: Option<String>,

    /// Connect to the camera, report measured FPS, and exit
    #[arg(long)]
    test_camera: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, config_missing) = if Config::exists(&args.config) {
        (Config::load(&args.config)?, false)
    } else {
        (Config::default(), true)
    };

    // CLI overrides first, environment second (env wins)
    if let Some(device_id) = args.device_id {
        config.device_id = device_id;
    }
    if let Some(camera_url) = args.camera {
        config.camera.url = camera_url;
    }
    if let Some(backend_url) = args.backend {
        config.backend.url = backend_url;
    }
    if let Some(log_level) = args.log_level {
        config.log_level = log_level;
    }
    config.merge_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(format!(
            "analytics_edge={},tungstenite=warn,tokio_tungstenite=warn",
            config.log_level
        )))
        .init();

    info!("analytics-edge v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    if config_missing {
        warn!("config file not found: {}, using defaults", args.config);
    }

    if args.test_camera {
        return test_camera(&config);
    }

    if !config.validate() {
        anyhow::bail!("invalid configuration");
    }

    info!("device id: {}", config.device_id);
    info!("camera url: {}", config.camera.url);
    info!("backend url: {}", config.backend.url);

    // Components
    let buffer = Arc::new(FrameBuffer::new(config.camera.buffer_size));
    let source = RtspCamera::new(config.camera.clone(), Arc::clone(&buffer));
    let detector = MotionDetector::new(config.detection.clone());

    let homography = Arc::new(Homography::new(config.calibration.clone()));
    if homography.is_calibrated() {
        info!("homography calibration loaded");
    } else {
        warn!("no homography calibration, using fallback mapping");
    }

    let session = Arc::new(TransportSession::new(
        config.backend.clone(),
        config.device_id.clone(),
        config.hardware_type.clone(),
    ));

    let shutdown = Arc::new(AtomicBool::new(false));
    let (control_tx, control_rx) = control_channel();
    wire_control_callbacks(&session, control_tx);
    session.start();

    let metrics = PipelineMetrics::new();
    let mut orchestrator = PipelineOrchestrator::new(
        config,
        buffer,
        Box::new(source),
        Box::new(detector),
        homography,
        Arc::clone(&session),
        metrics,
        control_rx,
        Arc::clone(&shutdown),
    );

    // Signal handling: raise the shutdown flag, the processing loop observes
    // it at its next suspension point
    let mut sigterm = signal(SignalKind::terminate())?;
    let shutdown_flag = Arc::clone(&shutdown);
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutdown signal received (SIGINT)"),
            _ = sigterm.recv() => info!("shutdown signal received (SIGTERM)"),
        }
        shutdown_flag.store(true, Ordering::Release);
    });

    let started = Instant::now();
    info!("starting main processing loop");
    let worker = tokio::task::spawn_blocking(move || orchestrator.run());
    let summary = worker.await??;

    // Controlled drain
    info!("shutting down...");
    session.stop().await;

    let transport_stats = session.stats();
    info!("session statistics:");
    info!("  total time: {:.1}s", started.elapsed().as_secs_f64());
    info!("  frames processed: {}", summary.frames_processed);
    info!("  average fps: {:.1}", summary.average_fps);
    info!("  total detections: {}", summary.detections_total);
    info!(
        "  tracker: active={} confirmed={} total={}",
        summary.tracker.active_tracks,
        summary.tracker.confirmed_tracks,
        summary.tracker.total_tracked
    );
    info!(
        "  transport: sent={} received={} reconnects={}",
        transport_stats.messages_sent,
        transport_stats.messages_received,
        transport_stats.reconnect_count
    );
    info!("shutdown complete");

    Ok(())
}

/// Capture a short burst of frames and report the measured rate
fn test_camera(config: &Config) -> Result<()> {
    info!("testing camera connection: {}", config.camera.url);

    let buffer = Arc::new(FrameBuffer::new(config.camera.buffer_size));
    let mut camera = RtspCamera::new(config.camera.clone(), Arc::clone(&buffer));
    if !camera.start() {
        anyhow::bail!("failed to start camera");
    }

    let deadline = Instant::now() + Duration::from_secs(20);
    let started = Instant::now();
    let mut frames = 0u32;

    while frames < 30 && Instant::now() < deadline {
        if let Some(frame) = camera.read() {
            frames += 1;
            info!("frame {}: {}x{}", frames, frame.width, frame.height);
        }
        std::thread::sleep(Duration::from_millis(33));
    }

    let elapsed = started.elapsed().as_secs_f32();
    camera.stop();

    if frames == 0 {
        anyhow::bail!("no frames received from camera");
    }
    info!(
        "captured {} frames in {:.2}s ({:.1} fps)",
        frames,
        elapsed,
        frames as f32 / elapsed
    );
    Ok(())
}
