// src/camera.rs
//
// RTSP frame source. Decoding is delegated to an ffmpeg subprocess emitting
// raw BGR24 frames on stdout; a capture thread reads fixed-size frame
// buffers and pushes them into the shared FrameBuffer. The capture thread
// survives camera dropouts: every decoder death is retried after
// reconnect_delay_ms, and the state degrades to ERROR only after too many
// consecutive failures without a decoded frame (it still keeps retrying).

use crate::config::CameraConfig;
use crate::frame_buffer::FrameBuffer;
use crate::types::Frame;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Consecutive decoder failures without a frame before the state degrades
const MAX_CONSECUTIVE_FAILURES: u32 = 30;

/// Abstraction over the decoded-frame producer consumed by the pipeline
pub trait FrameSource: Send {
    fn start(&mut self) -> bool;
    fn stop(&mut self);
    /// Oldest buffered frame, non-blocking
    fn read(&mut self) -> Option<Frame>;
    fn reconnect(&mut self) -> bool;
    /// Takes effect immediately: the stream is reopened on the new URL
    fn set_url(&mut self, url: String);
    fn stats(&self) -> CameraStats;
}

#[derive(Debug, Clone)]
pub struct CameraStats {
    pub state: String,
    pub url: String,
    pub frames_captured: u64,
    /// Decoder-side drops; distinct from FrameBuffer drops
    pub frames_dropped: u64,
    pub reconnect_count: u32,
    pub actual_fps: f32,
    pub last_error: Option<String>,
}

impl CameraStats {
    fn new(url: String) -> Self {
        Self {
            state: "STOPPED".to_string(),
            url,
            frames_captured: 0,
            frames_dropped: 0,
            reconnect_count: 0,
            actual_fps: 0.0,
            last_error: None,
        }
    }
}

struct CameraShared {
    config: CameraConfig,
    buffer: Arc<FrameBuffer>,
    current_url: Mutex<String>,
    running: AtomicBool,
    restart: AtomicBool,
    stats: Mutex<CameraStats>,
    child: Mutex<Option<Child>>,
}

impl CameraShared {
    fn set_state(&self, state: &str) {
        self.stats.lock().unwrap().state = state.to_string();
    }

    fn set_error(&self, message: String) {
        let mut stats = self.stats.lock().unwrap();
        stats.state = "ERROR".to_string();
        stats.last_error = Some(message);
    }

    fn kill_child(&self) {
        if let Some(mut child) = self.child.lock().unwrap().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Sleep in small steps so stop() is observed promptly
    fn interruptible_sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while self.running.load(Ordering::Acquire) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

pub struct RtspCamera {
    shared: Arc<CameraShared>,
    handle: Option<JoinHandle<()>>,
}

impl RtspCamera {
    pub fn new(config: CameraConfig, buffer: Arc<FrameBuffer>) -> Self {
        let url = config.url.clone();
        Self {
            shared: Arc::new(CameraShared {
                config,
                buffer,
                current_url: Mutex::new(url.clone()),
                running: AtomicBool::new(false),
                restart: AtomicBool::new(false),
                stats: Mutex::new(CameraStats::new(url)),
                child: Mutex::new(None),
            }),
            handle: None,
        }
    }
}

impl FrameSource for RtspCamera {
    fn start(&mut self) -> bool {
        if self.shared.running.load(Ordering::Acquire) {
            warn!("camera already running");
            return true;
        }

        let url = self.shared.current_url.lock().unwrap().clone();
        info!("starting rtsp camera: {}", url);
        {
            let mut stats = self.shared.stats.lock().unwrap();
            *stats = CameraStats::new(url);
        }

        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        self.handle = Some(std::thread::spawn(move || capture_loop(shared)));
        true
    }

    fn stop(&mut self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("stopping rtsp camera");
        self.shared.kill_child();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.shared.set_state("STOPPED");
        info!("rtsp camera stopped");
    }

    fn read(&mut self) -> Option<Frame> {
        self.shared.buffer.pop()
    }

    fn reconnect(&mut self) -> bool {
        info!("camera reconnect requested");
        self.shared.restart.store(true, Ordering::Release);
        self.shared.kill_child();
        true
    }

    fn set_url(&mut self, url: String) {
        info!("camera url changed, reconnecting");
        {
            let mut current = self.shared.current_url.lock().unwrap();
            *current = url.clone();
        }
        self.shared.stats.lock().unwrap().url = url;
        if self.shared.running.load(Ordering::Acquire) {
            self.shared.restart.store(true, Ordering::Release);
            self.shared.kill_child();
        }
    }

    fn stats(&self) -> CameraStats {
        self.shared.stats.lock().unwrap().clone()
    }
}

impl Drop for RtspCamera {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Capture thread
// ============================================================================

fn capture_loop(shared: Arc<CameraShared>) {
    debug!("capture loop started");
    let width = shared.config.width;
    let height = shared.config.height;
    let frame_bytes = width * height * 3;
    let mut consecutive_failures: u32 = 0;
    let mut frame_number: u64 = 0;

    while shared.running.load(Ordering::Acquire) {
        let url = shared.current_url.lock().unwrap().clone();
        shared.set_state("CONNECTING");

        let mut stdout = match spawn_decoder(&shared, &url) {
            Some(stdout) => stdout,
            None => {
                consecutive_failures += 1;
                fail_and_wait(&shared, consecutive_failures);
                continue;
            }
        };

        let mut frame_data = vec![0u8; frame_bytes];
        let mut got_frame = false;
        let mut fps_window_start = Instant::now();
        let mut fps_window_frames: u32 = 0;

        loop {
            if !shared.running.load(Ordering::Acquire) {
                break;
            }
            match stdout.read_exact(&mut frame_data) {
                Ok(()) => {
                    consecutive_failures = 0;
                    if !got_frame {
                        got_frame = true;
                        shared.set_state("RUNNING");
                        info!("camera connected ({}x{})", width, height);
                    }
                    frame_number += 1;
                    shared
                        .buffer
                        .push(Frame::new(frame_data.clone(), width, height, frame_number));

                    fps_window_frames += 1;
                    let elapsed = fps_window_start.elapsed().as_secs_f32();
                    {
                        let mut stats = shared.stats.lock().unwrap();
                        stats.frames_captured += 1;
                        if elapsed >= 1.0 {
                            stats.actual_fps = fps_window_frames as f32 / elapsed;
                        }
                    }
                    if elapsed >= 1.0 {
                        fps_window_start = Instant::now();
                        fps_window_frames = 0;
                    }
                }
                Err(err) => {
                    if shared.running.load(Ordering::Acquire)
                        && !shared.restart.load(Ordering::Acquire)
                    {
                        warn!("decoder stream ended: {}", err);
                    }
                    break;
                }
            }
        }

        shared.kill_child();

        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        if shared.restart.swap(false, Ordering::AcqRel) {
            // Deliberate reopen (url change or reconnect request): no
            // failure accounting, but it counts as a reconnect
            shared.stats.lock().unwrap().reconnect_count += 1;
            continue;
        }
        if !got_frame {
            consecutive_failures += 1;
        }
        fail_and_wait(&shared, consecutive_failures);
    }

    shared.set_state("STOPPED");
    debug!("capture loop ended");
}

fn fail_and_wait(shared: &CameraShared, consecutive_failures: u32) {
    if consecutive_failures > MAX_CONSECUTIVE_FAILURES {
        error!(
            "camera failed {} consecutive times, marking ERROR",
            consecutive_failures
        );
        shared.set_error("too many consecutive capture failures".to_string());
    } else {
        shared.set_state("RECONNECTING");
    }
    shared.interruptible_sleep(Duration::from_millis(shared.config.reconnect_delay_ms));
    if shared.running.load(Ordering::Acquire) {
        shared.stats.lock().unwrap().reconnect_count += 1;
    }
}

/// Spawn ffmpeg decoding the stream to raw BGR24 on stdout
fn spawn_decoder(shared: &CameraShared, url: &str) -> Option<impl Read> {
    let args = decoder_args(url, shared.config.width, shared.config.height);
    debug!("spawning decoder: ffmpeg {}", args.join(" "));

    let spawned = Command::new("ffmpeg")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn();

    match spawned {
        Ok(mut child) => {
            let stdout = child.stdout.take();
            *shared.child.lock().unwrap() = Some(child);
            if stdout.is_none() {
                shared.kill_child();
                shared.set_error("decoder has no stdout".to_string());
            }
            stdout
        }
        Err(err) => {
            warn!("failed to spawn decoder: {}", err);
            shared.set_error(err.to_string());
            None
        }
    }
}

fn decoder_args(url: &str, width: usize, height: usize) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-rtsp_transport".to_string(),
        "tcp".to_string(),
        "-fflags".to_string(),
        "nobuffer".to_string(),
        "-flags".to_string(),
        "low_delay".to_string(),
        "-max_delay".to_string(),
        "0".to_string(),
        "-i".to_string(),
        url.to_string(),
        "-vf".to_string(),
        format!("scale={}:{}", width, height),
        "-pix_fmt".to_string(),
        "bgr24".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraConfig;

    #[test]
    fn test_decoder_args_shape() {
        let args = decoder_args("rtsp://cam.local/stream", 640, 480);
        assert_eq!(args.first().unwrap(), "-hide_banner");
        assert!(args.contains(&"rtsp://cam.local/stream".to_string()));
        assert!(args.contains(&"scale=640:480".to_string()));
        assert!(args.contains(&"bgr24".to_string()));
        assert_eq!(args.last().unwrap(), "-");
    }

    #[test]
    fn test_start_stop_with_unreachable_camera() {
        // The decoder cannot connect; the camera must keep retrying and
        // still stop cleanly and quickly
        let config = CameraConfig {
            url: "rtsp://127.0.0.1:1/none".to_string(),
            width: 32,
            height: 24,
            reconnect_delay_ms: 50,
            ..CameraConfig::default()
        };
        let buffer = Arc::new(FrameBuffer::new(3));
        let mut camera = RtspCamera::new(config, Arc::clone(&buffer));

        assert!(camera.start());
        std::thread::sleep(Duration::from_millis(150));
        camera.stop();

        let stats = camera.stats();
        assert_eq!(stats.state, "STOPPED");
        assert_eq!(stats.frames_captured, 0);
    }

    #[test]
    fn test_set_url_updates_stats() {
        let config = CameraConfig {
            url: "rtsp://old/stream".to_string(),
            ..CameraConfig::default()
        };
        let buffer = Arc::new(FrameBuffer::new(3));
        let mut camera = RtspCamera::new(config, buffer);
        camera.set_url("rtsp://new/stream".to_string());
        assert_eq!(camera.stats().url, "rtsp://new/stream");
    }
}
