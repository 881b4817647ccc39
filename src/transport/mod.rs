// src/transport/mod.rs
//
// Persistent bidirectional backend channel. One task owns the socket and the
// reconnect loop; callers interact with the lock-free session core from any
// thread. Telemetry is gated on the registration handshake: until
// edge:register has been emitted on the current connection, occupancy,
// heartbeat and health sends fail without touching the wire.

pub mod messages;
pub mod protocol;

use crate::config::BackendConfig;
use crate::types::{iso_timestamp, OccupancyBatch};
use futures_util::{SinkExt, StreamExt};
use messages::{
    EdgeDeviceCommand, EdgeDeviceConfig, HealthPayload, HeartbeatPayload, OccupancyPayload,
    RegisterPayload,
};
use protocol::{MessageFrame, Packet, NAMESPACE, PONG_FRAME};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

// ============================================================================
// Session state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Registered = 3,
    Closing = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Registered,
            4 => SessionState::Closing,
            _ => SessionState::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Connecting => "CONNECTING",
            SessionState::Connected => "CONNECTED",
            SessionState::Registered => "REGISTERED",
            SessionState::Closing => "CLOSING",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reconnect_count: u64,
}

type ConfigCallback = Box<dyn Fn(EdgeDeviceConfig) + Send + Sync>;
type CommandCallback = Box<dyn Fn(EdgeDeviceCommand) + Send + Sync>;
type CalibrationCallback = Box<dyn Fn(serde_json::Value) + Send + Sync>;

// ============================================================================
// Session core
// ============================================================================

/// State shared between the socket task and the processing thread. Counters
/// and the state word are atomics; the outbound sender swaps per connection.
pub(crate) struct SessionCore {
    backend: BackendConfig,
    device_id: String,
    hardware_type: String,
    state: AtomicU8,
    running: AtomicBool,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    reconnect_count: AtomicU64,
    outbound: Mutex<Option<UnboundedSender<String>>>,
    stop_notify: Notify,
    config_callback: Mutex<Option<ConfigCallback>>,
    command_callback: Mutex<Option<CommandCallback>>,
    calibration_callback: Mutex<Option<CalibrationCallback>>,
}

impl SessionCore {
    fn new(backend: BackendConfig, device_id: String, hardware_type: String) -> Self {
        Self {
            backend,
            device_id,
            hardware_type,
            state: AtomicU8::new(SessionState::Disconnected as u8),
            running: AtomicBool::new(false),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            reconnect_count: AtomicU64::new(0),
            outbound: Mutex::new(None),
            stop_notify: Notify::new(),
            config_callback: Mutex::new(None),
            command_callback: Mutex::new(None),
            calibration_callback: Mutex::new(None),
        }
    }

    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn install_outbound(&self, sender: UnboundedSender<String>) {
        *self.outbound.lock().unwrap() = Some(sender);
    }

    fn clear_outbound(&self) {
        *self.outbound.lock().unwrap() = None;
    }

    /// Queue a raw frame on the live connection. Counts toward
    /// messages_sent; fails when no connection is up.
    fn enqueue(&self, frame: String) -> bool {
        let guard = self.outbound.lock().unwrap();
        match guard.as_ref() {
            Some(sender) if sender.send(frame).is_ok() => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Emit an application event. Suppressed (nothing reaches the wire)
    /// unless the session is Registered.
    fn emit(&self, event: &str, payload: serde_json::Value) -> bool {
        if self.state() != SessionState::Registered {
            debug!("suppressing {} while {}", event, self.state().as_str());
            return false;
        }
        self.enqueue(protocol::encode_event(NAMESPACE, event, &payload))
    }

    /// Emit edge:register on the current connection and mark the session
    /// registered. No acknowledgement is awaited; the backend binds the
    /// device identity to this connection on receipt.
    fn register(&self) -> bool {
        let payload = RegisterPayload::new(
            self.device_id.clone(),
            self.backend.tenant_id.clone(),
            self.backend.camera_id.clone(),
            self.hardware_type.clone(),
        );
        let value = match serde_json::to_value(&payload) {
            Ok(value) => value,
            Err(err) => {
                error!("failed to serialize register payload: {}", err);
                return false;
            }
        };
        if self.enqueue(protocol::encode_event(NAMESPACE, "edge:register", &value)) {
            self.set_state(SessionState::Registered);
            info!("device registration sent (device_id={})", self.device_id);
            true
        } else {
            false
        }
    }

    fn send_occupancy(&self, batch: &OccupancyBatch) -> bool {
        let payload = OccupancyPayload::from(batch);
        match serde_json::to_value(&payload) {
            Ok(value) => self.emit("edge:occupancy", value),
            Err(_) => false,
        }
    }

    fn send_heartbeat(&self) -> bool {
        let payload = HeartbeatPayload {
            device_id: self.device_id.clone(),
            timestamp: iso_timestamp(),
        };
        match serde_json::to_value(&payload) {
            Ok(value) => self.emit("edge:heartbeat", value),
            Err(_) => false,
        }
    }

    fn send_health(&self, payload: &HealthPayload) -> bool {
        match serde_json::to_value(payload) {
            Ok(value) => self.emit("edge:health", value),
            Err(_) => false,
        }
    }

    /// Process one inbound text frame. Returns false when the connection
    /// should be torn down (remote close).
    fn handle_frame(&self, text: &str) -> bool {
        self.messages_received.fetch_add(1, Ordering::Relaxed);

        let Some(packet) = protocol::parse(text) else {
            warn!("dropping unparseable frame: {:.80}", text);
            return true;
        };

        match packet {
            Packet::Open(_) => {
                debug!("session open packet received");
                true
            }
            Packet::Ping => {
                self.enqueue(PONG_FRAME.to_string());
                true
            }
            Packet::Pong => true,
            Packet::Close => {
                info!("backend closed the session");
                false
            }
            Packet::Message(frame) => {
                self.handle_message(frame);
                true
            }
        }
    }

    fn handle_message(&self, frame: MessageFrame) {
        match frame {
            MessageFrame::Event { event, payload, .. } => self.dispatch_event(&event, payload),
            MessageFrame::NamespaceOpen { namespace } => {
                debug!("namespace {} opened", namespace);
            }
            MessageFrame::NamespaceClose { namespace } => {
                warn!("namespace {} closed by backend", namespace);
            }
            MessageFrame::Ack { .. } => {
                debug!("ack received");
            }
        }
    }

    fn dispatch_event(&self, event: &str, payload: serde_json::Value) {
        let data = payload.get("data").cloned().unwrap_or(serde_json::Value::Null);
        match event {
            "edge:config" => {
                match serde_json::from_value::<EdgeDeviceConfig>(data) {
                    Ok(config) => {
                        if let Some(callback) = &*self.config_callback.lock().unwrap() {
                            callback(config);
                        }
                    }
                    Err(err) => warn!("invalid edge:config payload: {}", err),
                }
            }
            "edge:command" => {
                match serde_json::from_value::<EdgeDeviceCommand>(data) {
                    Ok(command) => {
                        if let Some(callback) = &*self.command_callback.lock().unwrap() {
                            callback(command);
                        }
                    }
                    Err(err) => warn!("invalid edge:command payload: {}", err),
                }
            }
            "edge:calibration" => {
                if let Some(callback) = &*self.calibration_callback.lock().unwrap() {
                    callback(data);
                }
            }
            other => debug!("ignoring unhandled event {}", other),
        }
    }
}

// ============================================================================
// Public session handle
// ============================================================================

pub struct TransportSession {
    core: Arc<SessionCore>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TransportSession {
    pub fn new(backend: BackendConfig, device_id: String, hardware_type: String) -> Self {
        Self {
            core: Arc::new(SessionCore::new(backend, device_id, hardware_type)),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the connection task. Reconnects indefinitely until `stop`.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            warn!("transport session already started");
            return;
        }
        self.core.running.store(true, Ordering::Release);
        let core = Arc::clone(&self.core);
        *handle = Some(tokio::spawn(run_loop(core)));
    }

    /// Stop reconnecting, close the socket, and wait for the task to exit.
    pub async fn stop(&self) {
        self.core.running.store(false, Ordering::Release);
        self.core.set_state(SessionState::Closing);
        // notify_one stores a permit, so a stop racing the connect phase is
        // still observed at the task's next wait point
        self.core.stop_notify.notify_one();

        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.core.set_state(SessionState::Disconnected);
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Connected | SessionState::Registered
        )
    }

    pub fn is_registered(&self) -> bool {
        self.state() == SessionState::Registered
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            messages_sent: self.core.messages_sent.load(Ordering::Relaxed),
            messages_received: self.core.messages_received.load(Ordering::Relaxed),
            reconnect_count: self.core.reconnect_count.load(Ordering::Relaxed),
        }
    }

    pub fn send_occupancy(&self, batch: &OccupancyBatch) -> bool {
        self.core.send_occupancy(batch)
    }

    pub fn send_heartbeat(&self) -> bool {
        self.core.send_heartbeat()
    }

    pub fn send_health(&self, payload: &HealthPayload) -> bool {
        self.core.send_health(payload)
    }

    /// Callbacks run on the socket task; they must not block. Post work to
    /// the processing thread instead of doing it inline.
    pub fn set_config_callback(&self, callback: impl Fn(EdgeDeviceConfig) + Send + Sync + 'static) {
        *self.core.config_callback.lock().unwrap() = Some(Box::new(callback));
    }

    pub fn set_command_callback(
        &self,
        callback: impl Fn(EdgeDeviceCommand) + Send + Sync + 'static,
    ) {
        *self.core.command_callback.lock().unwrap() = Some(Box::new(callback));
    }

    pub fn set_calibration_callback(
        &self,
        callback: impl Fn(serde_json::Value) + Send + Sync + 'static,
    ) {
        *self.core.calibration_callback.lock().unwrap() = Some(Box::new(callback));
    }
}

// ============================================================================
// Connection task
// ============================================================================

/// Handshake URL: engine protocol 4 over the websocket transport
fn connect_url(base: &str) -> String {
    if base.contains('?') {
        format!("{}&EIO=4&transport=websocket", base)
    } else {
        format!("{}?EIO=4&transport=websocket", base)
    }
}

async fn run_loop(core: Arc<SessionCore>) {
    while core.running() {
        core.set_state(SessionState::Connecting);

        match open_connection(&core).await {
            Ok(stream) => {
                info!("backend connection opened");
                core.set_state(SessionState::Connected);

                let (sender, receiver) = mpsc::unbounded_channel();
                core.install_outbound(sender);

                // Namespace open, then register; both ride the send queue so
                // ordering against telemetry is preserved
                core.enqueue(protocol::namespace_open(NAMESPACE));
                core.register();

                drive_connection(stream, receiver, &core).await;
                core.clear_outbound();
                info!("backend connection closed");
            }
            Err(err) => {
                warn!("backend connection failed: {}", err);
            }
        }

        if !core.running() {
            break;
        }
        core.set_state(SessionState::Disconnected);

        let delay = Duration::from_millis(core.backend.reconnect_delay_ms);
        debug!("reconnecting in {} ms", delay.as_millis());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = core.stop_notify.notified() => break,
        }
        core.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }
    core.set_state(SessionState::Disconnected);
}

async fn open_connection(
    core: &SessionCore,
) -> anyhow::Result<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>> {
    let url = connect_url(&core.backend.url);
    info!("connecting to backend: {}", url);

    let mut request = url.into_client_request()?;
    if !core.backend.auth_token.is_empty() {
        let value = HeaderValue::from_str(&format!("Bearer {}", core.backend.auth_token))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (stream, _response) = connect_async(request).await?;
    Ok(stream)
}

async fn drive_connection(
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    mut receiver: UnboundedReceiver<String>,
    core: &SessionCore,
) {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            outbound = receiver.recv() => {
                match outbound {
                    Some(frame) => {
                        debug!("sending frame: {:.100}", frame);
                        if let Err(err) = write.send(Message::Text(frame)).await {
                            warn!("send failed: {}", err);
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if !core.handle_frame(&text) {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("websocket close frame received");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("websocket error: {}", err);
                        break;
                    }
                    None => break,
                }
            }
            _ = core.stop_notify.notified() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FloorPosition, OccupancyRecord, PersonState, Point};
    use std::sync::atomic::AtomicUsize;

    fn test_core() -> (Arc<SessionCore>, UnboundedReceiver<String>) {
        let backend = BackendConfig {
            url: "wss://backend.test/socket.io/".to_string(),
            auth_token: "token".to_string(),
            tenant_id: "tenant-1".to_string(),
            camera_id: "cam-1".to_string(),
            ..BackendConfig::default()
        };
        let core = Arc::new(SessionCore::new(
            backend,
            "dev-1".to_string(),
            "GENERIC_X86".to_string(),
        ));
        let (sender, receiver) = mpsc::unbounded_channel();
        core.install_outbound(sender);
        (core, receiver)
    }

    fn batch() -> OccupancyBatch {
        OccupancyBatch::new(
            "cam-1".to_string(),
            "tenant-1".to_string(),
            vec![OccupancyRecord {
                tracking_id: "track_1".to_string(),
                position: FloorPosition {
                    x: 1.0,
                    z: 2.0,
                    grid_x: 2,
                    grid_z: 4,
                },
                state: PersonState::Standing,
                confidence: 0.9,
                velocity: Point::zero(),
            }],
        )
    }

    #[test]
    fn test_sends_suppressed_until_registered() {
        // Connected but not registered: every telemetry send fails and
        // nothing reaches the outbound queue
        let (core, mut receiver) = test_core();
        core.set_state(SessionState::Connected);

        assert!(!core.send_heartbeat());
        assert!(!core.send_occupancy(&batch()));
        assert!(!core.send_health(&health_payload()));
        assert!(receiver.try_recv().is_err());
        assert_eq!(core.messages_sent.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_register_unlocks_telemetry() {
        let (core, mut receiver) = test_core();
        core.set_state(SessionState::Connected);

        assert!(core.register());
        assert_eq!(core.state(), SessionState::Registered);
        let frame = receiver.try_recv().unwrap();
        assert!(frame.starts_with("42/analytics-edge,[\"edge:register\""));

        assert!(core.send_heartbeat());
        let frame = receiver.try_recv().unwrap();
        assert!(frame.starts_with("42/analytics-edge,[\"edge:heartbeat\""));
        assert_eq!(core.messages_sent.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_ping_answered_with_pong_in_queue_order() {
        let (core, mut receiver) = test_core();
        core.set_state(SessionState::Registered);

        assert!(core.send_heartbeat());
        assert!(core.handle_frame("2"));

        assert!(receiver.try_recv().unwrap().contains("edge:heartbeat"));
        assert_eq!(receiver.try_recv().unwrap(), "3");
    }

    #[test]
    fn test_remote_close_tears_down() {
        let (core, _receiver) = test_core();
        core.set_state(SessionState::Registered);
        assert!(!core.handle_frame("1"));
    }

    #[test]
    fn test_malformed_frame_is_dropped_connection_stays() {
        let (core, mut receiver) = test_core();
        core.set_state(SessionState::Registered);
        assert!(core.handle_frame("42/analytics-edge,garbage"));
        assert!(core.handle_frame("x"));
        assert!(receiver.try_recv().is_err());
        assert_eq!(core.messages_received.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_config_event_dispatches_callback() {
        let (core, _receiver) = test_core();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        *core.config_callback.lock().unwrap() = Some(Box::new(move |config| {
            sink.lock().unwrap().push(config.camera_url.clone());
        }));

        let frame = r#"42/analytics-edge,["edge:config",{"data":{"cameraUrl":"rtsp://10.0.0.5/live"}}]"#;
        assert!(core.handle_frame(frame));
        assert_eq!(seen.lock().unwrap().as_slice(), ["rtsp://10.0.0.5/live"]);
    }

    #[test]
    fn test_command_and_calibration_dispatch() {
        let (core, _receiver) = test_core();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let calibrations = Arc::new(AtomicUsize::new(0));

        let sink = Arc::clone(&commands);
        *core.command_callback.lock().unwrap() = Some(Box::new(move |command| {
            sink.lock().unwrap().push(command.command.clone());
        }));
        let counter = Arc::clone(&calibrations);
        *core.calibration_callback.lock().unwrap() = Some(Box::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        core.handle_frame(r#"42/analytics-edge,["edge:command",{"data":{"command":"STOP"}}]"#);
        core.handle_frame(r#"42/analytics-edge,["edge:calibration",{"data":{"points":[]}}]"#);

        assert_eq!(commands.lock().unwrap().as_slice(), ["STOP"]);
        assert_eq!(calibrations.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_no_connection_means_send_fails() {
        let (core, _receiver) = test_core();
        core.clear_outbound();
        core.set_state(SessionState::Registered);
        assert!(!core.send_heartbeat());
        assert_eq!(core.messages_sent.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_connect_url_parameters() {
        assert_eq!(
            connect_url("wss://backend.test/socket.io/"),
            "wss://backend.test/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(
            connect_url("wss://backend.test/socket.io/?room=a"),
            "wss://backend.test/socket.io/?room=a&EIO=4&transport=websocket"
        );
    }

    fn health_payload() -> HealthPayload {
        HealthPayload {
            device_id: "dev-1".to_string(),
            timestamp: iso_timestamp(),
            uptime: 1,
            frames_processed: 10,
            detections_total: 3,
            fps: 9.7,
            cpu_usage: 12.0,
            memory_usage: 30.0,
            gpu_usage: 0.0,
            temperature: 40.0,
            camera: messages::CameraHealth {
                state: "RUNNING".to_string(),
                url: "rtsp://cam".to_string(),
                reconnect_count: 0,
                actual_fps: 10.0,
            },
            tracker: messages::TrackerHealth {
                active_tracks: 1,
                total_tracked: 2,
            },
        }
    }
}
