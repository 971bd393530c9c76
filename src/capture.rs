use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::CaptureConfig;
use crate::endpoint::CameraEndpoint;
use crate::errors::{Result, StreamError};
use crate::protocol::{FrameDecoder, Message, MessageKind};
use crate::routes::Route;

/// A media frame pulled off the camera socket.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: MessageKind,
    pub sequence: Option<u32>,
    pub data: Bytes,
}

impl Frame {
    pub fn from_message(message: &Message) -> Option<Self> {
        if !message.kind.is_media() {
            return None;
        }
        Some(Self {
            kind: message.kind,
            sequence: message.sequence(),
            data: message.media_data(),
        })
    }

    pub fn is_video(&self) -> bool {
        self.kind == MessageKind::Video
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connecting { route: Route },
    Connected { route: Route },
    Lost { reason: String },
    Closed,
}

/// One live connection to a camera over one route. Never reconnects on its
/// own; dropping it closes the socket.
pub struct CaptureSession {
    route: Route,
    frames: Option<mpsc::Receiver<Frame>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    task: Option<JoinHandle<()>>,
}

impl CaptureSession {
    pub async fn open(
        endpoint: &CameraEndpoint,
        route: &Route,
        settings: &CaptureConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self> {
        let _ = events.send(SessionEvent::Connecting { route: route.clone() });
        let target = route.target();
        info!("Opening capture session for camera '{}' over {}", endpoint.id, route);

        let mut stream = match timeout(settings.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(StreamError::connect(format!("{}: {}", target, e))),
            Err(_) => {
                return Err(StreamError::connect(format!(
                    "timed out connecting to {} after {:?}", target, settings.connect_timeout
                )))
            }
        };
        stream.set_nodelay(true)?;

        let mut decoder = FrameDecoder::new();
        login(&mut stream, &mut decoder, endpoint, settings).await?;

        let request = serde_json::json!({
            "cmd": "stream",
            "channel": endpoint.stream.quality.channel(),
            "audio": endpoint.stream.audio,
            "fps": endpoint.stream.frame_rate,
        });
        stream.write_all(&Message::control(&request).encode()).await?;

        let (frame_tx, frame_rx) = mpsc::channel(settings.frame_buffer.max(1));
        let _ = events.send(SessionEvent::Connected { route: route.clone() });
        info!("✅ Capture session for camera '{}' connected via {}", endpoint.id, route);

        let task = tokio::spawn(run_session(
            endpoint.id.clone(),
            stream,
            decoder,
            frame_tx,
            events.clone(),
            settings.clone(),
        ));

        Ok(Self::from_parts(route.clone(), frame_rx, events, task))
    }

    /// Assemble a session from an already running reader task.
    pub fn from_parts(
        route: Route,
        frames: mpsc::Receiver<Frame>,
        events: mpsc::UnboundedSender<SessionEvent>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            route,
            frames: Some(frames),
            events,
            task: Some(task),
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// The frame sequence; can be taken once.
    pub fn take_frames(&mut self) -> Option<mpsc::Receiver<Frame>> {
        self.frames.take()
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = self.events.send(SessionEvent::Closed);
            debug!("Capture session over {} closed", self.route);
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn login(
    stream: &mut TcpStream,
    decoder: &mut FrameDecoder,
    endpoint: &CameraEndpoint,
    settings: &CaptureConfig,
) -> Result<()> {
    let request = serde_json::json!({
        "cmd": "login",
        "user": endpoint.credentials.username,
        "password": endpoint.credentials.password,
    });
    stream.write_all(&Message::control(&request).encode()).await?;

    timeout(settings.login_timeout, wait_for_login_reply(stream, decoder, &endpoint.id))
        .await
        .map_err(|_| StreamError::connect(format!("no login reply within {:?}", settings.login_timeout)))?
}

async fn wait_for_login_reply(stream: &mut TcpStream, decoder: &mut FrameDecoder, camera_id: &str) -> Result<()> {
    let mut chunk = vec![0u8; 4096];
    loop {
        while let Some(result) = decoder.next_message() {
            let Ok(message) = result else { continue };
            let Some(reply) = message.control_json() else { continue };
            if reply["cmd"] != "login" {
                continue;
            }
            return match reply["result"].as_str() {
                Some("ok") => Ok(()),
                other => Err(StreamError::auth(format!(
                    "camera '{}' answered login with {:?}", camera_id, other.unwrap_or("no result")
                ))),
            };
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(StreamError::connect("connection closed during login"));
        }
        decoder.push(&chunk[..n]);
    }
}

async fn run_session(
    camera_id: String,
    stream: TcpStream,
    mut decoder: FrameDecoder,
    frame_tx: mpsc::Sender<Frame>,
    events: mpsc::UnboundedSender<SessionEvent>,
    settings: CaptureConfig,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut heartbeat = interval(settings.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ack_deadline = settings.heartbeat_interval * settings.heartbeat_timeout_multiple;

    let mut chunk = vec![0u8; settings.read_chunk_size.max(512)];
    let mut state = ReaderState::new(camera_id.clone());
    let reason = loop {
        state.drain(&mut decoder, &frame_tx);

        tokio::select! {
            read = reader.read(&mut chunk) => {
                match read {
                    Ok(0) => break "camera closed the connection".to_string(),
                    Ok(n) => decoder.push(&chunk[..n]),
                    Err(e) => break format!("read error: {}", e),
                }
            }
            _ = heartbeat.tick() => {
                let silent_for = state.last_ack.elapsed();
                if silent_for > ack_deadline {
                    break format!("no heartbeat acknowledgement for {:?}", silent_for);
                }
                if let Err(e) = writer.write_all(&Message::heartbeat().encode()).await {
                    break format!("heartbeat write failed: {}", e);
                }
            }
        }
    };

    warn!("Capture session for camera '{}' lost: {} ({} frames, {} dropped, {} decode errors)",
          camera_id, reason, state.frames, state.dropped, decoder.error_count());
    let _ = events.send(SessionEvent::Lost { reason });
}

struct ReaderState {
    camera_id: String,
    last_ack: Instant,
    last_video_seq: Option<u32>,
    last_audio_seq: Option<u32>,
    frames: u64,
    dropped: u64,
}

impl ReaderState {
    fn new(camera_id: String) -> Self {
        Self {
            camera_id,
            last_ack: Instant::now(),
            last_video_seq: None,
            last_audio_seq: None,
            frames: 0,
            dropped: 0,
        }
    }

    fn drain(&mut self, decoder: &mut FrameDecoder, frame_tx: &mpsc::Sender<Frame>) {
        while let Some(result) = decoder.next_message() {
            match result {
                Ok(message) => self.handle(message, frame_tx),
                Err(e) => {
                    if decoder.error_count() % 50 == 1 {
                        warn!("Decode error on camera '{}': {} ({} so far)", self.camera_id, e, decoder.error_count());
                    } else {
                        debug!("Decode error on camera '{}': {}", self.camera_id, e);
                    }
                }
            }
        }
    }

    fn handle(&mut self, message: Message, frame_tx: &mpsc::Sender<Frame>) {
        match message.kind {
            MessageKind::Heartbeat => {
                self.last_ack = Instant::now();
            }
            MessageKind::Control => {
                debug!("Control message from camera '{}': {:?}", self.camera_id, message.control_json());
            }
            MessageKind::Video | MessageKind::Audio => {
                let Some(frame) = Frame::from_message(&message) else { return };
                let last = if frame.is_video() { &mut self.last_video_seq } else { &mut self.last_audio_seq };
                if let Some(seq) = frame.sequence {
                    if matches!(*last, Some(prev) if seq < prev) {
                        debug!("Dropping out-of-order {:?} frame {} on camera '{}'", frame.kind, seq, self.camera_id);
                        self.dropped += 1;
                        return;
                    }
                    *last = Some(seq);
                }

                self.frames += 1;
                if frame_tx.try_send(frame).is_err() {
                    self.dropped += 1;
                    if self.dropped % 100 == 1 {
                        debug!("Frame consumer for camera '{}' is behind, dropped {} frames", self.camera_id, self.dropped);
                    }
                }
            }
        }
    }
}

/// Opens capture sessions; the supervisor only talks to this seam.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn open(
        &self,
        endpoint: &CameraEndpoint,
        route: &Route,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<CaptureSession>;
}

pub struct V380Connector {
    settings: CaptureConfig,
}

impl V380Connector {
    pub fn new(settings: CaptureConfig) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SessionConnector for V380Connector {
    async fn open(
        &self,
        endpoint: &CameraEndpoint,
        route: &Route,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<CaptureSession> {
        CaptureSession::open(endpoint, route, &self.settings, events).await
    }
}

/// Settings with short timers for loopback tests.
#[cfg(test)]
pub(crate) fn fast_settings() -> CaptureConfig {
    use std::time::Duration;
    CaptureConfig {
        connect_timeout: Duration::from_millis(500),
        login_timeout: Duration::from_millis(500),
        heartbeat_interval: Duration::from_millis(40),
        heartbeat_timeout_multiple: 3,
        frame_buffer: 64,
        read_chunk_size: 1024,
    }
}
