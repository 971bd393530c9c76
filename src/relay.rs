use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::Frame;
use crate::config::RelayConfig;
use crate::endpoint::StreamPreferences;
use crate::errors::{Result, StreamError};

/// Public stream identity of one camera. Fixed when the relay is created and
/// unchanged across failovers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayEndpoints {
    pub hls_url: String,
    pub restream_url: String,
    pub peer_stream_id: String,
}

impl RelayEndpoints {
    pub fn new(camera_id: &str, public_url: &str) -> Self {
        let base = public_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };

        Self {
            hls_url: format!("{}/hls/{}/index.m3u8", base, camera_id),
            restream_url: format!("{}/restream/{}", ws_base, camera_id),
            peer_stream_id: format!("peer-{}", Uuid::new_v4()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    WorkerCrashed { epoch: u64, reason: String },
}

/// A running transcoder fed with raw video.
#[async_trait]
pub trait TranscodeWorker: Send {
    async fn write(&mut self, data: &[u8]) -> Result<()>;
    async fn shutdown(&mut self);
}

pub trait WorkerFactory: Send + Sync {
    fn spawn(&self, camera_id: &str, stream: &StreamPreferences) -> Result<Box<dyn TranscodeWorker>>;
}

pub struct FfmpegWorker {
    camera_id: String,
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl TranscodeWorker for FfmpegWorker {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Err(StreamError::relay(format!("ffmpeg exited with {}", status)));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| StreamError::relay("ffmpeg stdin already closed"))?;
        stdin
            .write_all(data)
            .await
            .map_err(|e| StreamError::relay(format!("ffmpeg write failed: {}", e)))
    }

    async fn shutdown(&mut self) {
        self.stdin.take();
        if let Err(e) = self.child.start_kill() {
            debug!("ffmpeg for camera '{}' already gone: {}", self.camera_id, e);
        }
        let _ = tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await;
        info!("Stopped ffmpeg worker for camera '{}'", self.camera_id);
    }
}

/// Spawns `ffmpeg` reading H.264 on stdin and writing an HLS playlist under
/// `<hls_root>/<camera_id>/index.m3u8`.
pub struct FfmpegFactory {
    settings: RelayConfig,
}

impl FfmpegFactory {
    pub fn new(settings: RelayConfig) -> Self {
        Self { settings }
    }

    pub fn output_dir(&self, camera_id: &str) -> PathBuf {
        Path::new(&self.settings.hls_root).join(camera_id)
    }
}

impl WorkerFactory for FfmpegFactory {
    fn spawn(&self, camera_id: &str, stream: &StreamPreferences) -> Result<Box<dyn TranscodeWorker>> {
        let output_dir = self.output_dir(camera_id);
        std::fs::create_dir_all(&output_dir)?;
        let args = hls_args(&output_dir, stream, &self.settings);
        debug!("Starting ffmpeg for camera '{}': {} {}", camera_id, self.settings.ffmpeg_path, args.join(" "));

        let mut child = Command::new(&self.settings.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(if self.settings.log_stderr { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StreamError::relay(format!("failed to spawn {}: {}", self.settings.ffmpeg_path, e)))?;

        if let Some(stderr) = child.stderr.take() {
            let camera_id = camera_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        warn!("ffmpeg [{}]: {}", camera_id, line);
                    }
                }
            });
        }

        let stdin = child.stdin.take();
        info!("🎬 Started ffmpeg worker for camera '{}' -> {}", camera_id, output_dir.display());
        Ok(Box::new(FfmpegWorker { camera_id: camera_id.to_string(), child, stdin }))
    }
}

pub fn hls_args(output_dir: &Path, stream: &StreamPreferences, settings: &RelayConfig) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner", "-loglevel", "error",
        "-fflags", "+genpts+nobuffer",
        "-f", "h264",
        "-i", "pipe:0",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if stream.needs_transcode() {
        args.extend(["-c:v", "libx264", "-preset", "veryfast", "-tune", "zerolatency"].map(String::from));
        args.push("-crf".to_string());
        args.push(stream.quality.crf().to_string());
        if let Some((width, height)) = stream.resolution_dims() {
            args.push("-vf".to_string());
            args.push(format!("scale={}:{}", width, height));
        }
        if let Some(fps) = stream.frame_rate {
            args.push("-r".to_string());
            args.push(fps.to_string());
        }
    } else {
        args.extend(["-c:v", "copy"].map(String::from));
    }

    // Audio only travels over the restream
    args.push("-an".to_string());
    args.extend(["-f", "hls"].map(String::from));
    args.push("-hls_time".to_string());
    args.push(settings.hls_segment_secs.to_string());
    args.push("-hls_list_size".to_string());
    args.push(settings.hls_list_size.to_string());
    args.extend(["-hls_flags", "delete_segments+omit_endlist"].map(String::from));
    args.push("-hls_segment_filename".to_string());
    args.push(output_dir.join("segment_%05d.ts").to_string_lossy().into_owned());
    args.push(output_dir.join("index.m3u8").to_string_lossy().into_owned());
    args
}

struct WorkerSlot {
    worker: Option<Box<dyn TranscodeWorker>>,
    /// Bumped by every attach and by shutdown; a pump only owns the worker
    /// while its generation is current.
    generation: u64,
    closed: bool,
}

#[derive(Clone)]
struct PumpContext {
    camera_id: String,
    stream: StreamPreferences,
    grace_period: Duration,
    write_timeout: Duration,
    factory: Arc<dyn WorkerFactory>,
    restream: broadcast::Sender<Frame>,
    peer: Arc<watch::Sender<Option<Frame>>>,
    slot: Arc<Mutex<WorkerSlot>>,
}

/// Handle for one attached frame source.
pub struct RelaySession {
    pump: JoinHandle<()>,
}

impl RelaySession {
    pub fn is_active(&self) -> bool {
        !self.pump.is_finished()
    }
}

/// Republishes whichever capture session is current for one camera.
pub struct StreamRelay {
    endpoints: RelayEndpoints,
    ctx: PumpContext,
}

impl StreamRelay {
    pub fn new(
        camera_id: &str,
        stream: StreamPreferences,
        public_url: &str,
        settings: &RelayConfig,
        factory: Arc<dyn WorkerFactory>,
    ) -> Self {
        let (restream, _) = broadcast::channel(settings.restream_buffer.max(1));
        let (peer, _) = watch::channel(None);
        Self {
            endpoints: RelayEndpoints::new(camera_id, public_url),
            ctx: PumpContext {
                camera_id: camera_id.to_string(),
                stream,
                grace_period: settings.grace_period,
                write_timeout: settings.write_timeout,
                factory,
                restream,
                peer: Arc::new(peer),
                slot: Arc::new(Mutex::new(WorkerSlot { worker: None, generation: 0, closed: false })),
            },
        }
    }

    pub fn endpoints(&self) -> &RelayEndpoints {
        &self.endpoints
    }

    pub fn subscribe_restream(&self) -> broadcast::Receiver<Frame> {
        self.ctx.restream.subscribe()
    }

    /// Latest-frame view for low-latency viewers.
    pub fn subscribe_peer(&self) -> watch::Receiver<Option<Frame>> {
        self.ctx.peer.subscribe()
    }

    pub async fn has_worker(&self) -> bool {
        self.ctx.slot.lock().await.worker.is_some()
    }

    /// Start consuming a new frame source. A worker still held from the
    /// previous source is reused.
    pub async fn attach(
        &self,
        frames: mpsc::Receiver<Frame>,
        epoch: u64,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> RelaySession {
        let generation = {
            let mut slot = self.ctx.slot.lock().await;
            slot.generation += 1;
            slot.generation
        };
        debug!("Relay for camera '{}' attached to source epoch {}", self.ctx.camera_id, epoch);
        let pump = tokio::spawn(pump(self.ctx.clone(), frames, generation, epoch, events));
        RelaySession { pump }
    }

    /// Stop the worker and refuse further output. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let mut slot = self.ctx.slot.lock().await;
        slot.closed = true;
        slot.generation += 1;
        if let Some(mut worker) = slot.worker.take() {
            worker.shutdown().await;
        }
        debug!("Relay for camera '{}' shut down", self.ctx.camera_id);
    }
}

async fn pump(
    ctx: PumpContext,
    mut frames: mpsc::Receiver<Frame>,
    generation: u64,
    epoch: u64,
    events: mpsc::UnboundedSender<RelayEvent>,
) {
    while let Some(frame) = frames.recv().await {
        let _ = ctx.restream.send(frame.clone());
        ctx.peer.send_replace(Some(frame.clone()));
        if !frame.is_video() {
            continue;
        }

        let mut worker = {
            let mut slot = ctx.slot.lock().await;
            if slot.closed || slot.generation != generation {
                return;
            }
            match slot.worker.take() {
                Some(worker) => worker,
                None => match ctx.factory.spawn(&ctx.camera_id, &ctx.stream) {
                    Ok(worker) => worker,
                    Err(e) => {
                        warn!("Could not start transcoder for camera '{}': {}", ctx.camera_id, e);
                        let _ = events.send(RelayEvent::WorkerCrashed { epoch, reason: e.to_string() });
                        return;
                    }
                },
            }
        };

        // Written outside the slot lock: attach and shutdown must not wait on a stalled transcoder
        let written = match tokio::time::timeout(ctx.write_timeout, worker.write(&frame.data)).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::relay(format!(
                "transcoder did not accept a frame within {:?}",
                ctx.write_timeout
            ))),
        };

        let mut slot = ctx.slot.lock().await;
        let current = !slot.closed && slot.generation == generation;
        match written {
            Ok(()) if !slot.closed && slot.worker.is_none() => {
                slot.worker = Some(worker);
                if !current {
                    return;
                }
            }
            Ok(()) => {
                drop(slot);
                worker.shutdown().await;
                return;
            }
            Err(e) => {
                drop(slot);
                warn!("Transcoder for camera '{}' crashed: {}", ctx.camera_id, e);
                worker.shutdown().await;
                if current {
                    let _ = events.send(RelayEvent::WorkerCrashed { epoch, reason: e.to_string() });
                }
                return;
            }
        }
    }

    debug!("Source for camera '{}' ended, holding transcoder for {:?}", ctx.camera_id, ctx.grace_period);
    tokio::time::sleep(ctx.grace_period).await;

    let mut slot = ctx.slot.lock().await;
    if slot.generation == generation {
        if let Some(mut worker) = slot.worker.take() {
            info!("No new source for camera '{}' within {:?}, stopping output", ctx.camera_id, ctx.grace_period);
            worker.shutdown().await;
        }
    }
}
