//! In-process stand-ins for the network and the transcoder, shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::capture::{CaptureSession, Frame, SessionConnector, SessionEvent};
use crate::endpoint::{CameraEndpoint, StreamPreferences};
use crate::errors::{Result, StreamError};
use crate::planner::RouteProber;
use crate::protocol::MessageKind;
use crate::relay::{TranscodeWorker, WorkerFactory};
use crate::routes::{Route, RouteProbeResult};

/// Answers probes from a table of target -> latency; unknown targets are unreachable.
#[derive(Default)]
pub struct FakeProber {
    latencies: Mutex<HashMap<SocketAddr, Option<u64>>>,
    hanging: Mutex<HashSet<SocketAddr>>,
    calls: AtomicUsize,
}

impl FakeProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, target: &str, latency_ms: Option<u64>) {
        let addr: SocketAddr = target.parse().unwrap();
        self.latencies.lock().unwrap().insert(addr, latency_ms);
    }

    /// Probes of this target never complete.
    pub fn hang(&self, target: &str) {
        self.hanging.lock().unwrap().insert(target.parse().unwrap());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RouteProber for FakeProber {
    async fn probe(&self, route: &Route) -> RouteProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let target = route.target();
        if self.hanging.lock().unwrap().contains(&target) {
            std::future::pending::<()>().await;
        }
        let latency = self.latencies.lock().unwrap().get(&target).copied().flatten();
        match latency {
            Some(ms) => RouteProbeResult::reachable(route.clone(), Duration::from_millis(ms)),
            None => RouteProbeResult::unreachable(route.clone(), format!("{} timed out", target)),
        }
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Opens sessions that emit one video frame and then idle until dropped.
#[derive(Default)]
pub struct FakeConnector {
    opened: Mutex<Vec<Route>>,
    live: Arc<AtomicUsize>,
    refused: Mutex<HashSet<SocketAddr>>,
    events: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse(&self, target: &str) {
        self.refused.lock().unwrap().insert(target.parse().unwrap());
    }

    /// Routes sessions were opened against, in order.
    pub fn opened(&self) -> Vec<Route> {
        self.opened.lock().unwrap().clone()
    }

    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Report every session opened so far as lost.
    pub fn lose_all(&self, reason: &str) {
        for events in self.events.lock().unwrap().iter() {
            let _ = events.send(SessionEvent::Lost { reason: reason.to_string() });
        }
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn open(
        &self,
        _endpoint: &CameraEndpoint,
        route: &Route,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<CaptureSession> {
        if self.refused.lock().unwrap().contains(&route.target()) {
            return Err(StreamError::connect(format!("{} refused", route.target())));
        }
        self.opened.lock().unwrap().push(route.clone());
        self.events.lock().unwrap().push(events.clone());
        let _ = events.send(SessionEvent::Connected { route: route.clone() });

        self.live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(self.live.clone());
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let task = tokio::spawn(async move {
            let _guard = guard;
            let frame = Frame { kind: MessageKind::Video, sequence: Some(0), data: Bytes::from_static(b"\x00\x00\x00\x01") };
            let _ = frame_tx.send(frame).await;
            std::future::pending::<()>().await;
        });
        Ok(CaptureSession::from_parts(route.clone(), frame_rx, events, task))
    }
}

/// Counts spawned and live workers; writes fail once `crash` is set and
/// never complete once `stall` is set.
#[derive(Default)]
pub struct FakeWorkerFactory {
    spawned: AtomicUsize,
    live: Arc<AtomicUsize>,
    written: Arc<AtomicUsize>,
    crash: Arc<AtomicBool>,
    stall: Arc<AtomicBool>,
    unavailable: AtomicBool,
}

impl FakeWorkerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }

    pub fn crash_workers(&self, crash: bool) {
        self.crash.store(crash, Ordering::SeqCst);
    }

    pub fn stall_writes(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }

    /// Every spawn fails, like a host without ffmpeg.
    pub fn fail_spawn(&self, fail: bool) {
        self.unavailable.store(fail, Ordering::SeqCst);
    }
}

impl WorkerFactory for FakeWorkerFactory {
    fn spawn(&self, _camera_id: &str, _stream: &StreamPreferences) -> Result<Box<dyn TranscodeWorker>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StreamError::relay("failed to spawn ffmpeg: ffmpeg not found"));
        }
        self.spawned.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeWorker {
            guard: Some(LiveGuard(self.live.clone())),
            written: self.written.clone(),
            crash: self.crash.clone(),
            stall: self.stall.clone(),
        }))
    }
}

struct FakeWorker {
    guard: Option<LiveGuard>,
    written: Arc<AtomicUsize>,
    crash: Arc<AtomicBool>,
    stall: Arc<AtomicBool>,
}

#[async_trait]
impl TranscodeWorker for FakeWorker {
    async fn write(&mut self, _data: &[u8]) -> Result<()> {
        if self.crash.load(Ordering::SeqCst) {
            self.guard = None;
            return Err(StreamError::relay("worker exited"));
        }
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.guard = None;
    }
}
