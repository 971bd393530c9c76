use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, info, warn};

use crate::camera_manager::RemoteCameraManager;
use crate::config::Config;
use crate::endpoint::validate_camera_id;
use crate::errors::{Result, StreamError};

const DEBOUNCE: Duration = Duration::from_millis(500);

pub async fn start_camera_config_watcher(manager: RemoteCameraManager, cameras_dir: String) -> Result<()> {
    let (tx, rx) = mpsc::channel(100);

    let mut watcher = RecommendedWatcher::new(
        move |res| {
            match res {
                Ok(event) => {
                    if let Err(e) = tx.blocking_send(event) {
                        error!("Failed to send file watcher event: {}", e);
                    }
                }
                Err(e) => error!("File watcher error: {}", e),
            }
        },
        NotifyConfig::default(),
    ).map_err(|e| StreamError::config(format!("File watcher error: {}", e)))?;

    let cameras_dir_path = Path::new(&cameras_dir);
    if !cameras_dir_path.exists() {
        info!("Creating cameras directory '{}' for watching...", cameras_dir);
        fs::create_dir_all(cameras_dir_path)?;
    }

    watcher.watch(cameras_dir_path, RecursiveMode::NonRecursive)
        .map_err(|e| StreamError::config(format!("Failed to watch cameras directory: {}", e)))?;
    info!("Started watching cameras directory '{}' for configuration changes", cameras_dir);

    tokio::spawn(async move {
        let _watcher = watcher; // Keep watcher alive
        apply_debounced(rx, manager).await;
    });

    Ok(())
}

/// Apply each changed camera file once it has been quiet for [`DEBOUNCE`].
async fn apply_debounced(mut rx: mpsc::Receiver<Event>, manager: RemoteCameraManager) {
    let mut debouncer = Debouncer::new(DEBOUNCE);

    loop {
        let deadline = debouncer.next_deadline();
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                if !is_config_change(&event.kind) {
                    continue;
                }
                for path in event.paths.iter().filter(|p| camera_id_from_path(p).is_some()) {
                    debouncer.record(path, Instant::now());
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                for path in debouncer.take_due(Instant::now()) {
                    sync_camera_file(&path, &manager).await;
                }
            }
        }
    }
    debug!("Camera config watcher stopped");
}

fn is_config_change(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_))
}

/// Trailing-edge debounce: every event pushes the file's deadline out, and a
/// file is due once no event arrived for a whole window.
struct Debouncer {
    window: Duration,
    deadlines: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self { window, deadlines: HashMap::new() }
    }

    fn record(&mut self, path: &Path, now: Instant) {
        self.deadlines.insert(path.to_path_buf(), now + self.window);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    fn take_due(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut due: Vec<PathBuf> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        due.sort();
        for path in &due {
            self.deadlines.remove(path);
        }
        due
    }
}

/// Bring the manager in line with one file: a missing file (removed or
/// renamed away) removes the camera, otherwise its config is applied.
async fn sync_camera_file(path: &Path, manager: &RemoteCameraManager) {
    let Some(camera_id) = camera_id_from_path(path) else { return };

    if !path.exists() {
        info!("Detected camera configuration removal: {}", camera_id);
        if let Err(e) = manager.remove_camera(&camera_id).await {
            error!("Failed to remove camera '{}': {}", camera_id, e);
        }
        return;
    }

    match Config::load_camera_config(path) {
        Ok(camera_config) => {
            info!("Detected camera configuration change: {}", camera_id);
            if let Err(e) = manager.apply_config(&camera_id, camera_config).await {
                error!("Failed to apply configuration of camera '{}': {}", camera_id, e);
            }
        }
        Err(e) => warn!("Ignoring unreadable camera config {}: {}", path.display(), e),
    }
}

fn camera_id_from_path(path: &Path) -> Option<String> {
    let extension = path.extension().and_then(|s| s.to_str())?;
    if !matches!(extension, "json" | "toml" | "yaml" | "yml") {
        return None;
    }
    let stem = path.file_stem().and_then(|s| s.to_str())?;
    validate_camera_id(stem).ok()?;
    Some(stem.to_string())
}
