use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::capture::{SessionConnector, V380Connector};
use crate::config::{CameraConfig, Config, DiscoveryConfig, RelayConfig, SupervisorConfig};
use crate::discovery::{CandidateCamera, NetworkDiscovery, Surface};
use crate::endpoint::{AddressingFacts, CameraEndpoint};
use crate::errors::{Result, StreamError};
use crate::gateway_registry::GatewayRegistry;
use crate::planner::{RoutePlanner, RouteProber, TcpProber};
use crate::relay::{FfmpegFactory, StreamRelay, WorkerFactory};
use crate::supervisor::{CameraStatus, SupervisorDeps, SupervisorHandle};

/// Everything the registry keeps for one camera.
pub struct CameraHandle {
    pub endpoint: CameraEndpoint,
    pub config: CameraConfig,
    pub relay: Arc<StreamRelay>,
    supervisor: SupervisorHandle,
    forwarder: JoinHandle<()>,
}

/// Broadcast to status listeners; `status` is `None` once the camera is removed.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub camera_id: String,
    pub status: Option<CameraStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoveryRequest {
    #[serde(default)]
    pub local_subnet: Option<String>,
    #[serde(default)]
    pub overlay_ranges: Option<Vec<String>>,
    /// Push matching candidates into registered cameras' addressing
    #[serde(default)]
    pub bind: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryReport {
    pub candidates: Vec<CandidateCamera>,
    pub bound: Vec<String>,
}

/// The only entry point external callers use: registry of cameras, each
/// with its supervisor and relay.
#[derive(Clone)]
pub struct RemoteCameraManager {
    cameras: Arc<RwLock<HashMap<String, CameraHandle>>>,
    planner: Arc<RoutePlanner>,
    connector: Arc<dyn SessionConnector>,
    workers: Arc<dyn WorkerFactory>,
    discovery: Arc<NetworkDiscovery>,
    discovery_settings: DiscoveryConfig,
    supervisor_settings: SupervisorConfig,
    relay_settings: RelayConfig,
    public_url: String,
    updates: broadcast::Sender<StatusUpdate>,
}

impl RemoteCameraManager {
    pub fn new(config: &Config, registry: Arc<dyn GatewayRegistry>) -> Self {
        let prober: Arc<dyn RouteProber> = Arc::new(TcpProber::new(config.probe.clone()));
        Self::with_parts(
            config,
            Arc::new(RoutePlanner::new(prober, registry)),
            Arc::new(V380Connector::new(config.capture.clone())),
            Arc::new(FfmpegFactory::new(config.relay.clone())),
        )
    }

    pub fn with_parts(
        config: &Config,
        planner: Arc<RoutePlanner>,
        connector: Arc<dyn SessionConnector>,
        workers: Arc<dyn WorkerFactory>,
    ) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            cameras: Arc::new(RwLock::new(HashMap::new())),
            planner,
            connector,
            workers,
            discovery: Arc::new(NetworkDiscovery::new(config.discovery.clone())),
            discovery_settings: config.discovery.clone(),
            supervisor_settings: config.supervisor.clone(),
            relay_settings: config.relay.clone(),
            public_url: config.server.effective_public_url(),
            updates,
        }
    }

    /// Register a camera and start supervising it. Returns as soon as the
    /// registry holds the camera; probing continues in the background.
    pub async fn add_camera(&self, camera_id: &str, config: CameraConfig) -> Result<CameraEndpoint> {
        let endpoint = CameraEndpoint::from_config(camera_id, &config)?;
        if !config.is_enabled() {
            return Err(StreamError::config(format!("Camera '{}' is disabled", camera_id)));
        }

        let mut cameras = self.cameras.write().await;
        if cameras.contains_key(camera_id) {
            return Err(StreamError::already_exists(camera_id));
        }

        info!("Adding camera '{}' ({})", camera_id, endpoint.name);
        let relay = Arc::new(StreamRelay::new(
            camera_id,
            endpoint.stream.clone(),
            &self.public_url,
            &self.relay_settings,
            self.workers.clone(),
        ));
        let supervisor = SupervisorHandle::spawn(
            endpoint.clone(),
            SupervisorDeps {
                planner: self.planner.clone(),
                connector: self.connector.clone(),
                relay: relay.clone(),
                settings: self.supervisor_settings.clone(),
            },
        );
        let forwarder = self.forward_status(camera_id.to_string(), supervisor.subscribe());

        cameras.insert(
            camera_id.to_string(),
            CameraHandle { endpoint: endpoint.clone(), config, relay, supervisor, forwarder },
        );
        info!("Camera '{}' registered, probing routes", camera_id);
        Ok(endpoint)
    }

    fn forward_status(&self, camera_id: String, status: watch::Receiver<CameraStatus>) -> JoinHandle<()> {
        let updates = self.updates.clone();
        tokio::spawn(async move {
            let mut snapshots = WatchStream::new(status);
            while let Some(snapshot) = snapshots.next().await {
                let _ = updates.send(StatusUpdate { camera_id: camera_id.clone(), status: Some(snapshot) });
            }
            debug!("Status forwarding for camera '{}' ended", camera_id);
        })
    }

    /// Stop supervising a camera and release its session and transcoder.
    /// Returns false when the camera was not registered.
    pub async fn remove_camera(&self, camera_id: &str) -> Result<bool> {
        let removed = {
            let mut cameras = self.cameras.write().await;
            cameras.remove(camera_id)
        };

        let Some(handle) = removed else {
            debug!("Camera '{}' was not registered", camera_id);
            return Ok(false);
        };

        info!("Removing camera '{}'...", camera_id);
        handle.supervisor.shutdown().await;
        handle.relay.shutdown().await;
        // The final snapshot must reach listeners before the removal does
        let _ = handle.forwarder.await;
        let _ = self.updates.send(StatusUpdate { camera_id: camera_id.to_string(), status: None });
        info!("Camera '{}' removed", camera_id);
        Ok(true)
    }

    pub async fn get_status(&self, camera_id: &str) -> Option<CameraStatus> {
        let cameras = self.cameras.read().await;
        cameras.get(camera_id).map(|handle| handle.supervisor.status())
    }

    pub async fn get_all_status(&self) -> Vec<CameraStatus> {
        let cameras = self.cameras.read().await;
        let mut statuses: Vec<CameraStatus> = cameras.values().map(|h| h.supervisor.status()).collect();
        statuses.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        statuses
    }

    pub async fn get_endpoint(&self, camera_id: &str) -> Option<CameraEndpoint> {
        let cameras = self.cameras.read().await;
        cameras.get(camera_id).map(|h| h.endpoint.clone())
    }

    pub async fn get_config(&self, camera_id: &str) -> Option<CameraConfig> {
        let cameras = self.cameras.read().await;
        cameras.get(camera_id).map(|h| h.config.clone())
    }

    pub async fn camera_ids(&self) -> Vec<String> {
        let cameras = self.cameras.read().await;
        let mut ids: Vec<String> = cameras.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn subscribe_status(&self, camera_id: &str) -> Option<watch::Receiver<CameraStatus>> {
        let cameras = self.cameras.read().await;
        cameras.get(camera_id).map(|h| h.supervisor.subscribe())
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<StatusUpdate> {
        self.updates.subscribe()
    }

    pub async fn relay(&self, camera_id: &str) -> Option<Arc<StreamRelay>> {
        let cameras = self.cameras.read().await;
        cameras.get(camera_id).map(|h| h.relay.clone())
    }

    pub async fn relay_by_peer_id(&self, peer_stream_id: &str) -> Option<Arc<StreamRelay>> {
        let cameras = self.cameras.read().await;
        cameras
            .values()
            .find(|h| h.relay.endpoints().peer_stream_id == peer_stream_id)
            .map(|h| h.relay.clone())
    }

    /// Replace a camera's addressing facts and re-plan its routes.
    pub async fn update_addressing(&self, camera_id: &str, facts: AddressingFacts) -> Result<()> {
        let mut cameras = self.cameras.write().await;
        let handle = cameras.get_mut(camera_id).ok_or_else(|| StreamError::not_found(camera_id))?;
        if facts.gateway.is_some() && handle.endpoint.site_id.is_none() {
            return Err(StreamError::config(format!(
                "Camera '{}' has no site_id, gateway forwarding cannot be resolved",
                camera_id
            )));
        }

        handle.endpoint.addressing = facts.clone();
        handle.config.addressing = facts.clone();
        handle.supervisor.update_addressing(facts).await
    }

    /// Manual retry; re-plans immediately regardless of backoff.
    pub async fn retry(&self, camera_id: &str) -> Result<()> {
        let cameras = self.cameras.read().await;
        let handle = cameras.get(camera_id).ok_or_else(|| StreamError::not_found(camera_id))?;
        info!("Manual retry requested for camera '{}'", camera_id);
        handle.supervisor.retry().await
    }

    /// Converge the registry on a camera config read from the store: add,
    /// push new addressing, restart on other changes, remove when disabled.
    pub async fn apply_config(&self, camera_id: &str, config: CameraConfig) -> Result<()> {
        if !config.is_enabled() {
            info!("Camera '{}' is disabled", camera_id);
            self.remove_camera(camera_id).await?;
            return Ok(());
        }

        let existing = {
            let cameras = self.cameras.read().await;
            cameras.get(camera_id).map(|h| h.config.clone())
        };

        match existing {
            None => {
                self.add_camera(camera_id, config).await?;
            }
            Some(current) if current == config => {
                debug!("Camera '{}' config unchanged", camera_id);
            }
            Some(current) => {
                let mut without_addressing = current.clone();
                without_addressing.addressing = config.addressing.clone();
                if without_addressing == config {
                    self.update_addressing(camera_id, config.addressing).await?;
                } else {
                    info!("Camera '{}' config changed, restarting", camera_id);
                    self.remove_camera(camera_id).await?;
                    self.add_camera(camera_id, config).await?;
                }
            }
        }
        Ok(())
    }

    /// Scan the local subnet and overlay ranges. With `bind` set, matching
    /// candidates are pushed into registered cameras.
    pub async fn discover(&self, request: DiscoveryRequest) -> Result<DiscoveryReport> {
        let subnet = request.local_subnet.or_else(|| self.discovery_settings.local_subnet.clone());
        let ranges = request
            .overlay_ranges
            .unwrap_or_else(|| self.discovery_settings.overlay_ranges.clone());

        if subnet.is_none() && ranges.is_empty() {
            return Err(StreamError::discovery("No local subnet or overlay ranges to scan"));
        }

        let mut candidates = Vec::new();
        if let Some(subnet) = &subnet {
            candidates.extend(self.discovery.discover_local(subnet).await?);
        }
        if !ranges.is_empty() {
            candidates.extend(self.discovery.discover_overlay(&ranges).await?);
        }

        let bound = if request.bind { self.bind_candidates(&candidates).await } else { Vec::new() };
        Ok(DiscoveryReport { candidates, bound })
    }

    /// Match candidates to cameras by device id. Local hits become the
    /// direct address, overlay hits the overlay address. Returns the ids of
    /// cameras whose addressing changed.
    pub async fn bind_candidates(&self, candidates: &[CandidateCamera]) -> Vec<String> {
        let changes: Vec<(String, AddressingFacts)> = {
            let cameras = self.cameras.read().await;
            let mut changes = Vec::new();
            for (camera_id, handle) in cameras.iter() {
                let Some(device_id) = handle.endpoint.device_id.as_deref() else { continue };
                let mut facts = handle.endpoint.addressing.clone();
                for candidate in candidates.iter().filter(|c| c.device_id.as_deref() == Some(device_id)) {
                    match candidate.surface {
                        Surface::Local => facts.direct = Some(candidate.address),
                        Surface::Overlay => facts.overlay = Some(candidate.address),
                    }
                }
                if facts != handle.endpoint.addressing {
                    changes.push((camera_id.clone(), facts));
                }
            }
            changes
        };

        let mut bound = Vec::new();
        for (camera_id, facts) in changes {
            match self.update_addressing(&camera_id, facts).await {
                Ok(()) => {
                    info!("Discovery updated addressing of camera '{}'", camera_id);
                    bound.push(camera_id);
                }
                Err(e) => warn!("Could not bind discovery result to camera '{}': {}", camera_id, e),
            }
        }
        bound.sort();
        bound
    }

    pub async fn shutdown(&self) {
        for camera_id in self.camera_ids().await {
            if let Err(e) = self.remove_camera(&camera_id).await {
                error!("Failed to remove camera '{}' during shutdown: {}", camera_id, e);
            }
        }
    }
}
