use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::endpoint::CameraEndpoint;
use crate::gateway_registry::{GatewayRegistry, GatewayStatus};
use crate::protocol::{FrameDecoder, Message};
use crate::routes::{Route, RouteProbeResult, RouteTable};

/// Checks whether a single route currently leads to a live camera.
#[async_trait]
pub trait RouteProber: Send + Sync {
    async fn probe(&self, route: &Route) -> RouteProbeResult;
}

/// Bounded TCP connect, optionally followed by a heartbeat exchange so a
/// forwarded port with nothing behind it does not count as reachable.
pub struct TcpProber {
    settings: ProbeConfig,
}

impl TcpProber {
    pub fn new(settings: ProbeConfig) -> Self {
        Self { settings }
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<(), String> {
        stream
            .write_all(&Message::heartbeat().encode())
            .await
            .map_err(|e| format!("heartbeat write failed: {}", e))?;

        let exchange = async {
            let mut decoder = FrameDecoder::new();
            let mut chunk = [0u8; 512];
            loop {
                let n = stream.read(&mut chunk).await.map_err(|e| format!("read failed: {}", e))?;
                if n == 0 {
                    return Err("connection closed before reply".to_string());
                }
                decoder.push(&chunk[..n]);
                while let Some(result) = decoder.next_message() {
                    if result.is_ok() {
                        return Ok(());
                    }
                }
            }
        };

        match timeout(self.settings.handshake_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(format!("no reply within {:?}", self.settings.handshake_timeout)),
        }
    }
}

#[async_trait]
impl RouteProber for TcpProber {
    async fn probe(&self, route: &Route) -> RouteProbeResult {
        let target = route.target();
        let started = Instant::now();

        let mut stream = match timeout(self.settings.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return RouteProbeResult::unreachable(route.clone(), format!("connect {}: {}", target, e)),
            Err(_) => {
                return RouteProbeResult::unreachable(
                    route.clone(),
                    format!("connect {} timed out after {:?}", target, self.settings.connect_timeout),
                )
            }
        };

        if self.settings.handshake {
            if let Err(e) = self.handshake(&mut stream).await {
                return RouteProbeResult::unreachable(route.clone(), format!("handshake with {}: {}", target, e));
            }
        }

        RouteProbeResult::reachable(route.clone(), started.elapsed())
    }
}

/// Turns a camera's addressing facts into a ranked, freshly probed route table.
pub struct RoutePlanner {
    prober: Arc<dyn RouteProber>,
    registry: Arc<dyn GatewayRegistry>,
}

impl RoutePlanner {
    pub fn new(prober: Arc<dyn RouteProber>, registry: Arc<dyn GatewayRegistry>) -> Self {
        Self { prober, registry }
    }

    /// Routes derivable from the endpoint's facts, plus routes already known to
    /// be unreachable without probing (gateway reported offline).
    pub async fn enumerate(&self, endpoint: &CameraEndpoint) -> (Vec<Route>, Vec<RouteProbeResult>) {
        let mut routes = Vec::new();
        let mut settled = Vec::new();
        let facts = &endpoint.addressing;

        if let Some(addr) = facts.direct {
            routes.push(Route::Direct { addr });
        }
        if let Some(addr) = facts.overlay {
            routes.push(Route::Overlay { addr });
        }

        if let (Some(fact), Some(site_id)) = (&facts.gateway, &endpoint.site_id) {
            match self.registry.list_gateways_for_site(site_id).await {
                Ok(gateways) => match gateways.into_iter().find(|g| g.gateway_id == fact.gateway_id) {
                    Some(gateway) => {
                        let route = Route::GatewayForward {
                            gateway_id: gateway.gateway_id.clone(),
                            gateway_addr: SocketAddr::new(gateway.overlay_address, fact.forwarded_port),
                            local_addr: fact.local_address,
                        };
                        if gateway.status == GatewayStatus::Offline {
                            settled.push(RouteProbeResult::unreachable(route, "gateway reported offline"));
                        } else {
                            routes.push(route);
                        }
                    }
                    None => {
                        warn!("Gateway '{}' for camera '{}' is not listed for site '{}'",
                              fact.gateway_id, endpoint.id, site_id);
                    }
                },
                Err(e) => {
                    warn!("Could not resolve gateway '{}' for camera '{}': {}", fact.gateway_id, endpoint.id, e);
                }
            }
        }

        (routes, settled)
    }

    pub async fn probe_route(&self, route: &Route) -> RouteProbeResult {
        self.prober.probe(route).await
    }

    /// Probe all routes concurrently.
    pub async fn probe_routes(&self, routes: &[Route]) -> Vec<RouteProbeResult> {
        join_all(routes.iter().map(|route| self.prober.probe(route))).await
    }

    pub async fn plan(&self, endpoint: &CameraEndpoint) -> RouteTable {
        let (routes, settled) = self.enumerate(endpoint).await;
        if routes.is_empty() && settled.is_empty() {
            info!("Camera '{}' has no addressing facts to plan routes from", endpoint.id);
            return RouteTable::new();
        }

        let mut results = self.probe_routes(&routes).await;
        results.extend(settled);

        for result in &results {
            match (&result.latency, &result.error) {
                (Some(latency), _) => debug!("Camera '{}': {} reachable in {:?}", endpoint.id, result.route, latency),
                (None, Some(error)) => debug!("Camera '{}': {} unreachable: {}", endpoint.id, result.route, error),
                (None, None) => debug!("Camera '{}': {} unreachable", endpoint.id, result.route),
            }
        }

        let table = RouteTable::from_probes(results);
        info!("Planned {} route(s) for camera '{}', best: {}",
              table.len(), endpoint.id,
              table.best_reachable().map(|r| r.to_string()).unwrap_or_else(|| "none".to_string()));
        table
    }
}
