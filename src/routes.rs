//! Route data model: the candidate network paths to one camera and the ranked
//! table the supervisor selects from.

use std::cmp::Ordering;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::utils::duration_millis;

/// Priority tier of a route. Declaration order is selection priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTier {
    Direct,
    Overlay,
    GatewayForward,
}

impl fmt::Display for RouteTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTier::Direct => write!(f, "direct"),
            RouteTier::Overlay => write!(f, "overlay"),
            RouteTier::GatewayForward => write!(f, "gateway-forward"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Route {
    Direct {
        addr: SocketAddr,
    },
    Overlay {
        addr: SocketAddr,
    },
    GatewayForward {
        gateway_id: String,
        /// Gateway overlay address plus the forwarded port
        gateway_addr: SocketAddr,
        /// Camera address on the site LAN behind the gateway
        local_addr: SocketAddr,
    },
}

impl Route {
    pub fn tier(&self) -> RouteTier {
        match self {
            Route::Direct { .. } => RouteTier::Direct,
            Route::Overlay { .. } => RouteTier::Overlay,
            Route::GatewayForward { .. } => RouteTier::GatewayForward,
        }
    }

    /// Socket address a connection over this route actually dials.
    pub fn target(&self) -> SocketAddr {
        match self {
            Route::Direct { addr } | Route::Overlay { addr } => *addr,
            Route::GatewayForward { gateway_addr, .. } => *gateway_addr,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::GatewayForward { gateway_id, gateway_addr, local_addr } => {
                write!(f, "gateway-forward {} via {} -> {}", gateway_addr, gateway_id, local_addr)
            }
            other => write!(f, "{} {}", other.tier(), other.target()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteProbeResult {
    pub route: Route,
    pub reachable: bool,
    #[serde(rename = "latency_ms", serialize_with = "duration_millis::serialize")]
    pub latency: Option<Duration>,
    pub measured_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RouteProbeResult {
    pub fn reachable(route: Route, latency: Duration) -> Self {
        Self {
            route,
            reachable: true,
            latency: Some(latency),
            measured_at: Utc::now(),
            error: None,
        }
    }

    pub fn unreachable(route: Route, error: impl Into<String>) -> Self {
        Self {
            route,
            reachable: false,
            latency: None,
            measured_at: Utc::now(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteEntry {
    pub route: Route,
    pub probe: Option<RouteProbeResult>,
}

impl RouteEntry {
    pub fn is_reachable(&self) -> bool {
        self.probe.as_ref().map(|p| p.reachable).unwrap_or(false)
    }

    fn latency(&self) -> Option<Duration> {
        self.probe.as_ref().and_then(|p| p.latency)
    }
}

/// Reachable first, then tier priority, then lower latency.
fn rank(a: &RouteEntry, b: &RouteEntry) -> Ordering {
    b.is_reachable()
        .cmp(&a.is_reachable())
        .then_with(|| a.route.tier().cmp(&b.route.tier()))
        .then_with(|| match (a.latency(), b.latency()) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
}

/// Ranked routes for one camera plus the active selection.
///
/// The active route, when set, is always an entry of the table whose latest
/// probe was reachable.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
    active: Option<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_probes(results: Vec<RouteProbeResult>) -> Self {
        let mut table = Self::new();
        for result in results {
            table.record_probe(result);
        }
        table
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn active(&self) -> Option<&Route> {
        self.active.as_ref()
    }

    pub fn active_entry(&self) -> Option<&RouteEntry> {
        let active = self.active.as_ref()?;
        self.entries.iter().find(|e| &e.route == active)
    }

    /// Insert or replace the probe result for a route, keeping the table ranked.
    /// An active route that turns unreachable loses its selection.
    pub fn record_probe(&mut self, result: RouteProbeResult) {
        let reachable = result.reachable;
        let route = result.route.clone();
        match self.entries.iter_mut().find(|e| e.route == route) {
            Some(entry) => entry.probe = Some(result),
            None => self.entries.push(RouteEntry { route: route.clone(), probe: Some(result) }),
        }
        self.entries.sort_by(rank);

        if !reachable && self.active.as_ref() == Some(&route) {
            self.active = None;
        }
    }

    pub fn best_reachable(&self) -> Option<&Route> {
        self.entries.iter().find(|e| e.is_reachable()).map(|e| &e.route)
    }

    /// Best reachable route other than `excluded`.
    pub fn next_reachable_excluding(&self, excluded: &Route) -> Option<&Route> {
        self.entries
            .iter()
            .find(|e| e.is_reachable() && &e.route != excluded)
            .map(|e| &e.route)
    }

    /// Routes that would outrank the active one on tier alone.
    pub fn higher_priority_than_active(&self) -> Vec<Route> {
        let Some(active) = &self.active else {
            return Vec::new();
        };
        let tier = active.tier();
        self.entries
            .iter()
            .filter(|e| e.route.tier() < tier)
            .map(|e| e.route.clone())
            .collect()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.entries.iter().map(|e| e.route.clone()).collect()
    }

    /// Select a route. Refused unless it is in the table and its latest probe
    /// was reachable.
    pub fn set_active(&mut self, route: &Route) -> bool {
        let eligible = self.entries.iter().any(|e| &e.route == route && e.is_reachable());
        if eligible {
            self.active = Some(route.clone());
        }
        eligible
    }

    pub fn clear_active(&mut self) {
        self.active = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unconfigured,
    Probing,
    Connected,
    Degraded,
    FailedOver,
    Unreachable,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Unconfigured => "unconfigured",
            ConnectionState::Probing => "probing",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::FailedOver => "failed-over",
            ConnectionState::Unreachable => "unreachable",
        };
        f.write_str(name)
    }
}
