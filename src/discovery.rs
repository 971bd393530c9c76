use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::DiscoveryConfig;
use crate::errors::{Result, StreamError};
use crate::protocol::{FrameDecoder, Message};

/// Which network a candidate was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Surface {
    Local,
    Overlay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateCamera {
    pub address: SocketAddr,
    pub surface: Surface,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

struct Identity {
    device_id: Option<String>,
    model: Option<String>,
    port: Option<u16>,
}

fn discover_request() -> Message {
    Message::control(&serde_json::json!({ "cmd": "discover" }))
}

fn parse_identity(message: &Message) -> Option<Identity> {
    let reply = message.control_json()?;
    if reply["cmd"] != "discover" {
        return None;
    }
    Some(Identity {
        device_id: reply["device_id"].as_str().map(str::to_string),
        model: reply["model"].as_str().map(str::to_string),
        port: reply["port"].as_u64().and_then(|p| u16::try_from(p).ok()),
    })
}

/// Finds V380 cameras on the site LAN and on VPN overlay ranges. Only reports
/// what it sees; binding candidates to endpoints is the manager's job.
pub struct NetworkDiscovery {
    settings: DiscoveryConfig,
}

impl NetworkDiscovery {
    pub fn new(settings: DiscoveryConfig) -> Self {
        Self { settings }
    }

    pub async fn discover_local(&self, subnet: &str) -> Result<Vec<CandidateCamera>> {
        let hosts = parse_cidr(subnet)?;
        info!("🔍 Discovering cameras on local subnet {} ({} hosts)", subnet, hosts.len());

        let broadcast = match broadcast_address(subnet) {
            Ok(addr) => self.broadcast_probe(addr).await,
            Err(e) => {
                debug!("Skipping broadcast probe for {}: {}", subnet, e);
                Vec::new()
            }
        };
        let scanned = self.scan(hosts, Surface::Local).await;

        let candidates = merge(broadcast, scanned);
        info!("Local discovery on {} found {} candidate(s)", subnet, candidates.len());
        Ok(candidates)
    }

    pub async fn discover_overlay(&self, ranges: &[String]) -> Result<Vec<CandidateCamera>> {
        let mut hosts = Vec::new();
        for range in ranges {
            hosts.extend(parse_cidr(range)?);
        }
        hosts.sort();
        hosts.dedup();
        info!("🔍 Discovering cameras on {} overlay range(s) ({} hosts)", ranges.len(), hosts.len());

        let candidates = merge(Vec::new(), self.scan(hosts, Surface::Overlay).await);
        info!("Overlay discovery found {} candidate(s)", candidates.len());
        Ok(candidates)
    }

    /// Broadcast a discover request and collect identity replies until the
    /// window closes. Socket errors end the probe with whatever arrived.
    async fn broadcast_probe(&self, broadcast: Ipv4Addr) -> Vec<CandidateCamera> {
        let socket = match broadcast_socket() {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Could not open broadcast socket: {}", e);
                return Vec::new();
            }
        };

        let target = SocketAddr::V4(SocketAddrV4::new(broadcast, self.settings.broadcast_port));
        if let Err(e) = socket.send_to(&discover_request().encode(), target).await {
            warn!("Broadcast discover to {} failed: {}", target, e);
            return Vec::new();
        }

        let mut found = Vec::new();
        let mut buffer = vec![0u8; 2048];
        let deadline = Instant::now() + self.settings.broadcast_window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (size, from) = match timeout(remaining, socket.recv_from(&mut buffer)).await {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    debug!("Broadcast receive error: {}", e);
                    continue;
                }
                Err(_) => break,
            };
            trace!("Broadcast reply of {} bytes from {}", size, from);

            let mut decoder = FrameDecoder::new();
            decoder.push(&buffer[..size]);
            while let Some(Ok(message)) = decoder.next_message() {
                if let Some(identity) = parse_identity(&message) {
                    found.push(CandidateCamera {
                        address: SocketAddr::new(from.ip(), identity.port.unwrap_or(self.settings.camera_port)),
                        surface: Surface::Local,
                        device_id: identity.device_id,
                        model: identity.model,
                    });
                }
            }
        }
        debug!("Broadcast probe collected {} replies", found.len());
        found
    }

    /// Directed TCP probe of every host on the camera port, bounded by a
    /// semaphore. Hosts that time out or refuse are dropped silently.
    async fn scan(&self, hosts: Vec<IpAddr>, surface: Surface) -> Vec<CandidateCamera> {
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let port = self.settings.camera_port;
        let per_address = self.settings.address_timeout;

        let mut tasks = Vec::with_capacity(hosts.len());
        for ip in hosts {
            let semaphore = semaphore.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                probe_host(SocketAddr::new(ip, port), surface, per_address).await
            }));
        }

        let mut found = Vec::new();
        for task in tasks {
            if let Ok(Some(candidate)) = task.await {
                found.push(candidate);
            }
        }
        found
    }
}

fn broadcast_socket() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from(([0, 0, 0, 0], 0)).into())?;
    UdpSocket::from_std(socket.into())
}

async fn probe_host(addr: SocketAddr, surface: Surface, per_address: Duration) -> Option<CandidateCamera> {
    let mut stream = timeout(per_address, TcpStream::connect(addr)).await.ok()?.ok()?;
    trace!("Camera port open on {}", addr);

    let identity = timeout(per_address, read_identity(&mut stream)).await.ok().flatten();
    Some(CandidateCamera {
        address: addr,
        surface,
        device_id: identity.as_ref().and_then(|i| i.device_id.clone()),
        model: identity.and_then(|i| i.model),
    })
}

async fn read_identity(stream: &mut TcpStream) -> Option<Identity> {
    stream.write_all(&discover_request().encode()).await.ok()?;
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        decoder.push(&chunk[..n]);
        while let Some(result) = decoder.next_message() {
            if let Some(identity) = result.ok().as_ref().and_then(parse_identity) {
                return Some(identity);
            }
        }
    }
}

/// Union keyed by address, sorted. Broadcast answers carry the camera's own
/// identity, so their fields win over the directed scan's.
pub fn merge(broadcast: Vec<CandidateCamera>, scanned: Vec<CandidateCamera>) -> Vec<CandidateCamera> {
    let mut by_address: BTreeMap<SocketAddr, CandidateCamera> = BTreeMap::new();
    for candidate in broadcast.into_iter().chain(scanned) {
        match by_address.get_mut(&candidate.address) {
            Some(existing) => {
                if existing.device_id.is_none() {
                    existing.device_id = candidate.device_id;
                }
                if existing.model.is_none() {
                    existing.model = candidate.model;
                }
            }
            None => {
                by_address.insert(candidate.address, candidate);
            }
        }
    }
    by_address.into_values().collect()
}

fn split_cidr(cidr: &str) -> Result<(u32, u8)> {
    let (ip, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| StreamError::discovery(format!("Invalid CIDR '{}'", cidr)))?;
    let ip: Ipv4Addr = ip
        .trim()
        .parse()
        .map_err(|e| StreamError::discovery(format!("Invalid IP in '{}': {}", cidr, e)))?;
    let prefix: u8 = prefix
        .trim()
        .parse()
        .map_err(|e| StreamError::discovery(format!("Invalid prefix in '{}': {}", cidr, e)))?;
    if prefix > 32 {
        return Err(StreamError::discovery(format!("Invalid prefix {} (must be 0-32)", prefix)));
    }
    Ok((u32::from(ip), prefix))
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 { 0 } else { !((1u32 << (32 - prefix)) - 1) }
}

/// Expand CIDR notation (or a single address) into host addresses.
/// Network and broadcast addresses are skipped for /24 through /30.
pub fn parse_cidr(cidr: &str) -> Result<Vec<IpAddr>> {
    if !cidr.contains('/') {
        return cidr
            .trim()
            .parse::<IpAddr>()
            .map(|ip| vec![ip])
            .map_err(|e| StreamError::discovery(format!("Invalid IP '{}': {}", cidr, e)));
    }

    let (base, prefix) = split_cidr(cidr)?;
    if prefix < 16 {
        return Err(StreamError::discovery(format!("Range '{}' is too large to scan", cidr)));
    }

    let network = base & mask(prefix);
    let broadcast = network | !mask(prefix);
    let (start, end) = if (24..=30).contains(&prefix) {
        (network + 1, broadcast - 1)
    } else {
        (network, broadcast)
    };

    Ok((start..=end).map(|ip| IpAddr::V4(Ipv4Addr::from(ip))).collect())
}

pub fn broadcast_address(cidr: &str) -> Result<Ipv4Addr> {
    let (base, prefix) = split_cidr(cidr)?;
    Ok(Ipv4Addr::from((base & mask(prefix)) | !mask(prefix)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn candidate(addr: &str, surface: Surface, device_id: Option<&str>, model: Option<&str>) -> CandidateCamera {
        CandidateCamera {
            address: addr.parse().unwrap(),
            surface,
            device_id: device_id.map(str::to_string),
            model: model.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_cidr() {
        let hosts = parse_cidr("192.168.1.0/24").unwrap();
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], "192.168.1.1".parse::<IpAddr>().unwrap());
        assert_eq!(hosts[253], "192.168.1.254".parse::<IpAddr>().unwrap());

        assert_eq!(parse_cidr("10.1.1.4/30").unwrap().len(), 2);
        assert_eq!(parse_cidr("10.1.1.5/32").unwrap(), vec!["10.1.1.5".parse::<IpAddr>().unwrap()]);
        assert_eq!(parse_cidr("10.1.1.5").unwrap().len(), 1);
        assert_eq!(parse_cidr("10.1.0.0/22").unwrap().len(), 1024);

        assert!(parse_cidr("10.0.0.0/8").is_err());
        assert!(parse_cidr("10.1.1.0/33").is_err());
        assert!(parse_cidr("not-an-ip/24").is_err());
    }

    #[test]
    fn test_broadcast_address() {
        assert_eq!(broadcast_address("192.168.1.0/24").unwrap(), Ipv4Addr::new(192, 168, 1, 255));
        assert_eq!(broadcast_address("10.1.0.7/22").unwrap(), Ipv4Addr::new(10, 1, 3, 255));
        assert!(broadcast_address("192.168.1.1").is_err());
    }

    #[test]
    fn test_merge_dedups_by_address_and_prefers_broadcast_identity() {
        let broadcast = vec![
            candidate("192.168.1.30:8800", Surface::Local, Some("V380-AAA"), None),
        ];
        let scanned = vec![
            candidate("192.168.1.40:8800", Surface::Local, None, None),
            candidate("192.168.1.30:8800", Surface::Local, Some("stale"), Some("V380 Pro")),
            candidate("192.168.1.20:8800", Surface::Local, Some("V380-BBB"), None),
        ];

        let merged = merge(broadcast, scanned);
        let addresses: Vec<String> = merged.iter().map(|c| c.address.to_string()).collect();
        assert_eq!(addresses, vec!["192.168.1.20:8800", "192.168.1.30:8800", "192.168.1.40:8800"]);
        assert_eq!(merged[1].device_id.as_deref(), Some("V380-AAA"));
        assert_eq!(merged[1].model.as_deref(), Some("V380 Pro"));
    }

    #[tokio::test]
    async fn test_overlay_scan_reads_identity_and_ignores_silent_hosts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = socket.read(&mut buf).await;
            let reply = serde_json::json!({"cmd": "discover", "device_id": "V380-1234", "model": "V380 Q6"});
            socket.write_all(&Message::control(&reply).encode()).await.unwrap();
        });

        let discovery = NetworkDiscovery::new(DiscoveryConfig {
            camera_port: port,
            address_timeout: Duration::from_millis(300),
            ..DiscoveryConfig::default()
        });
        let found = discovery
            .discover_overlay(&["127.0.0.1/32".to_string(), "127.0.0.2/32".to_string()])
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, SocketAddr::from(([127, 0, 0, 1], port)));
        assert_eq!(found[0].surface, Surface::Overlay);
        assert_eq!(found[0].device_id.as_deref(), Some("V380-1234"));
        assert_eq!(found[0].model.as_deref(), Some("V380 Q6"));
    }

    #[tokio::test]
    async fn test_bad_range_is_an_error() {
        let discovery = NetworkDiscovery::new(DiscoveryConfig::default());
        assert!(discovery.discover_overlay(&["10.1.1.0/40".to_string()]).await.is_err());
    }
}
