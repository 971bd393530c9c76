use serde::{Deserialize, Serialize};
use std::fs;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use crate::endpoint::{AddressingFacts, Credentials, StreamPreferences};
use crate::errors::{Result, StreamError};
use crate::gateway_registry::Gateway;
use crate::utils::humantime_serde;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub gateways: GatewayConfig,
    pub mqtt: Option<MqttConfig>,
    #[serde(default, skip_serializing)]
    pub cameras: HashMap<String, CameraConfig>,
}

/// One camera as stored in the cameras directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub enabled: Option<bool>,
    pub name: Option<String>,
    pub site_id: Option<String>,
    /// Identity reported by the camera in discovery replies
    pub device_id: Option<String>,
    #[serde(default)]
    pub addressing: AddressingFacts,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub stream: StreamPreferences,
}

impl CameraConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub public_url: Option<String>,  // Base URL advertised in relay endpoints (default: http://<host>:<port>)
    pub tls: Option<TlsConfig>,
    pub cors_allow_origin: Option<String>,
    pub admin_token: Option<String>,  // Optional token for camera add/remove/update
    pub cameras_directory: Option<String>,  // Directory path for camera configuration files (default: "cameras")
}

impl ServerConfig {
    pub fn effective_public_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let scheme = if self.tls.as_ref().map(|t| t.enabled).unwrap_or(false) { "https" } else { "http" };
                let host = if self.host == "0.0.0.0" { "127.0.0.1" } else { self.host.as_str() };
                format!("{}://{}:{}", scheme, host, self.port)
            }
        }
    }

    pub fn cameras_directory(&self) -> &str {
        self.cameras_directory.as_deref().unwrap_or("cameras")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(with = "humantime_serde", default = "default_health_interval")]
    pub health_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_restore_interval")]
    pub restore_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_retry_base")]
    pub retry_base: Duration,
    #[serde(with = "humantime_serde", default = "default_retry_ceiling")]
    pub retry_ceiling: Duration,
}

fn default_health_interval() -> Duration { Duration::from_secs(12) }
fn default_restore_interval() -> Duration { Duration::from_secs(90) }
fn default_retry_base() -> Duration { Duration::from_secs(5) }
fn default_retry_ceiling() -> Duration { Duration::from_secs(300) }

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_interval: default_health_interval(),
            restore_interval: default_restore_interval(),
            retry_base: default_retry_base(),
            retry_ceiling: default_retry_ceiling(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(with = "humantime_serde", default = "default_probe_connect_timeout")]
    pub connect_timeout: Duration,
    /// Send a heartbeat after connecting and require a valid frame back
    #[serde(default = "default_true")]
    pub handshake: bool,
    #[serde(with = "humantime_serde", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,
}

fn default_probe_connect_timeout() -> Duration { Duration::from_secs(2) }
fn default_handshake_timeout() -> Duration { Duration::from_millis(1500) }
fn default_true() -> bool { true }

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_probe_connect_timeout(),
            handshake: true,
            handshake_timeout: default_handshake_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(with = "humantime_serde", default = "default_capture_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_login_timeout")]
    pub login_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
    #[serde(default = "default_heartbeat_timeout_multiple")]
    pub heartbeat_timeout_multiple: u32,
    #[serde(default = "default_frame_buffer")]
    pub frame_buffer: usize,  // Frames queued between capture and relay
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
}

fn default_capture_connect_timeout() -> Duration { Duration::from_secs(5) }
fn default_login_timeout() -> Duration { Duration::from_secs(5) }
fn default_heartbeat_interval() -> Duration { Duration::from_secs(5) }
fn default_heartbeat_timeout_multiple() -> u32 { 3 }
fn default_frame_buffer() -> usize { 256 }
fn default_read_chunk_size() -> usize { 16 * 1024 }

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_capture_connect_timeout(),
            login_timeout: default_login_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout_multiple: default_heartbeat_timeout_multiple(),
            frame_buffer: default_frame_buffer(),
            read_chunk_size: default_read_chunk_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_concurrency")]
    pub concurrency: usize,
    #[serde(with = "humantime_serde", default = "default_address_timeout")]
    pub address_timeout: Duration,
    #[serde(default = "default_broadcast_port")]
    pub broadcast_port: u16,
    #[serde(with = "humantime_serde", default = "default_broadcast_window")]
    pub broadcast_window: Duration,
    #[serde(default = "default_camera_port")]
    pub camera_port: u16,
    pub local_subnet: Option<String>,  // e.g. "192.168.1.0/24"
    #[serde(default)]
    pub overlay_ranges: Vec<String>,  // VPN assigned ranges, e.g. ["10.1.1.0/24"]
}

fn default_discovery_concurrency() -> usize { 24 }
fn default_address_timeout() -> Duration { Duration::from_millis(300) }
fn default_broadcast_port() -> u16 { 8600 }
fn default_broadcast_window() -> Duration { Duration::from_secs(2) }
fn default_camera_port() -> u16 { 8800 }

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            concurrency: default_discovery_concurrency(),
            address_timeout: default_address_timeout(),
            broadcast_port: default_broadcast_port(),
            broadcast_window: default_broadcast_window(),
            camera_port: default_camera_port(),
            local_subnet: None,
            overlay_ranges: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_hls_root")]
    pub hls_root: String,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// How long a worker is kept alive after its source ends
    #[serde(with = "humantime_serde", default = "default_grace_period")]
    pub grace_period: Duration,
    /// A write the transcoder has not accepted within this time counts as a crash
    #[serde(with = "humantime_serde", default = "default_write_timeout")]
    pub write_timeout: Duration,
    #[serde(default = "default_restream_buffer")]
    pub restream_buffer: usize,
    #[serde(default = "default_hls_segment_secs")]
    pub hls_segment_secs: u32,
    #[serde(default = "default_hls_list_size")]
    pub hls_list_size: u32,
    #[serde(default)]
    pub log_stderr: bool,  // Forward ffmpeg stderr into the log
}

fn default_hls_root() -> String { "hls".to_string() }
fn default_ffmpeg_path() -> String { "ffmpeg".to_string() }
fn default_grace_period() -> Duration { Duration::from_secs(10) }
fn default_write_timeout() -> Duration { Duration::from_secs(5) }
fn default_restream_buffer() -> usize { 64 }
fn default_hls_segment_secs() -> u32 { 2 }
fn default_hls_list_size() -> u32 { 6 }

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            hls_root: default_hls_root(),
            ffmpeg_path: default_ffmpeg_path(),
            grace_period: default_grace_period(),
            write_timeout: default_write_timeout(),
            restream_buffer: default_restream_buffer(),
            hls_segment_secs: default_hls_segment_secs(),
            hls_list_size: default_hls_list_size(),
            log_stderr: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Router/VPN registry, queried as GET <registry_url>/sites/<site>/gateways
    pub registry_url: Option<String>,
    #[serde(with = "humantime_serde", default = "default_registry_timeout")]
    pub request_timeout: Duration,
    /// Static gateways per site, used when no registry is configured
    #[serde(default)]
    pub sites: HashMap<String, Vec<Gateway>>,
}

fn default_registry_timeout() -> Duration { Duration::from_secs(5) }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            registry_url: None,
            request_timeout: default_registry_timeout(),
            sites: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub base_topic: String,
    pub qos: u8,
    pub retain: bool,
    pub keep_alive_secs: u64,
}

impl MqttConfig {
    pub fn substitute_variables(&mut self) {
        let hostname = gethostname::gethostname()
            .to_string_lossy()
            .to_string();

        self.base_topic = self.base_topic.replace("${hostname}", &hostname);
        self.client_id = self.client_id.replace("${hostname}", &hostname);

        info!("MQTT config substituted: base_topic = {}, client_id = {}",
              self.base_topic, self.client_id);
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                public_url: None,
                tls: None,
                cors_allow_origin: Some("*".to_string()),
                admin_token: None,
                cameras_directory: None,  // Default: "cameras"
            },
            supervisor: SupervisorConfig::default(),
            probe: ProbeConfig::default(),
            capture: CaptureConfig::default(),
            discovery: DiscoveryConfig::default(),
            relay: RelayConfig::default(),
            gateways: GatewayConfig::default(),
            mqtt: None,
            cameras: HashMap::new(),
        }
    }
}

enum FileFormat {
    Json,
    Toml,
    Yaml,
}

impl FileFormat {
    fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|s| s.to_str()) {
            Some("json") => Some(FileFormat::Json),
            Some("toml") => Some(FileFormat::Toml),
            Some("yaml") | Some("yml") => Some(FileFormat::Yaml),
            _ => None,
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(&self, content: &str) -> Result<T> {
        Ok(match self {
            FileFormat::Json => serde_json::from_str(content)?,
            FileFormat::Toml => toml::from_str(content)?,
            FileFormat::Yaml => serde_yaml::from_str(content)?,
        })
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let format = FileFormat::from_path(Path::new(path)).unwrap_or(FileFormat::Toml);
        let mut config: Config = format.parse(&content)?;

        if let Some(ref mut mqtt) = config.mqtt {
            mqtt.substitute_variables();
        }

        config.validate()?;

        let cameras_dir = config.server.cameras_directory().to_string();
        config.cameras = Self::load_cameras_from_directory(&cameras_dir)?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.supervisor.restore_interval <= self.supervisor.health_interval {
            return Err(StreamError::config(format!(
                "supervisor.restore_interval ({:?}) must be longer than health_interval ({:?})",
                self.supervisor.restore_interval, self.supervisor.health_interval
            )));
        }
        if self.supervisor.retry_ceiling < self.supervisor.retry_base {
            return Err(StreamError::config("supervisor.retry_ceiling must not be below retry_base"));
        }
        if self.capture.heartbeat_timeout_multiple == 0 {
            return Err(StreamError::config("capture.heartbeat_timeout_multiple must be at least 1"));
        }
        if self.discovery.concurrency == 0 {
            return Err(StreamError::config("discovery.concurrency must be at least 1"));
        }
        if let Some(url) = &self.gateways.registry_url {
            url::Url::parse(url)?;
        }
        Ok(())
    }

    pub fn load_cameras_from_directory(cameras_dir: &str) -> Result<HashMap<String, CameraConfig>> {
        let mut cameras = HashMap::new();

        let dir = Path::new(cameras_dir);
        if !dir.exists() {
            info!("Cameras directory '{}' does not exist, starting with no cameras", cameras_dir);
            return Ok(cameras);
        }

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(file_stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // Skip non-config files
            if FileFormat::from_path(&path).is_none() {
                continue;
            }

            match Self::load_camera_config(&path) {
                Ok(camera_config) => {
                    info!("Loaded camera configuration: {}", file_stem);
                    cameras.insert(file_stem.to_string(), camera_config);
                }
                Err(e) => {
                    warn!("Skipping camera config file {}: {}", path.display(), e);
                }
            }
        }

        Ok(cameras)
    }

    pub fn load_camera_config(path: &Path) -> Result<CameraConfig> {
        let format = FileFormat::from_path(path)
            .ok_or_else(|| StreamError::config(format!("Unsupported camera config file: {}", path.display())))?;
        let content = fs::read_to_string(path)?;
        format.parse(&content)
    }

    pub fn save_camera_config(camera_id: &str, config: &CameraConfig, cameras_dir: &str) -> Result<()> {
        if !Path::new(cameras_dir).exists() {
            fs::create_dir_all(cameras_dir)?;
        }

        let file_path = format!("{}/{}.json", cameras_dir, camera_id);
        let json_content = serde_json::to_string_pretty(config)?;
        fs::write(&file_path, json_content)?;

        info!("Saved camera configuration: {} to {}", camera_id, file_path);
        Ok(())
    }

    /// Removes every stored variant of the camera's file. Returns whether anything was deleted.
    pub fn delete_camera_config(camera_id: &str, cameras_dir: &str) -> Result<bool> {
        let mut deleted = false;

        for ext in ["json", "toml", "yaml", "yml"] {
            let path = format!("{}/{}.{}", cameras_dir, camera_id, ext);
            if Path::new(&path).exists() {
                fs::remove_file(&path)?;
                deleted = true;
                info!("Deleted camera configuration: {} ({})", camera_id, ext);
            }
        }

        Ok(deleted)
    }
}
