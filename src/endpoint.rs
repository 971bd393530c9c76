use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::config::CameraConfig;
use crate::errors::{Result, StreamError};

/// Everything known about how a camera can be addressed. Each fact is optional;
/// the route planner only derives routes for facts that are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressingFacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct: Option<SocketAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<SocketAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayForwardFact>,
}

/// A site router forwarding `forwarded_port` to the camera at `local_address`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayForwardFact {
    pub gateway_id: String,
    pub forwarded_port: u16,
    pub local_address: SocketAddr,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_username() -> String { "admin".to_string() }

impl Default for Credentials {
    fn default() -> Self {
        Self { username: default_username(), password: String::new() }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &format_args!("[{} chars]", self.password.len()))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    #[default]
    Medium,
    High,
}

impl QualityTier {
    /// x264 constant rate factor used when the relay has to re-encode.
    pub fn crf(self) -> u8 {
        match self {
            QualityTier::Low => 32,
            QualityTier::Medium => 26,
            QualityTier::High => 20,
        }
    }

    /// Camera-side stream channel: 0 = main stream, 1 = sub stream.
    pub fn channel(self) -> u8 {
        match self {
            QualityTier::Low => 1,
            QualityTier::Medium | QualityTier::High => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPreferences {
    /// "WIDTHxHEIGHT", e.g. "1280x720"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<u32>,
    #[serde(default = "default_audio")]
    pub audio: bool,
    #[serde(default)]
    pub quality: QualityTier,
}

fn default_audio() -> bool { true }

impl Default for StreamPreferences {
    fn default() -> Self {
        Self {
            resolution: None,
            frame_rate: None,
            audio: default_audio(),
            quality: QualityTier::default(),
        }
    }
}

impl StreamPreferences {
    pub fn resolution_dims(&self) -> Option<(u32, u32)> {
        let (w, h) = self.resolution.as_deref()?.split_once(['x', 'X'])?;
        Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
    }

    /// Whether the relay can pass the camera's H.264 through untouched.
    pub fn needs_transcode(&self) -> bool {
        self.resolution_dims().is_some() || self.frame_rate.is_some()
    }
}

/// One managed camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraEndpoint {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub addressing: AddressingFacts,
    #[serde(skip_serializing)]
    pub credentials: Credentials,
    pub stream: StreamPreferences,
}

impl CameraEndpoint {
    pub fn from_config(camera_id: &str, config: &CameraConfig) -> Result<Self> {
        validate_camera_id(camera_id)?;

        if let Some(resolution) = &config.stream.resolution {
            if config.stream.resolution_dims().is_none() {
                return Err(StreamError::config(format!(
                    "Invalid resolution '{}' for camera '{}', expected WIDTHxHEIGHT",
                    resolution, camera_id
                )));
            }
        }

        if let Some(gateway) = &config.addressing.gateway {
            if config.site_id.is_none() {
                return Err(StreamError::config(format!(
                    "Camera '{}' uses gateway '{}' but has no site_id",
                    camera_id, gateway.gateway_id
                )));
            }
        }

        Ok(Self {
            id: camera_id.to_string(),
            name: config.name.clone().unwrap_or_else(|| camera_id.to_string()),
            site_id: config.site_id.clone(),
            device_id: config.device_id.clone(),
            addressing: config.addressing.clone(),
            credentials: config.credentials.clone(),
            stream: config.stream.clone(),
        })
    }
}

/// Camera ids end up in URLs and file names, so keep them to a safe alphabet.
pub fn validate_camera_id(camera_id: &str) -> Result<()> {
    if camera_id.is_empty() || camera_id.len() > 64 {
        return Err(StreamError::config("Camera id must be 1-64 characters"));
    }
    if !camera_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(StreamError::config(format!(
            "Camera id '{}' may only contain letters, digits, '-' and '_'",
            camera_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_dims() {
        let mut prefs = StreamPreferences::default();
        assert_eq!(prefs.resolution_dims(), None);
        assert!(!prefs.needs_transcode());

        prefs.resolution = Some("1280x720".to_string());
        assert_eq!(prefs.resolution_dims(), Some((1280, 720)));
        assert!(prefs.needs_transcode());

        prefs.resolution = Some("wide".to_string());
        assert_eq!(prefs.resolution_dims(), None);
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials { username: "admin".to_string(), password: "hunter2".to_string() };
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("[7 chars]"));
    }

    #[test]
    fn test_missing_credentials_log_in_as_admin() {
        let config: CameraConfig = serde_json::from_str(r#"{"addressing": {"overlay": "10.1.1.5:554"}}"#).unwrap();
        assert_eq!(config.credentials.username, "admin");
        assert_eq!(config.credentials.password, "");

        let config: CameraConfig = serde_json::from_str(r#"{"credentials": {"password": "secret"}}"#).unwrap();
        assert_eq!(config.credentials.username, "admin");
        assert_eq!(CameraConfig::default().credentials.username, "admin");
    }

    #[test]
    fn test_camera_id_validation() {
        assert!(validate_camera_id("site-a_cam01").is_ok());
        assert!(validate_camera_id("").is_err());
        assert!(validate_camera_id("../etc").is_err());
        assert!(validate_camera_id("cam 1").is_err());
    }

    #[test]
    fn test_endpoint_from_config_requires_site_for_gateway() {
        let mut config = CameraConfig::default();
        config.addressing.gateway = Some(GatewayForwardFact {
            gateway_id: "gw-1".to_string(),
            forwarded_port: 18800,
            local_address: "192.168.1.20:8800".parse().unwrap(),
        });
        assert!(CameraEndpoint::from_config("cam1", &config).is_err());

        config.site_id = Some("site-a".to_string());
        let endpoint = CameraEndpoint::from_config("cam1", &config).unwrap();
        assert_eq!(endpoint.name, "cam1");
        assert_eq!(endpoint.site_id.as_deref(), Some("site-a"));
    }
}
