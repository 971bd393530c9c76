use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GatewayConfig;
use crate::errors::{Result, StreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Online,
    Offline,
    Unknown,
}

impl Default for GatewayStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

/// A site router as known to the router/VPN registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
    pub gateway_id: String,
    pub overlay_address: IpAddr,
    #[serde(default)]
    pub status: GatewayStatus,
}

/// Source of gateway-forward routing facts.
#[async_trait]
pub trait GatewayRegistry: Send + Sync {
    async fn list_gateways_for_site(&self, site_id: &str) -> Result<Vec<Gateway>>;
}

/// Gateways listed directly in the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticGatewayRegistry {
    sites: HashMap<String, Vec<Gateway>>,
}

impl StaticGatewayRegistry {
    pub fn new(sites: HashMap<String, Vec<Gateway>>) -> Self {
        Self { sites }
    }
}

#[async_trait]
impl GatewayRegistry for StaticGatewayRegistry {
    async fn list_gateways_for_site(&self, site_id: &str) -> Result<Vec<Gateway>> {
        Ok(self.sites.get(site_id).cloned().unwrap_or_default())
    }
}

/// Remote registry queried as `GET <base>/sites/<site_id>/gateways`.
pub struct HttpGatewayRegistry {
    client: reqwest::Client,
    base_url: url::Url,
}

impl HttpGatewayRegistry {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base_url = url::Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    fn site_url(&self, site_id: &str) -> Result<url::Url> {
        Ok(self.base_url.join(&format!("sites/{}/gateways", site_id))?)
    }
}

#[async_trait]
impl GatewayRegistry for HttpGatewayRegistry {
    async fn list_gateways_for_site(&self, site_id: &str) -> Result<Vec<Gateway>> {
        let url = self.site_url(site_id)?;
        debug!("Querying gateway registry: {}", url);

        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(StreamError::registry(format!(
                "{} returned HTTP {}", url, response.status()
            )));
        }
        Ok(response.json::<Vec<Gateway>>().await?)
    }
}

pub fn from_config(config: &GatewayConfig) -> Result<Box<dyn GatewayRegistry>> {
    match &config.registry_url {
        Some(url) => Ok(Box::new(HttpGatewayRegistry::new(url, config.request_timeout)?)),
        None => Ok(Box::new(StaticGatewayRegistry::new(config.sites.clone()))),
    }
}
