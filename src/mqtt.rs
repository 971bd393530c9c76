use crate::errors::{Result, StreamError};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::camera_manager::{RemoteCameraManager, StatusUpdate};
use crate::config::MqttConfig;
use crate::supervisor::CameraStatus;

/// One message bound for the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

pub fn status_topic(base_topic: &str, camera_id: &str) -> String {
    format!("{}/cameras/{}/status", base_topic, camera_id)
}

fn qos_level(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Remembers what was last published per camera so that only meaningful
/// changes reach the broker.
#[derive(Debug, Default)]
pub struct StatusTracker {
    base_topic: String,
    retain: bool,
    published: HashMap<String, CameraStatus>,
}

impl StatusTracker {
    pub fn new(base_topic: &str, retain: bool) -> Self {
        Self { base_topic: base_topic.to_string(), retain, published: HashMap::new() }
    }

    pub fn observe(&mut self, update: &StatusUpdate) -> Option<Publication> {
        let topic = status_topic(&self.base_topic, &update.camera_id);
        match &update.status {
            Some(status) => {
                let changed = match self.published.get(&update.camera_id) {
                    Some(previous) => status.is_significant_change(previous),
                    None => true,
                };
                if !changed {
                    return None;
                }
                let payload = match serde_json::to_vec(status) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!("Failed to serialize status of camera '{}': {}", update.camera_id, e);
                        return None;
                    }
                };
                self.published.insert(update.camera_id.clone(), status.clone());
                Some(Publication { topic, payload, retain: self.retain })
            }
            None => {
                self.published.remove(&update.camera_id)?;
                // Empty retained payload clears the topic
                Some(Publication { topic, payload: Vec::new(), retain: true })
            }
        }
    }

    /// Catch up with the full set of cameras after updates were missed:
    /// clear cameras that are gone, then publish whatever changed.
    pub fn resync(&mut self, current: &[CameraStatus]) -> Vec<Publication> {
        let mut gone: Vec<String> = self
            .published
            .keys()
            .filter(|id| !current.iter().any(|status| &status.camera_id == *id))
            .cloned()
            .collect();
        gone.sort();

        let removals = gone.into_iter().map(|camera_id| StatusUpdate { camera_id, status: None });
        let changes = current
            .iter()
            .map(|status| StatusUpdate { camera_id: status.camera_id.clone(), status: Some(status.clone()) });
        removals.chain(changes).filter_map(|update| self.observe(&update)).collect()
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttConfig,
}

impl MqttPublisher {
    pub fn new(config: MqttConfig) -> Result<Self> {
        let url = url::Url::parse(&config.broker_url)
            .map_err(|e| StreamError::mqtt(format!("Invalid MQTT broker URL '{}': {}", config.broker_url, e)))?;

        let host = url.host_str()
            .ok_or_else(|| StreamError::mqtt(format!("No host found in MQTT broker URL: {}", config.broker_url)))?;

        let port = url.port().unwrap_or(1883);

        info!("Connecting to MQTT broker at {}:{}", host, port);

        let mut mqtt_options = MqttOptions::new(&config.client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        Ok(Self { client, eventloop, config })
    }

    /// Drive the connection and publish camera status changes until the
    /// manager's update channel closes.
    pub fn start(mut self, manager: &RemoteCameraManager) -> MqttHandle {
        let eventloop_task = tokio::spawn(async move {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("Disconnected from MQTT broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        let client = self.client.clone();
        let qos = qos_level(self.config.qos);
        let mut tracker = StatusTracker::new(&self.config.base_topic, self.config.retain);
        let mut updates = manager.subscribe_updates();
        let manager = manager.clone();

        let publisher_task = tokio::spawn(async move {
            loop {
                let publications = match updates.recv().await {
                    Ok(update) => tracker.observe(&update).into_iter().collect(),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("MQTT publisher skipped {} status updates, resyncing", skipped);
                        tracker.resync(&manager.get_all_status().await)
                    }
                    Err(RecvError::Closed) => break,
                };

                for publication in publications {
                    debug!("Publishing to {}", publication.topic);
                    if let Err(e) = client
                        .publish(publication.topic.clone(), qos, publication.retain, publication.payload)
                        .await
                    {
                        error!("Failed to publish to {}: {}", publication.topic, e);
                    }
                }
            }
        });

        MqttHandle { eventloop_task, publisher_task }
    }
}

pub struct MqttHandle {
    eventloop_task: JoinHandle<()>,
    publisher_task: JoinHandle<()>,
}

impl MqttHandle {
    pub fn stop(self) {
        self.publisher_task.abort();
        self.eventloop_task.abort();
    }
}
