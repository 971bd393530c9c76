use std::sync::Arc;
use tracing::{info, warn, error};
use anyhow::Result;
use std::fs::File;
use std::io::BufReader;
use clap::Parser;

mod api;
mod camera_manager;
mod capture;
mod config;
mod discovery;
mod endpoint;
mod errors;
mod gateway_registry;
mod mqtt;
mod planner;
mod protocol;
mod relay;
mod routes;
mod supervisor;
mod utils;
mod watcher;
mod websocket;
#[cfg(test)]
mod testing;

use camera_manager::RemoteCameraManager;
use config::Config;
use gateway_registry::GatewayRegistry;

#[derive(Parser, Debug, Clone)]
#[command(name = "siteguard-remote")]
#[command(about = "Remote V380 camera connectivity with route failover and stream relay")]
struct Args {
    /// Configuration file (TOML, JSON or YAML)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Directory with one configuration file per camera
    #[arg(long)]
    cameras_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "siteguard_remote=debug,info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            warn!("Could not load {} ({}), using default configuration", args.config, e);
            let mut config = Config::default();
            config.cameras = Config::load_cameras_from_directory(config.server.cameras_directory())?;
            config
        }
    };

    if let Some(dir) = &args.cameras_dir {
        config.server.cameras_directory = Some(dir.clone());
        config.cameras = Config::load_cameras_from_directory(dir)?;
    }

    info!("Starting SiteGuard remote camera service on {}:{}", config.server.host, config.server.port);

    let registry: Arc<dyn GatewayRegistry> = Arc::from(gateway_registry::from_config(&config.gateways)?);
    let manager = RemoteCameraManager::new(&config, registry);

    let mut cameras: Vec<_> = config.cameras.clone().into_iter().collect();
    cameras.sort_by(|a, b| a.0.cmp(&b.0));
    for (camera_id, camera_config) in cameras {
        if !camera_config.is_enabled() {
            info!("Camera '{}' is disabled, skipping", camera_id);
            continue;
        }
        if let Err(e) = manager.add_camera(&camera_id, camera_config).await {
            error!("Failed to add camera '{}': {}", camera_id, e);
        }
    }

    let cameras_dir = config.server.cameras_directory().to_string();
    if let Err(e) = watcher::start_camera_config_watcher(manager.clone(), cameras_dir.clone()).await {
        error!("Failed to start camera config watcher: {}", e);
    }

    let mqtt_handle = match config.mqtt.clone() {
        Some(mqtt_config) if mqtt_config.enabled => match mqtt::MqttPublisher::new(mqtt_config) {
            Ok(publisher) => Some(publisher.start(&manager)),
            Err(e) => {
                error!("Failed to initialize MQTT: {}", e);
                None
            }
        },
        _ => None,
    };

    let cors_layer = if let Some(origin) = &config.server.cors_allow_origin {
        if origin == "*" {
            tower_http::cors::CorsLayer::permissive()
        } else {
            match origin.parse::<axum::http::HeaderValue>() {
                Ok(origin_header) => {
                    tower_http::cors::CorsLayer::new()
                        .allow_origin(origin_header)
                        .allow_methods(tower_http::cors::Any)
                        .allow_headers(tower_http::cors::Any)
                }
                Err(_) => {
                    warn!("Invalid CORS origin '{}', falling back to permissive", origin);
                    tower_http::cors::CorsLayer::permissive()
                }
            }
        }
    } else {
        tower_http::cors::CorsLayer::permissive()
    };

    if let Err(e) = std::fs::create_dir_all(&config.relay.hls_root) {
        warn!("Could not create HLS directory '{}': {}", config.relay.hls_root, e);
    }

    let app = api::router(api::ApiState {
        manager: manager.clone(),
        admin_token: config.server.admin_token.clone(),
        cameras_directory: Some(cameras_dir),
    })
    .nest_service("/hls", tower_http::services::ServeDir::new(&config.relay.hls_root))
    .layer(cors_layer);

    let addr = format!("{}:{}", config.server.host, config.server.port);

    let server = async {
        match &config.server.tls {
            Some(tls_config) if tls_config.enabled => {
                info!("Starting HTTPS server on {}", addr);
                start_https_server(app, &addr, tls_config).await
            }
            _ => {
                info!("Starting HTTP server on {}", addr);
                start_http_server(app, &addr).await
            }
        }
    };

    let result = tokio::select! {
        result = server => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            Ok(())
        }
    };

    if let Some(handle) = mqtt_handle {
        handle.stop();
    }
    manager.shutdown().await;
    info!("All cameras stopped");

    result
}

async fn start_http_server(app: axum::Router, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn start_https_server(app: axum::Router, addr: &str, tls_cfg: &config::TlsConfig) -> Result<()> {
    let cert_file = File::open(&tls_cfg.cert_path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file '{}': {}", tls_cfg.cert_path, e))?;
    let key_file = File::open(&tls_cfg.key_path)
        .map_err(|e| anyhow::anyhow!("Failed to open private key file '{}': {}", tls_cfg.key_path, e))?;

    let mut cert_reader = BufReader::new(cert_file);
    let mut key_reader = BufReader::new(key_file);

    let certs = rustls_pemfile::certs(&mut cert_reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse certificate: {}", e))?
        .into_iter()
        .map(rustls::Certificate)
        .collect();

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;

    if keys.is_empty() {
        let mut key_reader = BufReader::new(File::open(&tls_cfg.key_path)?);
        keys = rustls_pemfile::rsa_private_keys(&mut key_reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse RSA private key: {}", e))?;
    }

    let private_key = keys.into_iter().next()
        .ok_or_else(|| anyhow::anyhow!("No private key found in key file"))?;

    let rustls_config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, rustls::PrivateKey(private_key))
        .map_err(|e| anyhow::anyhow!("Failed to create TLS config: {}", e))?;

    info!("HTTPS server listening on https://{} (cert: {})", addr, tls_cfg.cert_path);

    let tls_config = axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(rustls_config));
    axum_server::bind_rustls(addr.parse()?, tls_config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("HTTPS server error: {}", e))?;

    Ok(())
}
