use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Connection failed: {message}")]
    Connect { message: String },

    #[error("Camera rejected login: {message}")]
    Auth { message: String },

    #[error("Discovery error: {message}")]
    Discovery { message: String },

    #[error("Relay error: {message}")]
    Relay { message: String },

    #[error("Gateway registry error: {message}")]
    Registry { message: String },

    #[error("MQTT error: {message}")]
    Mqtt { message: String },

    #[error("Camera '{camera_id}' not found")]
    NotFound { camera_id: String },

    #[error("Camera '{camera_id}' already exists")]
    AlreadyExists { camera_id: String },

    #[error("Server error: {message}")]
    Server { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("URL parse error: {source}")]
    UrlParse {
        #[from]
        source: url::ParseError,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },

    #[error("YAML error: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },

    #[error("Network address parse error: {source}")]
    AddrParse {
        #[from]
        source: std::net::AddrParseError,
    },

    #[error("HTTP client error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("MQTT client error: {source}")]
    MqttClient {
        #[from]
        source: rumqttc::ClientError,
    },
}

impl StreamError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect { message: message.into() }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth { message: message.into() }
    }

    pub fn discovery(message: impl Into<String>) -> Self {
        Self::Discovery { message: message.into() }
    }

    pub fn relay(message: impl Into<String>) -> Self {
        Self::Relay { message: message.into() }
    }

    pub fn registry(message: impl Into<String>) -> Self {
        Self::Registry { message: message.into() }
    }

    pub fn mqtt(message: impl Into<String>) -> Self {
        Self::Mqtt { message: message.into() }
    }

    pub fn not_found(camera_id: impl Into<String>) -> Self {
        Self::NotFound { camera_id: camera_id.into() }
    }

    pub fn already_exists(camera_id: impl Into<String>) -> Self {
        Self::AlreadyExists { camera_id: camera_id.into() }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::Server { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
