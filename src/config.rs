use crate::protocol::mysql::{DEFAULT_MAX_ALLOWED_PACKET, DEFAULT_SERVER_VERSION};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
    #[serde(default)]
    pub api: Option<ApiConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Version string announced in the handshake greeting.
    #[serde(default = "default_server_version")]
    pub version: String,
    /// Largest client payload accepted, in bytes, after reassembly.
    #[serde(default = "default_max_allowed_packet")]
    pub max_allowed_packet: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            version: default_server_version(),
            max_allowed_packet: default_max_allowed_packet(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AccountConfig {
    pub user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiConfig {
    /// API key for authenticating management API requests.
    /// If set, connection endpoints require the `X-API-Key` header.
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3306
}

fn default_server_version() -> String {
    DEFAULT_SERVER_VERSION.to_string()
}

fn default_max_allowed_packet() -> usize {
    DEFAULT_MAX_ALLOWED_PACKET
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "mysql-wire-server".to_string()
}

impl AppConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api.as_ref().and_then(|a| a.api_key.as_deref())
    }
}
