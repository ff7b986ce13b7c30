//! Configuration management for the flowway engine
//!
//! Handles storage locations, engine limits, logging and the connector
//! instances created at startup.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;

use crate::error::{FlowError, Result};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// REST control API configuration
    pub server: ServerConfig,
    /// Flow and context storage locations
    pub storage: StorageConfig,
    /// Flow execution limits
    pub engine: EngineConfig,
    /// Log output
    pub logging: LoggingConfig,
    /// Connector instances registered before any flow is loaded
    pub connectors: Vec<ConnectorSpec>,
    /// Address segment of the bus control API topic (`.../rn:flowway/ad:<instance_address>`)
    pub instance_address: String,
}

/// HTTP server configuration for the control API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// One `<flow_id>.json` file per flow lives here
    pub flow_storage_dir: String,
    /// SQLite file backing the variable/context store
    pub context_db_path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of each flow's bounded ingestion queue
    pub pipeline_capacity: usize,
    /// Upper bound on nodes executed for a single inbound message
    pub max_walk_steps: usize,
    /// How long `stop` waits for the dispatcher task to exit
    pub stop_timeout_ms: u64,
    /// Default bound for synchronous request/response waits
    pub default_request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// "text" or "json"
    pub format: String,
}

/// A connector instance to create at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorSpec {
    /// Name nodes use to look the instance up
    pub name: String,
    /// Plugin kind: "bus", "http" or "scheduler"
    pub plugin: String,
    /// Plugin-specific configuration
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pipeline_capacity: 64,
            max_walk_steps: 1000,
            stop_timeout_ms: 5000,
            default_request_timeout_secs: 15,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: env_or("FLOWWAY_HOST", "0.0.0.0"),
            port: env_or("FLOWWAY_PORT", "3005").parse().unwrap_or(3005),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = env_or("FLOWWAY_DATA_DIR", "data");
        Self {
            flow_storage_dir: format!("{}/flows", data_dir),
            context_db_path: format!("{}/context.db", data_dir),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: env_or("FLOWWAY_LOG_LEVEL", "info"),
            format: env_or("FLOWWAY_LOG_FORMAT", "text"),
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            engine: EngineConfig::default(),
            logging: LoggingConfig::default(),
            connectors: default_connectors(),
            instance_address: env_or("FLOWWAY_INSTANCE", "1"),
        }
    }
}

impl Config {
    /// Load a JSON config file; missing sections fall back to defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path.as_ref())?;
        let config: Config = serde_json::from_slice(&raw)?;
        if config.engine.pipeline_capacity == 0 {
            return Err(FlowError::Validation(
                "engine.pipeline_capacity must be greater than 0".into(),
            ));
        }
        Ok(config)
    }
}

/// Connector set used when the config file doesn't list any
pub fn default_connectors() -> Vec<ConnectorSpec> {
    vec![
        ConnectorSpec {
            name: "msgbus".into(),
            plugin: "bus".into(),
            config: json!({}),
        },
        ConnectorSpec {
            name: "httpserv".into(),
            plugin: "http".into(),
            config: json!({ "bind_address": env_or("FLOWWAY_HTTP_BIND", "0.0.0.0:8082") }),
        },
        ConnectorSpec {
            name: "scheduler".into(),
            plugin: "scheduler".into(),
            config: json!({}),
        },
    ]
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
