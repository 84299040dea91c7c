/// Configuration management for pasarela

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use crate::core::{BackendAlgo, BackendConfig, BackendState, BackendType, MAX_GROUP_SLAVES};
use crate::utils::parse_backend_address;

pub use crate::error::ConfigError;

/// Main pasarela configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backend servers and selection policy
    pub backends: BackendsConfig,
    /// Per-backend pool and session defaults
    #[serde(default)]
    pub pool: BackendConfig,
    /// Health check configuration
    pub health: HealthConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Backend list and read-only selection policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    /// Policy for read-only picks
    #[serde(default)]
    pub algorithm: BackendAlgo,
    pub servers: Vec<ServerConfig>,
}

/// One upstream server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `host:port`, optionally suffixed with `@group`
    pub address: String,
    #[serde(rename = "type")]
    pub backend_type: BackendType,
    /// Initial state, unknown until the first health sweep when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<BackendState>,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Health check interval in seconds
    pub interval_sec: u64,
    /// Health check timeout in seconds
    pub timeout_sec: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (text, compact)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backends: BackendsConfig {
                algorithm: BackendAlgo::RoundRobin,
                servers: vec![ServerConfig {
                    address: "127.0.0.1:3306".to_string(),
                    backend_type: BackendType::ReadWrite,
                    state: None,
                }],
            },
            pool: BackendConfig::default(),
            health: HealthConfig {
                interval_sec: 10,
                timeout_sec: 3,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        log::debug!("Loaded configuration with {} servers", config.backends.servers.len());
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate backend list
        if self.backends.servers.is_empty() {
            return Err(ConfigError::ValidationError("servers cannot be empty".to_string()));
        }

        let mut seen = HashSet::new();
        let mut primaries: HashMap<String, usize> = HashMap::new();
        let mut replicas: HashMap<String, usize> = HashMap::new();

        for server in &self.backends.servers {
            let parsed = parse_backend_address(&server.address)
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

            if !seen.insert(parsed.address.clone()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate server address: {}",
                    parsed.address
                )));
            }

            if server.backend_type == BackendType::Unknown {
                return Err(ConfigError::ValidationError(format!(
                    "Server {} must be of type rw or ro",
                    server.address
                )));
            }

            if server.state == Some(BackendState::Deleted) {
                return Err(ConfigError::ValidationError(format!(
                    "Server {} cannot start in state deleted",
                    server.address
                )));
            }

            if let Some(group) = parsed.group {
                let counter = match server.backend_type {
                    BackendType::ReadWrite => &mut primaries,
                    _ => &mut replicas,
                };
                *counter.entry(group).or_default() += 1;
            }
        }

        if let Some((group, _)) = primaries.iter().find(|(_, count)| **count > 1) {
            return Err(ConfigError::ValidationError(format!(
                "Group {} has more than one rw server",
                group
            )));
        }

        if let Some((group, _)) = replicas.iter().find(|(_, count)| **count > MAX_GROUP_SLAVES) {
            return Err(ConfigError::ValidationError(format!(
                "Group {} has more than {} ro servers",
                group,
                MAX_GROUP_SLAVES
            )));
        }

        // Validate pool config
        if self.pool.max_conn_pool == 0 {
            return Err(ConfigError::ValidationError(
                "max_conn_pool must be greater than 0".to_string(),
            ));
        }

        if self.pool.mid_conn_pool > self.pool.max_conn_pool {
            return Err(ConfigError::ValidationError(
                "mid_conn_pool must not exceed max_conn_pool".to_string(),
            ));
        }

        // Validate health config
        if self.health.interval_sec == 0 {
            return Err(ConfigError::ValidationError(
                "health check interval_sec must be greater than 0".to_string(),
            ));
        }

        if self.health.timeout_sec == 0 {
            return Err(ConfigError::ValidationError(
                "health check timeout_sec must be greater than 0".to_string(),
            ));
        }

        if self.health.timeout_sec >= self.health.interval_sec {
            return Err(ConfigError::ValidationError(
                "health check timeout_sec must be less than interval_sec".to_string(),
            ));
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "text" | "compact" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, layout: &str) -> Result<(), ConfigError> {
        let server = |address: &str, backend_type| ServerConfig {
            address: address.to_string(),
            backend_type,
            state: None,
        };

        let config = match layout {
            "single" => Config {
                backends: BackendsConfig {
                    algorithm: BackendAlgo::RoundRobin,
                    servers: vec![
                        server("10.0.1.10:3306", BackendType::ReadWrite),
                        server("10.0.1.11:3306", BackendType::ReadOnly),
                        server("10.0.1.12:3306", BackendType::ReadOnly),
                    ],
                },
                ..Default::default()
            },
            "grouped" => Config {
                backends: BackendsConfig {
                    algorithm: BackendAlgo::RoundRobin,
                    servers: vec![
                        server("10.0.1.10:3306@shard1", BackendType::ReadWrite),
                        server("10.0.1.11:3306@shard1", BackendType::ReadOnly),
                        server("10.0.1.12:3306@shard1", BackendType::ReadOnly),
                        server("10.0.2.10:3306@shard2", BackendType::ReadWrite),
                        server("10.0.2.11:3306@shard2", BackendType::ReadOnly),
                    ],
                },
                ..Default::default()
            },
            _ => {
                return Err(ConfigError::ValidationError(
                    "Layout must be 'single' or 'grouped'".to_string(),
                ))
            }
        };

        config.save_to_file(path)
    }
}
