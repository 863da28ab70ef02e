//! Supervisor configuration
//!
//! Connection parameters are supplied once, at construction, either as a
//! struct literal, parsed from an `amqp://` URL, or loaded from a TOML file:
//!
//! ```toml
//! [connection]
//! host = "rabbit.internal"
//! vhost = "/orders"
//! username_env = "AMQP_USER"
//! password_env = "AMQP_PASSWORD"
//! prefetch_count = 10
//!
//! [reconnect]
//! max_attempts = 20
//! ```

use crate::transport::amqp::connection::ReconnectConfig;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use url::Url;

/// Top-level configuration file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Immutable broker connection parameters
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    /// Environment variable overriding `username` at load time
    pub username_env: Option<String>,
    /// Environment variable overriding `password` at load time
    pub password_env: Option<String>,
    /// Heartbeat interval in seconds (0 disables heartbeats)
    #[serde(default)]
    pub heartbeat_secs: u16,
    /// Maximum unacknowledged deliveries per consumer; unset means unlimited
    pub prefetch_count: Option<u16>,
    #[serde(default)]
    pub tls: bool,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5672
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_username() -> String {
    "guest".to_string()
}

fn default_password() -> String {
    "guest".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            vhost: default_vhost(),
            username: default_username(),
            password: default_password(),
            username_env: None,
            password_env: None,
            heartbeat_secs: 0,
            prefetch_count: None,
            tls: false,
        }
    }
}

// Never print the password.
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("username", &self.username)
            .field("password", &"***")
            .field("heartbeat_secs", &self.heartbeat_secs)
            .field("prefetch_count", &self.prefetch_count)
            .field("tls", &self.tls)
            .finish()
    }
}

/// Login credentials submitted during the handshake
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SupervisorConfig {
    /// Load configuration from TOML file with environment variable resolution
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: SupervisorConfig = toml::from_str(&content)?;

        config.connection.resolve_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;
        self.reconnect
            .validate()
            .map_err(ConfigError::InvalidConfig)
    }
}

impl ConnectionConfig {
    /// Parse `amqp[s]://user:pass@host:port/vhost?heartbeat=N&prefetch_count=M`
    ///
    /// A missing or bare `/` path selects the default vhost `/`; `%2f` encodes
    /// a literal slash inside the vhost name.
    pub fn from_url(broker_url: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidUrl(broker_url.to_string());
        let url = Url::parse(broker_url).map_err(|_| invalid())?;

        let tls = match url.scheme() {
            "amqp" => false,
            "amqps" => true,
            _ => return Err(invalid()),
        };

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(invalid)?
            .to_string();
        let port = url.port().unwrap_or(if tls { 5671 } else { 5672 });

        let mut config = ConnectionConfig {
            host,
            port,
            tls,
            ..Default::default()
        };

        if !url.username().is_empty() {
            config.username = decode_component(url.username()).ok_or_else(invalid)?;
            config.password = match url.password() {
                Some(password) => decode_component(password).ok_or_else(invalid)?,
                None => String::new(),
            };
        }

        let path = url.path();
        if !path.is_empty() && path != "/" {
            config.vhost = decode_component(&path[1..]).ok_or_else(invalid)?;
        }

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "heartbeat" => {
                    config.heartbeat_secs = value.parse().map_err(|_| invalid())?;
                }
                "prefetch_count" => {
                    config.prefetch_count = Some(value.parse().map_err(|_| invalid())?);
                }
                _ => {}
            }
        }

        Ok(config)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    /// `host:port`, for logging
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "connection.host must not be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "connection.port must be greater than 0".to_string(),
            ));
        }
        if self.prefetch_count == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "connection.prefetch_count must be greater than 0 or unset".to_string(),
            ));
        }
        Ok(())
    }

    /// Replace credentials with values from the configured environment variables
    fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(name) = &self.username_env {
            self.username = Self::get_env_var_required(name)?;
        }
        if let Some(name) = &self.password_env {
            self.password = Self::get_env_var_required(name)?;
        }
        Ok(())
    }

    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }
}

fn decode_component(raw: &str) -> Option<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}
