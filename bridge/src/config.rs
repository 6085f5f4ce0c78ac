//! Bridge configuration.
//!
//! Loaded from YAML; every field has a default so an empty file is valid.
//!
//! ```yaml
//! listen_addr: 0.0.0.0:1883
//! messaging_url: amqp://localhost:5672
//! container_id: mqtt-bridge
//! handshake_timeout_ms: 5000
//! max_packet_size: 1048576
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::codec::MAX_PACKET_SIZE;
use crate::error::{Error, Result};
use crate::session::{DEFAULT_HANDSHAKE_TIMEOUT, SessionOptions};

/// Default MQTT listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:1883";
/// Default messaging backbone URL.
pub const DEFAULT_MESSAGING_URL: &str = "amqp://localhost:5672";
/// Default AMQP container id.
pub const DEFAULT_CONTAINER_ID: &str = "mqtt-bridge";

const AMQP_PORT: u16 = 5672;
const AMQPS_PORT: u16 = 5671;

/// Bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// MQTT listen address (host:port).
    pub listen_addr: String,

    /// AMQP messaging backbone, `amqp://host[:port]`.
    pub messaging_url: String,

    /// AMQP container id announced by every session.
    pub container_id: String,

    /// Connect handshake deadline in milliseconds.
    pub handshake_timeout_ms: u64,

    /// Maximum MQTT packet size.
    pub max_packet_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            messaging_url: DEFAULT_MESSAGING_URL.to_string(),
            container_id: DEFAULT_CONTAINER_ID.to_string(),
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

impl BridgeConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::InvalidConfig(format!("parse: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&data)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_messaging_url(mut self, url: impl Into<String>) -> Self {
        self.messaging_url = url.into();
        self
    }

    pub fn with_container_id(mut self, id: impl Into<String>) -> Self {
        self.container_id = id.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Check every field.
    pub fn validate(&self) -> Result<()> {
        self.listen_socket_addr()?;
        self.messaging_endpoint()?;
        if self.container_id.is_empty() {
            return Err(Error::InvalidConfig("container_id is empty".to_string()));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(Error::InvalidConfig("handshake_timeout_ms must be positive".to_string()));
        }
        if self.max_packet_size == 0 {
            return Err(Error::InvalidConfig("max_packet_size must be positive".to_string()));
        }
        Ok(())
    }

    /// Parsed listen address.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("listen_addr {:?}: {}", self.listen_addr, e)))
    }

    /// Host and port of the messaging backbone.
    pub fn messaging_endpoint(&self) -> Result<(String, u16)> {
        let url = Url::parse(&self.messaging_url).map_err(|e| {
            Error::InvalidConfig(format!("messaging_url {:?}: {}", self.messaging_url, e))
        })?;

        let default_port = match url.scheme() {
            "amqp" => AMQP_PORT,
            "amqps" => AMQPS_PORT,
            other => {
                return Err(Error::InvalidConfig(format!(
                    "messaging_url scheme {:?} is not amqp or amqps",
                    other
                )));
            }
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidConfig("messaging_url has no host".to_string()))?;

        Ok((host.to_string(), url.port().unwrap_or(default_port)))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Options every bridge session is created with.
    pub fn session_options(&self) -> Result<SessionOptions> {
        let (host, port) = self.messaging_endpoint()?;
        Ok(SessionOptions::new(host, port)
            .with_container_id(self.container_id.clone())
            .with_handshake_timeout(self.handshake_timeout()))
    }
}
