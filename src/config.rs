// src/config.rs
//! Construction parameters of an ICE connection

use std::fmt;
use std::path::Path;
use serde::{Serialize, Deserialize};

use crate::error::{IceError, IceResult};

/// Default STUN port (RFC 8489)
pub const DEFAULT_STUN_PORT: u16 = 3478;

/// Upper bound on components per connection
pub const MAX_COMPONENTS: u32 = 256;

/// Media carried by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
    Data,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Data => "data",
        };
        write!(f, "{s}")
    }
}

/// Immutable identity of one ICE connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Media type of the connection
    pub media_type: MediaType,

    /// Transport label, used for logging only
    pub transport_name: String,

    /// Number of ICE components (1 with rtcp-mux)
    pub ice_components: u32,

    /// STUN server host, empty when none
    pub stun_server: String,

    /// STUN server port
    pub stun_port: u16,

    /// Lowest local port the engine may bind
    pub min_port: u16,

    /// Highest local port the engine may bind
    pub max_port: u16,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            media_type: MediaType::Audio,
            transport_name: "rtp".to_string(),
            ice_components: 1,
            stun_server: String::new(),
            stun_port: DEFAULT_STUN_PORT,
            min_port: 0,
            max_port: u16::MAX,
        }
    }
}

impl ConnectionConfig {
    /// Create config with defaults for everything but identity
    pub fn new(media_type: MediaType, transport_name: impl Into<String>) -> Self {
        Self {
            media_type,
            transport_name: transport_name.into(),
            ..Default::default()
        }
    }

    pub fn with_components(mut self, ice_components: u32) -> Self {
        self.ice_components = ice_components;
        self
    }

    pub fn with_stun_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.stun_server = host.into();
        self.stun_port = port;
        self
    }

    pub fn with_port_range(mut self, min_port: u16, max_port: u16) -> Self {
        self.min_port = min_port;
        self.max_port = max_port;
        self
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(s: &str) -> IceResult<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> IceResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&contents)
    }

    /// Check parameters the connection itself depends on
    pub fn validate(&self) -> IceResult<()> {
        if self.ice_components == 0 || self.ice_components > MAX_COMPONENTS {
            return Err(IceError::Configuration(format!(
                "ice_components must be between 1 and {}, got {}",
                MAX_COMPONENTS, self.ice_components
            )));
        }

        if self.min_port > self.max_port {
            return Err(IceError::Configuration(format!(
                "Invalid port range {}-{}",
                self.min_port, self.max_port
            )));
        }

        Ok(())
    }

    /// `host:port` of the STUN server, if one is configured
    pub fn stun_address(&self) -> Option<String> {
        if self.stun_server.is_empty() {
            None
        } else {
            Some(format!("{}:{}", self.stun_server, self.stun_port))
        }
    }

    pub fn port_range_is_unrestricted(&self) -> bool {
        self.min_port == 0 && self.max_port == u16::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::new(MediaType::Video, "video_rtp");
        assert_eq!(config.ice_components, 1);
        assert_eq!(config.stun_port, 3478);
        assert_eq!((config.min_port, config.max_port), (0, 65535));
        assert!(config.port_range_is_unrestricted());
        assert_eq!(config.stun_address(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = ConnectionConfig::from_json(
            r#"{"media_type": "video", "ice_components": 2, "stun_server": "stun.example.org"}"#,
        ).unwrap();

        assert_eq!(config.media_type, MediaType::Video);
        assert_eq!(config.ice_components, 2);
        assert_eq!(config.stun_address().as_deref(), Some("stun.example.org:3478"));
        assert_eq!(config.transport_name, "rtp");
    }

    #[test]
    fn test_validation() {
        let config = ConnectionConfig::default().with_components(0);
        assert!(matches!(config.validate(), Err(IceError::Configuration(_))));

        let config = ConnectionConfig::default().with_port_range(5000, 4000);
        assert!(config.validate().is_err());

        let config = ConnectionConfig::default().with_port_range(5000, 5010);
        assert!(config.validate().is_ok());
        assert!(!config.port_range_is_unrestricted());

        assert!(ConnectionConfig::from_json(r#"{"ice_components": 0}"#).is_err());
        assert!(matches!(ConnectionConfig::from_json("{"), Err(IceError::Json(_))));
    }
}
