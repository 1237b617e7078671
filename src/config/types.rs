use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Root configuration for the duplexd daemon
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listener settings
    #[serde(default)]
    pub server: ServerSection,

    /// Transport limits
    #[serde(default)]
    pub limits: LimitsSection,

    /// Setup authentication
    #[serde(default)]
    pub auth: AuthSection,

    /// Logging settings
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

/// Listener settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Bind address
    #[serde(default = "default_address")]
    pub address: SocketAddr,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: default_address(),
        }
    }
}

/// Transport limits
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum encoded frame size in bytes
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

/// Setup authentication
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    /// When set, setups must present this token as metadata
    #[serde(default)]
    pub token: Option<String>,
}

/// Logging settings
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetrySection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// JSON log format
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7878)
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_frame_len() -> usize {
    crate::wire::MAX_FRAME_LEN
}

fn default_log_level() -> String {
    "info".to_string()
}
