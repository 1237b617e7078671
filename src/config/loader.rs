use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::wire::{HEADER_LEN, MAX_FRAME_LEN};

use super::types::Config;

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading configuration");

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(yaml).context("failed to parse YAML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_connections == 0 {
            anyhow::bail!("limits.max_connections must be at least 1");
        }

        if self.limits.max_frame_len < HEADER_LEN {
            anyhow::bail!(
                "limits.max_frame_len must be at least {} bytes",
                HEADER_LEN
            );
        }

        if self.limits.max_frame_len > MAX_FRAME_LEN {
            anyhow::bail!(
                "limits.max_frame_len cannot exceed {} (u24 length prefix)",
                MAX_FRAME_LEN
            );
        }

        if let Some(token) = &self.auth.token {
            if token.is_empty() {
                anyhow::bail!("auth.token must not be empty when set");
            }
        }

        info!("configuration validated successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.server.address.port(), 7878);
        assert_eq!(config.limits.max_connections, 10_000);
        assert_eq!(config.limits.max_frame_len, MAX_FRAME_LEN);
        assert!(config.auth.token.is_none());
        assert_eq!(config.telemetry.log_level, "info");
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
server:
  address: "127.0.0.1:4040"

limits:
  max_connections: 256
  max_frame_len: 65536

auth:
  token: "hunter2"

telemetry:
  log_level: debug
  json_logs: true
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.server.address.to_string(), "127.0.0.1:4040");
        assert_eq!(config.limits.max_connections, 256);
        assert_eq!(config.limits.max_frame_len, 65_536);
        assert_eq!(config.auth.token.as_deref(), Some("hunter2"));
        assert!(config.telemetry.json_logs);
    }

    #[test]
    fn test_zero_connections_rejected() {
        let yaml = r#"
limits:
  max_connections: 0
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_oversized_frame_limit_rejected() {
        let yaml = r#"
limits:
  max_frame_len: 999999999
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_empty_token_rejected() {
        let yaml = r#"
auth:
  token: ""
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }
}
