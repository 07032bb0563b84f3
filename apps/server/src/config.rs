//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use overtone_core::{Config, DeviceIdentity, RendererBackend, RewriteRules};

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port for the companion HTTP surface.
    /// Override: `OVERTONE_COMPANION_PORT`
    pub companion_port: u16,

    /// Local port the discovery beacon binds.
    /// Override: `OVERTONE_BEACON_PORT`
    pub beacon_port: u16,

    /// Address of the UPnP renderer device (`ip` or `ip:port`).
    /// Override: `OVERTONE_DEVICE_IP`
    pub device_ip: Option<String>,

    /// Name shown in controller device pickers. Defaults to the hostname.
    pub title: Option<String>,

    /// Interval between subscriber notification ticks (milliseconds).
    pub notify_interval_ms: u64,

    /// Interval the renderer monitor polls transport state at (milliseconds).
    pub monitor_interval_ms: u64,

    /// Force `http` on media URLs handed to the renderer.
    pub rewrite_http: bool,

    /// Replace the host of media URLs handed to the renderer.
    pub rewrite_host: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            companion_port: 32005,
            beacon_port: 32412,
            device_ip: None,
            title: None,
            notify_interval_ms: 500,
            monitor_interval_ms: 300,
            rewrite_http: false,
            rewrite_host: None,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("OVERTONE_COMPANION_PORT") {
            if let Ok(port) = val.parse() {
                self.companion_port = port;
            }
        }

        if let Ok(val) = std::env::var("OVERTONE_BEACON_PORT") {
            if let Ok(port) = val.parse() {
                self.beacon_port = port;
            }
        }

        if let Ok(val) = std::env::var("OVERTONE_DEVICE_IP") {
            if !val.is_empty() {
                self.device_ip = Some(val);
            }
        }
    }

    /// Converts to overtone-core's Config type.
    ///
    /// Fails when no renderer device is configured.
    pub fn to_core_config(&self) -> Result<Config> {
        let device_ip = self
            .device_ip
            .clone()
            .context("No renderer device configured. Set device_ip or OVERTONE_DEVICE_IP.")?;

        let mut identity = DeviceIdentity::default();
        if let Some(title) = &self.title {
            identity.title = title.clone();
        }

        Ok(Config {
            identity,
            companion_port: self.companion_port,
            beacon_port: self.beacon_port,
            notify_interval_ms: self.notify_interval_ms,
            monitor_interval_ms: self.monitor_interval_ms,
            renderer: RendererBackend::Upnp { device_ip },
            rewrite: RewriteRules {
                rewrite_http: self.rewrite_http,
                rewrite_host: self.rewrite_host.clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_ports() {
        let config = ServerConfig::default();
        assert_eq!(config.companion_port, 32005);
        assert_eq!(config.beacon_port, 32412);
    }

    #[test]
    fn to_core_config_requires_a_device() {
        let config = ServerConfig::default();
        assert!(config.to_core_config().is_err());

        let config = ServerConfig {
            device_ip: Some("192.168.1.50".to_string()),
            title: Some("Kitchen".to_string()),
            ..ServerConfig::default()
        };
        let core = config.to_core_config().unwrap();
        assert_eq!(core.identity.title, "Kitchen");
        assert!(matches!(
            core.renderer,
            RendererBackend::Upnp { ref device_ip } if device_ip == "192.168.1.50"
        ));
    }

    #[test]
    fn yaml_fields_deserialize() {
        let yaml = "companion_port: 40005\ndevice_ip: 10.0.0.4\nrewrite_http: true\n";
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.companion_port, 40005);
        assert_eq!(config.device_ip.as_deref(), Some("10.0.0.4"));
        assert!(config.rewrite_http);
        // Unset fields fall back to defaults.
        assert_eq!(config.beacon_port, 32412);
    }
}
