use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level service configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub service: ServiceSection,
}

/// Rendezvous server endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// TLS to the rendezvous server (plain TCP only for local development).
    #[serde(default = "default_true")]
    pub use_tls: bool,
    /// Extra PEM chain to trust besides the baked-in one.
    pub cert: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    /// Where settings and history files live.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Installed as a system service: enables the app-pipe watchdog.
    #[serde(default)]
    pub run_as_service: bool,
    /// Override the worker binary (defaults to re-executing our own image).
    pub worker_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            use_tls: true,
            cert: None,
        }
    }
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            run_as_service: false,
            worker_path: None,
        }
    }
}

fn default_server_host() -> String {
    "server.lanthing.net".to_string()
}

fn default_server_port() -> u16 {
    44898
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> String {
    std::env::var("LANTHING_DATA_DIR").unwrap_or_else(|_| "/var/lib/lanthing".to_string())
}

/// Load configuration, falling back to defaults when the file is absent.
pub fn load_config(path: &Path) -> Result<ServiceConfig> {
    if !path.exists() {
        return Ok(ServiceConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Failed to parse config at {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: ServiceConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.host, "server.lanthing.net");
        assert_eq!(config.server.port, 44898);
        assert!(config.server.use_tls);
        assert!(config.server.cert.is_none());
        assert!(!config.service.run_as_service);
        assert!(config.service.worker_path.is_none());
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: ServiceConfig = toml::from_str(
            r#"
            [server]
            host = "127.0.0.1"
            use_tls = false
            "#,
        )
        .unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(!config.server.use_tls);
        assert_eq!(config.server.port, 44898);
    }

    #[test]
    fn missing_file_is_defaults() {
        let config = load_config(Path::new("/nonexistent/lanthing.toml")).unwrap();
        assert_eq!(config.server.port, 44898);
    }
}
