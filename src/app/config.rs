//! Application configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Proxy listener settings
    pub proxy: ProxyConfig,

    /// Inspection API settings
    pub api: ApiConfig,

    /// TLS interception settings
    pub tls: TlsConfig,

    /// Replay client settings
    pub replay: ReplayConfig,

    /// Capture store settings
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy listen address
    pub listen_addr: String,

    /// Proxy listen port
    pub port: u16,

    /// Upstream connect timeout in seconds
    pub connect_timeout: u64,

    /// Read deadline for requests inside a decrypted tunnel, in seconds
    pub tunnel_read_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API listen address
    pub listen_addr: String,

    /// API listen port
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Directory holding the root CA material and the shared leaf key
    /// (`ca.crt`, `ca.key`, `cert.key`)
    pub https_dir: PathBuf,

    /// Directory caching minted per-host leaf certificates (`<host>.crt`)
    pub certs_dir: PathBuf,

    /// External minting command invoked as `<script> <host>`, emitting a
    /// PEM leaf on stdout. When unset, leaves are signed in-process with
    /// the root CA key.
    pub mint_script: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Overall per-request timeout in seconds
    pub timeout: u64,

    /// Connect/TLS-handshake timeout in seconds
    pub handshake_timeout: u64,

    /// Accept invalid upstream certificates. On by default so that
    /// self-signed and broken-TLS targets stay reachable during testing.
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory for capture snapshots; unset keeps the store in memory only
    pub persist_dir: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            port: 8080,
            connect_timeout: 10,
            tunnel_read_timeout: 10,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            https_dir: PathBuf::from("https"),
            certs_dir: PathBuf::from("certs"),
            mint_script: None,
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            timeout: 10,
            handshake_timeout: 5,
            accept_invalid_certs: true,
        }
    }
}

impl TlsConfig {
    /// Path of the private key shared by all minted leaves
    pub fn leaf_key_path(&self) -> PathBuf {
        self.https_dir.join("cert.key")
    }

    /// Path of the root CA certificate bundle
    pub fn ca_cert_path(&self) -> PathBuf {
        self.https_dir.join("ca.crt")
    }

    /// Path of the root CA private key
    pub fn ca_key_path(&self) -> PathBuf {
        self.https_dir.join("ca.key")
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults when the file
    /// does not exist
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(p),
            None => PathBuf::from("remora.toml"),
        };

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config from {:?}", config_path))?;

            let config: Config = toml::from_str(&contents)
                .with_context(|| "Failed to parse configuration file")?;

            tracing::info!("Loaded configuration from {:?}", config_path);
            Ok(config)
        } else {
            tracing::info!("No configuration file found, using defaults");
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_contract() {
        let config = Config::default();
        assert_eq!(config.proxy.port, 8080);
        assert_eq!(config.api.port, 8000);
        assert_eq!(config.replay.timeout, 10);
        assert_eq!(config.replay.handshake_timeout, 5);
        assert!(config.replay.accept_invalid_certs);
        assert_eq!(config.tls.leaf_key_path(), PathBuf::from("https/cert.key"));
        assert_eq!(config.tls.ca_cert_path(), PathBuf::from("https/ca.crt"));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str("[proxy]\nport = 9090\n").unwrap();
        assert_eq!(config.proxy.port, 9090);
        assert_eq!(config.api.port, 8000);
        assert_eq!(config.tls.certs_dir, PathBuf::from("certs"));
    }
}
