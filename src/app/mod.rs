//! Application wiring
//!
//! Owns the shared service objects and threads them explicitly into the
//! proxy tasks and the inspection API.

mod config;

pub use config::{ApiConfig, Config, ProxyConfig, ReplayConfig, StoreConfig, TlsConfig};

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::capture::store::CaptureStore;
use crate::proxy::CertificateAuthority;
use crate::replay::ReplayClient;

/// Shared service context built once in `main` and cloned into each task
#[derive(Clone)]
pub struct Services {
    /// Per-host leaf certificate cache
    pub ca: Arc<CertificateAuthority>,

    /// Capture store shared by the proxy and the inspection API
    pub store: Arc<CaptureStore>,

    /// Replay user-agent
    pub replay: Arc<ReplayClient>,
}

impl Services {
    /// Construct all shared services from configuration.
    ///
    /// The certificate authority is built first so the replay client can
    /// pick up a freshly written `ca.crt` bundle.
    pub fn new(config: &Config) -> Result<Self> {
        let ca = CertificateAuthority::new(&config.tls)
            .context("Failed to initialize certificate authority")?;

        let store = match &config.store.persist_dir {
            Some(dir) => CaptureStore::with_persistence(dir)
                .context("Failed to open capture store")?,
            None => CaptureStore::new(),
        };

        let replay = ReplayClient::new(&config.replay, &config.tls.ca_cert_path())
            .context("Failed to build replay client")?;

        Ok(Self {
            ca: Arc::new(ca),
            store: Arc::new(store),
            replay: Arc::new(replay),
        })
    }
}
