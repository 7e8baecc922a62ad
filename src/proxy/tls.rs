//! TLS certificate handling for HTTPS interception
//!
//! Maintains the per-host leaf certificate cache. All leaves share one
//! process-wide private key; the certificate side is minted on first sight
//! of a host, either by an external script or in-process with the root CA
//! key, and persisted under the certs directory so restarts warm the cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::app::TlsConfig;
use crate::error::ProxyError;

/// How a missing leaf certificate gets minted
enum LeafMinter {
    /// Run `<path> <host>` and capture a PEM certificate from stdout
    Script { path: PathBuf },

    /// Sign in-process with the root CA key
    BuiltIn {
        ca_cert: rcgen::Certificate,
        ca_key: KeyPair,
        leaf_key: KeyPair,
    },
}

/// Certificate authority cache shared by all proxy tasks
pub struct CertificateAuthority {
    /// Private key shared by every minted leaf, PEM form
    leaf_key_pem: String,

    minter: LeafMinter,

    certs_dir: PathBuf,

    /// host -> leaf certificate PEM. The lock is held across the entire
    /// mint so concurrent requests for the same novel host see exactly one
    /// mint.
    cache: Mutex<HashMap<String, String>>,
}

impl CertificateAuthority {
    /// Build the authority, loading root and leaf key material and warming
    /// the cache from previously minted certificates on disk.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.https_dir)
            .with_context(|| format!("Failed to create {:?}", config.https_dir))?;
        std::fs::create_dir_all(&config.certs_dir)
            .with_context(|| format!("Failed to create {:?}", config.certs_dir))?;

        let (minter, leaf_key_pem) = match &config.mint_script {
            Some(script) => {
                let key_pem = std::fs::read_to_string(config.leaf_key_path())
                    .with_context(|| {
                        format!("Failed to read leaf key {:?}", config.leaf_key_path())
                    })?;
                (LeafMinter::Script { path: script.clone() }, key_pem)
            }
            None => {
                let (ca_cert, ca_key) = load_or_generate_root(config)?;
                let leaf_key = load_or_generate_leaf_key(&config.leaf_key_path())?;
                let key_pem = leaf_key.serialize_pem();
                (
                    LeafMinter::BuiltIn {
                        ca_cert,
                        ca_key,
                        leaf_key,
                    },
                    key_pem,
                )
            }
        };

        let cache = load_cached_leaves(&config.certs_dir)?;
        if !cache.is_empty() {
            tracing::info!(count = cache.len(), "Warmed certificate cache from disk");
        }

        Ok(Self {
            leaf_key_pem,
            minter,
            certs_dir: config.certs_dir.clone(),
            cache: Mutex::new(cache),
        })
    }

    /// Return the leaf pair for `host`, minting and persisting on miss
    pub fn get(&self, host: &str) -> Result<(String, String), ProxyError> {
        let host = host.to_ascii_lowercase();

        let mut cache = self.cache.lock();
        if let Some(cert_pem) = cache.get(&host) {
            return Ok((cert_pem.clone(), self.leaf_key_pem.clone()));
        }

        tracing::info!(%host, "Minting certificate");
        let cert_pem = self.mint(&host)?;

        let cert_path = self.certs_dir.join(format!("{}.crt", host));
        std::fs::write(&cert_path, &cert_pem).map_err(|e| ProxyError::CertMintFailed {
            host: host.clone(),
            reason: format!("writing {:?}: {}", cert_path, e),
        })?;

        cache.insert(host, cert_pem.clone());
        Ok((cert_pem, self.leaf_key_pem.clone()))
    }

    /// rustls server configuration offering the single leaf for `host`
    pub fn server_config(&self, host: &str) -> Result<Arc<rustls::ServerConfig>, ProxyError> {
        let (cert_pem, key_pem) = self.get(host)?;

        let certs: Vec<CertificateDer<'static>> =
            CertificateDer::pem_slice_iter(cert_pem.as_bytes())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ProxyError::Tls(format!("parsing leaf certificate: {}", e)))?;

        let key = PrivateKeyDer::from_pem_slice(key_pem.as_bytes())
            .map_err(|e| ProxyError::Tls(format!("parsing leaf key: {}", e)))?;

        let mut tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ProxyError::Tls(e.to_string()))?;

        // No HTTP/2 interception; force the inner protocol to HTTP/1.1
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(tls_config))
    }

    fn mint(&self, host: &str) -> Result<String, ProxyError> {
        match &self.minter {
            LeafMinter::Script { path } => {
                let output = std::process::Command::new(path)
                    .arg(host)
                    .output()
                    .map_err(|e| ProxyError::CertMintFailed {
                        host: host.to_string(),
                        reason: format!("spawning {:?}: {}", path, e),
                    })?;

                if !output.status.success() {
                    return Err(ProxyError::CertMintFailed {
                        host: host.to_string(),
                        reason: String::from_utf8_lossy(&output.stderr).into_owned(),
                    });
                }
                if output.stdout.is_empty() {
                    return Err(ProxyError::CertMintEmpty {
                        host: host.to_string(),
                    });
                }

                String::from_utf8(output.stdout).map_err(|_| ProxyError::CertMintFailed {
                    host: host.to_string(),
                    reason: "mint output was not valid PEM text".to_string(),
                })
            }
            LeafMinter::BuiltIn {
                ca_cert,
                ca_key,
                leaf_key,
            } => sign_leaf(host, ca_cert, ca_key, leaf_key).map_err(|e| {
                ProxyError::CertMintFailed {
                    host: host.to_string(),
                    reason: e.to_string(),
                }
            }),
        }
    }
}

fn sign_leaf(
    host: &str,
    ca_cert: &rcgen::Certificate,
    ca_key: &KeyPair,
    leaf_key: &KeyPair,
) -> Result<String> {
    let mut params = CertificateParams::new(vec![host.to_string()])?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    let cert = params.signed_by(leaf_key, ca_cert, ca_key)?;
    Ok(cert.pem())
}

/// Root CA parameters, identical on generation and on key-only reload
fn root_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Constrained(0));
    params.key_usages = vec![
        rcgen::KeyUsagePurpose::DigitalSignature,
        rcgen::KeyUsagePurpose::KeyCertSign,
        rcgen::KeyUsagePurpose::CrlSign,
    ];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Remora Proxy CA");
    dn.push(DnType::OrganizationName, "Remora");
    params.distinguished_name = dn;
    params
}

fn load_or_generate_root(config: &TlsConfig) -> Result<(rcgen::Certificate, KeyPair)> {
    let key_path = config.ca_key_path();
    let cert_path = config.ca_cert_path();

    let ca_key = if key_path.exists() {
        let key_pem = std::fs::read_to_string(&key_path)
            .with_context(|| format!("Failed to read CA key {:?}", key_path))?;
        KeyPair::from_pem(&key_pem).context("Failed to parse CA private key")?
    } else {
        let key = KeyPair::generate().context("Failed to generate CA key")?;
        std::fs::write(&key_path, key.serialize_pem())
            .with_context(|| format!("Failed to write CA key {:?}", key_path))?;
        key
    };

    // The certificate is rebuilt from fixed parameters with the existing
    // key; the refreshed PEM keeps the replay trust bundle in sync.
    let ca_cert = root_params()
        .self_signed(&ca_key)
        .context("Failed to build CA certificate")?;
    std::fs::write(&cert_path, ca_cert.pem())
        .with_context(|| format!("Failed to write CA certificate {:?}", cert_path))?;

    Ok((ca_cert, ca_key))
}

fn load_or_generate_leaf_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        let key_pem = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read leaf key {:?}", path))?;
        KeyPair::from_pem(&key_pem).context("Failed to parse leaf private key")
    } else {
        let key = KeyPair::generate().context("Failed to generate leaf key")?;
        std::fs::write(path, key.serialize_pem())
            .with_context(|| format!("Failed to write leaf key {:?}", path))?;
        Ok(key)
    }
}

fn load_cached_leaves(certs_dir: &Path) -> Result<HashMap<String, String>> {
    let mut cache = HashMap::new();
    for entry in std::fs::read_dir(certs_dir)
        .with_context(|| format!("Failed to list {:?}", certs_dir))?
    {
        let path = entry?.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if let Some(host) = name.strip_suffix(".crt") {
            let pem = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read cached leaf {:?}", path))?;
            cache.insert(host.to_string(), pem);
        }
    }
    Ok(cache)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> (TlsConfig, PathBuf) {
        let root = std::env::temp_dir().join(format!("remora-ca-{}", uuid::Uuid::new_v4()));
        let config = TlsConfig {
            https_dir: root.join("https"),
            certs_dir: root.join("certs"),
            mint_script: None,
        };
        (config, root)
    }

    #[test]
    fn mints_and_caches_builtin_leaf() {
        let (config, root) = test_config();
        let ca = CertificateAuthority::new(&config).unwrap();

        let (cert, key) = ca.get("Example.COM").unwrap();
        assert!(cert.contains("BEGIN CERTIFICATE"));
        assert!(key.contains("PRIVATE KEY"));

        // Host keys are lowercased; the second call must hit the cache
        let (cert_again, key_again) = ca.get("example.com").unwrap();
        assert_eq!(cert, cert_again);
        assert_eq!(key, key_again);

        assert!(config.certs_dir.join("example.com.crt").exists());
        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn shared_key_across_hosts() {
        let (config, root) = test_config();
        let ca = CertificateAuthority::new(&config).unwrap();

        let (cert_a, key_a) = ca.get("a.test").unwrap();
        let (cert_b, key_b) = ca.get("b.test").unwrap();
        assert_ne!(cert_a, cert_b);
        assert_eq!(key_a, key_b);
        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn warm_start_skips_minting() {
        let (config, root) = test_config();
        {
            let ca = CertificateAuthority::new(&config).unwrap();
            ca.get("warm.test").unwrap();
        }

        // Second authority in the same directories; a failing script minter
        // proves the cached leaf is served without minting.
        let script_config = TlsConfig {
            mint_script: Some(PathBuf::from("/nonexistent/mint.sh")),
            ..config.clone()
        };
        let ca = CertificateAuthority::new(&script_config).unwrap();
        let (cert, _) = ca.get("warm.test").unwrap();
        assert!(cert.contains("BEGIN CERTIFICATE"));

        assert!(matches!(
            ca.get("cold.test"),
            Err(ProxyError::CertMintFailed { .. })
        ));
        std::fs::remove_dir_all(root).ok();
    }

    #[cfg(unix)]
    #[test]
    fn script_minter_runs_once_per_host() {
        use std::os::unix::fs::PermissionsExt;

        let (config, root) = test_config();
        // Seed the shared leaf key the script minter expects on disk
        {
            let ca = CertificateAuthority::new(&config).unwrap();
            drop(ca);
        }

        let counter = root.join("mint-count");
        let script = root.join("gen.sh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho run >> {}\necho '-----BEGIN CERTIFICATE-----'\necho \"$1\"\necho '-----END CERTIFICATE-----'\n",
                counter.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = TlsConfig {
            mint_script: Some(script),
            ..config
        };
        let ca = CertificateAuthority::new(&config).unwrap();
        ca.get("scripted.test").unwrap();
        ca.get("scripted.test").unwrap();

        let runs = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(runs.lines().count(), 1);
        std::fs::remove_dir_all(root).ok();
    }

    #[cfg(unix)]
    #[test]
    fn empty_script_output_is_an_error() {
        use std::os::unix::fs::PermissionsExt;

        let (config, root) = test_config();
        {
            CertificateAuthority::new(&config).unwrap();
        }

        let script = root.join("empty.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = TlsConfig {
            mint_script: Some(script),
            ..config
        };
        let ca = CertificateAuthority::new(&config).unwrap();
        assert!(matches!(
            ca.get("empty.test"),
            Err(ProxyError::CertMintEmpty { .. })
        ));
        std::fs::remove_dir_all(root).ok();
    }
}
