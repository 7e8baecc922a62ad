//! Replay engine
//!
//! A TLS-capable user-agent for re-issuing captured requests. Redirects are
//! never followed so the initial response is returned as-is; timeouts are
//! fixed; trust anchors come from the local CA bundle, with certificate
//! verification optionally relaxed for self-signed targets.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::CertificateDer;

use crate::app::ReplayConfig;
use crate::capture::WireRequest;
use crate::error::ReplayError;

/// Result of one replayed exchange
#[derive(Debug)]
pub struct ReplayOutcome {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Replay user-agent, built once and shared
pub struct ReplayClient {
    client: reqwest::Client,
}

impl ReplayClient {
    /// Build the client from configuration and the CA bundle path
    pub fn new(config: &ReplayConfig, ca_bundle: &Path) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(config.timeout))
            .connect_timeout(Duration::from_secs(config.handshake_timeout))
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        if ca_bundle.exists() {
            let pem = std::fs::read(ca_bundle)
                .with_context(|| format!("Failed to read CA bundle {:?}", ca_bundle))?;
            for cert in CertificateDer::pem_slice_iter(&pem) {
                let cert = cert
                    .with_context(|| format!("Failed to parse CA bundle {:?}", ca_bundle))?;
                builder = builder.add_root_certificate(
                    reqwest::Certificate::from_der(cert.as_ref())
                        .context("Invalid CA certificate")?,
                );
            }
        } else {
            tracing::warn!(path = ?ca_bundle, "CA bundle not found, replay trusts no local root");
        }

        Ok(Self {
            client: builder.build().context("Failed to build replay client")?,
        })
    }

    /// Dispatch a recomposed request and read the full response
    pub async fn execute(&self, request: &WireRequest) -> Result<ReplayOutcome, ReplayError> {
        let method = reqwest::Method::from_str(&request.method)
            .map_err(|_| ReplayError::InvalidRequest(request.method.clone()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            // The transport computes Content-Length from the actual body
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            if let (Ok(name), Ok(value)) =
                (HeaderName::from_str(name), HeaderValue::from_str(value))
            {
                headers.append(name, value);
            }
        }

        let response = self
            .client
            .request(method, request.url.clone())
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(ReplayOutcome {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_client() -> ReplayClient {
        ReplayClient::new(
            &ReplayConfig::default(),
            Path::new("/nonexistent/ca.crt"),
        )
        .unwrap()
    }

    fn wire_get(url: &str) -> WireRequest {
        WireRequest {
            method: "GET".to_string(),
            url: url::Url::parse(url).unwrap(),
            headers: vec![("X-Probe".to_string(), "1".to_string())],
            body: Vec::new(),
        }
    }

    /// One-shot plaintext origin returning a canned response
    async fn spawn_origin(response: &'static str) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            stream.write_all(response.as_bytes()).await.unwrap();
        });
        addr
    }

    #[test]
    fn invalid_method_is_rejected() {
        let client = test_client();
        let mut request = wire_get("http://example.test/");
        request.method = "NOT A METHOD".to_string();
        let result = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(client.execute(&request));
        assert!(matches!(result, Err(ReplayError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn redirects_are_not_followed() {
        let addr = spawn_origin(
            "HTTP/1.1 302 Found\r\nLocation: http://0.0.0.0:1/elsewhere\r\nContent-Length: 0\r\n\r\n",
        )
        .await;

        let client = test_client();
        let outcome = client
            .execute(&wire_get(&format!("http://{}/start", addr)))
            .await
            .unwrap();

        assert_eq!(outcome.status, 302);
        assert!(outcome
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("location")));
    }

    #[tokio::test]
    async fn response_body_is_returned_verbatim() {
        let addr = spawn_origin(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello",
        )
        .await;

        let client = test_client();
        let outcome = client
            .execute(&wire_get(&format!("http://{}/", addr)))
            .await
            .unwrap();

        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.body, b"hello");
    }
}
