//! Proxy server implementation

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use super::codec::{self, RawRequest, RawResponse};
use super::tls::CertificateAuthority;
use crate::app::ProxyConfig;
use crate::capture::store::CaptureStore;
use crate::capture::{decompose_request, decompose_response};
use crate::error::ProxyError;

/// Exact bytes acknowledging a CONNECT before the TLS upgrade
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.0 200 Connection Established\r\n\r\n";

/// Intercepting proxy listener
pub struct ProxyServer {
    config: ProxyConfig,
    ca: Arc<CertificateAuthority>,
    store: Arc<CaptureStore>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig, ca: Arc<CertificateAuthority>, store: Arc<CaptureStore>) -> Self {
        Self { config, ca, store }
    }

    /// Accept loop; one task per connection, raced against shutdown
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let addr = format!("{}:{}", self.config.listen_addr, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind proxy listener on {}", addr))?;

        tracing::info!("Proxy listening on {}", addr);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            tracing::debug!(%peer_addr, "Accepted proxy connection");

                            let ca = self.ca.clone();
                            let store = self.store.clone();
                            let config = self.config.clone();

                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, ca, store, config).await
                                {
                                    tracing::warn!(%peer_addr, error = %e, "Proxy connection error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Accept error");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Proxy listener shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Parse the first request and branch on plain relay vs CONNECT tunnel
async fn handle_connection(
    mut stream: TcpStream,
    ca: Arc<CertificateAuthority>,
    store: Arc<CaptureStore>,
    config: ProxyConfig,
) -> Result<()> {
    let request = {
        let mut reader = BufReader::new(&mut stream);
        match codec::read_request(&mut reader).await? {
            Some(request) => request,
            None => return Ok(()),
        }
    };

    tracing::info!(method = %request.method, target = %request.target, "Proxy request");

    if request.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(stream, request, ca, store, config).await
    } else {
        handle_plain(stream, request, store, config).await
    }
}

/// Plaintext path: one round trip per accepted connection
async fn handle_plain(
    mut stream: TcpStream,
    mut request: RawRequest,
    store: Arc<CaptureStore>,
    config: ProxyConfig,
) -> Result<()> {
    let (host, port, authority) = plain_target(&request)?;
    codec::prepare_for_upstream(&mut request, &authority);

    let mut upstream = connect_tcp(&host, port, config.connect_timeout).await?;
    relay_exchange(&mut stream, &mut upstream, &request, "http", &authority, &store).await?;

    Ok(())
}

/// CONNECT path: TLS upgrade with a minted leaf, then a request loop inside
/// the decrypted tunnel until either side closes
async fn handle_connect(
    mut stream: TcpStream,
    request: RawRequest,
    ca: Arc<CertificateAuthority>,
    store: Arc<CaptureStore>,
    config: ProxyConfig,
) -> Result<()> {
    let (host, port) = split_authority(&request.target, 443);

    stream.write_all(CONNECT_ESTABLISHED).await?;
    stream.flush().await?;

    let tls_config = ca.server_config(&host)?;
    let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| ProxyError::Tls(format!("client handshake: {}", e)))?;

    tracing::debug!(%host, "TLS upgrade complete");

    let mut client = BufReader::new(tls_stream);
    let mut upstream: Option<tokio_rustls::client::TlsStream<TcpStream>> = None;

    loop {
        let deadline = Duration::from_secs(config.tunnel_read_timeout);
        let mut inner = match tokio::time::timeout(deadline, codec::read_request(&mut client)).await
        {
            Err(_) => {
                tracing::debug!(%host, "Tunnel idle past read deadline, closing");
                break;
            }
            Ok(Ok(None)) => break,
            Ok(Ok(Some(request))) => request,
            Ok(Err(e)) => return Err(e).context("parsing tunneled request"),
        };

        let authority = inner
            .header("Host")
            .map(str::to_string)
            .unwrap_or_else(|| host.clone());
        codec::prepare_for_upstream(&mut inner, &authority);
        let client_wants_close = inner.wants_close();

        tracing::info!(method = %inner.method, %authority, target = %inner.target, "Tunneled request");

        if upstream.is_none() {
            upstream = Some(connect_tls(&host, port, config.connect_timeout).await?);
        }
        let origin = upstream.as_mut().expect("origin connection just set");

        let response =
            relay_exchange(client.get_mut(), origin, &inner, "https", &authority, &store).await?;

        if response.wants_close() {
            upstream = None;
        }
        if client_wants_close {
            break;
        }
    }

    Ok(())
}

/// Forward one prepared request to the origin, capture both sides, and
/// write the response back to the client. Capture failures never abort the
/// relay.
async fn relay_exchange<C, U>(
    client: &mut C,
    upstream: &mut U,
    request: &RawRequest,
    scheme: &str,
    authority: &str,
    store: &CaptureStore,
) -> Result<RawResponse>
where
    C: AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let request_id = match store.save_request(decompose_request(request, scheme, authority)) {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!(error = %e, "Request capture failed");
            None
        }
    };

    upstream
        .write_all(&request.to_bytes())
        .await
        .context("writing request to upstream")?;
    upstream.flush().await.context("flushing upstream")?;

    let response = {
        let mut reader = BufReader::new(&mut *upstream);
        codec::read_response(&mut reader, &request.method)
            .await
            .context("reading upstream response")?
    };

    if let Some(id) = &request_id {
        if let Err(e) = store.save_response(id, decompose_response(&response)) {
            tracing::warn!(error = %e, "Response capture failed");
        }
    }

    client
        .write_all(&response.to_bytes())
        .await
        .context("writing response to client")?;
    client.flush().await.context("flushing client")?;

    Ok(response)
}

/// Resolve host, port and authority for a plaintext request: from the
/// absolute-form target, falling back to the Host header
fn plain_target(request: &RawRequest) -> Result<(String, u16, String), ProxyError> {
    if request.target.starts_with("http://") || request.target.starts_with("https://") {
        let url = url::Url::parse(&request.target)
            .map_err(|e| ProxyError::Protocol(format!("invalid request target: {}", e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::Protocol("request target has no host".to_string()))?
            .to_string();
        let default_port = if url.scheme() == "https" { 443 } else { 80 };
        let port = url.port().unwrap_or(default_port);
        let authority = match url.port() {
            Some(explicit) => format!("{}:{}", host, explicit),
            None => host.clone(),
        };
        Ok((host, port, authority))
    } else {
        let authority = request
            .header("Host")
            .ok_or_else(|| ProxyError::Protocol("request has no Host header".to_string()))?
            .to_string();
        let (host, port) = split_authority(&authority, 80);
        Ok((host, port, authority))
    }
}

fn split_authority(authority: &str, default_port: u16) -> (String, u16) {
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (authority.to_string(), default_port),
        },
        None => (authority.to_string(), default_port),
    }
}

async fn connect_tcp(host: &str, port: u16, timeout_secs: u64) -> Result<TcpStream, ProxyError> {
    let target = format!("{}:{}", host, port);
    tracing::debug!(%target, "Connecting upstream");

    match tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        TcpStream::connect(&target),
    )
    .await
    {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::UpstreamConnect {
            target,
            reason: e.to_string(),
        }),
        Err(_) => Err(ProxyError::Timeout("connecting upstream")),
    }
}

async fn connect_tls(
    host: &str,
    port: u16,
    timeout_secs: u64,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ProxyError> {
    let tcp = connect_tcp(host, port, timeout_secs).await?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| ProxyError::Tls(format!("invalid server name {:?}", host)))?;

    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ProxyError::Tls(format!("origin handshake with {}: {}", host, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn client_request(target: &str, headers: &[(&str, &str)]) -> RawRequest {
        RawRequest {
            method: "GET".to_string(),
            target: target.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: Vec::new(),
        }
    }

    #[test]
    fn plain_target_from_absolute_form() {
        let request = client_request("http://example.test/hello", &[("Host", "example.test")]);
        let (host, port, authority) = plain_target(&request).unwrap();
        assert_eq!(host, "example.test");
        assert_eq!(port, 80);
        assert_eq!(authority, "example.test");

        let request = client_request("http://example.test:8081/x", &[]);
        let (_, port, authority) = plain_target(&request).unwrap();
        assert_eq!(port, 8081);
        assert_eq!(authority, "example.test:8081");
    }

    #[test]
    fn connect_authority_defaults_to_443() {
        assert_eq!(
            split_authority("api.test:443", 443),
            ("api.test".to_string(), 443)
        );
        assert_eq!(split_authority("api.test", 443), ("api.test".to_string(), 443));
    }

    #[tokio::test]
    async fn relay_forwards_and_captures_both_sides() {
        let store = CaptureStore::new();
        let (mut origin_side, mut proxy_side) = tokio::io::duplex(64 * 1024);

        let origin = tokio::spawn(async move {
            let seen = {
                let mut reader = BufReader::new(&mut origin_side);
                codec::read_request(&mut reader).await.unwrap().unwrap()
            };
            origin_side
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            seen
        });

        let mut request = client_request(
            "http://example.test/hello",
            &[
                ("Host", "example.test"),
                ("Proxy-Connection", "keep-alive"),
                ("Accept-Encoding", "gzip"),
            ],
        );
        codec::prepare_for_upstream(&mut request, "example.test");

        let mut client_out = std::io::Cursor::new(Vec::new());
        let response = relay_exchange(
            &mut client_out,
            &mut proxy_side,
            &request,
            "http",
            "example.test",
            &store,
        )
        .await
        .unwrap();

        // Upstream saw the mandatory header edits
        let seen = origin.await.unwrap();
        assert_eq!(seen.target, "/hello");
        assert!(seen.header("Proxy-Connection").is_none());
        assert!(seen.header("Accept-Encoding").is_none());
        assert_eq!(seen.header("Host"), Some("example.test"));

        // Client got the response verbatim
        assert_eq!(response.code, 200);
        let written = String::from_utf8(client_out.into_inner()).unwrap();
        assert!(written.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(written.ends_with("ok"));

        // Both records landed in the store, linked together
        let requests = store.list_requests(5);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].scheme, "http");
        assert_eq!(requests[0].path, "/hello");

        let stored = store.response_for_request(&requests[0].id).unwrap();
        assert_eq!(stored.code, 200);
        assert_eq!(stored.message, "OK");
        assert_eq!(stored.body, "ok");
    }

    #[tokio::test]
    async fn relay_handles_bodyless_response() {
        let store = CaptureStore::new();
        let (mut origin_side, mut proxy_side) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = origin_side.read(&mut buf).await;
            origin_side
                .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                .await
                .unwrap();
        });

        let mut request = client_request("http://example.test/", &[("Host", "example.test")]);
        codec::prepare_for_upstream(&mut request, "example.test");

        let mut client_out = std::io::Cursor::new(Vec::new());
        let response = relay_exchange(
            &mut client_out,
            &mut proxy_side,
            &request,
            "http",
            "example.test",
            &store,
        )
        .await
        .unwrap();
        assert_eq!(response.code, 204);
    }
}
