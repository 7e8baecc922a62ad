//! HTTP/1.1 message codec
//!
//! Parses requests and responses from buffered async streams and serializes
//! them back. The serializer is byte-faithful: header order and casing are
//! preserved as parsed, bodies are written verbatim. De-chunked responses
//! are re-emitted with a correct `Content-Length`.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::ProxyError;

/// A parsed HTTP/1.1 request with the body fully read into memory
#[derive(Debug, Clone)]
pub struct RawRequest {
    /// HTTP method, as sent
    pub method: String,

    /// Request target: absolute-form, origin-form, or authority-form
    pub target: String,

    /// Protocol version token, e.g. `HTTP/1.1`
    pub version: String,

    /// Ordered header pairs; duplicates allowed
    pub headers: Vec<(String, String)>,

    /// Raw body bytes
    pub body: Vec<u8>,
}

/// A parsed HTTP/1.1 response with the body fully read into memory
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub version: String,

    /// Numeric status code
    pub code: u16,

    /// Reason phrase, possibly empty
    pub reason: String,

    pub headers: Vec<(String, String)>,

    pub body: Vec<u8>,
}

impl RawRequest {
    /// First header value for `name`, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }

    /// Remove every occurrence of `name`
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Replace the first occurrence of `name` in place, dropping later
    /// duplicates; appends when the header is absent
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self.headers.iter().position(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(pos) => {
                self.headers[pos].1 = value.to_string();
                let mut index = 0;
                self.headers.retain(|(k, _)| {
                    let keep = index <= pos || !k.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
            }
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    /// Wants-close check for the keep-alive loop
    pub fn wants_close(&self) -> bool {
        connection_close(&self.headers, &self.version)
    }

    /// Serialize to wire form
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        let has_length = header_get(&self.headers, "Content-Length").is_some();
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        if !self.body.is_empty() && !has_length {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }

    pub fn wants_close(&self) -> bool {
        connection_close(&self.headers, &self.version)
    }

    /// Serialize to wire form.
    ///
    /// `Transfer-Encoding` and `Content-Length` are dropped in favor of a
    /// `Content-Length` computed from the de-chunked body, emitted whenever
    /// the original response carried a body length mechanism or a body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let had_length = header_get(&self.headers, "Content-Length").is_some()
            || header_get(&self.headers, "Transfer-Encoding").is_some();

        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.version, self.code, self.reason).as_bytes(),
        );
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("Transfer-Encoding")
                || name.eq_ignore_ascii_case("Content-Length")
            {
                continue;
            }
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        if had_length || !self.body.is_empty() {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// Mandatory header edits on a request about to be forwarded upstream:
/// drop `Proxy-Connection` and `Accept-Encoding`, pin `Host` to the target
/// authority, and rewrite the target to origin form.
pub fn prepare_for_upstream(req: &mut RawRequest, authority: &str) {
    req.remove_header("Proxy-Connection");
    req.remove_header("Accept-Encoding");
    req.set_header("Host", authority);

    let target = req.target.clone();
    if let Some(rest) = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
    {
        req.target = match rest.find('/') {
            Some(index) => rest[index..].to_string(),
            None => "/".to_string(),
        };
    }
}

/// Read one request head and body from the stream.
///
/// Returns `Ok(None)` on clean EOF before the first byte of a request line,
/// so keep-alive loops can distinguish a closed connection from a protocol
/// error.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<RawRequest>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut request_line = String::new();
    let read = reader.read_line(&mut request_line).await?;
    if read == 0 {
        return Ok(None);
    }

    let line = request_line.trim_end_matches(['\r', '\n']);
    let mut parts = line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v.to_string()),
        _ => {
            return Err(ProxyError::Protocol(format!(
                "invalid request line: {:?}",
                line
            )))
        }
    };

    let headers = read_headers(reader).await?;

    let body = if method.eq_ignore_ascii_case("CONNECT") {
        Vec::new()
    } else if is_chunked(&headers) {
        read_chunked_body(reader).await?
    } else {
        match content_length(&headers)? {
            Some(length) => read_exact_body(reader, length).await?,
            None => Vec::new(),
        }
    };

    Ok(Some(RawRequest {
        method,
        target,
        version,
        headers,
        body,
    }))
}

/// Read one response head and body from the stream.
///
/// `request_method` decides whether a body can follow at all (HEAD cannot).
pub async fn read_response<R>(
    reader: &mut R,
    request_method: &str,
) -> Result<RawResponse, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut status_line = String::new();
    let read = reader.read_line(&mut status_line).await?;
    if read == 0 {
        return Err(ProxyError::Protocol(
            "connection closed before status line".to_string(),
        ));
    }

    let line = status_line.trim_end_matches(['\r', '\n']);
    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .filter(|v| v.starts_with("HTTP/"))
        .ok_or_else(|| ProxyError::Protocol(format!("invalid status line: {:?}", line)))?
        .to_string();
    let code: u16 = parts
        .next()
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| ProxyError::Protocol(format!("invalid status line: {:?}", line)))?;
    let reason = parts.next().unwrap_or("").to_string();

    let headers = read_headers(reader).await?;

    let body = if !response_allows_body(code) || request_method.eq_ignore_ascii_case("HEAD") {
        Vec::new()
    } else if is_chunked(&headers) {
        read_chunked_body(reader).await?
    } else if let Some(length) = content_length(&headers)? {
        read_exact_body(reader, length).await?
    } else if connection_close(&headers, &version) {
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await?;
        body
    } else {
        Vec::new()
    };

    Ok(RawResponse {
        version,
        code,
        reason,
        headers,
        body,
    })
}

async fn read_headers<R>(reader: &mut R) -> Result<Vec<(String, String)>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(ProxyError::Protocol(
                "connection closed inside header block".to_string(),
            ));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::Protocol(format!("invalid header line: {:?}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

async fn read_exact_body<R>(reader: &mut R, length: usize) -> Result<Vec<u8>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Vec<u8>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        reader.read_line(&mut size_line).await?;
        let size_token = size_line
            .trim()
            .split(';')
            .next()
            .unwrap_or("")
            .to_string();
        let size = usize::from_str_radix(&size_token, 16).map_err(|_| {
            ProxyError::Protocol(format!("invalid chunk size: {:?}", size_line.trim()))
        })?;

        if size == 0 {
            // Trailer section, discarded
            loop {
                let mut trailer = String::new();
                let read = reader.read_line(&mut trailer).await?;
                if read == 0 || trailer.trim().is_empty() {
                    break;
                }
            }
            break;
        }

        let mut chunk = vec![0u8; size];
        reader.read_exact(&mut chunk).await?;
        body.extend_from_slice(&chunk);

        let mut crlf = String::new();
        reader.read_line(&mut crlf).await?;
    }
    Ok(body)
}

fn header_get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn is_chunked(headers: &[(String, String)]) -> bool {
    header_get(headers, "Transfer-Encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

fn content_length(headers: &[(String, String)]) -> Result<Option<usize>, ProxyError> {
    match header_get(headers, "Content-Length") {
        Some(value) => value
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ProxyError::Protocol(format!("invalid Content-Length: {:?}", value))),
        None => Ok(None),
    }
}

fn connection_close(headers: &[(String, String)], version: &str) -> bool {
    match header_get(headers, "Connection") {
        Some(value) => value.to_ascii_lowercase().contains("close"),
        None => version == "HTTP/1.0",
    }
}

fn response_allows_body(code: u16) -> bool {
    !(code < 200 || code == 204 || code == 304)
}
