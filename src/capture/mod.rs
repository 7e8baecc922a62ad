//! Capture model
//!
//! Decomposes live requests and responses into structured records and
//! recomposes a stored request into a replayable wire form.

pub mod store;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ProxyError;
use crate::proxy::codec::{RawRequest, RawResponse};

/// A captured value that is either a single string or an ordered sequence.
///
/// Serializes untagged, so single values render as JSON strings and
/// sequences as arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Single(String),
    Multi(Vec<String>),
}

impl ParamValue {
    /// First value in the sequence
    pub fn first(&self) -> &str {
        match self {
            ParamValue::Single(v) => v,
            ParamValue::Multi(vs) => vs.first().map(String::as_str).unwrap_or(""),
        }
    }

    fn push(&mut self, value: String) {
        match self {
            ParamValue::Single(existing) => {
                *self = ParamValue::Multi(vec![std::mem::take(existing), value]);
            }
            ParamValue::Multi(vs) => vs.push(value),
        }
    }
}

/// Decomposed snapshot of a captured request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Store-assigned identifier
    pub id: String,

    /// `http` or `https`
    pub scheme: String,

    /// Authority as the client supplied it
    pub host: String,

    pub method: String,

    pub path: String,

    pub get_params: BTreeMap<String, ParamValue>,

    /// Populated iff the body was `application/x-www-form-urlencoded`
    pub post_params: BTreeMap<String, ParamValue>,

    /// Raw body, present iff `post_params` was not extracted
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub body: Option<String>,

    /// Captured headers, `Cookie` excluded
    pub headers: BTreeMap<String, ParamValue>,

    /// Cookie name -> value, last write wins on duplicates
    pub cookies: BTreeMap<String, String>,
}

/// Decomposed snapshot of a captured response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub id: String,

    /// Id of the request this response answered
    pub request_id: String,

    pub code: u16,

    /// Reason phrase without the leading numeric code
    pub message: String,

    pub headers: BTreeMap<String, ParamValue>,

    pub body: String,
}

/// Recomposed live form of a stored request
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub method: String,
    pub url: Url,
    /// Ordered header pairs; duplicates allowed
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl WireRequest {
    /// Lower into the codec's raw form with an origin-form target
    pub fn to_raw(&self) -> RawRequest {
        let mut target = self.url.path().to_string();
        if let Some(query) = self.url.query() {
            target.push('?');
            target.push_str(query);
        }

        // The serializer recomputes Content-Length; a stored value may be
        // stale after form re-encoding or probe substitution
        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case("Content-Length"))
            .cloned()
            .collect();
        if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("Host")) {
            let mut authority = self.url.host_str().unwrap_or("").to_string();
            if let Some(port) = self.url.port() {
                authority.push_str(&format!(":{}", port));
            }
            headers.insert(0, ("Host".to_string(), authority));
        }

        RawRequest {
            method: self.method.clone(),
            target,
            version: "HTTP/1.1".to_string(),
            headers,
            body: self.body.clone(),
        }
    }
}

/// Decompose a parsed request into a record.
///
/// The caller passes the request as it was prepared for the upstream, so
/// the record reflects what was actually sent. The query string is
/// canonicalized (`;` separators rewritten to `&`) before extraction.
pub fn decompose_request(raw: &RawRequest, scheme: &str, host: &str) -> RequestRecord {
    let (path, query) = match raw.target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.replace(';', "&")),
        None => (raw.target.clone(), String::new()),
    };

    let get_params = parse_params(query.as_bytes());

    let mut headers: BTreeMap<String, ParamValue> = BTreeMap::new();
    let mut cookies: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in &raw.headers {
        if name.eq_ignore_ascii_case("Cookie") {
            parse_cookies(value, &mut cookies);
        } else {
            fold_param(&mut headers, canonical_header_name(name), value.clone());
        }
    }

    let mut post_params = BTreeMap::new();
    let mut body = None;
    if is_form_urlencoded(raw.header("Content-Type")) && !raw.body.is_empty() {
        post_params = parse_params(&raw.body);
    } else if !raw.body.is_empty() {
        body = Some(String::from_utf8_lossy(&raw.body).into_owned());
    }

    RequestRecord {
        id: String::new(),
        scheme: scheme.to_string(),
        host: host.to_string(),
        method: raw.method.clone(),
        path,
        get_params,
        post_params,
        body,
        headers,
        cookies,
    }
}

/// Decompose a parsed response into a record; `request_id` and `id` are
/// filled in by the store.
pub fn decompose_response(raw: &RawResponse) -> ResponseRecord {
    let mut headers = BTreeMap::new();
    for (name, value) in &raw.headers {
        fold_param(&mut headers, canonical_header_name(name), value.clone());
    }

    ResponseRecord {
        id: String::new(),
        request_id: String::new(),
        code: raw.code,
        message: raw.reason.clone(),
        headers,
        body: String::from_utf8_lossy(&raw.body).into_owned(),
    }
}

/// Rebuild a live request from a stored record
pub fn recompose(record: &RequestRecord) -> Result<WireRequest, ProxyError> {
    let mut path = record.path.clone();
    if !path.starts_with('/') {
        path.insert(0, '/');
    }

    let mut url = Url::parse(&format!("{}://{}{}", record.scheme, record.host, path))
        .map_err(|e| ProxyError::Protocol(format!("stored request has no valid URL: {}", e)))?;

    if !record.get_params.is_empty() {
        url.set_query(Some(&encode_params(&record.get_params)));
    }

    let mut headers = Vec::new();
    for (name, value) in &record.headers {
        match value {
            ParamValue::Single(v) => headers.push((name.clone(), v.clone())),
            ParamValue::Multi(vs) => {
                for v in vs {
                    headers.push((name.clone(), v.clone()));
                }
            }
        }
    }

    if !record.cookies.is_empty() {
        let cookie = record
            .cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ");
        headers.push(("Cookie".to_string(), cookie));
    }

    let content_type = record
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("Content-Type"))
        .map(|(_, value)| value.first());

    let body = if is_form_urlencoded(content_type) {
        encode_params(&record.post_params).into_bytes()
    } else {
        record.body.clone().unwrap_or_default().into_bytes()
    };

    Ok(WireRequest {
        method: record.method.clone(),
        url,
        headers,
        body,
    })
}

/// Parse a canonical `&`-separated parameter string into one-or-many values
pub fn parse_params(input: &[u8]) -> BTreeMap<String, ParamValue> {
    let mut params = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(input) {
        fold_param(&mut params, key.into_owned(), value.into_owned());
    }
    params
}

/// Encode one-or-many values back into a parameter string, keys in sorted
/// order and sequences in order
pub fn encode_params(params: &BTreeMap<String, ParamValue>) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        match value {
            ParamValue::Single(v) => {
                serializer.append_pair(key, v);
            }
            ParamValue::Multi(vs) => {
                for v in vs {
                    serializer.append_pair(key, v);
                }
            }
        }
    }
    serializer.finish()
}

/// Canonical display form of a header name: each dash-separated segment
/// capitalized, the rest lowercased. Header names are case-insensitive, so
/// differently-cased duplicates must fold onto one key.
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn fold_param(map: &mut BTreeMap<String, ParamValue>, key: String, value: String) {
    match map.get_mut(&key) {
        Some(existing) => existing.push(value),
        None => {
            map.insert(key, ParamValue::Single(value));
        }
    }
}

fn parse_cookies(header_value: &str, cookies: &mut BTreeMap<String, String>) {
    for pair in header_value.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        if let Some((name, value)) = pair.split_once('=') {
            cookies.insert(name.trim().to_string(), value.trim().to_string());
        }
    }
}

fn is_form_urlencoded(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}
