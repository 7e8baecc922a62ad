//! Inspection REST surface
//!
//! A thin adapter over the capture store, the replay engine, and the
//! scanner. No authentication; every internal error surfaces as HTTP 500
//! with the error message as a plain-text body.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::broadcast;

use crate::app::ApiConfig;
use crate::capture::store::{effective_limit, CaptureStore};
use crate::capture::{recompose, RequestRecord, ResponseRecord};
use crate::replay::ReplayClient;
use crate::scanner;

/// State shared by all API handlers
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<CaptureStore>,
    pub replay: Arc<ReplayClient>,
}

/// Wrapper turning any error into a 500 with the message as body
struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the inspection router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/requests", get(list_requests))
        .route("/requests/:id", get(get_request))
        .route("/requests/:id/dump", get(dump_request))
        .route("/requests/:id/response", get(get_request_response))
        .route("/repeat/:id", get(repeat_request))
        .route("/scan/:id", get(scan_request))
        .route("/responses", get(list_responses))
        .route("/responses/:id", get(get_response))
        .with_state(state)
}

/// Serve the inspection API until shutdown
pub async fn serve(
    config: &ApiConfig,
    state: ApiState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", config.listen_addr, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind inspection API on {}", addr))?;

    tracing::info!("Inspection API listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .context("Inspection API server failed")
}

async fn list_requests(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<RequestRecord>> {
    let limit = effective_limit(params.get("limit").map(String::as_str));
    Json(state.store.list_requests(limit))
}

async fn get_request(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RequestRecord>> {
    Ok(Json(state.store.request(&id)?))
}

async fn dump_request(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let record = state.store.request(&id)?;
    let wire = recompose(&record)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        wire.to_raw().to_bytes(),
    ))
}

async fn get_request_response(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ResponseRecord>> {
    Ok(Json(state.store.response_for_request(&id)?))
}

/// Replay the stored request and proxy the origin's answer verbatim
async fn repeat_request(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let record = state.store.request(&id)?;
    let wire = recompose(&record).context("Error getting request")?;
    let outcome = state
        .replay
        .execute(&wire)
        .await
        .context("Error resending request")?;

    let mut headers = HeaderMap::new();
    for (name, value) in &outcome.headers {
        // Recomputed from the buffered body
        if name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (HeaderName::from_str(name), HeaderValue::from_str(value)) {
            headers.append(name, value);
        }
    }

    let status =
        StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Ok((status, headers, outcome.body).into_response())
}

async fn scan_request(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<&'static str> {
    let record = state.store.request(&id)?;
    let vulnerable = scanner::scan_record(&record, &state.replay).await?;
    Ok(scanner::verdict_text(vulnerable))
}

async fn list_responses(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<ResponseRecord>> {
    let limit = effective_limit(params.get("limit").map(String::as_str));
    Json(state.store.list_responses(limit))
}

async fn get_response(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ResponseRecord>> {
    Ok(Json(state.store.response(&id)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ReplayConfig;
    use crate::capture::decompose_request;
    use crate::proxy::codec::{self, RawRequest};
    use tokio::io::{AsyncWriteExt, BufReader};

    fn test_state() -> ApiState {
        ApiState {
            store: Arc::new(CaptureStore::new()),
            replay: Arc::new(
                ReplayClient::new(
                    &ReplayConfig::default(),
                    std::path::Path::new("/nonexistent/ca.crt"),
                )
                .unwrap(),
            ),
        }
    }

    fn seed_request(state: &ApiState, path: &str) -> String {
        let raw = RawRequest {
            method: "GET".to_string(),
            target: path.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: vec![("Host".to_string(), "example.test".to_string())],
            body: Vec::new(),
        };
        state
            .store
            .save_request(decompose_request(&raw, "http", "example.test"))
            .unwrap()
    }

    async fn spawn_api(state: ApiState) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        addr
    }

    async fn api_get(addr: std::net::SocketAddr, path: &str) -> (u16, Vec<u8>) {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                format!(
                    "GET {} HTTP/1.1\r\nHost: inspection\r\nConnection: close\r\n\r\n",
                    path
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let mut reader = BufReader::new(stream);
        let response = codec::read_response(&mut reader, "GET").await.unwrap();
        (response.code, response.body)
    }

    #[tokio::test]
    async fn listing_respects_default_limit_and_order() {
        let state = test_state();
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(seed_request(&state, &format!("/{}", i)));
        }
        let addr = spawn_api(state).await;

        let (code, body) = api_get(addr, "/requests").await;
        assert_eq!(code, 200);

        let listed: Vec<RequestRecord> = serde_json::from_slice(&body).unwrap();
        assert_eq!(listed.len(), 5);
        assert_eq!(listed[0].id, ids[9]);

        let (_, body) = api_get(addr, "/requests?limit=2").await;
        let listed: Vec<RequestRecord> = serde_json::from_slice(&body).unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn record_fetch_and_dump() {
        let state = test_state();
        let id = seed_request(&state, "/hello?x=1");
        let addr = spawn_api(state).await;

        let (code, body) = api_get(addr, &format!("/requests/{}", id)).await;
        assert_eq!(code, 200);
        let record: RequestRecord = serde_json::from_slice(&body).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.path, "/hello");

        let (code, body) = api_get(addr, &format!("/requests/{}/dump", id)).await;
        assert_eq!(code, 200);
        let dump = String::from_utf8(body).unwrap();
        assert!(dump.starts_with("GET /hello?x=1 HTTP/1.1\r\n"));
        assert!(dump.contains("Host: example.test\r\n"));
    }

    #[tokio::test]
    async fn errors_surface_as_500_with_message() {
        let state = test_state();
        let addr = spawn_api(state).await;

        let (code, body) = api_get(addr, "/requests/not-a-uuid").await;
        assert_eq!(code, 500);
        assert!(String::from_utf8_lossy(&body).contains("malformed record id"));

        let absent = uuid::Uuid::new_v4();
        let (code, body) = api_get(addr, &format!("/scan/{}", absent)).await;
        assert_eq!(code, 500);
        assert!(String::from_utf8_lossy(&body).contains("no record with id"));
    }
}
