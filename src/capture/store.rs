//! Capture store
//!
//! Two insertion-ordered collections of request and response records,
//! shared between the proxy tasks and the inspection API. Optionally
//! snapshots both collections to JSON files so ids survive restarts.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use uuid::Uuid;

use super::{RequestRecord, ResponseRecord};
use crate::error::StoreError;

/// Default page size for listings when the caller supplies no positive limit
pub const DEFAULT_LIST_LIMIT: usize = 5;

/// Document store for captured traffic
pub struct CaptureStore {
    requests: RwLock<Vec<RequestRecord>>,
    responses: RwLock<Vec<ResponseRecord>>,
    persist_dir: Option<PathBuf>,
}

impl CaptureStore {
    /// In-memory store
    pub fn new() -> Self {
        Self {
            requests: RwLock::new(Vec::new()),
            responses: RwLock::new(Vec::new()),
            persist_dir: None,
        }
    }

    /// Store backed by JSON snapshots in `dir`, loaded at startup
    pub fn with_persistence(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| StoreError::Persist(format!("creating {:?}: {}", dir, e)))?;

        let requests = load_collection(&dir.join("requests.json"))?;
        let responses = load_collection(&dir.join("responses.json"))?;
        tracing::info!(
            requests = requests.len(),
            responses = responses.len(),
            "Loaded capture snapshots"
        );

        Ok(Self {
            requests: RwLock::new(requests),
            responses: RwLock::new(responses),
            persist_dir: Some(dir.to_path_buf()),
        })
    }

    /// Insert a request record, assigning its id
    pub fn save_request(&self, mut record: RequestRecord) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        record.id = id.clone();

        let snapshot = {
            let mut requests = self.requests.write();
            requests.push(record);
            requests.clone()
        };
        self.snapshot("requests.json", snapshot);

        Ok(id)
    }

    /// Insert a response record under its parent request, assigning its id
    pub fn save_response(
        &self,
        request_id: &str,
        mut record: ResponseRecord,
    ) -> Result<String, StoreError> {
        validate_id(request_id)?;

        let id = Uuid::new_v4().to_string();
        record.id = id.clone();
        record.request_id = request_id.to_string();

        let snapshot = {
            let mut responses = self.responses.write();
            responses.push(record);
            responses.clone()
        };
        self.snapshot("responses.json", snapshot);

        Ok(id)
    }

    pub fn request(&self, id: &str) -> Result<RequestRecord, StoreError> {
        validate_id(id)?;
        self.requests
            .read()
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn response(&self, id: &str) -> Result<ResponseRecord, StoreError> {
        validate_id(id)?;
        self.responses
            .read()
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// The response whose `request_id` matches, if the upstream completed
    pub fn response_for_request(&self, request_id: &str) -> Result<ResponseRecord, StoreError> {
        validate_id(request_id)?;
        self.responses
            .read()
            .iter()
            .find(|r| r.request_id == request_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(request_id.to_string()))
    }

    /// Newest-first listing
    pub fn list_requests(&self, limit: usize) -> Vec<RequestRecord> {
        self.requests.read().iter().rev().take(limit).cloned().collect()
    }

    /// Newest-first listing
    pub fn list_responses(&self, limit: usize) -> Vec<ResponseRecord> {
        self.responses.read().iter().rev().take(limit).cloned().collect()
    }

    /// Write a snapshot of `records`, taken after the collection lock was
    /// released. Inside a runtime the serialization and file write run on
    /// the blocking pool so the relay path never stalls on disk; outside
    /// one they run inline.
    fn snapshot<T>(&self, file: &str, records: Vec<T>)
    where
        T: serde::Serialize + Send + 'static,
    {
        let Some(dir) = &self.persist_dir else {
            return;
        };
        let path = dir.join(file);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || write_snapshot(&path, &records));
            }
            Err(_) => write_snapshot(&path, &records),
        }
    }
}

impl Default for CaptureStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a caller-supplied limit, falling back to the default when it is
/// absent or not a positive integer
pub fn effective_limit(raw: Option<&str>) -> usize {
    raw.and_then(|v| v.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_LIST_LIMIT)
}

fn write_snapshot<T: serde::Serialize>(path: &Path, records: &[T]) {
    let result = serde_json::to_vec_pretty(records)
        .map_err(|e| e.to_string())
        .and_then(|json| std::fs::write(path, json).map_err(|e| e.to_string()));
    if let Err(e) = result {
        tracing::warn!(path = ?path, error = %e, "Capture snapshot failed");
    }
}

fn validate_id(id: &str) -> Result<(), StoreError> {
    Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| StoreError::BadId(id.to_string()))
}

fn load_collection<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(path)
        .map_err(|e| StoreError::Persist(format!("reading {:?}: {}", path, e)))?;
    serde_json::from_str(&contents)
        .map_err(|e| StoreError::Persist(format!("parsing {:?}: {}", path, e)))
}
