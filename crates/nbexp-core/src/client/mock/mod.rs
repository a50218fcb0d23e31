//! In-memory [`ApiClient`] for testing fetchers and the collector without a
//! NetBackup master server.
//!
//! Pages are stored as raw JSON envelopes keyed by endpoint path and
//! `page[offset]`, so fixtures can also contain malformed items and cursors.

mod scenarios;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::Url;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::ApiClient;
use crate::error::FetchError;

/// Base URL reported by every mock.
pub const MOCK_BASE_URL: &str = "https://mock-master:1556/netbackup";

/// Canned NetBackup API.
///
/// A path without any page answers 404. Failures injected through
/// [`MockApi::fail`] take precedence over pages and can be lifted again with
/// [`MockApi::recover`], which lets tests model an outage between cycles.
#[derive(Debug)]
pub struct MockApi {
    base_url: Url,
    /// (path relative to base, page offset) → envelope.
    pages: HashMap<(String, u64), Value>,
    failures: Mutex<HashMap<String, FetchError>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<Url>>,
}

impl Default for MockApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockApi {
    pub fn new() -> Self {
        Self::with_base_url(
            Url::parse(MOCK_BASE_URL).unwrap_or_else(|e| panic!("static mock url: {e}")),
        )
    }

    pub fn with_base_url(base_url: Url) -> Self {
        Self {
            base_url,
            pages: HashMap::new(),
            failures: Mutex::new(HashMap::new()),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Stores a raw envelope served for `path` at `offset`.
    pub fn add_page(&mut self, path: &str, offset: u64, envelope: Value) {
        self.pages.insert((path.to_string(), offset), envelope);
    }

    /// Splits `items` into pages of `limit` and stores them with proper
    /// pagination metadata.
    pub fn add_items(&mut self, path: &str, items: Vec<Value>, limit: u64) {
        let total = items.len() as u64;
        if items.is_empty() {
            self.add_page(path, 0, envelope(Vec::new(), 0, limit, 0));
            return;
        }
        for (index, chunk) in items.chunks(limit.max(1) as usize).enumerate() {
            let offset = index as u64 * limit;
            self.add_page(path, offset, envelope(chunk.to_vec(), offset, limit, total));
        }
    }

    /// Delays every response, honoring cancellation while waiting.
    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = Some(delay);
    }

    /// Makes every call to `path` fail with `error`.
    pub fn fail(&self, path: &str, error: FetchError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), error);
    }

    /// Removes an injected failure for `path`.
    pub fn recover(&self, path: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }

    /// Every URL requested so far, in order.
    pub fn calls(&self) -> Vec<Url> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of requests made to `path`.
    pub fn calls_to(&self, path: &str) -> usize {
        self.calls()
            .iter()
            .filter(|u| self.relative_path(u) == path)
            .count()
    }

    fn relative_path(&self, url: &Url) -> String {
        let prefix = self.base_url.path().trim_end_matches('/');
        url.path()
            .strip_prefix(prefix)
            .unwrap_or(url.path())
            .to_string()
    }

    fn respond(&self, url: &Url) -> Result<Value, FetchError> {
        let path = self.relative_path(url);
        if let Some(err) = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&path)
        {
            return Err(err.clone());
        }

        let offset = url
            .query_pairs()
            .find(|(k, _)| k == "page[offset]")
            .and_then(|(_, v)| v.parse::<u64>().ok())
            .unwrap_or(0);

        self.pages
            .get(&(path.clone(), offset))
            .cloned()
            .ok_or_else(|| FetchError::Status {
                status: 404,
                retry_after: None,
                body: format!("no fixture for {} at offset {}", path, offset),
            })
    }
}

impl ApiClient for MockApi {
    fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn fetch_data<T>(&self, cancel: &CancellationToken, url: Url) -> Result<T, FetchError>
    where
        T: DeserializeOwned + Send,
    {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(url.clone());

        if let Some(delay) = self.delay {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let body = self.respond(&url)?;
        serde_json::from_value(body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

/// Builds a NetBackup response envelope for one page.
///
/// `next` is present only while more items follow; `last` is the offset of
/// the final page.
pub fn envelope(items: Vec<Value>, offset: u64, limit: u64, total: u64) -> Value {
    let limit = limit.max(1);
    let last = if total == 0 { 0 } else { (total - 1) / limit * limit };
    let mut pagination = json!({
        "offset": offset,
        "limit": limit,
        "last": last,
        "count": total,
    });
    if offset + limit < total {
        pagination["next"] = json!(offset + limit);
    }
    json!({
        "data": items,
        "meta": { "pagination": pagination },
    })
}

/// One `/storage/storage-units` item.
pub fn storage_unit(name: &str, storage_type: &str, free: u64, used: u64) -> Value {
    json!({
        "type": "storageUnit",
        "id": name,
        "attributes": {
            "name": name,
            "storageType": storage_type,
            "storageServerType": storage_type,
            "freeCapacityBytes": free,
            "usedCapacityBytes": used,
            "totalCapacityBytes": free + used,
        }
    })
}

/// One `/admin/jobs` item.
pub fn job(id: u64, job_type: &str, policy_type: &str, status: i64, kilobytes: u64) -> Value {
    json!({
        "type": "job",
        "id": id.to_string(),
        "attributes": {
            "jobId": id,
            "jobType": job_type,
            "policyType": policy_type,
            "status": status,
            "state": "DONE",
            "kilobytesTransferred": kilobytes,
            "endTime": "2024-05-01T10:00:00.000Z",
        }
    })
}
