//! Wire types of the NetBackup REST API.
//!
//! Only the fields the collectors read are modelled. Items are decoded one
//! at a time (see `fetcher`), so a single odd item never fails its page.

use serde::Deserialize;

/// Response envelope: `{ "data": [...], "meta": { "pagination": {...} } }`.
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub meta: Option<PageMeta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageMeta {
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

/// Offset pagination block. `last` is the offset of the final page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub next: Option<u64>,
    #[serde(default)]
    pub last: Option<u64>,
    #[serde(default)]
    pub count: Option<u64>,
}

/// Item of `/storage/storage-units`.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageUnit {
    #[serde(default)]
    pub id: String,
    pub attributes: StorageUnitAttributes,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUnitAttributes {
    pub name: String,
    #[serde(default)]
    pub storage_type: String,
    #[serde(default)]
    pub storage_server_type: String,
    pub free_capacity_bytes: u64,
    pub used_capacity_bytes: u64,
    #[serde(default)]
    pub total_capacity_bytes: u64,
}

/// Item of `/admin/jobs`.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub id: String,
    pub attributes: JobAttributes,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAttributes {
    #[serde(default)]
    pub job_id: u64,
    pub job_type: String,
    #[serde(default)]
    pub policy_type: String,
    /// Exit status code of the job.
    pub status: i64,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub kilobytes_transferred: u64,
    #[serde(default)]
    pub end_time: Option<String>,
}
