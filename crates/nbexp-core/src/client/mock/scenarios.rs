//! Pre-built mock API scenarios for testing.
//!
//! These scenarios provide realistic master server states for exercising
//! the fetchers and the collector.

use serde_json::json;

use super::{MockApi, envelope, job, storage_unit};
use crate::fetcher::{JOBS_ENDPOINT, PAGE_LIMIT, STORAGE_ENDPOINT};

#[allow(dead_code)]
impl MockApi {
    /// A typical site: three storage units and 150 finished jobs.
    ///
    /// Jobs come back as pages of 100 and 50. Their mix is:
    /// - 90 × BACKUP/VMWARE status 0, 1024 KiB each
    /// - 40 × BACKUP/STANDARD status 0, 512 KiB each
    /// - 15 × BACKUP/STANDARD status 96, nothing transferred
    /// - 5 × RESTORE/VMWARE status 0, 2048 KiB each
    pub fn typical_site() -> Self {
        let mut api = Self::new();
        api.add_items(
            STORAGE_ENDPOINT,
            vec![
                storage_unit("dp_disk_01", "DISK", 4_000_000_000, 6_000_000_000),
                storage_unit("msdp_pool", "MSDP", 1_500_000_000_000, 500_000_000_000),
                storage_unit("cloud_tier", "CLOUD", 0, 750_000_000),
            ],
            PAGE_LIMIT,
        );

        let mut jobs = Vec::with_capacity(150);
        let mut id = 1000;
        let mut push = |count: usize, job_type: &str, policy: &str, status: i64, kb: u64| {
            for _ in 0..count {
                jobs.push(job(id, job_type, policy, status, kb));
                id += 1;
            }
        };
        push(90, "BACKUP", "VMWARE", 0, 1024);
        push(40, "BACKUP", "STANDARD", 0, 512);
        push(15, "BACKUP", "STANDARD", 96, 0);
        push(5, "RESTORE", "VMWARE", 0, 2048);
        api.add_items(JOBS_ENDPOINT, jobs, PAGE_LIMIT);
        api
    }

    /// A master server with no storage units and no recent jobs.
    pub fn empty_site() -> Self {
        let mut api = Self::new();
        api.add_items(STORAGE_ENDPOINT, vec![], PAGE_LIMIT);
        api.add_items(JOBS_ENDPOINT, vec![], PAGE_LIMIT);
        api
    }

    /// Storage units where one item has an unexpected shape.
    pub fn storage_with_odd_item() -> Self {
        let mut api = Self::new();
        api.add_page(
            STORAGE_ENDPOINT,
            0,
            envelope(
                vec![
                    storage_unit("dp_disk_01", "DISK", 100, 200),
                    json!({"type": "storageUnit", "id": "broken", "attributes": {"name": 7}}),
                    storage_unit("dp_disk_02", "DISK", 300, 400),
                ],
                0,
                PAGE_LIMIT,
                3,
            ),
        );
        api
    }

    /// Jobs whose cursor points back at the first page forever.
    pub fn looping_jobs_cursor() -> Self {
        let mut api = Self::new();
        api.add_page(
            JOBS_ENDPOINT,
            0,
            json!({
                "data": [job(1, "BACKUP", "STANDARD", 0, 10)],
                "meta": {"pagination": {"offset": 0, "limit": 100, "next": 0, "last": 500}}
            }),
        );
        api
    }

    /// Jobs page without pagination metadata.
    pub fn jobs_without_meta() -> Self {
        let mut api = Self::new();
        api.add_page(
            JOBS_ENDPOINT,
            0,
            json!({"data": [job(1, "BACKUP", "STANDARD", 0, 10), job(2, "BACKUP", "STANDARD", 0, 10)]}),
        );
        api
    }
}
