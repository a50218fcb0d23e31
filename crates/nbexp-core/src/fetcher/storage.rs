//! Storage unit capacity.

use tokio_util::sync::CancellationToken;

use super::{Batch, Folded, PageCursor, PagedSource, fetch_all, fetch_page};
use crate::client::ApiClient;
use crate::error::FetchError;
use crate::instrument::Instrumentation;
use crate::model::{Buckets, MetricValue, SizeClass, StorageKey, StorageUnit};

pub const STORAGE_ENDPOINT: &str = "/storage/storage-units";

/// Capacity series of every storage unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageMetrics {
    pub capacity: Vec<MetricValue<StorageKey>>,
    /// Storage units folded.
    pub units: usize,
}

/// Fetches `/storage/storage-units` and emits free/used bytes per unit.
#[derive(Debug, Clone, Default)]
pub struct StorageFetcher {
    instrumentation: Instrumentation,
}

impl StorageFetcher {
    pub fn new(instrumentation: Instrumentation) -> Self {
        Self { instrumentation }
    }

    pub async fn fetch_page<C: ApiClient>(
        &self,
        cancel: &CancellationToken,
        client: &C,
        cursor: PageCursor,
    ) -> Result<Batch<StorageUnit>, FetchError> {
        fetch_page(cancel, client, self, cursor).await
    }

    pub async fn fetch<C: ApiClient>(
        &self,
        cancel: &CancellationToken,
        client: &C,
    ) -> Result<StorageMetrics, FetchError> {
        let Folded { metrics, items, .. } = fetch_all(cancel, client, self).await?;
        Ok(StorageMetrics {
            capacity: metrics.into_values(),
            units: items,
        })
    }
}

impl PagedSource for StorageFetcher {
    type Item = StorageUnit;
    type Metrics = Buckets<StorageKey>;

    const ENDPOINT: &'static str = STORAGE_ENDPOINT;
    const OPERATION: &'static str = "fetch_storage";

    fn fold(&self, metrics: &mut Self::Metrics, unit: StorageUnit) {
        let attrs = unit.attributes;
        metrics.add(
            StorageKey::new(attrs.name.as_str(), attrs.storage_type.as_str(), SizeClass::Free),
            attrs.free_capacity_bytes as f64,
        );
        metrics.add(
            StorageKey::new(attrs.name, attrs.storage_type, SizeClass::Used),
            attrs.used_capacity_bytes as f64,
        );
    }

    fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }
}
