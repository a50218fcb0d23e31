//! Metric model and API wire types.

pub mod api;
mod keys;

pub use api::{Job, JobAttributes, Page, PageMeta, Pagination, StorageUnit, StorageUnitAttributes};
pub use keys::{Buckets, JobKey, JobStatusKey, MetricKey, MetricValue, SizeClass, StorageKey};
