//! Finished jobs within the scrape window.
//!
//! Each job contributes to three series:
//! - job count per `{action, policy_type, status}`
//! - transferred bytes per `{action, policy_type, status}` (`kilobytesTransferred × 1024`)
//! - status count per `{action, status}`

use chrono::{DateTime, SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;

use super::{Batch, Folded, PageCursor, PagedSource, fetch_all, fetch_page};
use crate::client::ApiClient;
use crate::error::FetchError;
use crate::instrument::Instrumentation;
use crate::model::{Buckets, Job, JobKey, JobStatusKey, MetricValue};

pub const JOBS_ENDPOINT: &str = "/admin/jobs";

/// Aggregated job series of one sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobMetrics {
    pub count: Vec<MetricValue<JobKey>>,
    pub bytes: Vec<MetricValue<JobKey>>,
    pub status: Vec<MetricValue<JobStatusKey>>,
    /// Jobs folded.
    pub items: usize,
}

#[derive(Debug, Default)]
pub struct JobBuckets {
    count: Buckets<JobKey>,
    bytes: Buckets<JobKey>,
    status: Buckets<JobStatusKey>,
}

/// Fetches `/admin/jobs` finished after `since`.
#[derive(Debug, Clone)]
pub struct JobsFetcher {
    since: DateTime<Utc>,
    instrumentation: Instrumentation,
}

impl JobsFetcher {
    pub fn new(since: DateTime<Utc>, instrumentation: Instrumentation) -> Self {
        Self {
            since,
            instrumentation,
        }
    }

    /// Server-side predicate restricting jobs to the window.
    pub fn filter(&self) -> String {
        format!(
            "endTime gt {}",
            self.since.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }

    pub async fn fetch_page<C: ApiClient>(
        &self,
        cancel: &CancellationToken,
        client: &C,
        cursor: PageCursor,
    ) -> Result<Batch<Job>, FetchError> {
        fetch_page(cancel, client, self, cursor).await
    }

    pub async fn fetch<C: ApiClient>(
        &self,
        cancel: &CancellationToken,
        client: &C,
    ) -> Result<JobMetrics, FetchError> {
        let Folded { metrics, items, .. } = fetch_all(cancel, client, self).await?;
        Ok(JobMetrics {
            count: metrics.count.into_values(),
            bytes: metrics.bytes.into_values(),
            status: metrics.status.into_values(),
            items,
        })
    }
}

impl PagedSource for JobsFetcher {
    type Item = Job;
    type Metrics = JobBuckets;

    const ENDPOINT: &'static str = JOBS_ENDPOINT;
    const OPERATION: &'static str = "fetch_jobs";
    const PAGE_OPERATION: Option<&'static str> = Some("fetch_job_page");

    fn query(&self) -> Vec<(&'static str, String)> {
        vec![("filter", self.filter())]
    }

    fn fold(&self, metrics: &mut JobBuckets, job: Job) {
        let attrs = job.attributes;
        let status = attrs.status.to_string();
        let key = JobKey::new(attrs.job_type.as_str(), attrs.policy_type, status.as_str());

        metrics.count.increment(key.clone());
        metrics
            .bytes
            .add(key, attrs.kilobytes_transferred as f64 * 1024.0);
        metrics
            .status
            .increment(JobStatusKey::new(attrs.job_type, status));
    }

    fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::client::mock::MockApi;
    use crate::instrument::testing::RecordingSink;

    fn since() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 55, 0).unwrap()
    }

    fn fetcher() -> JobsFetcher {
        JobsFetcher::new(since(), Instrumentation::disabled())
    }

    fn count(metrics: &JobMetrics, key: &JobKey) -> f64 {
        metrics
            .count
            .iter()
            .find(|v| &v.key == key)
            .map(|v| v.value)
            .unwrap_or(0.0)
    }

    #[test]
    fn filter_uses_millisecond_utc_timestamp() {
        assert_eq!(fetcher().filter(), "endTime gt 2024-05-01T09:55:00.000Z");
    }

    #[tokio::test]
    async fn aggregates_150_jobs_across_two_pages() {
        let api = MockApi::typical_site();
        let metrics = fetcher().fetch(&CancellationToken::new(), &api).await.unwrap();

        assert_eq!(metrics.items, 150);
        assert_eq!(api.calls_to(JOBS_ENDPOINT), 2);

        let total: f64 = metrics.count.iter().map(|v| v.value).sum();
        assert_eq!(total, 150.0);
        assert_eq!(count(&metrics, &JobKey::new("BACKUP", "VMWARE", "0")), 90.0);
        assert_eq!(count(&metrics, &JobKey::new("BACKUP", "STANDARD", "0")), 40.0);
        assert_eq!(count(&metrics, &JobKey::new("BACKUP", "STANDARD", "96")), 15.0);
        assert_eq!(count(&metrics, &JobKey::new("RESTORE", "VMWARE", "0")), 5.0);

        let vmware_bytes = metrics
            .bytes
            .iter()
            .find(|v| v.key == JobKey::new("BACKUP", "VMWARE", "0"))
            .unwrap();
        assert_eq!(vmware_bytes.value, 90.0 * 1024.0 * 1024.0);

        let failed = metrics
            .status
            .iter()
            .find(|v| v.key == JobStatusKey::new("BACKUP", "96"))
            .unwrap();
        assert_eq!(failed.value, 15.0);
    }

    #[tokio::test]
    async fn pages_are_requested_in_order_with_filter() {
        let api = MockApi::typical_site();
        fetcher().fetch(&CancellationToken::new(), &api).await.unwrap();

        let offsets: Vec<String> = api
            .calls()
            .iter()
            .map(|u| {
                u.query_pairs()
                    .find(|(k, _)| k == "page[offset]")
                    .map(|(_, v)| v.into_owned())
                    .unwrap()
            })
            .collect();
        assert_eq!(offsets, vec!["0", "100"]);

        let filter = api.calls()[0]
            .query_pairs()
            .find(|(k, _)| k == "filter")
            .map(|(_, v)| v.into_owned());
        assert_eq!(filter.as_deref(), Some("endTime gt 2024-05-01T09:55:00.000Z"));
    }

    #[tokio::test]
    async fn looping_cursor_terminates() {
        let api = MockApi::looping_jobs_cursor();
        let metrics = fetcher().fetch(&CancellationToken::new(), &api).await.unwrap();
        assert_eq!(metrics.items, 1);
        assert_eq!(api.calls_to(JOBS_ENDPOINT), 1);
    }

    #[tokio::test]
    async fn missing_meta_ends_after_first_page() {
        let api = MockApi::jobs_without_meta();
        let metrics = fetcher().fetch(&CancellationToken::new(), &api).await.unwrap();
        assert_eq!(metrics.items, 2);
    }

    #[tokio::test]
    async fn empty_window_yields_no_series() {
        let api = MockApi::empty_site();
        let metrics = fetcher().fetch(&CancellationToken::new(), &api).await.unwrap();
        assert_eq!(metrics, JobMetrics::default());
    }

    #[tokio::test]
    async fn cancelled_sequence_returns_nothing() {
        let api = MockApi::typical_site();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fetcher().fetch(&cancel, &api).await.unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn one_span_per_page_plus_sequence() {
        let sink = Arc::new(RecordingSink::default());
        let api = MockApi::typical_site();
        JobsFetcher::new(since(), Instrumentation::new(sink.clone()))
            .fetch(&CancellationToken::new(), &api)
            .await
            .unwrap();
        assert_eq!(sink.spans_named("fetch_job_page").len(), 2);
        assert_eq!(sink.spans_named("fetch_jobs").len(), 1);
    }
}
