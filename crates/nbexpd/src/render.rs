//! Prometheus text exposition of a collection result.
//!
//! A fresh registry is built for every scrape, so series that disappeared
//! upstream (a deleted storage unit, a job key outside the window) are not
//! carried over from earlier cycles.

use std::fmt;

use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};

use nbexp_core::collector::{CollectionResult, HealthSnapshot};
use nbexp_core::model::{MetricKey, MetricValue};

#[derive(Debug)]
pub(crate) enum RenderError {
    Prometheus(prometheus::Error),
    Utf8(std::string::FromUtf8Error),
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderError::Prometheus(e) => write!(f, "metric encoding failed: {}", e),
            RenderError::Utf8(e) => write!(f, "metric output is not utf-8: {}", e),
        }
    }
}

impl std::error::Error for RenderError {}

impl From<prometheus::Error> for RenderError {
    fn from(e: prometheus::Error) -> Self {
        RenderError::Prometheus(e)
    }
}

fn keyed<K: MetricKey>(
    registry: &Registry,
    name: &str,
    help: &str,
    values: &[MetricValue<K>],
) -> Result<(), prometheus::Error> {
    let gauge = GaugeVec::new(Opts::new(name, help), K::LABEL_NAMES)?;
    registry.register(Box::new(gauge.clone()))?;
    for v in values {
        gauge
            .get_metric_with_label_values(&v.key.label_values())?
            .set(v.value);
    }
    Ok(())
}

fn labeled(
    registry: &Registry,
    name: &str,
    help: &str,
    label: &str,
) -> Result<GaugeVec, prometheus::Error> {
    let gauge = GaugeVec::new(Opts::new(name, help), &[label])?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// Renders one cycle plus exporter health as Prometheus text.
pub(crate) fn render(
    result: &CollectionResult,
    health: &HealthSnapshot,
) -> Result<String, RenderError> {
    let registry = Registry::new();

    keyed(
        &registry,
        "nbu_disk_bytes",
        "Storage unit capacity in bytes",
        &result.storage,
    )?;
    keyed(
        &registry,
        "nbu_jobs_count",
        "Finished jobs in the scrape window",
        &result.jobs.count,
    )?;
    keyed(
        &registry,
        "nbu_jobs_bytes",
        "Bytes transferred by finished jobs in the scrape window",
        &result.jobs.bytes,
    )?;
    keyed(
        &registry,
        "nbu_status_count",
        "Finished jobs per exit status in the scrape window",
        &result.jobs.status,
    )?;

    let up = Gauge::new("nbu_up", "Whether the last collection reached the master server")?;
    registry.register(Box::new(up.clone()))?;
    up.set(if result.is_up() { 1.0 } else { 0.0 });

    let errors = labeled(
        &registry,
        "nbu_scrape_errors",
        "Whether collecting a source failed in this scrape",
        "source",
    )?;
    for (source, error) in [("storage", &result.storage_error), ("jobs", &result.jobs_error)] {
        errors
            .get_metric_with_label_values(&[source])?
            .set(if error.is_some() { 1.0 } else { 0.0 });
    }

    let last = labeled(
        &registry,
        "nbu_last_scrape_timestamp_seconds",
        "Unix time of the last successful collection per source",
        "source",
    )?;
    for (source, at) in [
        ("storage", health.last_storage_success),
        ("jobs", health.last_jobs_success),
    ] {
        if let Some(at) = at {
            last.get_metric_with_label_values(&[source])?
                .set(at.timestamp_millis() as f64 / 1000.0);
        }
    }

    if let Some(version) = &health.version {
        let info = labeled(
            &registry,
            "nbu_api_version_info",
            "Negotiated NetBackup API version",
            "version",
        )?;
        info.get_metric_with_label_values(&[version.as_str()])?
            .set(1.0);
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(RenderError::Utf8)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use nbexp_core::FetchError;
    use nbexp_core::fetcher::JobMetrics;
    use nbexp_core::model::{JobKey, JobStatusKey, SizeClass, StorageKey};
    use nbexp_core::version::ApiVersion;

    fn result() -> CollectionResult {
        CollectionResult {
            storage: vec![
                MetricValue::new(StorageKey::new("dp_disk_01", "DISK", SizeClass::Free), 100.0),
                MetricValue::new(StorageKey::new("dp_disk_01", "DISK", SizeClass::Used), 200.0),
            ],
            jobs: JobMetrics {
                count: vec![MetricValue::new(JobKey::new("BACKUP", "VMWARE", "0"), 3.0)],
                bytes: vec![MetricValue::new(JobKey::new("BACKUP", "VMWARE", "0"), 3072.0)],
                status: vec![MetricValue::new(JobStatusKey::new("BACKUP", "0"), 3.0)],
                items: 3,
            },
            storage_error: None,
            jobs_error: None,
            storage_from_cache: false,
            collected_at: Utc::now(),
        }
    }

    fn health() -> HealthSnapshot {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        HealthSnapshot {
            up: true,
            last_cycle: Some(at),
            last_storage_success: Some(at),
            last_jobs_success: None,
            version: Some(ApiVersion::V12),
        }
    }

    #[test]
    fn renders_every_family() {
        let text = render(&result(), &health()).unwrap();
        assert!(text.contains(r#"nbu_disk_bytes{name="dp_disk_01",size="free",type="DISK"} 100"#));
        assert!(text.contains(r#"nbu_jobs_count{action="BACKUP",policy_type="VMWARE",status="0"} 3"#));
        assert!(text.contains(r#"nbu_jobs_bytes{action="BACKUP",policy_type="VMWARE",status="0"} 3072"#));
        assert!(text.contains(r#"nbu_status_count{action="BACKUP",status="0"} 3"#));
        assert!(text.contains("nbu_up 1"));
        assert!(text.contains(r#"nbu_scrape_errors{source="jobs"} 0"#));
        assert!(text.contains(r#"nbu_last_scrape_timestamp_seconds{source="storage"} 1714557600"#));
        assert!(!text.contains(r#"nbu_last_scrape_timestamp_seconds{source="jobs"}"#));
        assert!(text.contains(r#"nbu_api_version_info{version="12.0"} 1"#));
    }

    #[test]
    fn label_values_with_delimiters_survive() {
        let mut r = result();
        r.storage = vec![MetricValue::new(
            StorageKey::new("pool|a,b", "DISK", SizeClass::Used),
            5.0,
        )];
        let text = render(&r, &health()).unwrap();
        assert!(text.contains(r#"nbu_disk_bytes{name="pool|a,b",size="used",type="DISK"} 5"#));
    }

    #[test]
    fn failed_source_is_flagged() {
        let mut r = result();
        r.storage = Vec::new();
        r.storage_error = Some(FetchError::Closed);
        r.jobs_error = Some(FetchError::Cancelled);
        let text = render(&r, &health()).unwrap();
        assert!(text.contains("nbu_up 0"));
        assert!(text.contains(r#"nbu_scrape_errors{source="storage"} 1"#));
        assert!(!text.contains("nbu_disk_bytes{"));
    }
}
