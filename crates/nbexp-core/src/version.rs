//! API version negotiation.
//!
//! NetBackup selects the contract revision through the `Accept` media type.
//! Candidates are probed newest first with a one-item jobs request:
//!
//! ```text
//!   13.0 ──406──▶ 12.0 ──406──▶ 3.0 ──406──▶ NoneAccepted([13.0, 12.0, 3.0])
//!    │             │             │
//!    2xx           2xx           2xx          any other failure ──▶ Probe error
//!    ▼             ▼             ▼
//!  accept        accept        accept
//! ```
//!
//! A 406 is the only answer that moves on to an older candidate. Network and
//! authentication failures say nothing about version support and end the
//! negotiation immediately.

use std::borrow::Cow;
use std::fmt;
use std::future::Future;

use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{HttpTransport, PROBE_ENDPOINT, endpoint_url};
use crate::config::Credential;
use crate::error::{ErrorKind, FetchError, VersionError};
use crate::instrument::Instrumentation;

/// Media type prefix; the version is appended as a parameter.
const MEDIA_TYPE_PREFIX: &str = "application/vnd.netbackup+json;version=";

/// Protocol revision identifier such as `"13.0"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion(Cow<'static, str>);

impl ApiVersion {
    /// NetBackup 10.5.
    pub const V13: ApiVersion = ApiVersion(Cow::Borrowed("13.0"));
    /// NetBackup 10.4.
    pub const V12: ApiVersion = ApiVersion(Cow::Borrowed("12.0"));
    /// NetBackup 8.3.
    pub const V3: ApiVersion = ApiVersion(Cow::Borrowed("3.0"));

    /// Negotiation candidates, highest priority first.
    pub const CANDIDATES: &'static [ApiVersion] = &[Self::V13, Self::V12, Self::V3];

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value of the `Accept` header selecting this revision.
    pub fn media_type(&self) -> String {
        format!("{}{}", MEDIA_TYPE_PREFIX, self.0)
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ApiVersion {
    type Err = String;

    /// Accepts `major.minor` with numeric parts, e.g. `"12.0"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut parts = s.split('.');
        let valid = match (parts.next(), parts.next(), parts.next()) {
            (Some(major), Some(minor), None) => {
                !major.is_empty()
                    && !minor.is_empty()
                    && major.chars().all(|c| c.is_ascii_digit())
                    && minor.chars().all(|c| c.is_ascii_digit())
            }
            _ => false,
        };
        if !valid {
            return Err(format!(
                "invalid API version '{}' (expected e.g. 13.0)",
                s
            ));
        }
        Ok(ApiVersion(Cow::Owned(s.to_string())))
    }
}

/// One low-cost request that tells whether a version is accepted.
pub trait VersionProbe: Send + Sync {
    /// Endpoint reported to instrumentation.
    fn endpoint(&self) -> &str;

    fn probe(
        &self,
        cancel: &CancellationToken,
        version: &ApiVersion,
    ) -> impl Future<Output = Result<(), FetchError>> + Send;
}

/// Probes `candidates` in order and returns the first accepted version.
pub async fn negotiate<P: VersionProbe>(
    probe: &P,
    candidates: &[ApiVersion],
    cancel: &CancellationToken,
    instrumentation: &Instrumentation,
) -> Result<ApiVersion, VersionError> {
    let mut overall = instrumentation.span("detect_version");
    overall.attr("endpoint", probe.endpoint());

    let mut attempted: Vec<ApiVersion> = Vec::with_capacity(candidates.len());
    let result = loop_candidates(probe, candidates, cancel, instrumentation, &mut attempted).await;

    let list = attempted
        .iter()
        .map(|v| v.as_str())
        .collect::<Vec<_>>()
        .join(",");
    overall.attr("versions_attempted", list);
    match &result {
        Ok(version) => {
            overall.attr("status", "ok");
            overall.attr("version", version.as_str());
        }
        Err(e) => {
            overall.attr("status", "error");
            overall.record_error(e);
        }
    }
    result
}

async fn loop_candidates<P: VersionProbe>(
    probe: &P,
    candidates: &[ApiVersion],
    cancel: &CancellationToken,
    instrumentation: &Instrumentation,
    attempted: &mut Vec<ApiVersion>,
) -> Result<ApiVersion, VersionError> {
    for version in candidates {
        if cancel.is_cancelled() {
            return Err(VersionError::Cancelled);
        }
        attempted.push(version.clone());

        let mut span = instrumentation.span("detect_version");
        span.attr("endpoint", probe.endpoint());
        span.attr("version", version.as_str());

        match probe.probe(cancel, version).await {
            Ok(()) => {
                span.attr("status", "accepted");
                info!(version = %version, "API version accepted");
                return Ok(version.clone());
            }
            Err(e) if e.kind() == ErrorKind::NotAcceptable => {
                span.attr("status", "not_acceptable");
                debug!(version = %version, "API version not acceptable, trying next");
            }
            Err(FetchError::Cancelled) => {
                span.attr("status", "cancelled");
                return Err(VersionError::Cancelled);
            }
            Err(e) => {
                span.attr("status", "failed");
                span.record_error(&e);
                warn!(version = %version, error = %e, "version probe failed");
                return Err(VersionError::Probe {
                    version: version.clone(),
                    source: e,
                });
            }
        }
    }

    Err(VersionError::NoneAccepted {
        attempted: attempted.clone(),
    })
}

/// Probe issuing `GET <base>/admin/jobs?page[limit]=1` over a transport.
pub struct HttpProbe<'a> {
    transport: &'a HttpTransport,
    url: Url,
    credential: &'a Credential,
}

impl<'a> HttpProbe<'a> {
    pub fn new(
        transport: &'a HttpTransport,
        base_url: &Url,
        credential: &'a Credential,
    ) -> Result<Self, FetchError> {
        let mut url = endpoint_url(base_url, PROBE_ENDPOINT)?;
        url.query_pairs_mut().append_pair("page[limit]", "1");
        Ok(Self {
            transport,
            url,
            credential,
        })
    }
}

impl VersionProbe for HttpProbe<'_> {
    fn endpoint(&self) -> &str {
        PROBE_ENDPOINT
    }

    async fn probe(
        &self,
        cancel: &CancellationToken,
        version: &ApiVersion,
    ) -> Result<(), FetchError> {
        self.transport
            .get_json::<serde::de::IgnoredAny>(
                cancel,
                &self.url,
                self.credential,
                &version.media_type(),
            )
            .await
            .map(|_| ())
    }
}

/// Picks the highest protocol version the server accepts.
///
/// Reads only its arguments; the caller decides what to do with the result.
pub async fn detect_version(
    cancel: &CancellationToken,
    transport: &HttpTransport,
    base_url: &Url,
    credential: &Credential,
    instrumentation: &Instrumentation,
) -> Result<ApiVersion, VersionError> {
    let probe = HttpProbe::new(transport, base_url, credential).map_err(|e| VersionError::Probe {
        version: ApiVersion::CANDIDATES[0].clone(),
        source: e,
    })?;
    negotiate(&probe, ApiVersion::CANDIDATES, cancel, instrumentation).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::Router;
    use axum::http::{HeaderMap, StatusCode, header};
    use axum::routing::get;

    use super::*;
    use crate::client::test_server::serve;
    use crate::config::ConfigSnapshot;
    use crate::instrument::testing::RecordingSink;

    /// Probe answering from a scripted list, one entry per call.
    struct ScriptedProbe {
        answers: Mutex<Vec<Result<(), FetchError>>>,
        calls: Mutex<Vec<ApiVersion>>,
    }

    impl ScriptedProbe {
        fn new(answers: Vec<Result<(), FetchError>>) -> Self {
            Self {
                answers: Mutex::new(answers.into_iter().rev().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<ApiVersion> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl VersionProbe for ScriptedProbe {
        fn endpoint(&self) -> &str {
            "/admin/jobs"
        }

        async fn probe(
            &self,
            _cancel: &CancellationToken,
            version: &ApiVersion,
        ) -> Result<(), FetchError> {
            self.calls.lock().unwrap().push(version.clone());
            self.answers.lock().unwrap().pop().unwrap_or(Ok(()))
        }
    }

    fn status(code: u16) -> FetchError {
        FetchError::Status {
            status: code,
            retry_after: None,
            body: String::new(),
        }
    }

    #[tokio::test]
    async fn first_accepted_candidate_wins() {
        let probe = ScriptedProbe::new(vec![Ok(())]);
        let v = negotiate(
            &probe,
            ApiVersion::CANDIDATES,
            &CancellationToken::new(),
            &Instrumentation::disabled(),
        )
        .await
        .unwrap();
        assert_eq!(v, ApiVersion::V13);
        assert_eq!(probe.calls(), vec![ApiVersion::V13]);
    }

    #[tokio::test]
    async fn not_acceptable_falls_through_to_next() {
        let probe = ScriptedProbe::new(vec![Err(status(406)), Ok(())]);
        let v = negotiate(
            &probe,
            ApiVersion::CANDIDATES,
            &CancellationToken::new(),
            &Instrumentation::disabled(),
        )
        .await
        .unwrap();
        assert_eq!(v, ApiVersion::V12);
        assert_eq!(probe.calls().len(), 2);
    }

    #[tokio::test]
    async fn auth_failure_stops_immediately() {
        let probe = ScriptedProbe::new(vec![Err(status(401)), Ok(())]);
        let err = negotiate(
            &probe,
            ApiVersion::CANDIDATES,
            &CancellationToken::new(),
            &Instrumentation::disabled(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            VersionError::Probe { ref version, .. } if *version == ApiVersion::V13
        ));
        assert_eq!(probe.calls().len(), 1);
    }

    #[tokio::test]
    async fn transport_failure_stops_immediately() {
        let probe = ScriptedProbe::new(vec![
            Err(status(406)),
            Err(FetchError::Transport {
                message: "connection refused".into(),
                timeout: false,
            }),
        ]);
        let err = negotiate(
            &probe,
            ApiVersion::CANDIDATES,
            &CancellationToken::new(),
            &Instrumentation::disabled(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(probe.calls(), vec![ApiVersion::V13, ApiVersion::V12]);
    }

    #[tokio::test]
    async fn exhausting_candidates_lists_all_attempts() {
        let probe = ScriptedProbe::new(vec![Err(status(406)), Err(status(406)), Err(status(406))]);
        let sink = Arc::new(RecordingSink::default());
        let err = negotiate(
            &probe,
            ApiVersion::CANDIDATES,
            &CancellationToken::new(),
            &Instrumentation::new(sink.clone()),
        )
        .await
        .unwrap_err();
        match err {
            VersionError::NoneAccepted { attempted } => {
                assert_eq!(attempted, ApiVersion::CANDIDATES.to_vec())
            }
            other => panic!("unexpected error: {other}"),
        }
        // Three attempts plus the overall operation.
        assert_eq!(sink.spans_named("detect_version").len(), 4);
    }

    #[tokio::test]
    async fn cancelled_before_first_probe() {
        let probe = ScriptedProbe::new(vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = negotiate(&probe, ApiVersion::CANDIDATES, &cancel, &Instrumentation::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, VersionError::Cancelled));
        assert!(probe.calls().is_empty());
    }

    #[test]
    fn parses_and_renders_versions() {
        let v: ApiVersion = "12.0".parse().unwrap();
        assert_eq!(v, ApiVersion::V12);
        assert_eq!(
            v.media_type(),
            "application/vnd.netbackup+json;version=12.0"
        );
        assert!("12".parse::<ApiVersion>().is_err());
        assert!("v12.0".parse::<ApiVersion>().is_err());
    }

    #[tokio::test]
    async fn http_negotiation_settles_on_12_after_two_probes() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/netbackup/admin/jobs",
            get(move |headers: HeaderMap| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let accept = headers
                        .get(header::ACCEPT)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    if accept.ends_with("version=12.0") {
                        (StatusCode::OK, r#"{"data": []}"#)
                    } else {
                        (StatusCode::NOT_ACCEPTABLE, "")
                    }
                }
            }),
        );
        let base = serve(router).await;
        let cfg = ConfigSnapshot::builder(base, Credential::new("key")).build().unwrap();
        let transport = HttpTransport::new(&cfg).unwrap();

        let v = detect_version(
            &CancellationToken::new(),
            &transport,
            cfg.base_url(),
            cfg.credential(),
            &Instrumentation::disabled(),
        )
        .await
        .unwrap();
        assert_eq!(v, ApiVersion::V12);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
