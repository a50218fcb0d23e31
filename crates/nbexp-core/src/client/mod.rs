//! Authenticated HTTP access to the NetBackup REST API.
//!
//! # Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ FetchClient  (ApiClient)                      │
//! │  - negotiated ApiVersion → Accept header      │
//! │  - credential → Authorization header          │
//! │  ┌────────────────────────────────────────┐   │
//! │  │ HttpTransport                          │   │
//! │  │  - reqwest pool, TLS floor, timeouts   │   │
//! │  │  - retry/backoff (retry.rs)            │   │
//! │  │  - in-flight tracking (lifecycle.rs)   │   │
//! │  └────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Fetchers and the collector only see the [`ApiClient`] trait, so they run
//! unchanged against [`mock::MockApi`] in tests.

mod lifecycle;
pub mod mock;
pub mod retry;

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use reqwest::Url;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::de::{DeserializeOwned, IgnoredAny};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigSnapshot, Credential};
use crate::error::FetchError;
use crate::instrument::Instrumentation;
use crate::version::{ApiVersion, detect_version};

pub(crate) use lifecycle::Lifecycle;
pub use retry::RetryPolicy;

/// Cheapest authenticated endpoint; used for version probes and pings.
pub const PROBE_ENDPOINT: &str = "/admin/jobs";

/// Longest error body kept in [`FetchError::Status`].
const MAX_ERROR_BODY: usize = 256;

/// Appends an API path to the configured base URL.
///
/// `https://host:1556/netbackup` + `/admin/jobs` →
/// `https://host:1556/netbackup/admin/jobs`.
pub fn endpoint_url(base: &Url, path: &str) -> Result<Url, FetchError> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", joined, e)))
}

/// Source of decoded API responses.
pub trait ApiClient: Send + Sync {
    fn base_url(&self) -> &Url;

    /// GETs `url` and decodes the JSON body into `T`.
    fn fetch_data<T>(
        &self,
        cancel: &CancellationToken,
        url: Url,
    ) -> impl Future<Output = Result<T, FetchError>> + Send
    where
        T: DeserializeOwned + Send;
}

/// Pooled HTTP transport with retries and a drain-then-close lifecycle.
///
/// Holds no version or credential of its own, so the same pool serves the
/// version probes and the regular calls.
#[derive(Debug)]
pub struct HttpTransport {
    http: Mutex<Option<reqwest::Client>>,
    lifecycle: Lifecycle,
    retry: RetryPolicy,
    request_timeout: Duration,
    drain_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &ConfigSnapshot) -> Result<Self, FetchError> {
        let tuning = config.http();
        let tls = config.tls();
        if tls.insecure_skip_verify {
            warn!("TLS certificate verification is disabled");
        }

        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .min_tls_version(tls.min_version.to_reqwest())
            .danger_accept_invalid_certs(tls.insecure_skip_verify)
            .connect_timeout(tuning.connect_timeout)
            .timeout(tuning.request_timeout)
            .pool_max_idle_per_host(tuning.pool_max_idle_per_host)
            .pool_idle_timeout(tuning.pool_idle_timeout)
            .user_agent(concat!("nbexp/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::ClientBuild(e.to_string()))?;

        Ok(Self {
            http: Mutex::new(Some(http)),
            lifecycle: Lifecycle::new(),
            retry: RetryPolicy::from_tuning(tuning),
            request_timeout: tuning.request_timeout,
            drain_timeout: tuning.drain_timeout,
        })
    }

    /// Number of calls currently running.
    pub fn in_flight(&self) -> usize {
        self.lifecycle.in_flight()
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    fn pool(&self) -> Result<reqwest::Client, FetchError> {
        let slot = self.http.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().cloned().ok_or(FetchError::Closed)
    }

    /// GETs `url` with retries and decodes the body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        url: &Url,
        credential: &Credential,
        accept: &str,
    ) -> Result<T, FetchError> {
        let _guard = self.lifecycle.enter()?;
        let http = self.pool()?;

        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                r = self.send_once::<T>(&http, url, credential, accept) => r,
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt, e.retry_after());
                    attempt += 1;
                    warn!(
                        url = %url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "request failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        http: &reqwest::Client,
        url: &Url,
        credential: &Credential,
        accept: &str,
    ) -> Result<T, FetchError> {
        let response = http
            .get(url.clone())
            .header(ACCEPT, accept)
            .header(AUTHORIZATION, credential.expose())
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry::parse_retry_after(response.headers(), Utc::now());
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(FetchError::Status {
                status: status.as_u16(),
                retry_after,
                body,
            });
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode(e.to_string()))
    }

    /// Stops accepting calls, waits for in-flight ones, then drops the pool.
    ///
    /// The pool is released even when the drain deadline passes or `cancel`
    /// fires; calls still running hold their own handle to it. A second call
    /// returns [`FetchError::AlreadyClosed`] and releases nothing.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<(), FetchError> {
        if !self.lifecycle.begin_close() {
            return Err(FetchError::AlreadyClosed);
        }

        let pending = self.lifecycle.in_flight();
        debug!(in_flight = pending, "draining http transport");
        let drained = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            r = self.lifecycle.drain(self.drain_timeout) => {
                r.map_err(|in_flight| FetchError::DrainTimeout { in_flight })
            }
        };

        let released = self
            .http
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(released);

        match &drained {
            Ok(()) => info!("http transport closed"),
            Err(e) => warn!(error = %e, "http transport closed before drain completed"),
        }
        drained
    }
}

/// Versioned, authenticated client for one configuration snapshot.
#[derive(Debug)]
pub struct FetchClient {
    transport: HttpTransport,
    config: Arc<ConfigSnapshot>,
    version: ApiVersion,
    accept: String,
}

impl FetchClient {
    /// Builds a client for an already known `version`.
    pub fn new(config: Arc<ConfigSnapshot>, version: ApiVersion) -> Result<Self, FetchError> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::with_transport(transport, config, version))
    }

    fn with_transport(
        transport: HttpTransport,
        config: Arc<ConfigSnapshot>,
        version: ApiVersion,
    ) -> Self {
        let accept = version.media_type();
        Self {
            transport,
            config,
            version,
            accept,
        }
    }

    /// Builds a client, negotiating the version when the snapshot has none.
    ///
    /// The returned client carries a new snapshot with the version pinned;
    /// the snapshot passed in is left as is.
    pub async fn connect(
        cancel: &CancellationToken,
        config: Arc<ConfigSnapshot>,
        instrumentation: &Instrumentation,
    ) -> Result<Self, FetchError> {
        let transport = HttpTransport::new(&config)?;
        match config.api_version() {
            Some(version) => {
                info!(version = %version, "using configured API version");
                let version = version.clone();
                Ok(Self::with_transport(transport, config, version))
            }
            None => {
                let version = detect_version(
                    cancel,
                    &transport,
                    config.base_url(),
                    config.credential(),
                    instrumentation,
                )
                .await?;
                let pinned = Arc::new(config.with_api_version(version.clone()));
                Ok(Self::with_transport(transport, pinned, version))
            }
        }
    }

    pub fn version(&self) -> &ApiVersion {
        &self.version
    }

    pub fn config(&self) -> &Arc<ConfigSnapshot> {
        &self.config
    }

    pub fn in_flight(&self) -> usize {
        self.transport.in_flight()
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Lightweight connectivity check: one single-item jobs request.
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<(), FetchError> {
        let mut url = endpoint_url(self.config.base_url(), PROBE_ENDPOINT)?;
        url.query_pairs_mut().append_pair("page[limit]", "1");
        self.fetch_data::<IgnoredAny>(cancel, url).await.map(|_| ())
    }

    /// See [`HttpTransport::close`].
    pub async fn close(&self, cancel: &CancellationToken) -> Result<(), FetchError> {
        self.transport.close(cancel).await
    }
}

impl ApiClient for FetchClient {
    fn base_url(&self) -> &Url {
        self.config.base_url()
    }

    async fn fetch_data<T>(&self, cancel: &CancellationToken, url: Url) -> Result<T, FetchError>
    where
        T: DeserializeOwned + Send,
    {
        self.transport
            .get_json(cancel, &url, self.config.credential(), &self.accept)
            .await
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    //! In-process axum server for exercising the real HTTP path.

    use axum::Router;

    /// Serves `router` on an ephemeral port and returns `http://addr/netbackup`.
    pub(crate) async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/netbackup", addr)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::http::{HeaderMap, StatusCode, header};
    use axum::response::IntoResponse;
    use axum::routing::get;

    use super::test_server::serve;
    use super::*;
    use crate::config::HttpTuning;
    use crate::error::ErrorKind;

    fn fast_tuning() -> HttpTuning {
        HttpTuning {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(5),
            retry_max_delay: Duration::from_millis(50),
            drain_timeout: Duration::from_secs(5),
            ..HttpTuning::default()
        }
    }

    fn client_for(base: String) -> FetchClient {
        let cfg = ConfigSnapshot::builder(base, Credential::new("secret-key"))
            .api_version(Some(ApiVersion::V13))
            .http(fast_tuning())
            .build()
            .unwrap();
        FetchClient::new(Arc::new(cfg), ApiVersion::V13).unwrap()
    }

    fn url(client: &FetchClient, path: &str) -> Url {
        endpoint_url(client.base_url(), path).unwrap()
    }

    #[test]
    fn endpoint_url_joins_paths() {
        let base = Url::parse("https://nbu:1556/netbackup/").unwrap();
        assert_eq!(
            endpoint_url(&base, "/admin/jobs").unwrap().as_str(),
            "https://nbu:1556/netbackup/admin/jobs"
        );
        let base = Url::parse("https://nbu:1556/netbackup").unwrap();
        assert_eq!(
            endpoint_url(&base, "storage/storage-units").unwrap().as_str(),
            "https://nbu:1556/netbackup/storage/storage-units"
        );
    }

    #[tokio::test]
    async fn sends_credential_and_version_headers() {
        let router = Router::new().route(
            "/netbackup/admin/jobs",
            get(|headers: HeaderMap| async move {
                let auth = headers.get(header::AUTHORIZATION).cloned();
                let accept = headers.get(header::ACCEPT).cloned();
                if auth.as_ref().and_then(|v| v.to_str().ok()) == Some("secret-key")
                    && accept.as_ref().and_then(|v| v.to_str().ok())
                        == Some("application/vnd.netbackup+json;version=13.0")
                {
                    (StatusCode::OK, r#"{"data": [1, 2, 3]}"#)
                } else {
                    (StatusCode::UNAUTHORIZED, "")
                }
            }),
        );
        let client = client_for(serve(router).await);
        let page: serde_json::Value = client
            .fetch_data(&CancellationToken::new(), url(&client, "/admin/jobs"))
            .await
            .unwrap();
        assert_eq!(page["data"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn retries_server_errors_honoring_retry_after() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/netbackup/admin/jobs",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        (
                            StatusCode::SERVICE_UNAVAILABLE,
                            [(header::RETRY_AFTER, "0")],
                            "busy",
                        )
                            .into_response()
                    } else {
                        (StatusCode::OK, r#"{"data": []}"#).into_response()
                    }
                }
            }),
        );
        let client = client_for(serve(router).await);
        let page: serde_json::Value = client
            .fetch_data(&CancellationToken::new(), url(&client, "/admin/jobs"))
            .await
            .unwrap();
        assert!(page["data"].as_array().unwrap().is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/netbackup/admin/jobs",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::TOO_MANY_REQUESTS, "slow down")
                }
            }),
        );
        let client = client_for(serve(router).await);
        let err = client
            .fetch_data::<serde_json::Value>(&CancellationToken::new(), url(&client, "/admin/jobs"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(429));
        // first attempt + max_retries
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn authentication_failure_is_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/netbackup/admin/jobs",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::UNAUTHORIZED, "bad key")
                }
            }),
        );
        let client = client_for(serve(router).await);
        let err = client
            .fetch_data::<serde_json::Value>(&CancellationToken::new(), url(&client, "/admin/jobs"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(err.to_string().contains("bad key"));
    }

    #[tokio::test]
    async fn undecodable_body_is_a_shape_error() {
        let router = Router::new().route("/netbackup/admin/jobs", get(|| async { "not json" }));
        let client = client_for(serve(router).await);
        let err = client
            .fetch_data::<serde_json::Value>(&CancellationToken::new(), url(&client, "/admin/jobs"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResponseShape);
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = client_for(format!("http://{}/netbackup", addr));
        let err = client
            .fetch_data::<serde_json::Value>(&CancellationToken::new(), url(&client, "/admin/jobs"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_slow_call() {
        let router = Router::new().route(
            "/netbackup/admin/jobs",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "{}"
            }),
        );
        let client = client_for(serve(router).await);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = client
            .fetch_data::<serde_json::Value>(&cancel, url(&client, "/admin/jobs"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn close_twice_reports_already_closed() {
        let router = Router::new().route("/netbackup/admin/jobs", get(|| async { "{}" }));
        let client = client_for(serve(router).await);
        let cancel = CancellationToken::new();
        client.close(&cancel).await.unwrap();
        assert!(matches!(
            client.close(&cancel).await,
            Err(FetchError::AlreadyClosed)
        ));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn calls_after_close_fail_immediately() {
        let router = Router::new().route("/netbackup/admin/jobs", get(|| async { "{}" }));
        let client = client_for(serve(router).await);
        let cancel = CancellationToken::new();
        client.close(&cancel).await.unwrap();
        let err = client
            .fetch_data::<serde_json::Value>(&cancel, url(&client, "/admin/jobs"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Closed));
        assert!(matches!(client.ping(&cancel).await, Err(FetchError::Closed)));
    }

    #[tokio::test]
    async fn close_waits_for_in_flight_request() {
        let router = Router::new().route(
            "/netbackup/admin/jobs",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                r#"{"data": []}"#
            }),
        );
        let client = Arc::new(client_for(serve(router).await));
        let cancel = CancellationToken::new();

        let call = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let url = endpoint_url(client.base_url(), "/admin/jobs").unwrap();
                client.fetch_data::<serde_json::Value>(&cancel, url).await
            })
        };
        while client.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        client.close(&cancel).await.unwrap();
        assert_eq!(client.in_flight(), 0);
        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn connect_negotiates_when_version_unset() {
        let router = Router::new().route(
            "/netbackup/admin/jobs",
            get(|headers: HeaderMap| async move {
                let accept = headers
                    .get(header::ACCEPT)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                if accept.ends_with("version=3.0") {
                    (StatusCode::OK, r#"{"data": []}"#)
                } else {
                    (StatusCode::NOT_ACCEPTABLE, "")
                }
            }),
        );
        let base = serve(router).await;
        let cfg = Arc::new(
            ConfigSnapshot::builder(base, Credential::new("k"))
                .http(fast_tuning())
                .build()
                .unwrap(),
        );
        let client = FetchClient::connect(&CancellationToken::new(), cfg.clone(), &Instrumentation::disabled())
            .await
            .unwrap();
        assert_eq!(client.version(), &ApiVersion::V3);
        assert_eq!(client.config().api_version(), Some(&ApiVersion::V3));
        assert!(cfg.api_version().is_none());
        client.ping(&CancellationToken::new()).await.unwrap();
    }
}
