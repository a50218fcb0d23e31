//! Immutable configuration snapshot.
//!
//! A [`ConfigSnapshot`] is built once through [`ConfigBuilder`], validated,
//! and then shared read-only as `Arc<ConfigSnapshot>`. Nothing in the engine
//! mutates it; producing a different configuration means building a new
//! snapshot (see [`ConfigSnapshot::with_api_version`]).

use std::fmt;
use std::time::Duration;

use reqwest::Url;

use crate::error::ConfigError;
use crate::version::ApiVersion;

/// Default jobs look-back window.
pub const DEFAULT_SCRAPE_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Default lifetime of cached storage metrics.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// API key sent to the server. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Minimum TLS protocol version accepted for outbound connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsFloor {
    #[default]
    Tls12,
    Tls13,
}

impl TlsFloor {
    pub(crate) fn to_reqwest(self) -> reqwest::tls::Version {
        match self {
            TlsFloor::Tls12 => reqwest::tls::Version::TLS_1_2,
            TlsFloor::Tls13 => reqwest::tls::Version::TLS_1_3,
        }
    }
}

impl std::str::FromStr for TlsFloor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1.2" | "tls1.2" | "TLS1.2" => Ok(TlsFloor::Tls12),
            "1.3" | "tls1.3" | "TLS1.3" => Ok(TlsFloor::Tls13),
            other => Err(format!("unsupported TLS version '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlsPolicy {
    pub min_version: TlsFloor,
    /// Accept any server certificate. Only for lab setups with self-signed masters.
    pub insecure_skip_verify: bool,
}

/// Connection pool, timeout and retry tuning for the fetch client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTuning {
    /// Upper bound for one HTTP exchange, body included.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// How long `close` waits for in-flight calls.
    pub drain_timeout: Duration,
}

impl Default for HttpTuning {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            pool_max_idle_per_host: 8,
            pool_idle_timeout: Duration::from_secs(90),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Validated, read-only configuration for one exporter instance.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    base_url: Url,
    credential: Credential,
    api_version: Option<ApiVersion>,
    scrape_window: Duration,
    cache_ttl: Duration,
    http: HttpTuning,
    tls: TlsPolicy,
}

impl ConfigSnapshot {
    /// Starts a builder for the given master server URL and API key.
    pub fn builder(base_url: impl Into<String>, credential: Credential) -> ConfigBuilder {
        ConfigBuilder {
            base_url: base_url.into(),
            credential,
            api_version: None,
            scrape_window: DEFAULT_SCRAPE_WINDOW,
            cache_ttl: DEFAULT_CACHE_TTL,
            http: HttpTuning::default(),
            tls: TlsPolicy::default(),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Version pinned by configuration, `None` when it must be negotiated.
    pub fn api_version(&self) -> Option<&ApiVersion> {
        self.api_version.as_ref()
    }

    pub fn scrape_window(&self) -> Duration {
        self.scrape_window
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    pub fn http(&self) -> &HttpTuning {
        &self.http
    }

    pub fn tls(&self) -> &TlsPolicy {
        &self.tls
    }

    /// Returns a new snapshot identical to this one but with `version` pinned.
    pub fn with_api_version(&self, version: ApiVersion) -> ConfigSnapshot {
        ConfigSnapshot {
            api_version: Some(version),
            ..self.clone()
        }
    }
}

/// Builder for [`ConfigSnapshot`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    base_url: String,
    credential: Credential,
    api_version: Option<ApiVersion>,
    scrape_window: Duration,
    cache_ttl: Duration,
    http: HttpTuning,
    tls: TlsPolicy,
}

impl ConfigBuilder {
    pub fn api_version(mut self, version: Option<ApiVersion>) -> Self {
        self.api_version = version;
        self
    }

    pub fn scrape_window(mut self, window: Duration) -> Self {
        self.scrape_window = window;
        self
    }

    /// Storage cache lifetime. `Duration::ZERO` disables caching.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn http(mut self, http: HttpTuning) -> Self {
        self.http = http;
        self
    }

    pub fn tls(mut self, tls: TlsPolicy) -> Self {
        self.tls = tls;
        self
    }

    pub fn build(self) -> Result<ConfigSnapshot, ConfigError> {
        let base_url = Url::parse(self.base_url.trim())
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", self.base_url, e)))?;
        match base_url.scheme() {
            "http" | "https" => {}
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
        if base_url.cannot_be_a_base() || base_url.host_str().is_none() {
            return Err(ConfigError::InvalidUrl(self.base_url));
        }
        if self.credential.is_empty() {
            return Err(ConfigError::EmptyCredential);
        }
        if self.scrape_window.is_zero() {
            return Err(ConfigError::ZeroDuration("scrape window"));
        }
        if self.http.request_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("request timeout"));
        }
        if self.http.drain_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("drain timeout"));
        }
        if self.http.retry_base_delay > self.http.retry_max_delay {
            return Err(ConfigError::RetryDelays);
        }

        Ok(ConfigSnapshot {
            base_url,
            credential: self.credential,
            api_version: self.api_version,
            scrape_window: self.scrape_window,
            cache_ttl: self.cache_ttl,
            http: self.http,
            tls: self.tls,
        })
    }
}
