//! nbexp-core - NetBackup metrics collection engine.
//!
//! This crate queries a NetBackup master server over its REST API and turns
//! storage units and finished jobs into labeled numeric series.
//!
//! # Modules
//!
//! - [`config`]: Immutable, validated configuration snapshot
//! - [`version`]: API version negotiation
//! - [`client`]: Authenticated HTTP client with retries and drain-on-close
//! - [`fetcher`]: Paginated storage and jobs fetchers
//! - [`cache`]: Single-slot TTL cache
//! - [`collector`]: Concurrent collection cycle with per-source failure
//! - [`exporter`]: Owner of client and collector, ordered shutdown
//! - [`model`]: Metric keys/values and API wire types
//! - [`instrument`]: Optional instrumentation capability

pub mod cache;
pub mod client;
pub mod collector;
pub mod config;
pub mod error;
pub mod exporter;
pub mod fetcher;
pub mod instrument;
pub mod model;
pub mod version;

pub use client::{ApiClient, FetchClient};
pub use collector::{CollectionResult, Collector, HealthSnapshot};
pub use config::{ConfigSnapshot, Credential, HttpTuning, TlsFloor, TlsPolicy};
pub use error::{ConfigError, ErrorKind, FetchError, VersionError};
pub use exporter::{Exporter, Health};
pub use instrument::{Instrumentation, TracingSink};
pub use version::ApiVersion;
