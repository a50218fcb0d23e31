//! Exporter service: the owner of the client and the collector.
//!
//! Shutdown runs in a fixed order:
//! 1. stop accepting new cycles (`scrape` returns `Closed`)
//! 2. wait, bounded by the drain timeout, for running cycles
//! 3. close the fetch client (drain, then release the pool)
//! 4. flush instrumentation

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{FetchClient, Lifecycle};
use crate::collector::{CollectionResult, Collector, HealthSnapshot};
use crate::config::ConfigSnapshot;
use crate::error::FetchError;
use crate::instrument::Instrumentation;

/// Result of a health check.
#[derive(Debug, Clone)]
pub struct Health {
    /// Outcome of the live connectivity probe.
    pub ping: Result<(), FetchError>,
    pub snapshot: HealthSnapshot,
}

impl Health {
    /// Healthy when the master answers and the last cycle (if any) was up.
    pub fn is_healthy(&self) -> bool {
        self.ping.is_ok() && (self.snapshot.last_cycle.is_none() || self.snapshot.up)
    }

    /// Short human-readable reason when unhealthy.
    pub fn reason(&self) -> Option<String> {
        if let Err(e) = &self.ping {
            return Some(format!("ping failed: {}", e));
        }
        if self.snapshot.last_cycle.is_some() && !self.snapshot.up {
            return Some("last collection cycle failed for every source".to_string());
        }
        None
    }
}

#[derive(Debug)]
pub struct Exporter {
    collector: Collector<FetchClient>,
    cycles: Lifecycle,
    drain_timeout: Duration,
    instrumentation: Instrumentation,
}

impl Exporter {
    pub fn new(client: Arc<FetchClient>, instrumentation: Instrumentation) -> Self {
        let config = client.config().clone();
        Self {
            drain_timeout: config.http().drain_timeout,
            collector: Collector::new(client, config, instrumentation.clone()),
            cycles: Lifecycle::new(),
            instrumentation,
        }
    }

    /// Connects (negotiating the API version if needed) and builds the exporter.
    pub async fn start(
        cancel: &CancellationToken,
        config: Arc<ConfigSnapshot>,
        instrumentation: Instrumentation,
    ) -> Result<Self, FetchError> {
        let client = FetchClient::connect(cancel, config, &instrumentation).await?;
        info!(
            base_url = %client.config().base_url(),
            version = %client.version(),
            "exporter started"
        );
        Ok(Self::new(Arc::new(client), instrumentation))
    }

    pub fn client(&self) -> Arc<FetchClient> {
        self.collector.client()
    }

    pub fn collector(&self) -> &Collector<FetchClient> {
        &self.collector
    }

    /// Runs one collection cycle.
    pub async fn scrape(&self, cancel: &CancellationToken) -> Result<CollectionResult, FetchError> {
        let _cycle = self.cycles.enter()?;
        Ok(self.collector.collect(cancel).await)
    }

    /// Points the exporter at a new snapshot.
    ///
    /// Connects a client for `config` first; on failure the current target
    /// stays in place. The replaced client is drained and closed.
    pub async fn retarget(
        &self,
        cancel: &CancellationToken,
        config: Arc<ConfigSnapshot>,
    ) -> Result<(), FetchError> {
        let _cycle = self.cycles.enter()?;
        let client = Arc::new(FetchClient::connect(cancel, config, &self.instrumentation).await?);
        let config = client.config().clone();
        info!(
            base_url = %config.base_url(),
            version = %client.version(),
            "exporter retargeted"
        );

        let previous = self.collector.retarget(client, config);
        if let Err(e) = previous.close(cancel).await {
            warn!(error = %e, "replaced client did not close cleanly");
        }
        Ok(())
    }

    /// Live ping combined with the collector's last known state.
    pub async fn health(&self, cancel: &CancellationToken) -> Health {
        let ping = self.client().ping(cancel).await;
        Health {
            ping,
            snapshot: self.collector.health(),
        }
    }

    /// Stops the exporter. See the module docs for the order of steps.
    ///
    /// Every step runs even if an earlier one fails; the first error is
    /// returned.
    pub async fn shutdown(&self, cancel: &CancellationToken) -> Result<(), FetchError> {
        if !self.cycles.begin_close() {
            return Err(FetchError::AlreadyClosed);
        }
        info!(running_cycles = self.cycles.in_flight(), "exporter shutting down");

        let drained = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            r = self.cycles.drain(self.drain_timeout) => {
                r.map_err(|in_flight| FetchError::DrainTimeout { in_flight })
            }
        };
        if let Err(e) = &drained {
            warn!(error = %e, "collection cycles still running at shutdown");
        }

        let closed = self.client().close(cancel).await;
        self.instrumentation.flush();
        info!("exporter stopped");
        drained.and(closed)
    }
}
