//! Multi-endpoint service-health aggregator.
//!
//! Generalizes the reachability probe to N named HTTP endpoints (the
//! wireless access points), checked round-robin at a short fixed step with
//! a bounded per-request timeout. Each endpoint keeps its own freshness;
//! the aggregate target's freshness is the *oldest* of them, the worst-case
//! staleness, so one stale access point is enough to degrade the target.
//! One endpoint failing never stops the others from being checked.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::ProbeError;
use crate::state::{FreshnessCell, TargetId, WatchdogState};

#[derive(Debug)]
struct Endpoint {
    name: String,
    address: String,
    freshness: FreshnessCell,
}

/// Per-endpoint diagnostics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointDetail {
    pub name: String,
    pub address: String,
    /// Seconds since the last good check, or `None` if there never was one.
    pub staleness_secs: Option<f64>,
}

#[derive(Debug)]
pub struct ServiceHealthAggregator {
    target: TargetId,
    endpoints: Vec<Endpoint>,
    client: reqwest::Client,
    step: Duration,
    state: Arc<WatchdogState>,
}

impl ServiceHealthAggregator {
    pub fn new(
        target: TargetId,
        endpoints: &BTreeMap<String, String>,
        step: Duration,
        request_timeout: Duration,
        state: Arc<WatchdogState>,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            bail!("service-health aggregation needs at least one endpoint");
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("building service-health HTTP client")?;
        let endpoints = endpoints
            .iter()
            .map(|(name, address)| Endpoint {
                name: name.clone(),
                address: address.clone(),
                freshness: FreshnessCell::new(),
            })
            .collect();
        Ok(Self {
            target,
            endpoints,
            client,
            step,
            state,
        })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.step);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut index = 0usize;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let outcome = self.check_endpoint(index).await;
                    self.record(index, outcome);
                    index = (index + 1) % self.endpoints.len();
                    if index == 0 {
                        self.log_details();
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(target = %self.target, "service-health aggregator stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One bounded GET against one endpoint.
    async fn check_endpoint(&self, index: usize) -> Result<(), ProbeError> {
        let url = format!("http://{}/", self.endpoints[index].address);
        let response = self.client.get(&url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProbeError::HostDown)
        }
    }

    /// Fold one endpoint's outcome into its freshness cell and republish
    /// the aggregate. A failure touches nothing.
    fn record(&self, index: usize, outcome: Result<(), ProbeError>) {
        let endpoint = &self.endpoints[index];
        match outcome {
            Ok(()) => {
                trace!(endpoint = %endpoint.name, address = %endpoint.address, "healthy");
                endpoint.freshness.advance(self.state.epoch(), Instant::now());
                self.publish_aggregate();
            }
            Err(error) => {
                debug!(
                    endpoint = %endpoint.name,
                    address = %endpoint.address,
                    %error,
                    "check failed"
                );
            }
        }
    }

    /// Push the oldest endpoint freshness into the target's cell. Each
    /// endpoint cell is monotonic, so their minimum is monotonic too; the
    /// aggregate stays at "never seen" until every endpoint has answered
    /// at least once.
    fn publish_aggregate(&self) {
        let mut oldest = u64::MAX;
        for endpoint in &self.endpoints {
            match endpoint.freshness.millis() {
                Some(millis) => oldest = oldest.min(millis),
                None => return,
            }
        }
        self.state.advance_freshness_millis(self.target, oldest);
    }

    /// Worst-case staleness across all endpoints; `None` while any
    /// endpoint has never checked good.
    pub fn oldest_staleness(&self) -> Option<Duration> {
        let epoch = self.state.epoch();
        let now = Instant::now();
        let mut worst = Duration::ZERO;
        for endpoint in &self.endpoints {
            match endpoint.freshness.staleness(epoch, now) {
                Some(staleness) => worst = worst.max(staleness),
                None => return None,
            }
        }
        Some(worst)
    }

    /// Per-endpoint snapshot for diagnostics.
    pub fn details(&self) -> Vec<EndpointDetail> {
        let epoch = self.state.epoch();
        let now = Instant::now();
        self.endpoints
            .iter()
            .map(|endpoint| EndpointDetail {
                name: endpoint.name.clone(),
                address: endpoint.address.clone(),
                staleness_secs: endpoint
                    .freshness
                    .staleness(epoch, now)
                    .map(|d| d.as_secs_f64()),
            })
            .collect()
    }

    fn log_details(&self) {
        if tracing::enabled!(tracing::Level::DEBUG) {
            if let Ok(details) = serde_json::to_string(&self.details()) {
                debug!(target = %self.target, %details, "endpoint round complete");
            }
        }
    }
}
