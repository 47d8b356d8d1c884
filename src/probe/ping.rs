//! Single-address reachability probe.
//!
//! Issues one bounded network echo per period by invoking the system
//! `ping` with a hard timeout wrapped around the whole invocation. A
//! nonzero exit, a spawn failure, and a timeout are all the same failure.
//! Invocations never overlap for a target: the next echo is not issued
//! until the previous one has resolved, and probe duration is bounded by
//! a timeout no longer than the period.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::ProbeError;
use crate::state::{TargetId, WatchdogState};

#[derive(Debug)]
pub struct PingProbe {
    target: TargetId,
    address: String,
    period: Duration,
    timeout: Duration,
    state: Arc<WatchdogState>,
}

impl PingProbe {
    pub fn new(
        target: TargetId,
        address: impl Into<String>,
        period: Duration,
        timeout: Duration,
        state: Arc<WatchdogState>,
    ) -> Self {
        Self {
            target,
            address: address.into(),
            period,
            timeout,
            state,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let outcome = self.check().await;
                    self.record(outcome);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(target = %self.target, "reachability probe stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One bounded echo against the configured address.
    async fn check(&self) -> Result<(), ProbeError> {
        let mut command = Command::new("ping");
        command
            .arg("-n")
            .arg("-c")
            .arg("1")
            .arg("-W")
            .arg(self.timeout.as_secs().max(1).to_string())
            .arg(&self.address)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let status = tokio::time::timeout(self.timeout, command.status())
            .await
            .map_err(|_| ProbeError::TimedOut)??;

        if status.success() {
            Ok(())
        } else {
            Err(ProbeError::HostDown)
        }
    }

    /// Fold a check outcome into the shared state. Success advances
    /// freshness; failure of any kind leaves it exactly where it was.
    fn record(&self, outcome: Result<(), ProbeError>) {
        match outcome {
            Ok(()) => {
                trace!(target = %self.target, address = %self.address, "reachable");
                self.state.mark_good(self.target);
            }
            Err(error) => {
                debug!(target = %self.target, address = %self.address, %error, "check failed");
            }
        }
    }
}
