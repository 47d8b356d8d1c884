//! Worker lifecycle and coordinated shutdown.
//!
//! Every long-running worker is spawned through the supervisor and watches
//! the shared shutdown channel. Shutdown is ordered: first wait for any
//! in-flight power-cycle job to run to completion (an outlet is never left
//! dark), then signal the workers and join them within a bounded grace
//! window, aborting stragglers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::state::WatchdogState;

pub struct Supervisor {
    state: Arc<WatchdogState>,
    shutdown: watch::Sender<bool>,
    workers: Vec<(&'static str, JoinHandle<()>)>,
    grace: Duration,
}

impl Supervisor {
    pub fn new(state: Arc<WatchdogState>, grace: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state,
            shutdown,
            workers: Vec::new(),
            grace,
        }
    }

    /// A fresh receiver on the shutdown channel.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Spawn a named worker. Workers are expected to return once the
    /// shutdown channel flips to `true`.
    pub fn spawn<F>(&mut self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(worker = name, "worker started");
        self.workers.push((name, tokio::spawn(future)));
    }

    /// Run the ordered shutdown sequence.
    pub async fn shutdown(self) {
        // A committed relay sequence always finishes first
        if self.state.active_cycle_count() > 0 {
            info!("waiting for active power-cycle jobs to finish");
        }
        self.state.wait_cycles_idle().await;

        info!("stopping workers");
        // Receivers may all be gone already; nothing to do then
        let _ = self.shutdown.send(true);

        let deadline = Instant::now() + self.grace;
        for (name, handle) in self.workers {
            let abort = handle.abort_handle();
            match timeout_at(deadline, handle).await {
                Ok(Ok(())) => debug!(worker = name, "worker stopped"),
                Ok(Err(error)) => warn!(worker = name, %error, "worker panicked"),
                Err(_) => {
                    warn!(worker = name, "worker did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
        info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TargetId;
    use tokio::time::{advance, sleep};

    fn supervisor(state: Arc<WatchdogState>) -> Supervisor {
        Supervisor::new(state, Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn workers_stop_on_the_shutdown_signal() {
        let state = WatchdogState::new(false);
        let mut supervisor = supervisor(state);

        let mut shutdown = supervisor.subscribe();
        supervisor.spawn("worker", async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        });

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn a_stuck_worker_is_abandoned_after_the_grace_window() {
        let state = WatchdogState::new(false);
        let mut supervisor = supervisor(state);

        supervisor.spawn("stuck", async {
            sleep(Duration::from_secs(3600)).await;
        });

        let start = Instant::now();
        supervisor.shutdown().await;
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_active_cycle_jobs() {
        let state = WatchdogState::new(false);
        let guard = state.try_begin_cycle(TargetId::Router).unwrap();

        let supervisor = supervisor(state.clone());
        let shutdown = tokio::spawn(supervisor.shutdown());

        tokio::task::yield_now().await;
        advance(Duration::from_secs(30)).await;
        assert!(!shutdown.is_finished(), "shutdown must wait for the job");

        drop(guard);
        shutdown.await.unwrap();
    }
}
