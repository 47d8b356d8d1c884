//! Reachability and service-health probes.
//!
//! Both probes are free-running periodic workers that only ever advance a
//! target's freshness on a successful check. A failed check of any kind
//! (timeout, unreachable host, process error, refused connection) leaves
//! freshness untouched and is logged at debug level; the next scheduled
//! period is the only retry mechanism.

mod http;
mod ping;

pub use http::{EndpointDetail, ServiceHealthAggregator};
pub use ping::PingProbe;

use thiserror::Error;

/// Why a single check failed. Every variant is handled identically: the
/// target gets no freshness update this cycle.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("check timed out")]
    TimedOut,
    #[error("host did not answer")]
    HostDown,
    #[error("check could not run: {0}")]
    Launch(#[from] std::io::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}
