// Library crate: some public API items are only used by the binary or by tests
#![allow(unused)]

//! # boxwatch
//!
//! A watchdog daemon for a small enclosure of network appliances (router,
//! wireless access point, modem). It continuously estimates the health of
//! each appliance and of the broader network path, reflects that health
//! through multi-color indicator lights, and power-cycles an appliance
//! through a relay-controlled outlet when an operator holds the matching
//! button long enough to confirm.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                       free-running workers                     │
//! │  ┌────────┐   ┌─────────────┐      ┌──────────┐  ┌──────────┐  │
//! │  │ probe  │──▶│   state     │◀─────│ button   │─▶│ gesture  │  │
//! │  │ (ping/ │   │ (freshness, │      │ monitor  │  │ detector │  │
//! │  │  http) │   │  commands,  │      └──────────┘  └────┬─────┘  │
//! │  └────────┘   │  suppress)  │                         ▼        │
//! │               └──────┬──────┘ ◀─────────────── ┌───────────┐   │
//! │                      │                         │ sequencer │   │
//! │               ┌──────▼─────┐   ┌───────────┐   │ (power    │   │
//! │               │ classifier │──▶│ indicator │   │  cycle)   │   │
//! │               └────────────┘   │ renderer  │   └───────────┘   │
//! │                                └───────────┘                   │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **[`state`]**: the shared context every worker holds: per-target
//!   freshness timestamps, per-indicator commands, the suppression flag,
//!   the flash-phase clock, and the active power-cycle job table
//! - **[`probe`]**: reachability checks (bounded network echo) and the
//!   multi-endpoint HTTP health aggregator, both advancing freshness
//! - **[`classify`]**: converts staleness into tri-state health and issues
//!   indicator commands, unless suppressed by manual activity
//! - **[`button`]** / **[`gesture`]**: debounced press/hold tracking and
//!   the hold-duration state machine that commits a power cycle
//! - **[`cycle`]**: the exclusive power-cycle sequencer (confirm, off,
//!   staggered restore)
//! - **[`indicator`]**: level-driven rendering of commanded
//!   `{color, flashing}` pairs against a shared flash clock
//! - **[`hal`]**: the seam to the physical lines; real deployments
//!   implement these traits, the built-in simulation backs tests
//!
//! There is no central scheduler: each worker is a periodic tokio task
//! that sleeps on its own interval and stops cooperatively on a shared
//! shutdown signal. An in-flight relay sequence is never cancelled, even
//! during shutdown: once outlet power has been dropped, the sequence runs
//! to completion so hardware is never left in an indeterminate state.

pub mod button;
pub mod classify;
pub mod config;
pub mod cycle;
pub mod fan;
pub mod gesture;
pub mod hal;
pub mod indicator;
pub mod probe;
pub mod state;
pub mod supervisor;

// Re-export main types for convenience
pub use button::{ButtonHandle, ButtonMonitor};
pub use classify::{classify, Bounds, HealthClassifier, HealthState};
pub use config::Settings;
pub use cycle::PowerCycleSequencer;
pub use gesture::GestureDetector;
pub use indicator::{Color, FlashClock, IndicatorCommand, IndicatorRenderer};
pub use state::{CyclePhase, TargetId, WatchdogState};
pub use supervisor::Supervisor;
