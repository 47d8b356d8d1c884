//! The shared context every worker holds.
//!
//! This is the only cross-worker mutable state in the daemon: per-target
//! freshness timestamps, per-indicator commands, the suppression flag, the
//! flash-phase clock, and the active power-cycle job table. Each field has
//! a single logical writer except the suppression count, which is the one
//! place multiple workers read-modify-write and therefore atomic.
//!
//! All elapsed-time math uses [`tokio::time::Instant`], a monotonic clock
//! that the test suite can pause and advance deterministically.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::indicator::IndicatorCommand;

/// A monitored target. `Main` is the aggregate: its health is the worst of
/// the appliances and its power cycle sequences all three outlets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetId {
    Main,
    Wifi,
    Router,
    Modem,
}

impl TargetId {
    pub const ALL: [TargetId; 4] = [
        TargetId::Main,
        TargetId::Wifi,
        TargetId::Router,
        TargetId::Modem,
    ];

    /// The relay-backed appliances, excluding the aggregate.
    pub const APPLIANCES: [TargetId; 3] = [TargetId::Wifi, TargetId::Router, TargetId::Modem];

    pub fn label(&self) -> &'static str {
        match self {
            TargetId::Main => "main",
            TargetId::Wifi => "wifi",
            TargetId::Router => "router",
            TargetId::Modem => "modem",
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Phase of an active power-cycle job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// Operator feedback window before outlet power is dropped. The only
    /// phase in which the job can still be cancelled.
    Confirm,
    /// Outlet power is off.
    Off,
    /// Outlets are being restored (staggered for the aggregate).
    Restoring,
    /// All outlets restored; the job is about to clear.
    Done,
}

/// Timestamp of the last successful check for one target, stored as
/// milliseconds since the state's epoch. Zero means "never seen good".
///
/// Advancement uses `fetch_max`, so freshness is monotonically
/// non-decreasing even when probe completions land out of order.
#[derive(Debug, Default)]
pub struct FreshnessCell {
    millis: AtomicU64,
}

impl FreshnessCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to `now`. Never regresses.
    pub fn advance(&self, epoch: Instant, now: Instant) {
        self.advance_millis(instant_to_millis(epoch, now));
    }

    /// Advance to an absolute offset from the epoch. Never regresses.
    pub fn advance_millis(&self, millis: u64) {
        // Stored with a +1 offset so zero keeps meaning "never seen good"
        // and a success at the epoch instant itself is recorded exactly
        self.millis.fetch_max(millis.saturating_add(1), Ordering::Relaxed);
    }

    /// Epoch offset of the last good check, or `None` if there never was one.
    pub fn millis(&self) -> Option<u64> {
        self.millis.load(Ordering::Relaxed).checked_sub(1)
    }

    /// Time since the last good check, or `None` if there never was one.
    pub fn staleness(&self, epoch: Instant, now: Instant) -> Option<Duration> {
        let millis = self.millis()?;
        let good_at = epoch + Duration::from_millis(millis);
        Some(now.saturating_duration_since(good_at))
    }
}

fn instant_to_millis(epoch: Instant, at: Instant) -> u64 {
    at.saturating_duration_since(epoch).as_millis() as u64
}

/// Commanded `{color, flashing}` for one indicator, last-writer-wins.
#[derive(Debug, Default)]
struct IndicatorCell {
    command: RwLock<IndicatorCommand>,
}

/// Shared context passed to every worker at construction.
#[derive(Debug)]
pub struct WatchdogState {
    epoch: Instant,
    freshness: BTreeMap<TargetId, FreshnessCell>,
    indicators: BTreeMap<TargetId, IndicatorCell>,
    /// Count of live suppression contributions (held buttons, active
    /// jobs). Automatic indicator updates pause while this is non-zero.
    suppression: AtomicUsize,
    /// Shared flash phase, toggled by the flash clock task only.
    flash_phase: AtomicBool,
    /// When set, at most one power-cycle job runs enclosure-wide.
    exclusive_cycles: bool,
    /// Active jobs and their phases. A key present means a job is live.
    cycles: Mutex<BTreeMap<TargetId, CyclePhase>>,
    cycles_idle: Notify,
}

impl WatchdogState {
    pub fn new(exclusive_cycles: bool) -> Arc<Self> {
        let freshness =
            TargetId::APPLIANCES.iter().map(|t| (*t, FreshnessCell::new())).collect();
        let indicators =
            TargetId::ALL.iter().map(|t| (*t, IndicatorCell::default())).collect();
        Arc::new(Self {
            epoch: Instant::now(),
            freshness,
            indicators,
            suppression: AtomicUsize::new(0),
            flash_phase: AtomicBool::new(false),
            exclusive_cycles,
            cycles: Mutex::new(BTreeMap::new()),
            cycles_idle: Notify::new(),
        })
    }

    /// The monotonic origin all freshness offsets are relative to.
    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    // --- freshness ---

    /// Record a successful check for `target` at the current instant.
    pub fn mark_good(&self, target: TargetId) {
        if let Some(cell) = self.freshness.get(&target) {
            cell.advance(self.epoch, Instant::now());
        }
    }

    /// Advance `target`'s freshness to an absolute epoch offset. Used by
    /// the aggregator, whose per-endpoint cells share this state's epoch.
    pub fn advance_freshness_millis(&self, target: TargetId, millis: u64) {
        if let Some(cell) = self.freshness.get(&target) {
            cell.advance_millis(millis);
        }
    }

    /// Time since `target` last checked good; `None` if it never has.
    pub fn staleness(&self, target: TargetId) -> Option<Duration> {
        self.freshness.get(&target)?.staleness(self.epoch, Instant::now())
    }

    pub fn freshness_millis(&self, target: TargetId) -> Option<u64> {
        self.freshness.get(&target).and_then(|cell| cell.millis())
    }

    // --- suppression ---

    /// Contribute to the suppression flag for the lifetime of the guard.
    pub fn suppress(self: &Arc<Self>) -> SuppressionGuard {
        self.suppression.fetch_add(1, Ordering::SeqCst);
        SuppressionGuard {
            state: self.clone(),
        }
    }

    /// True while any button is held or any power-cycle job is active.
    pub fn suppressed(&self) -> bool {
        self.suppression.load(Ordering::SeqCst) > 0
    }

    // --- indicators ---

    pub fn set_indicator(&self, target: TargetId, command: IndicatorCommand) {
        if let Some(cell) = self.indicators.get(&target) {
            *cell.command.write() = command;
        }
    }

    pub fn indicator(&self, target: TargetId) -> IndicatorCommand {
        self.indicators
            .get(&target)
            .map(|cell| *cell.command.read())
            .unwrap_or_default()
    }

    // --- flash clock ---

    pub fn flash_phase(&self) -> bool {
        self.flash_phase.load(Ordering::Relaxed)
    }

    /// Called by the flash clock task only.
    pub fn toggle_flash_phase(&self) {
        self.flash_phase.fetch_xor(true, Ordering::Relaxed);
    }

    // --- power-cycle jobs ---

    /// Try to reserve a power-cycle job for `target`.
    ///
    /// Returns `None` (a no-op for the caller) when a job already covers
    /// the target: a duplicate for the same target, any job while the
    /// aggregate is cycling, any other job while starting the aggregate,
    /// or any job at all under exclusive-cycle policy.
    pub fn try_begin_cycle(self: &Arc<Self>, target: TargetId) -> Option<CycleGuard> {
        let mut cycles = self.cycles.lock();
        let blocked = match target {
            TargetId::Main => !cycles.is_empty(),
            _ => {
                cycles.contains_key(&target)
                    || cycles.contains_key(&TargetId::Main)
                    || (self.exclusive_cycles && !cycles.is_empty())
            }
        };
        if blocked {
            debug!(%target, "power cycle already active, ignoring start");
            return None;
        }
        cycles.insert(target, CyclePhase::Confirm);
        drop(cycles);
        info!(%target, "power-cycle job created");
        Some(CycleGuard {
            state: self.clone(),
            target,
            _suppression: self.suppress(),
        })
    }

    /// Whether a job covering `target` is active (its own, or the
    /// aggregate's, which covers every appliance).
    pub fn cycle_active(&self, target: TargetId) -> bool {
        let cycles = self.cycles.lock();
        cycles.contains_key(&target)
            || (target != TargetId::Main && cycles.contains_key(&TargetId::Main))
    }

    pub fn cycle_phase(&self, target: TargetId) -> Option<CyclePhase> {
        self.cycles.lock().get(&target).copied()
    }

    pub fn active_cycle_count(&self) -> usize {
        self.cycles.lock().len()
    }

    /// Wait until no power-cycle job is active. Used at shutdown: an
    /// in-flight relay sequence always runs to completion.
    pub async fn wait_cycles_idle(&self) {
        loop {
            let notified = self.cycles_idle.notified();
            if self.cycles.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// RAII contribution to the suppression flag.
#[derive(Debug)]
pub struct SuppressionGuard {
    state: Arc<WatchdogState>,
}

impl Drop for SuppressionGuard {
    fn drop(&mut self) {
        self.state.suppression.fetch_sub(1, Ordering::SeqCst);
    }
}

/// RAII reservation of a power-cycle job. Holds a suppression
/// contribution; dropping it clears the job and wakes shutdown waiters.
#[derive(Debug)]
pub struct CycleGuard {
    state: Arc<WatchdogState>,
    target: TargetId,
    _suppression: SuppressionGuard,
}

impl CycleGuard {
    pub fn target(&self) -> TargetId {
        self.target
    }

    pub fn set_phase(&self, phase: CyclePhase) {
        info!(target = %self.target, ?phase, "power-cycle phase");
        self.state.cycles.lock().insert(self.target, phase);
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.state.cycles.lock().remove(&self.target);
        info!(target = %self.target, "power-cycle job cleared");
        self.state.cycles_idle.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, Duration};

    #[tokio::test(start_paused = true)]
    async fn freshness_starts_as_never_seen() {
        let state = WatchdogState::new(false);
        assert_eq!(state.staleness(TargetId::Router), None);
    }

    #[tokio::test(start_paused = true)]
    async fn freshness_tracks_last_good_check() {
        let state = WatchdogState::new(false);

        advance(Duration::from_secs(5)).await;
        state.mark_good(TargetId::Router);
        advance(Duration::from_secs(30)).await;

        assert_eq!(state.staleness(TargetId::Router), Some(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn freshness_never_decreases() {
        let state = WatchdogState::new(false);

        // Simulate concurrent probe completions landing out of order
        state.advance_freshness_millis(TargetId::Modem, 9_000);
        state.advance_freshness_millis(TargetId::Modem, 4_000);
        state.advance_freshness_millis(TargetId::Modem, 7_500);

        assert_eq!(state.freshness_millis(TargetId::Modem), Some(9_000));
    }

    #[tokio::test(start_paused = true)]
    async fn a_success_at_the_epoch_is_recorded_exactly() {
        let state = WatchdogState::new(false);

        // The very first check can complete at the same instant the
        // state was constructed
        state.mark_good(TargetId::Router);
        advance(Duration::from_secs(20)).await;

        assert_eq!(state.staleness(TargetId::Router), Some(Duration::from_secs(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn suppression_counts_contributions() {
        let state = WatchdogState::new(false);
        assert!(!state.suppressed());

        let first = state.suppress();
        let second = state.suppress();
        assert!(state.suppressed());

        drop(first);
        assert!(state.suppressed());
        drop(second);
        assert!(!state.suppressed());
    }

    #[tokio::test(start_paused = true)]
    async fn indicator_commands_are_last_writer_wins() {
        use crate::indicator::{Color, IndicatorCommand};

        let state = WatchdogState::new(false);
        state.set_indicator(TargetId::Main, IndicatorCommand::solid(Color::Green));
        state.set_indicator(TargetId::Main, IndicatorCommand::flashing(Color::Red));

        assert_eq!(
            state.indicator(TargetId::Main),
            IndicatorCommand::flashing(Color::Red)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn second_cycle_for_same_target_is_a_no_op() {
        let state = WatchdogState::new(false);

        let guard = state.try_begin_cycle(TargetId::Router);
        assert!(guard.is_some());
        assert!(state.try_begin_cycle(TargetId::Router).is_none());
        assert_eq!(state.active_cycle_count(), 1);

        drop(guard);
        assert!(state.try_begin_cycle(TargetId::Router).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_cycle_excludes_all_other_jobs() {
        let state = WatchdogState::new(false);

        let main = state.try_begin_cycle(TargetId::Main).unwrap();
        for target in TargetId::APPLIANCES {
            assert!(state.try_begin_cycle(target).is_none());
            assert!(state.cycle_active(target));
        }

        drop(main);
        assert!(state.try_begin_cycle(TargetId::Wifi).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn appliance_job_blocks_aggregate_start() {
        let state = WatchdogState::new(false);
        let _wifi = state.try_begin_cycle(TargetId::Wifi).unwrap();
        assert!(state.try_begin_cycle(TargetId::Main).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_cycles_follow_policy() {
        // Default policy: holds on different buttons may cycle different
        // targets at once
        let permissive = WatchdogState::new(false);
        let _a = permissive.try_begin_cycle(TargetId::Wifi).unwrap();
        assert!(permissive.try_begin_cycle(TargetId::Modem).is_some());

        let exclusive = WatchdogState::new(true);
        let _b = exclusive.try_begin_cycle(TargetId::Wifi).unwrap();
        assert!(exclusive.try_begin_cycle(TargetId::Modem).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_guard_asserts_suppression_and_phase() {
        let state = WatchdogState::new(false);

        let guard = state.try_begin_cycle(TargetId::Modem).unwrap();
        assert!(state.suppressed());
        assert_eq!(state.cycle_phase(TargetId::Modem), Some(CyclePhase::Confirm));

        guard.set_phase(CyclePhase::Off);
        assert_eq!(state.cycle_phase(TargetId::Modem), Some(CyclePhase::Off));

        drop(guard);
        assert!(!state.suppressed());
        assert_eq!(state.cycle_phase(TargetId::Modem), None);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_cycles_idle_returns_once_jobs_clear() {
        let state = WatchdogState::new(false);
        let guard = state.try_begin_cycle(TargetId::Router).unwrap();

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_cycles_idle().await })
        };
        // Give the waiter a chance to register
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn flash_phase_toggles() {
        let state = WatchdogState::new(false);
        assert!(!state.flash_phase());
        state.toggle_flash_phase();
        assert!(state.flash_phase());
        state.toggle_flash_phase();
        assert!(!state.flash_phase());
    }
}
