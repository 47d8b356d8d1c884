//! Staleness classification and automatic indicator control.
//!
//! Every classification tick converts each target's staleness into a
//! tri-state health and issues the matching indicator command. The whole
//! pass, classification and indicator writes together, is skipped while
//! the suppression flag is set, leaving indicators at their last-set
//! value. That is the arbitration rule that keeps automatic updates from
//! fighting manual and power-cycle indicator commands.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::indicator::{Color, IndicatorCommand};
use crate::state::{TargetId, WatchdogState};

/// Tri-state health. Ordered so that an aggregate's health is simply the
/// `max` of its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthState {
    Alive,
    Uncertain,
    Dead,
}

impl HealthState {
    /// The display each health state commands. Dead flashes its bad color
    /// to distinguish "down" from "about to be considered down".
    pub fn display(&self) -> IndicatorCommand {
        match self {
            HealthState::Alive => IndicatorCommand::solid(Color::Green),
            HealthState::Uncertain => IndicatorCommand::flashing(Color::Green),
            HealthState::Dead => IndicatorCommand::flashing(Color::Red),
        }
    }
}

/// Per-target staleness bounds. `alive` is strictly below `dead`.
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub alive: Duration,
    pub dead: Duration,
}

impl Bounds {
    /// Derive bounds from a target's own probe cadence: a self-consistent
    /// round trip (one period plus one timeout) must be able to complete
    /// before staleness means anything, plus margin. The dead bound adds
    /// a fixed slack beyond that.
    pub fn from_round_trip(
        period: Duration,
        timeout: Duration,
        margin: Duration,
        slack: Duration,
    ) -> Self {
        let alive = period + timeout + margin;
        Self {
            alive,
            dead: alive + slack,
        }
    }
}

/// Classify one target's staleness. A target that has never checked good
/// is `Dead` outright.
pub fn classify(staleness: Option<Duration>, bounds: &Bounds) -> HealthState {
    match staleness {
        None => HealthState::Dead,
        Some(elapsed) if elapsed <= bounds.alive => HealthState::Alive,
        Some(elapsed) if elapsed > bounds.dead => HealthState::Dead,
        Some(_) => HealthState::Uncertain,
    }
}

/// Periodic worker classifying every appliance and the aggregate.
#[derive(Debug)]
pub struct HealthClassifier {
    state: Arc<WatchdogState>,
    targets: Vec<(TargetId, Bounds)>,
    period: Duration,
}

impl HealthClassifier {
    pub fn new(
        state: Arc<WatchdogState>,
        targets: Vec<(TargetId, Bounds)>,
        period: Duration,
    ) -> Self {
        Self {
            state,
            targets,
            period,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => { self.tick(); }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("health classifier stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One classification pass. Returns `false` when the pass was
    /// suppressed and no indicator was written.
    pub fn tick(&self) -> bool {
        if self.state.suppressed() {
            trace!("manual activity in progress, skipping classification pass");
            return false;
        }

        let mut worst = HealthState::Alive;
        for (target, bounds) in &self.targets {
            let staleness = self.state.staleness(*target);
            let health = classify(staleness, bounds);
            trace!(%target, ?staleness, ?health, "classified");
            worst = worst.max(health);
            self.state.set_indicator(*target, health.display());
        }
        // The aggregate mirrors its worst appliance
        self.state.set_indicator(TargetId::Main, worst.display());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn bounds() -> Bounds {
        // Ping cadence: 10s period + 10s timeout + 1s margin, 60s slack
        Bounds::from_round_trip(
            Duration::from_secs(10),
            Duration::from_secs(10),
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn bounds_derive_from_the_probe_round_trip() {
        let bounds = bounds();
        assert_eq!(bounds.alive, Duration::from_secs(21));
        assert_eq!(bounds.dead, Duration::from_secs(81));
    }

    #[test]
    fn classification_is_exact_at_the_bounds() {
        let bounds = bounds();

        assert_eq!(classify(Some(Duration::ZERO), &bounds), HealthState::Alive);
        assert_eq!(classify(Some(Duration::from_secs(21)), &bounds), HealthState::Alive);
        assert_eq!(
            classify(Some(Duration::from_secs(21) + Duration::from_millis(1)), &bounds),
            HealthState::Uncertain
        );
        assert_eq!(classify(Some(Duration::from_secs(81)), &bounds), HealthState::Uncertain);
        assert_eq!(
            classify(Some(Duration::from_secs(81) + Duration::from_millis(1)), &bounds),
            HealthState::Dead
        );
    }

    #[test]
    fn never_seen_is_dead() {
        assert_eq!(classify(None, &bounds()), HealthState::Dead);
    }

    #[test]
    fn health_displays() {
        assert_eq!(HealthState::Alive.display(), IndicatorCommand::solid(Color::Green));
        assert_eq!(
            HealthState::Uncertain.display(),
            IndicatorCommand::flashing(Color::Green)
        );
        assert_eq!(HealthState::Dead.display(), IndicatorCommand::flashing(Color::Red));
    }

    fn classifier(state: Arc<WatchdogState>) -> HealthClassifier {
        HealthClassifier::new(
            state,
            TargetId::APPLIANCES.iter().map(|t| (*t, bounds())).collect(),
            Duration::from_secs(2),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_then_silent_probe_walks_through_all_states() {
        let state = WatchdogState::new(false);
        let classifier = classifier(state.clone());

        // Healthy for 30s
        for _ in 0..3 {
            for target in TargetId::APPLIANCES {
                state.mark_good(target);
            }
            advance(Duration::from_secs(10)).await;
        }
        classifier.tick();
        assert_eq!(
            state.indicator(TargetId::Router),
            IndicatorCommand::solid(Color::Green)
        );

        // Probe goes silent: just past the alive bound, below the dead bound.
        // The last good check was at t=20s; at t=42s staleness is 22s.
        advance(Duration::from_secs(12)).await;
        classifier.tick();
        assert_eq!(
            state.indicator(TargetId::Router),
            IndicatorCommand::flashing(Color::Green)
        );

        // Well past the dead bound
        advance(Duration::from_secs(60)).await; // elapsed = 82s
        classifier.tick();
        assert_eq!(
            state.indicator(TargetId::Router),
            IndicatorCommand::flashing(Color::Red)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn suppression_blocks_every_indicator_write() {
        let state = WatchdogState::new(false);
        let classifier = classifier(state.clone());

        for target in TargetId::APPLIANCES {
            state.mark_good(target);
        }

        // Sentinel commands a classification pass would overwrite
        let sentinel = IndicatorCommand::flashing(Color::Blue);
        for target in TargetId::ALL {
            state.set_indicator(target, sentinel);
        }

        let guard = state.suppress();
        assert!(!classifier.tick());
        for target in TargetId::ALL {
            assert_eq!(state.indicator(target), sentinel);
        }

        drop(guard);
        assert!(classifier.tick());
        assert_ne!(state.indicator(TargetId::Main), sentinel);
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_is_the_worst_appliance() {
        let state = WatchdogState::new(false);
        let classifier = classifier(state.clone());

        // Wifi and modem healthy, router never seen
        state.mark_good(TargetId::Wifi);
        state.mark_good(TargetId::Modem);
        classifier.tick();

        assert_eq!(
            state.indicator(TargetId::Wifi),
            IndicatorCommand::solid(Color::Green)
        );
        assert_eq!(
            state.indicator(TargetId::Router),
            IndicatorCommand::flashing(Color::Red)
        );
        assert_eq!(
            state.indicator(TargetId::Main),
            IndicatorCommand::flashing(Color::Red)
        );
    }
}
