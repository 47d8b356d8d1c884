//! Hold-gesture detection on one button.
//!
//! Polls the button's hold time and walks it through the gesture ladder:
//! a short hold shows solid green feedback, a longer hold warns with
//! flashing red, and holding past the trigger threshold starts the
//! target's power cycle. The whole press contributes to suppression, so
//! automatic classification never overwrites gesture feedback, and
//! releasing the button restores the healthy display.
//!
//! Once a cycle is running for the target the detector goes quiet: it
//! stops writing indicator commands (the sequencer owns the display) and
//! keeping the button held does not start a second job while that one
//! runs. The gesture re-arms as soon as the job clears, so a button still
//! held past the threshold commits the next cycle without a release.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::button::ButtonHandle;
use crate::cycle::PowerCycleSequencer;
use crate::indicator::{Color, IndicatorCommand};
use crate::state::{SuppressionGuard, TargetId, WatchdogState};

#[derive(Debug)]
pub struct GestureDetector {
    target: TargetId,
    button: ButtonHandle,
    state: Arc<WatchdogState>,
    sequencer: Arc<PowerCycleSequencer>,
    poll: Duration,
    /// Hold time past which feedback switches to flashing red.
    flash_start: Duration,
    /// Hold time past which the power cycle starts.
    flash_enough: Duration,
    /// Live while the button is held.
    held: Option<SuppressionGuard>,
}

impl GestureDetector {
    pub fn new(
        target: TargetId,
        button: ButtonHandle,
        state: Arc<WatchdogState>,
        sequencer: Arc<PowerCycleSequencer>,
        poll: Duration,
        flash_start: Duration,
        flash_enough: Duration,
    ) -> Self {
        Self {
            target,
            button,
            state,
            sequencer,
            poll,
            flash_start,
            flash_enough,
            held: None,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.poll);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.poll_once(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(target = %self.target, "gesture detector stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One gesture step, driven by the current hold time.
    pub(crate) fn poll_once(&mut self) {
        let held = self.button.held_time();

        if held.is_zero() {
            if self.held.take().is_some() {
                info!(target = %self.target, "button released, gesture over");
                // Clear any gesture feedback unless a sequence owns the
                // indicator now
                if !self.state.cycle_active(self.target) {
                    self.state
                        .set_indicator(self.target, IndicatorCommand::solid(Color::Green));
                }
            }
            return;
        }

        if self.held.is_none() {
            info!(target = %self.target, "button hold started");
            self.held = Some(self.state.suppress());
        }

        // A running sequence owns the indicator and the job table
        if self.state.cycle_active(self.target) {
            return;
        }

        if held <= self.flash_start {
            self.state
                .set_indicator(self.target, IndicatorCommand::solid(Color::Green));
        } else {
            self.state
                .set_indicator(self.target, IndicatorCommand::flashing(Color::Red));
            if held > self.flash_enough {
                // Reserving the job is synchronous, so the next poll sees
                // the cycle as active; once it clears, a button still held
                // past the threshold commits the next one
                self.sequencer.start(self.target, self.button.clone());
            }
        }
    }
}
