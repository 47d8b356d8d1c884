//! Debounced press/hold tracking for one physical button.
//!
//! The monitor polls its input line at a fixed period and keeps the press
//! state plus the instant the current press began. Bounce faster than the
//! poll period is not filtered; at a 250ms poll and with mechanical
//! buttons that is sufficient debouncing. Consumers read through a cheap
//! cloneable [`ButtonHandle`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::hal::DigitalInput;
use crate::state::TargetId;

#[derive(Debug, Default)]
struct ButtonShared {
    pressed: AtomicBool,
    press_start: RwLock<Option<Instant>>,
}

/// Read-only view of a button's press/hold state.
#[derive(Debug, Clone)]
pub struct ButtonHandle {
    shared: Arc<ButtonShared>,
}

impl ButtonHandle {
    pub fn is_pressed(&self) -> bool {
        self.shared.pressed.load(Ordering::SeqCst)
    }

    /// How long the button has been held, or zero when it is not pressed.
    ///
    /// Returns zero for one tick at the start of a press if the start
    /// instant has not landed yet; callers tolerate that.
    pub fn held_time(&self) -> Duration {
        if !self.is_pressed() {
            return Duration::ZERO;
        }
        match *self.shared.press_start.read() {
            Some(start) => Instant::now().saturating_duration_since(start),
            None => Duration::ZERO,
        }
    }
}

/// Polls one input line and maintains the shared press state.
#[derive(Debug)]
pub struct ButtonMonitor {
    target: TargetId,
    line: Arc<dyn DigitalInput>,
    shared: Arc<ButtonShared>,
    poll: Duration,
}

impl ButtonMonitor {
    pub fn new(
        target: TargetId,
        line: Arc<dyn DigitalInput>,
        poll: Duration,
    ) -> (Self, ButtonHandle) {
        let shared = Arc::new(ButtonShared::default());
        let handle = ButtonHandle {
            shared: shared.clone(),
        };
        (
            Self {
                target,
                line,
                shared,
                poll,
            },
            handle,
        )
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.poll);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.poll_once(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(target = %self.target, "button monitor stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One poll: read the line and update press state. A read failure
    /// leaves the state exactly as it was.
    pub(crate) fn poll_once(&self) {
        let high = match self.line.is_high() {
            Ok(high) => high,
            Err(error) => {
                debug!(target = %self.target, %error, "button read failed");
                return;
            }
        };
        // Pull-up wiring: pressed reads low
        let pressed = !high;
        let was_pressed = self.shared.pressed.load(Ordering::SeqCst);

        if pressed && !was_pressed {
            *self.shared.press_start.write() = Some(Instant::now());
            debug!(target = %self.target, "button pressed");
        }
        self.shared.pressed.store(pressed, Ordering::SeqCst);
        if !pressed {
            if was_pressed {
                debug!(target = %self.target, "button released");
            }
            *self.shared.press_start.write() = None;
        } else if let Some(start) = *self.shared.press_start.read() {
            trace!(
                target = %self.target,
                held = ?Instant::now().saturating_duration_since(start),
                "button held"
            );
        }
    }
}
