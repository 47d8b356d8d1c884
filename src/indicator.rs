//! Indicator commands, the shared flash clock, and the level-driven
//! renderer.
//!
//! Every indicator holds a commanded `{color, flashing}` pair in the
//! shared state. One renderer task per indicator re-drives its physical
//! lines every render tick whether or not the command changed, gating a
//! flashing command on the process-wide flash phase so all indicators
//! blink in unison. The flash phase itself is owned by a single
//! [`FlashClock`] task; renderers only read it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::hal::{DigitalOutput, IndicatorOutputs};
use crate::state::{TargetId, WatchdogState};

/// Commanded indicator color. `Off` keeps every line low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Color {
    #[default]
    Off,
    Red,
    Green,
    Blue,
}

/// A commanded indicator display: one color, optionally flashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndicatorCommand {
    pub color: Color,
    pub flashing: bool,
}

impl IndicatorCommand {
    pub const OFF: Self = Self {
        color: Color::Off,
        flashing: false,
    };

    pub fn solid(color: Color) -> Self {
        Self {
            color,
            flashing: false,
        }
    }

    pub fn flashing(color: Color) -> Self {
        Self {
            color,
            flashing: true,
        }
    }
}

impl fmt::Display for IndicatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let color = match self.color {
            Color::Off => return f.write_str("off"),
            Color::Red => "red",
            Color::Green => "green",
            Color::Blue => "blue",
        };
        let mode = if self.flashing { "flashing" } else { "solid" };
        write!(f, "{color},{mode}")
    }
}

/// Owns the process-wide flash phase, toggling it at a fixed cadence.
#[derive(Debug)]
pub struct FlashClock {
    state: Arc<WatchdogState>,
    half_period: Duration,
}

impl FlashClock {
    pub fn new(state: Arc<WatchdogState>, half_period: Duration) -> Self {
        Self { state, half_period }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.half_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.state.toggle_flash_phase(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

/// Renders one indicator's commanded display onto its physical lines.
#[derive(Debug)]
pub struct IndicatorRenderer {
    target: TargetId,
    lines: IndicatorOutputs,
    state: Arc<WatchdogState>,
    period: Duration,
}

impl IndicatorRenderer {
    pub fn new(
        target: TargetId,
        lines: IndicatorOutputs,
        state: Arc<WatchdogState>,
        period: Duration,
    ) -> Self {
        Self {
            target,
            lines,
            state,
            period,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.render_once(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        // Documented shutdown behavior: indicators are forced off, never
        // left at their last commanded display.
        info!(target = %self.target, "indicator renderer stopping, forcing lines off");
        self.drive(&self.lines.green, false);
        self.drive(&self.lines.red, false);
        self.drive(&self.lines.blue, false);
    }

    /// One render pass: re-drive every fitted line to match the command.
    pub fn render_once(&self) {
        let command = self.state.indicator(self.target);
        let on = !command.flashing || self.state.flash_phase();
        self.drive(&self.lines.green, on && command.color == Color::Green);
        self.drive(&self.lines.red, on && command.color == Color::Red);
        self.drive(&self.lines.blue, on && command.color == Color::Blue);
    }

    fn drive(&self, line: &Option<Arc<dyn DigitalOutput>>, level: bool) {
        if let Some(line) = line {
            if let Err(error) = line.set(level) {
                debug!(target = %self.target, %error, "indicator line write failed");
            }
        }
    }
}
