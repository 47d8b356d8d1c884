//! Enclosure fan control.
//!
//! A slow periodic loop mapping the CPU temperature linearly onto a PWM
//! duty cycle. The fan never stops entirely; the baseline duty keeps some
//! air moving through the enclosure even when the board is cold. A failed
//! temperature read skips the adjustment and keeps the last duty.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::config::FanSettings;
use crate::hal::{PwmOutput, Thermometer};

/// Map a temperature onto a duty cycle: linear from zero at `ramp_start_c`
/// to 100% at `ramp_full_c`, floored at `min_duty` and capped at 100.
pub fn duty_for(celsius: f64, settings: &FanSettings) -> f64 {
    let span = settings.ramp_full_c - settings.ramp_start_c;
    let fraction = ((celsius - settings.ramp_start_c) / span).clamp(0.0, 1.0);
    (fraction * 100.0).max(settings.min_duty)
}

#[derive(Debug)]
pub struct FanController {
    fan: Arc<dyn PwmOutput>,
    thermometer: Arc<dyn Thermometer>,
    settings: FanSettings,
}

impl FanController {
    pub fn new(
        fan: Arc<dyn PwmOutput>,
        thermometer: Arc<dyn Thermometer>,
        settings: FanSettings,
    ) -> Self {
        Self {
            fan,
            thermometer,
            settings,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.check_period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.adjust_once(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("fan controller stopping");
                        return;
                    }
                }
            }
        }
    }

    pub(crate) fn adjust_once(&self) {
        let celsius = match self.thermometer.read_celsius() {
            Ok(celsius) => celsius,
            Err(error) => {
                warn!(%error, "temperature read failed, keeping current fan duty");
                return;
            }
        };
        let duty = duty_for(celsius, &self.settings);
        trace!(celsius, duty, "fan adjusted");
        if let Err(error) = self.fan.set_duty_percent(duty) {
            warn!(%error, "fan duty write failed");
        }
    }
}
