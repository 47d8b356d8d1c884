//! Hardware abstraction seam.
//!
//! The daemon never configures or asserts a physical line itself; it talks
//! to these traits. Real deployments provide implementations backed by the
//! platform's GPIO stack. The [`sim`] module provides in-memory
//! implementations that record every level transition, used by the binary
//! when no hardware backend is wired in and by the test suite throughout.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::{IndicatorPins, Settings};
use crate::state::TargetId;

/// One output line (an indicator color line or a relay coil).
pub trait DigitalOutput: Send + Sync + Debug {
    /// Drive the line to the given level.
    fn set(&self, high: bool) -> Result<()>;
}

/// One input line (a button).
pub trait DigitalInput: Send + Sync + Debug {
    /// Read the current level.
    fn is_high(&self) -> Result<bool>;
}

/// A PWM-capable output line (the fan).
pub trait PwmOutput: Send + Sync + Debug {
    /// Set the duty cycle, 0.0 to 100.0 percent.
    fn set_duty_percent(&self, percent: f64) -> Result<()>;
}

/// A scalar temperature source.
pub trait Thermometer: Send + Sync + Debug {
    fn read_celsius(&self) -> Result<f64>;
}

/// The output lines backing one indicator. Any subset of colors may be
/// fitted; absent lines are simply never driven.
#[derive(Debug, Clone, Default)]
pub struct IndicatorOutputs {
    pub green: Option<Arc<dyn DigitalOutput>>,
    pub red: Option<Arc<dyn DigitalOutput>>,
    pub blue: Option<Arc<dyn DigitalOutput>>,
}

/// Every line the enclosure exposes, assembled once at startup.
#[derive(Debug)]
pub struct Board {
    pub indicators: BTreeMap<TargetId, IndicatorOutputs>,
    pub relays: BTreeMap<TargetId, Arc<dyn DigitalOutput>>,
    pub buttons: BTreeMap<TargetId, Arc<dyn DigitalInput>>,
    pub fan: Arc<dyn PwmOutput>,
    pub thermometer: Arc<dyn Thermometer>,
}

impl Board {
    /// Assemble a fully simulated board from the configured pin map.
    pub fn simulated(settings: &Settings) -> Self {
        fn lines(target: TargetId, pins: &IndicatorPins) -> IndicatorOutputs {
            let line = |color: &str, pin: Option<u8>| {
                pin.map(|p| {
                    Arc::new(sim::SimOutput::new(format!("led-{target}-{color}#{p}")))
                        as Arc<dyn DigitalOutput>
                })
            };
            IndicatorOutputs {
                green: line("green", pins.green),
                red: line("red", pins.red),
                blue: line("blue", pins.blue),
            }
        }

        let mut indicators = BTreeMap::new();
        indicators.insert(TargetId::Main, lines(TargetId::Main, &settings.pins.indicators.main));
        indicators.insert(
            TargetId::Router,
            lines(TargetId::Router, &settings.pins.indicators.router),
        );
        indicators.insert(
            TargetId::Modem,
            lines(TargetId::Modem, &settings.pins.indicators.modem),
        );
        if let Some(pins) = &settings.pins.indicators.wifi {
            indicators.insert(TargetId::Wifi, lines(TargetId::Wifi, pins));
        }

        let relay = |target: TargetId, pin: u8| {
            Arc::new(sim::SimOutput::new(format!("relay-{target}#{pin}"))) as Arc<dyn DigitalOutput>
        };
        let mut relays = BTreeMap::new();
        relays.insert(TargetId::Wifi, relay(TargetId::Wifi, settings.pins.relays.wifi));
        relays.insert(TargetId::Router, relay(TargetId::Router, settings.pins.relays.router));
        relays.insert(TargetId::Modem, relay(TargetId::Modem, settings.pins.relays.modem));

        let button = |target: TargetId, pin: u8| {
            Arc::new(sim::SimInput::new(format!("button-{target}#{pin}")))
                as Arc<dyn DigitalInput>
        };
        let mut buttons = BTreeMap::new();
        buttons.insert(TargetId::Main, button(TargetId::Main, settings.pins.buttons.main));
        buttons.insert(TargetId::Wifi, button(TargetId::Wifi, settings.pins.buttons.wifi));
        buttons.insert(TargetId::Router, button(TargetId::Router, settings.pins.buttons.router));
        buttons.insert(TargetId::Modem, button(TargetId::Modem, settings.pins.buttons.modem));

        Self {
            indicators,
            relays,
            buttons,
            fan: Arc::new(sim::SimPwm::new(format!("fan#{}", settings.pins.fan.pwm))),
            thermometer: Arc::new(FileThermometer::new(settings.fan.source.clone())),
        }
    }
}

/// Reads a temperature from a sysfs-style file holding millidegrees
/// Celsius (e.g. `/sys/class/thermal/thermal_zone0/temp`).
#[derive(Debug)]
pub struct FileThermometer {
    path: PathBuf,
}

impl FileThermometer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Thermometer for FileThermometer {
    fn read_celsius(&self) -> Result<f64> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading temperature from {}", self.path.display()))?;
        let millidegrees: f64 = raw
            .trim()
            .parse()
            .with_context(|| format!("malformed temperature reading {raw:?}"))?;
        Ok(millidegrees / 1000.0)
    }
}

pub mod sim {
    //! In-memory line implementations.
    //!
    //! Outputs record their transition history with monotonic timestamps,
    //! which is what the relay-ordering tests assert against.

    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;
    use tokio::time::Instant;
    use tracing::debug;

    use super::*;

    /// A recorded level change on a simulated output.
    #[derive(Debug, Clone, Copy)]
    pub struct Transition {
        pub at: Instant,
        pub high: bool,
    }

    /// Simulated output line. Repeated writes of the same level are
    /// accepted (rendering is level-driven) but only changes are recorded.
    #[derive(Debug)]
    pub struct SimOutput {
        name: String,
        level: AtomicBool,
        transitions: Mutex<Vec<Transition>>,
    }

    impl SimOutput {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                level: AtomicBool::new(false),
                transitions: Mutex::new(Vec::new()),
            }
        }

        pub fn level(&self) -> bool {
            self.level.load(Ordering::Relaxed)
        }

        pub fn transitions(&self) -> Vec<Transition> {
            self.transitions.lock().clone()
        }

        /// Timestamp of the most recent transition to the given level.
        pub fn last_transition_to(&self, high: bool) -> Option<Instant> {
            self.transitions
                .lock()
                .iter()
                .rev()
                .find(|t| t.high == high)
                .map(|t| t.at)
        }
    }

    impl DigitalOutput for SimOutput {
        fn set(&self, high: bool) -> Result<()> {
            let previous = self.level.swap(high, Ordering::Relaxed);
            if previous != high {
                debug!(line = %self.name, high, "output level changed");
                self.transitions.lock().push(Transition {
                    at: Instant::now(),
                    high,
                });
            }
            Ok(())
        }
    }

    /// Simulated input line. Idles high, matching the pull-up wiring of
    /// the physical buttons (pressed reads low).
    #[derive(Debug)]
    pub struct SimInput {
        name: String,
        level: AtomicBool,
    }

    impl SimInput {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                level: AtomicBool::new(true),
            }
        }

        pub fn set_high(&self, high: bool) {
            self.level.store(high, Ordering::Relaxed);
        }

        /// Drive the line low, as a pressed button does.
        pub fn press(&self) {
            self.set_high(false);
        }

        pub fn release(&self) {
            self.set_high(true);
        }
    }

    impl DigitalInput for SimInput {
        fn is_high(&self) -> Result<bool> {
            Ok(self.level.load(Ordering::Relaxed))
        }
    }

    /// Simulated PWM line remembering the last commanded duty cycle.
    #[derive(Debug)]
    pub struct SimPwm {
        name: String,
        duty: Mutex<f64>,
    }

    impl SimPwm {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                duty: Mutex::new(0.0),
            }
        }

        pub fn duty(&self) -> f64 {
            *self.duty.lock()
        }
    }

    impl PwmOutput for SimPwm {
        fn set_duty_percent(&self, percent: f64) -> Result<()> {
            debug!(line = %self.name, percent, "duty cycle set");
            *self.duty.lock() = percent;
            Ok(())
        }
    }

    /// Fixed-value thermometer for tests.
    #[derive(Debug)]
    pub struct FixedThermometer {
        celsius: Mutex<f64>,
    }

    impl FixedThermometer {
        pub fn new(celsius: f64) -> Self {
            Self {
                celsius: Mutex::new(celsius),
            }
        }

        pub fn set(&self, celsius: f64) {
            *self.celsius.lock() = celsius;
        }
    }

    impl Thermometer for FixedThermometer {
        fn read_celsius(&self) -> Result<f64> {
            Ok(*self.celsius.lock())
        }
    }
}
