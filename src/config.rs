//! Startup configuration.
//!
//! All hardware line assignments and probe addresses are supplied once at
//! process start and are immutable for the process lifetime. Anything
//! missing or malformed is a fatal error raised before any worker starts.
//! Timing knobs carry defaults matching the deployed enclosure and only
//! need to appear in the file when tuning.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Complete daemon configuration, deserialized from a TOML file with
/// `BOXWATCH_`-prefixed environment variable overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub probes: ProbeSettings,
    /// Named service-health endpoints (access point name -> address).
    pub endpoints: BTreeMap<String, String>,
    pub pins: PinSettings,
    #[serde(default)]
    pub timing: TimingSettings,
    #[serde(default)]
    pub behavior: BehaviorSettings,
    #[serde(default)]
    pub fan: FanSettings,
}

/// Addresses for the single-host reachability probes.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeSettings {
    /// Router LAN address, probed directly.
    pub router: String,
    /// An address beyond the modem, probing the outside path.
    pub outside: String,
}

/// GPIO line assignments (BCM numbering on the deployed board).
#[derive(Debug, Clone, Deserialize)]
pub struct PinSettings {
    pub indicators: IndicatorPinSettings,
    pub relays: RelayPins,
    pub buttons: ButtonPins,
    pub fan: FanPin,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndicatorPinSettings {
    pub main: IndicatorPins,
    pub router: IndicatorPins,
    pub modem: IndicatorPins,
    /// The wifi target has a button and relay but no dedicated light on
    /// the original enclosure; one may be fitted.
    #[serde(default)]
    pub wifi: Option<IndicatorPins>,
}

/// Lines for one indicator. An indicator may drive any subset of colors.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct IndicatorPins {
    #[serde(default)]
    pub green: Option<u8>,
    #[serde(default)]
    pub red: Option<u8>,
    #[serde(default)]
    pub blue: Option<u8>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RelayPins {
    pub wifi: u8,
    pub router: u8,
    pub modem: u8,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ButtonPins {
    pub main: u8,
    pub wifi: u8,
    pub router: u8,
    pub modem: u8,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FanPin {
    pub pwm: u8,
}

/// Worker periods and gesture/cycle thresholds, all in seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Button poll period.
    pub button_poll: f64,
    /// Reachability probe period.
    pub ping_period: f64,
    /// Hard timeout on a single echo; at most the period.
    pub ping_timeout: f64,
    /// Delay between consecutive endpoint checks in the aggregator.
    pub http_step: f64,
    /// Per-request timeout in the aggregator.
    pub http_timeout: f64,
    /// Indicator render tick.
    pub render_tick: f64,
    /// Half-period of the shared flash clock.
    pub flash_half_period: f64,
    /// Health classification period.
    pub classify_period: f64,
    /// Margin added to a target's own round trip when deriving its
    /// alive bound.
    pub bound_margin: f64,
    /// Fixed slack between the alive bound and the dead bound.
    pub dead_slack: f64,
    /// Hold duration after which the indicator starts flashing.
    pub flash_start: f64,
    /// Hold duration after which a power cycle is committed.
    pub flash_enough: f64,
    /// Red/flashing feedback window before outlet power is dropped;
    /// releasing the button inside it cancels the cycle.
    pub confirm_delay: f64,
    /// Minimum time an outlet stays off.
    pub min_off: f64,
    /// Delay after the router restore before the wifi outlet restores.
    pub wifi_stagger: f64,
    /// Further delay before the modem outlet restores.
    pub modem_stagger: f64,
    /// Bounded join window for non-critical workers at shutdown.
    pub shutdown_grace: f64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            button_poll: 0.25,
            ping_period: 10.0,
            ping_timeout: 9.0,
            http_step: 0.25,
            http_timeout: 10.0,
            render_tick: 0.1,
            flash_half_period: 0.5,
            classify_period: 2.0,
            bound_margin: 1.0,
            dead_slack: 60.0,
            flash_start: 0.5,
            flash_enough: 5.0,
            confirm_delay: 3.0,
            min_off: 10.0,
            wifi_stagger: 5.0,
            modem_stagger: 1.0,
            shutdown_grace: 5.0,
        }
    }
}

impl TimingSettings {
    pub fn button_poll_period(&self) -> Duration {
        Duration::from_secs_f64(self.button_poll)
    }

    pub fn ping_probe_period(&self) -> Duration {
        Duration::from_secs_f64(self.ping_period)
    }

    pub fn ping_probe_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ping_timeout)
    }

    pub fn http_step_period(&self) -> Duration {
        Duration::from_secs_f64(self.http_step)
    }

    pub fn http_request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.http_timeout)
    }

    pub fn render_period(&self) -> Duration {
        Duration::from_secs_f64(self.render_tick)
    }

    pub fn flash_period(&self) -> Duration {
        Duration::from_secs_f64(self.flash_half_period)
    }

    pub fn classify_interval(&self) -> Duration {
        Duration::from_secs_f64(self.classify_period)
    }

    pub fn margin(&self) -> Duration {
        Duration::from_secs_f64(self.bound_margin)
    }

    pub fn slack(&self) -> Duration {
        Duration::from_secs_f64(self.dead_slack)
    }

    pub fn flash_start_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.flash_start)
    }

    pub fn flash_enough_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.flash_enough)
    }

    pub fn confirm_window(&self) -> Duration {
        Duration::from_secs_f64(self.confirm_delay)
    }

    pub fn min_off_duration(&self) -> Duration {
        Duration::from_secs_f64(self.min_off)
    }

    pub fn wifi_restore_stagger(&self) -> Duration {
        Duration::from_secs_f64(self.wifi_stagger)
    }

    pub fn modem_restore_stagger(&self) -> Duration {
        Duration::from_secs_f64(self.modem_stagger)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_grace)
    }
}

/// Behavior toggles for cases the hardware leaves ambiguous.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BehaviorSettings {
    /// Whether holds on different buttons may run power cycles for
    /// different targets at the same time. Overlap with an aggregate
    /// cycle, or a second cycle for the same target, is always refused.
    pub allow_concurrent_cycles: bool,
}

impl Default for BehaviorSettings {
    fn default() -> Self {
        Self {
            allow_concurrent_cycles: true,
        }
    }
}

/// Enclosure fan control (linear temperature-to-duty mapping).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FanSettings {
    /// File exposing the CPU temperature in millidegrees Celsius.
    pub source: PathBuf,
    /// Temperature at which the fan starts ramping up.
    pub ramp_start_c: f64,
    /// Temperature at which the fan reaches full speed.
    pub ramp_full_c: f64,
    /// Baseline duty cycle in percent; the fan never runs below this.
    pub min_duty: f64,
    /// Seconds between temperature checks.
    pub period: f64,
}

impl Default for FanSettings {
    fn default() -> Self {
        Self {
            source: PathBuf::from("/cputemp"),
            ramp_start_c: 40.0,
            ramp_full_c: 60.0,
            min_duty: 25.0,
            period: 20.0,
        }
    }
}

impl FanSettings {
    pub fn check_period(&self) -> Duration {
        Duration::from_secs_f64(self.period)
    }
}

impl Settings {
    /// Load and validate configuration from a file, with environment
    /// overrides (`BOXWATCH_TIMING__MIN_OFF=20`, etc).
    pub fn load(path: &Path) -> Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("BOXWATCH").separator("__"))
            .build()
            .with_context(|| format!("reading configuration from {}", path.display()))?
            .try_deserialize()
            .context("malformed configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.probes.router.trim().is_empty() {
            bail!("probes.router must be a non-empty address");
        }
        if self.probes.outside.trim().is_empty() {
            bail!("probes.outside must be a non-empty address");
        }
        if self.endpoints.is_empty() {
            bail!("at least one service-health endpoint is required");
        }
        if self.timing.ping_timeout > self.timing.ping_period {
            bail!(
                "ping_timeout ({}s) must not exceed ping_period ({}s)",
                self.timing.ping_timeout,
                self.timing.ping_period
            );
        }
        if self.timing.flash_start >= self.timing.flash_enough {
            bail!("flash_start must be shorter than flash_enough");
        }
        if self.fan.ramp_full_c <= self.fan.ramp_start_c {
            bail!("fan.ramp_full_c must be above fan.ramp_start_c");
        }
        Ok(())
    }
}
