//! The power-cycle sequencer.
//!
//! Executes the off/confirm/on procedure for one relay-controlled outlet,
//! or for all of them when the aggregate target is cycled. At most one job
//! runs per target, an aggregate job excludes every other job, and a
//! committed sequence always runs to completion: releasing the button or
//! shutting the daemon down never leaves an outlet dark.
//!
//! The confirm window is the one exception: until outlet power has
//! actually been dropped, releasing the button cancels the job.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{error, info};

use crate::button::ButtonHandle;
use crate::config::TimingSettings;
use crate::hal::DigitalOutput;
use crate::indicator::{Color, IndicatorCommand};
use crate::state::{CycleGuard, CyclePhase, TargetId, WatchdogState};

/// Delays governing one power-cycle sequence.
#[derive(Debug, Clone, Copy)]
pub struct CycleTiming {
    /// Red/flashing feedback window before power is dropped.
    pub confirm: Duration,
    /// Minimum time an outlet stays off.
    pub min_off: Duration,
    /// Delay between the router restore and the wifi restore.
    pub wifi_stagger: Duration,
    /// Further delay before the modem restore.
    pub modem_stagger: Duration,
    /// Button poll granularity inside the confirm window.
    pub poll: Duration,
}

impl CycleTiming {
    pub fn from_settings(timing: &TimingSettings) -> Self {
        Self {
            confirm: timing.confirm_window(),
            min_off: timing.min_off_duration(),
            wifi_stagger: timing.wifi_restore_stagger(),
            modem_stagger: timing.modem_restore_stagger(),
            poll: timing.button_poll_period(),
        }
    }
}

#[derive(Debug)]
pub struct PowerCycleSequencer {
    state: Arc<WatchdogState>,
    relays: BTreeMap<TargetId, Arc<dyn DigitalOutput>>,
    timing: CycleTiming,
}

impl PowerCycleSequencer {
    pub fn new(
        state: Arc<WatchdogState>,
        relays: BTreeMap<TargetId, Arc<dyn DigitalOutput>>,
        timing: CycleTiming,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            relays,
            timing,
        })
    }

    /// Start a power cycle for `target`, driven by `button` during the
    /// confirm window. A no-op returning `false` when a job already
    /// covers the target.
    pub fn start(self: &Arc<Self>, target: TargetId, button: ButtonHandle) -> bool {
        let Some(guard) = self.state.try_begin_cycle(target) else {
            return false;
        };
        let sequencer = self.clone();
        // Detached on purpose: a committed sequence outlives shutdown.
        // The supervisor waits on the job table, not on this task handle.
        tokio::spawn(async move {
            sequencer.run_cycle(target, button, guard).await;
        });
        true
    }

    async fn run_cycle(&self, target: TargetId, button: ButtonHandle, guard: CycleGuard) {
        // Confirm: red/flashing feedback while power is still on
        self.state.set_indicator(target, IndicatorCommand::flashing(Color::Red));
        if !self.confirm(&button).await {
            info!(%target, "power cycle cancelled before outlet power dropped");
            self.state.set_indicator(target, IndicatorCommand::solid(Color::Green));
            return;
        }

        match target {
            TargetId::Main => self.cycle_all(&guard).await,
            target => self.cycle_one(target, &guard).await,
        }
        // guard drops here: job cleared, suppression released, the
        // classifier takes the indicators back on its next pass
    }

    /// Hold the confirm window, polling the button. Returns `false` if
    /// the operator releases before the window elapses.
    async fn confirm(&self, button: &ButtonHandle) -> bool {
        let deadline = Instant::now() + self.timing.confirm;
        loop {
            if !button.is_pressed() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            sleep(remaining.min(self.timing.poll)).await;
        }
    }

    async fn cycle_one(&self, target: TargetId, guard: &CycleGuard) {
        guard.set_phase(CyclePhase::Off);
        self.set_relay(target, false);
        self.state.set_indicator(target, IndicatorCommand::flashing(Color::Green));

        sleep(self.timing.min_off).await;

        guard.set_phase(CyclePhase::Restoring);
        self.set_relay(target, true);

        guard.set_phase(CyclePhase::Done);
        self.state.set_indicator(target, IndicatorCommand::solid(Color::Green));
    }

    /// Cycle all three outlets together, restoring them in dependency
    /// order: router first, wifi once the router has likely settled,
    /// modem last.
    async fn cycle_all(&self, guard: &CycleGuard) {
        guard.set_phase(CyclePhase::Off);
        for target in TargetId::APPLIANCES {
            self.set_relay(target, false);
            self.state.set_indicator(target, IndicatorCommand::flashing(Color::Green));
        }
        self.state.set_indicator(TargetId::Main, IndicatorCommand::flashing(Color::Green));

        sleep(self.timing.min_off).await;

        guard.set_phase(CyclePhase::Restoring);
        self.set_relay(TargetId::Router, true);
        self.state.set_indicator(TargetId::Router, IndicatorCommand::solid(Color::Green));

        sleep(self.timing.wifi_stagger).await;
        self.set_relay(TargetId::Wifi, true);
        self.state.set_indicator(TargetId::Wifi, IndicatorCommand::solid(Color::Green));

        sleep(self.timing.modem_stagger).await;
        self.set_relay(TargetId::Modem, true);
        self.state.set_indicator(TargetId::Modem, IndicatorCommand::solid(Color::Green));

        guard.set_phase(CyclePhase::Done);
        self.state.set_indicator(TargetId::Main, IndicatorCommand::solid(Color::Green));
    }

    fn set_relay(&self, target: TargetId, high: bool) {
        let Some(relay) = self.relays.get(&target) else {
            return;
        };
        info!(%target, high, "relay");
        if let Err(err) = relay.set(high) {
            // Nothing sensible to do but carry on with the sequence
            error!(%target, %err, "relay write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::button::ButtonMonitor;
    use crate::hal::sim::{SimInput, SimOutput};
    use tokio::time::advance;

    fn timing() -> CycleTiming {
        CycleTiming {
            confirm: Duration::from_secs(3),
            min_off: Duration::from_secs(10),
            wifi_stagger: Duration::from_secs(5),
            modem_stagger: Duration::from_secs(1),
            poll: Duration::from_millis(250),
        }
    }

    struct Rig {
        state: Arc<WatchdogState>,
        sequencer: Arc<PowerCycleSequencer>,
        relays: BTreeMap<TargetId, Arc<SimOutput>>,
        button_line: Arc<SimInput>,
        button: ButtonHandle,
        monitor: ButtonMonitor,
    }

    fn rig(target: TargetId) -> Rig {
        let state = WatchdogState::new(false);
        let mut relays: BTreeMap<TargetId, Arc<SimOutput>> = BTreeMap::new();
        let mut dyn_relays: BTreeMap<TargetId, Arc<dyn DigitalOutput>> = BTreeMap::new();
        for t in TargetId::APPLIANCES {
            let relay = Arc::new(SimOutput::new(format!("relay-{t}")));
            // Startup state: outlets powered
            relay.set(true).unwrap();
            dyn_relays.insert(t, relay.clone());
            relays.insert(t, relay);
        }
        let sequencer = PowerCycleSequencer::new(state.clone(), dyn_relays, timing());
        let button_line = Arc::new(SimInput::new("button"));
        let (monitor, button) =
            ButtonMonitor::new(target, button_line.clone(), Duration::from_millis(250));
        Rig {
            state,
            sequencer,
            relays,
            button_line,
            button,
            monitor,
        }
    }

    fn press(rig: &Rig) {
        rig.button_line.press();
        rig.monitor.poll_once();
    }

    /// Advance paused time in poll-sized steps, yielding between each so
    /// timers the sequencer creates along the way get a chance to fire.
    async fn run_for(total: Duration) {
        let step = Duration::from_millis(250);
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            advance(step).await;
            tokio::task::yield_now().await;
            elapsed += step;
        }
    }

    fn release(rig: &Rig) {
        rig.button_line.release();
        rig.monitor.poll_once();
    }

    #[tokio::test(start_paused = true)]
    async fn single_target_cycle_runs_confirm_off_restore() {
        let rig = rig(TargetId::Router);
        press(&rig);

        assert!(rig.sequencer.start(TargetId::Router, rig.button.clone()));
        tokio::task::yield_now().await;
        assert_eq!(rig.state.cycle_phase(TargetId::Router), Some(CyclePhase::Confirm));
        assert!(rig.relays[&TargetId::Router].level(), "power stays on during confirm");
        assert_eq!(
            rig.state.indicator(TargetId::Router),
            IndicatorCommand::flashing(Color::Red)
        );

        // Confirm window elapses, power drops
        advance(Duration::from_secs(3) + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(rig.state.cycle_phase(TargetId::Router), Some(CyclePhase::Off));
        assert!(!rig.relays[&TargetId::Router].level());
        assert_eq!(
            rig.state.indicator(TargetId::Router),
            IndicatorCommand::flashing(Color::Green)
        );
        assert!(rig.state.suppressed());

        // Minimum off-duration elapses, power restores, job clears
        advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(rig.relays[&TargetId::Router].level());
        assert_eq!(rig.state.cycle_phase(TargetId::Router), None);
        assert!(!rig.state.suppressed());
        assert_eq!(
            rig.state.indicator(TargetId::Router),
            IndicatorCommand::solid(Color::Green)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn release_during_confirm_cancels_without_dropping_power() {
        let rig = rig(TargetId::Modem);
        press(&rig);

        assert!(rig.sequencer.start(TargetId::Modem, rig.button.clone()));
        tokio::task::yield_now().await;

        advance(Duration::from_secs(1)).await;
        release(&rig);
        advance(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;

        assert_eq!(rig.state.cycle_phase(TargetId::Modem), None);
        assert!(rig.relays[&TargetId::Modem].level(), "power never dropped");
        // Only the startup transition is on record
        assert_eq!(rig.relays[&TargetId::Modem].transitions().len(), 1);
        assert!(!rig.state.suppressed());
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_for_an_active_target_is_a_no_op() {
        let rig = rig(TargetId::Wifi);
        press(&rig);

        assert!(rig.sequencer.start(TargetId::Wifi, rig.button.clone()));
        tokio::task::yield_now().await;
        assert!(!rig.sequencer.start(TargetId::Wifi, rig.button.clone()));
        assert_eq!(rig.state.active_cycle_count(), 1);

        // Run the whole sequence out and count relay transitions: exactly
        // one drop and one restore beyond the startup set
        run_for(Duration::from_secs(14)).await;
        let transitions = rig.relays[&TargetId::Wifi].transitions();
        assert_eq!(transitions.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_cycle_restores_in_staggered_dependency_order() {
        let rig = rig(TargetId::Main);
        press(&rig);

        assert!(rig.sequencer.start(TargetId::Main, rig.button.clone()));
        tokio::task::yield_now().await;

        // Confirm, then all outlets drop together
        advance(Duration::from_secs(3) + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        for t in TargetId::APPLIANCES {
            assert!(!rig.relays[&t].level(), "{t} outlet should be off");
        }

        // Off window plus both staggers
        run_for(Duration::from_secs(10 + 5 + 1)).await;
        for t in TargetId::APPLIANCES {
            assert!(rig.relays[&t].level(), "{t} outlet should be restored");
        }

        let router_on = rig.relays[&TargetId::Router].last_transition_to(true).unwrap();
        let wifi_on = rig.relays[&TargetId::Wifi].last_transition_to(true).unwrap();
        let modem_on = rig.relays[&TargetId::Modem].last_transition_to(true).unwrap();

        assert!(router_on < wifi_on);
        assert!(wifi_on < modem_on);

        let poll = Duration::from_millis(250);
        let wifi_gap = wifi_on.duration_since(router_on);
        assert!(wifi_gap >= Duration::from_secs(5) && wifi_gap <= Duration::from_secs(5) + poll);
        let modem_gap = modem_on.duration_since(wifi_on);
        assert!(modem_gap >= Duration::from_secs(1) && modem_gap <= Duration::from_secs(1) + poll);

        assert_eq!(rig.state.cycle_phase(TargetId::Main), None);
        assert_eq!(
            rig.state.indicator(TargetId::Main),
            IndicatorCommand::solid(Color::Green)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn committed_sequence_runs_to_completion_after_release() {
        let rig = rig(TargetId::Router);
        press(&rig);

        assert!(rig.sequencer.start(TargetId::Router, rig.button.clone()));
        tokio::task::yield_now().await;

        // Past the confirm window: power is off
        advance(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;
        assert!(!rig.relays[&TargetId::Router].level());

        // Operator lets go mid-sequence
        release(&rig);
        advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(!rig.relays[&TargetId::Router].level(), "off window keeps running");

        advance(Duration::from_secs(8)).await;
        tokio::task::yield_now().await;
        assert!(rig.relays[&TargetId::Router].level(), "outlet restored on schedule");
        assert_eq!(rig.state.cycle_phase(TargetId::Router), None);
    }
}
