//! Daemon entrypoint: load configuration, assemble the board, put the
//! hardware into a known electrical state, then start every worker and
//! wait for a termination signal.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use boxwatch::classify::Bounds;
use boxwatch::cycle::CycleTiming;
use boxwatch::fan::FanController;
use boxwatch::hal::Board;
use boxwatch::probe::{PingProbe, ServiceHealthAggregator};
use boxwatch::{
    ButtonMonitor, FlashClock, GestureDetector, HealthClassifier, IndicatorRenderer,
    PowerCycleSequencer, Settings, Supervisor, TargetId, WatchdogState,
};

#[derive(Debug, Parser)]
#[command(name = "boxwatch", version, about = "Appliance watchdog daemon")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "boxwatch.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::load(&args.config)?;
    info!(config = %args.config.display(), "configuration loaded");

    let board = Board::simulated(&settings);
    initialize_lines(&board)?;

    let state = WatchdogState::new(!settings.behavior.allow_concurrent_cycles);
    let mut supervisor = Supervisor::new(state.clone(), settings.timing.shutdown_grace_period());

    spawn_probes(&mut supervisor, &settings, &state)?;
    spawn_classifier(&mut supervisor, &settings, &state);
    spawn_buttons(&mut supervisor, &settings, &state, &board);
    spawn_indicators(&mut supervisor, &settings, &state, &board);

    let rx = supervisor.subscribe();
    supervisor.spawn(
        "fan",
        FanController::new(board.fan.clone(), board.thermometer.clone(), settings.fan.clone())
            .run(rx),
    );

    info!("boxwatch running");
    wait_for_signal().await?;
    info!("termination signal received");
    supervisor.shutdown().await;
    Ok(())
}

/// Known startup state: every outlet powered, every indicator dark.
fn initialize_lines(board: &Board) -> Result<()> {
    for (target, relay) in &board.relays {
        relay
            .set(true)
            .with_context(|| format!("energizing the {target} outlet relay"))?;
    }
    for (target, lines) in &board.indicators {
        for line in [&lines.green, &lines.red, &lines.blue].into_iter().flatten() {
            line.set(false)
                .with_context(|| format!("clearing the {target} indicator"))?;
        }
    }
    Ok(())
}

fn spawn_probes(
    supervisor: &mut Supervisor,
    settings: &Settings,
    state: &Arc<WatchdogState>,
) -> Result<()> {
    let period = settings.timing.ping_probe_period();
    let timeout = settings.timing.ping_probe_timeout();

    let router = PingProbe::new(
        TargetId::Router,
        settings.probes.router.clone(),
        period,
        timeout,
        state.clone(),
    );
    let rx = supervisor.subscribe();
    supervisor.spawn("probe-router", router.run(rx));

    // The outside path exercises the modem: if an address beyond it
    // answers, the modem is passing traffic
    let outside = PingProbe::new(
        TargetId::Modem,
        settings.probes.outside.clone(),
        period,
        timeout,
        state.clone(),
    );
    let rx = supervisor.subscribe();
    supervisor.spawn("probe-outside", outside.run(rx));

    let aggregator = ServiceHealthAggregator::new(
        TargetId::Wifi,
        &settings.endpoints,
        settings.timing.http_step_period(),
        settings.timing.http_request_timeout(),
        state.clone(),
    )?;
    let rx = supervisor.subscribe();
    supervisor.spawn("wifi-endpoints", aggregator.run(rx));
    Ok(())
}

fn spawn_classifier(
    supervisor: &mut Supervisor,
    settings: &Settings,
    state: &Arc<WatchdogState>,
) {
    let margin = settings.timing.margin();
    let slack = settings.timing.slack();
    let ping_bounds = Bounds::from_round_trip(
        settings.timing.ping_probe_period(),
        settings.timing.ping_probe_timeout(),
        margin,
        slack,
    );
    // A full endpoint round is one step per endpoint
    let wifi_bounds = Bounds::from_round_trip(
        settings.timing.http_step_period() * settings.endpoints.len() as u32,
        settings.timing.http_request_timeout(),
        margin,
        slack,
    );
    let classifier = HealthClassifier::new(
        state.clone(),
        vec![
            (TargetId::Wifi, wifi_bounds),
            (TargetId::Router, ping_bounds),
            (TargetId::Modem, ping_bounds),
        ],
        settings.timing.classify_interval(),
    );
    let rx = supervisor.subscribe();
    supervisor.spawn("classifier", classifier.run(rx));
}

fn spawn_buttons(
    supervisor: &mut Supervisor,
    settings: &Settings,
    state: &Arc<WatchdogState>,
    board: &Board,
) {
    let sequencer = PowerCycleSequencer::new(
        state.clone(),
        board.relays.clone(),
        CycleTiming::from_settings(&settings.timing),
    );
    let poll = settings.timing.button_poll_period();

    for target in TargetId::ALL {
        let Some(line) = board.buttons.get(&target) else {
            continue;
        };
        let (monitor, handle) = ButtonMonitor::new(target, line.clone(), poll);
        let rx = supervisor.subscribe();
        supervisor.spawn(button_worker_name(target), monitor.run(rx));

        let detector = GestureDetector::new(
            target,
            handle,
            state.clone(),
            sequencer.clone(),
            poll,
            settings.timing.flash_start_threshold(),
            settings.timing.flash_enough_threshold(),
        );
        let rx = supervisor.subscribe();
        supervisor.spawn(gesture_worker_name(target), detector.run(rx));
    }
}

fn spawn_indicators(
    supervisor: &mut Supervisor,
    settings: &Settings,
    state: &Arc<WatchdogState>,
    board: &Board,
) {
    let rx = supervisor.subscribe();
    supervisor.spawn(
        "flash-clock",
        FlashClock::new(state.clone(), settings.timing.flash_period()).run(rx),
    );

    for target in TargetId::ALL {
        let Some(lines) = board.indicators.get(&target) else {
            continue;
        };
        let renderer = IndicatorRenderer::new(
            target,
            lines.clone(),
            state.clone(),
            settings.timing.render_period(),
        );
        let rx = supervisor.subscribe();
        supervisor.spawn(renderer_worker_name(target), renderer.run(rx));
    }
}

fn button_worker_name(target: TargetId) -> &'static str {
    match target {
        TargetId::Main => "button-main",
        TargetId::Wifi => "button-wifi",
        TargetId::Router => "button-router",
        TargetId::Modem => "button-modem",
    }
}

fn gesture_worker_name(target: TargetId) -> &'static str {
    match target {
        TargetId::Main => "gesture-main",
        TargetId::Wifi => "gesture-wifi",
        TargetId::Router => "gesture-router",
        TargetId::Modem => "gesture-modem",
    }
}

fn renderer_worker_name(target: TargetId) -> &'static str {
    match target {
        TargetId::Main => "indicator-main",
        TargetId::Wifi => "indicator-wifi",
        TargetId::Router => "indicator-router",
        TargetId::Modem => "indicator-modem",
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("waiting for ctrl-c")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    Ok(())
}
