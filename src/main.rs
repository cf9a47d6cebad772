//! Pinball Ball Transport - bench runner
//!
//! Loads `config/<env>.yaml`, boots the machine and drives it from switch
//! lines typed on stdin (`<switch> <1|0>`). Transport events are written to
//! stdout as JSON lines.
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │  Config  │───▶│ Machine  │◀───│  stdin   │    │  stdout  │
//! │  (YAML)  │    │ (runner) │───────────────────▶│  (JSON)  │
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//! ```

use anyhow::Context;
use tokio::io::BufReader;
use tokio::sync::mpsc;

use pinball_transport::config::AppConfig;
use pinball_transport::driver::build_drivers;
use pinball_transport::events::EventSink;
use pinball_transport::machine::Machine;
use pinball_transport::runner::{MachineRunner, command_channel};
use pinball_transport::switch_feed::{LineSwitchFeed, MachineClock};

// ============================================================
// ARGUMENTS
// ============================================================

fn get_arg(names: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if names.contains(&args[i].as_str()) && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }
    None
}

fn get_env() -> String {
    get_arg(&["--env", "-e"]).unwrap_or_else(|| "dev".to_string())
}

/// Switches already active at power-on (`--active trough_1,plunger`)
fn get_active_switches() -> Vec<String> {
    get_arg(&["--active"])
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Device to request one ball for once booted (`--request plunger`)
fn get_start_request() -> Option<String> {
    get_arg(&["--request"])
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config =
        AppConfig::load(&env).with_context(|| format!("loading configuration for {env}"))?;
    let _log_guard = pinball_transport::logging::init_logging(&app_config);

    tracing::info!(
        version = env!("GIT_HASH"),
        devices = app_config.machine.devices.len(),
        "Starting ball transport in {} mode",
        env
    );

    let drivers = build_drivers(&app_config.machine.coils);
    let events = EventSink::new(app_config.event_queue_size);
    let mut machine = Machine::new(&app_config.machine, drivers, events)
        .context("building machine from configuration")?;

    let clock = MachineClock::start();
    machine.boot(&get_active_switches(), clock.now_ms());
    tracing::info!(
        balls = machine.controller().total_known_balls(),
        "Boot complete"
    );

    let (handle, commands) = command_channel(64);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let feed = LineSwitchFeed::new(BufReader::new(tokio::io::stdin()), clock);
    let runner = MachineRunner::new(machine, feed, commands, clock).with_event_forwarding(events_tx);
    let runner_task = tokio::spawn(runner.run());

    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "Failed to encode event"),
            }
        }
    });

    if let Some(device) = get_start_request() {
        match handle.request_balls("bench", &device, 1).await {
            Ok(id) => tracing::info!(request = id, %device, "Requested start ball"),
            Err(e) => tracing::error!(code = e.code(), "Start request refused: {}", e),
        }
    }

    tokio::select! {
        finished = runner_task => {
            let machine = finished.context("machine runner panicked")?;
            tracing::info!(
                balls = machine.controller().total_known_balls(),
                lost = machine.controller().lost_balls(),
                balanced = machine.ledger_balanced(),
                "Switch input closed"
            );
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            printer.abort();
            return Ok(());
        }
    }

    drop(handle);
    let _ = printer.await;
    Ok(())
}
