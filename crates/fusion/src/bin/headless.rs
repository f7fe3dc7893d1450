//! # Fusion Headless Driver
//!
//! Runs the demo universe for a fixed number of simulation ticks.
//!
//! ```bash
//! # Defaults, 300 ticks
//! fusion_headless
//!
//! # Config file and tick count, with per-tick logs
//! RUST_LOG=fusion_core=debug fusion_headless crates/fusion/config/fusion.toml 600
//! ```

use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use fusion::core::{CoreConfig, CoreError, TaskScheduler};
use fusion::DemoUniverse;
use tracing_subscriber::EnvFilter;

const DEFAULT_TICKS: u64 = 300;
const BODIES: usize = 16;
const REPORT_EVERY: u64 = 60;

fn main() -> ExitCode {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => match CoreConfig::load(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(path = %path, error = %err, "config rejected");
                return ExitCode::FAILURE;
            }
        },
        None => CoreConfig::default(),
    };
    let ticks = match args.next().map(|raw| raw.parse::<u64>()) {
        None => DEFAULT_TICKS,
        Some(Ok(ticks)) => ticks,
        Some(Err(err)) => {
            tracing::error!(error = %err, "tick count must be a non-negative integer");
            return ExitCode::FAILURE;
        }
    };

    match run(&config, ticks) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "driver stopped");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();
}

fn run(config: &CoreConfig, ticks: u64) -> Result<(), CoreError> {
    let mut scheduler = TaskScheduler::from_config(config)?;
    let universe = DemoUniverse::new(BODIES)?;
    universe.install(&mut scheduler);

    if let Some(manager) = scheduler.manager_mut() {
        manager.non_standard_per_thread_callback(|| {
            let thread = std::thread::current();
            tracing::debug!(worker = thread.name().unwrap_or("unnamed"), "worker ready");
        })?;
        manager.add_thread_cleanup(|| {
            tracing::debug!("worker released");
        });
    }

    tracing::info!(ticks, bodies = BODIES, "driver started");
    let started = Instant::now();
    let mut frames = 0u64;

    while scheduler.tick() < ticks {
        let report = scheduler.execute()?;
        frames += 1;

        if report.simulated() && report.context.tick % REPORT_EVERY == 0 {
            let stats = universe.stats();
            tracing::info!(
                tick = report.context.tick,
                frames,
                skipped = report.context.frames_skipped,
                impacts = stats.impacts.load(Ordering::Relaxed),
                replicated_bytes = stats.replicated_bytes.load(Ordering::Relaxed),
                "progress"
            );
        }
        if !report.simulated() {
            // Render-only ticks come back immediately without a limiter
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    let stats = universe.stats();
    tracing::info!(
        ticks = scheduler.tick(),
        frames,
        elapsed = ?started.elapsed(),
        frames_drawn = stats.frames_drawn.load(Ordering::Relaxed),
        impacts = stats.impacts.load(Ordering::Relaxed),
        streamed_us = stats.streamed_us.load(Ordering::Relaxed),
        "driver finished"
    );
    Ok(())
}
