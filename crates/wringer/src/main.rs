//! wringer - start/stop stress harness for continuous capture
//!
//! Spins up N simulated capture devices, each cycling through
//! configure/capture/teardown forever, with every released frame
//! buffer quarantined and poison-checked between cycles. Exits 0 when
//! a bounded run completes clean, nonzero when any session detects a
//! write into released memory.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use poisonpool::BufferPool;
#[cfg(unix)]
use poisonpool::PageGuard;
use wringer::{
    CaptureSession, DisplayMode, Orchestrator, Sabotage, SessionConfig, SimDevice, SimScript,
};

#[derive(Parser)]
#[command(name = "wringer")]
#[command(about = "Start/stop stress harness for continuous capture")]
#[command(version)]
struct Cli {
    /// Number of simulated capture devices
    #[arg(short, long, default_value = "2")]
    devices: usize,

    /// Stop each session after this many cycles (default: run until abort)
    #[arg(short = 'c', long)]
    max_cycles: Option<u64>,

    /// Milliseconds between delivered frames
    #[arg(long, default_value = "5")]
    frame_interval_ms: u64,

    /// Have device 0 write into a released buffer at this byte offset
    /// after every stop, exercising the corruption detector
    #[arg(long)]
    sabotage: Option<usize>,

    /// Back the pools with page-protected quarantine instead of plain
    /// poison-filled heap memory
    #[cfg(unix)]
    #[arg(long)]
    page_guard: bool,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn build_pool(index: usize, cli: &Cli) -> Arc<BufferPool> {
    #[cfg(unix)]
    if cli.page_guard {
        return Arc::new(BufferPool::with_backend(index, Box::new(PageGuard::new())));
    }
    Arc::new(BufferPool::new(index))
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    info!(
        "wringer starting: {} device(s), {} cycle bound",
        cli.devices,
        match cli.max_cycles {
            Some(n) => format!("{n}"),
            None => "no".into(),
        }
    );

    let mut sessions = Vec::with_capacity(cli.devices);
    for index in 0..cli.devices {
        let script = SimScript {
            frame_interval: Duration::from_millis(cli.frame_interval_ms),
            sabotage: match cli.sabotage {
                Some(offset) if index == 0 => Some(Sabotage {
                    offset,
                    ..Default::default()
                }),
                _ => None,
            },
            ..Default::default()
        };
        let device = SimDevice::new(format!("sim-{index}"), script);
        let config = SessionConfig {
            initial_mode: DisplayMode::default(),
            max_cycles: cli.max_cycles,
            ..Default::default()
        };
        sessions.push(CaptureSession::new(
            index,
            Box::new(device),
            build_pool(index, &cli),
            config,
        ));
    }

    let report = Orchestrator::new(sessions).run();

    for stats in &report.stats {
        info!(
            "[{}] {} cycle(s), {} frame(s) ({} with signal){}",
            stats.index,
            stats.cycles,
            stats.frames,
            stats.signal_frames,
            if stats.raised_abort { ", raised abort" } else { "" }
        );
    }

    if report.passed {
        info!("PASS: all sessions completed with clean quarantines");
        Ok(ExitCode::SUCCESS)
    } else {
        error!("FAIL: released-memory corruption detected, see ALERT lines above");
        Ok(ExitCode::FAILURE)
    }
}
