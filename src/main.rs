//! blockprobe CLI entry point

use anyhow::{Context, Result};
use blockprobe::aio::DispatchError;
use blockprobe::config::cli::Cli;
use blockprobe::config::toml::{merge_cli_with_config, parse_toml_file};
use blockprobe::config::validator::validate_config;
use blockprobe::config::Config;
use blockprobe::output::{json, text};
use blockprobe::worker::run_job;
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Exit code for a failed watermark check
const EXIT_INTEGRITY: i32 = 2;
/// Exit code for any other fatal run error
const EXIT_FAILED: i32 = 1;

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let base = match &cli.config {
        Some(path) => parse_toml_file(path)?,
        None => Config::default(),
    };
    merge_cli_with_config(cli, base)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(config.output.verbosity);
    validate_config(&config)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        devices = config.job.devices.len(),
        engine = %config.job.engine,
        queue_depth = config.job.queue_depth,
        "blockprobe starting"
    );

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        if handler_stop.swap(true, Ordering::SeqCst) {
            // Second interrupt: give up on the drain
            std::process::exit(130);
        }
        tracing::warn!("interrupted; draining outstanding IO (interrupt again to abort)");
    })
    .context("Failed to install signal handler")?;

    let config = Arc::new(config);
    let started_at = chrono::Utc::now();
    let report = run_job(config.clone(), stop)?;

    if !config.output.quiet {
        text::print_results(&report)?;
    }
    if let Some(path) = &config.output.json_output {
        let summary = json::build_summary(&report, &config, started_at)?;
        json::write_json_output(path, &summary)?;
        tracing::info!(path = %path.display(), "JSON summary written");
    }

    if let Some(err) = report.first_error() {
        let code = match err.downcast_ref::<DispatchError>() {
            Some(DispatchError::Integrity { .. }) => EXIT_INTEGRITY,
            _ => EXIT_FAILED,
        };
        tracing::error!("run failed: {:#}", err);
        std::process::exit(code);
    }

    Ok(())
}
