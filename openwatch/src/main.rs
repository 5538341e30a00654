use anyhow::{Context, Result};
use aya::include_bytes_aligned;
use clap::Parser;
use log::{info, warn};
use openwatch::{
    OpenWatchEngine, probes::ProbeMode, settings::Settings, sink::OutputFormat, telemetry,
};

#[derive(Debug, Parser)]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// How to attach the probes
    #[clap(long, value_enum)]
    mode: Option<ProbeMode>,

    /// Event output format
    #[clap(long, value_enum)]
    format: Option<OutputFormat>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "debug" } else { "info" }),
    )
    .init();

    let settings = Settings::new()
        .context("Failed to load settings")?
        .with_overrides(opt.mode, opt.format);

    if let Err(e) = telemetry::init_metrics() {
        warn!("Metrics export disabled: {:#}", e);
    }

    // build.rs cross-compiles openwatch-ebpf and drops the object in OUT_DIR
    let bytecode = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/openwatch"));

    let result = OpenWatchEngine::new(settings).run(bytecode).await;
    telemetry::shutdown_metrics();

    let report = result?;
    info!(
        "Stopped after {} events ({} read errors, {} decode errors)",
        report.events, report.read_errors, report.decode_errors
    );
    Ok(())
}
