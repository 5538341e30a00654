pub mod codec;
pub mod consumer;
pub mod pipeline;
pub mod probes;
pub mod ringbuf;
pub mod settings;
pub mod sink;
pub mod telemetry;

use std::io;

use log::{info, warn};
use tokio::signal::{self, unix::SignalKind};

use crate::consumer::ConsumerReport;
use crate::pipeline::{Pipeline, PipelineError};
use crate::probes::KernelProbes;
use crate::ringbuf::{BufferCloser, close_channel};
use crate::settings::Settings;

pub struct OpenWatchEngine {
    pub settings: Settings,
}

impl OpenWatchEngine {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Run until Ctrl-C / SIGTERM closes the ring buffer.
    pub async fn run(self, bytecode: &[u8]) -> Result<ConsumerReport, PipelineError> {
        pipeline::remove_memlock_limit()?;
        info!("Removed locked memory limit");

        let probes = KernelProbes::load(bytecode, self.settings.probe_mode())
            .map_err(PipelineError::Load)?;

        let (closer, signal) = close_channel();
        tokio::spawn(close_on_shutdown_signal(closer));

        let mut sink = self.settings.output_format().sink();
        Pipeline::new(probes, signal).run(&mut sink).await
    }
}

async fn close_on_shutdown_signal(closer: BufferCloser) {
    match wait_for_shutdown_signal().await {
        Ok(()) => {
            info!("Received signal, exiting...");
            closer.close();
        }
        Err(e) => {
            // Keep the closer alive: dropping it would stop the pipeline.
            warn!("Failed to listen for shutdown signals: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

async fn wait_for_shutdown_signal() -> io::Result<()> {
    let mut terminate = signal::unix::signal(SignalKind::terminate())?;
    tokio::select! {
        res = signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}
