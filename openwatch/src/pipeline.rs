//! Startup and shutdown sequencing.
//!
//! Startup: memlock precondition, program load, entry attach, exit attach,
//! ring buffer reader. A failure at any step unwinds what was acquired before
//! it. Shutdown, once the buffer is closed, releases the reader, then the exit
//! attachment, then the entry attachment, then the loaded programs.

use std::io;

use anyhow::Result;
use log::{info, warn};
use thiserror::Error;

use crate::consumer::{Consumer, ConsumerReport, SinkError};
use crate::probes::{AttachError, AttachmentStack, ProbeAttacher};
use crate::ringbuf::{CloseSignal, RecordSource};
use crate::sink::EventSink;

/// Fatal pipeline failures, named after the step that failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to remove the locked memory limit: {0}")]
    Precondition(#[source] io::Error),

    #[error("failed to load probe programs: {0:#}")]
    Load(anyhow::Error),

    #[error("failed to attach entry probe: {0}")]
    AttachEntry(#[source] AttachError),

    #[error("failed to attach exit probe: {0}")]
    AttachExit(#[source] AttachError),

    #[error("failed to open ring buffer reader: {0:#}")]
    OpenBuffer(anyhow::Error),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// eBPF maps and programs live in locked kernel memory; lift the limit once
/// before anything is loaded.
pub fn remove_memlock_limit() -> Result<(), PipelineError> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        return Err(PipelineError::Precondition(io::Error::last_os_error()));
    }
    Ok(())
}

/// Loaded programs that can be attached and whose ring buffer can be opened.
///
/// Dropping the backend unloads the programs.
pub trait ProbeBackend: ProbeAttacher {
    type Source: RecordSource;

    fn open_buffer(&mut self, signal: CloseSignal) -> Result<Self::Source>;
}

pub struct Pipeline<B> {
    backend: B,
    signal: CloseSignal,
}

impl<B: ProbeBackend> Pipeline<B> {
    /// `signal` is the close side of the buffer; closing its closer stops the pipeline.
    pub fn new(backend: B, signal: CloseSignal) -> Self {
        Self { backend, signal }
    }

    /// Attach, stream events into `sink` until the buffer is closed, then tear down.
    pub async fn run<K: EventSink>(self, sink: &mut K) -> Result<ConsumerReport, PipelineError> {
        let Self {
            mut backend,
            signal,
        } = self;
        let target = backend.target().to_string();
        let mut attachments = AttachmentStack::default();

        let entry = backend
            .attach_entry()
            .map_err(PipelineError::AttachEntry)?;
        attachments.push(entry);

        match backend.attach_exit() {
            Ok(exit) => attachments.push(exit),
            Err(e) => {
                attachments.unwind();
                return Err(PipelineError::AttachExit(e));
            }
        }

        let source = match backend.open_buffer(signal) {
            Ok(source) => source,
            Err(e) => {
                attachments.unwind();
                return Err(PipelineError::OpenBuffer(e));
            }
        };

        info!("Tracing {}", target);
        let mut consumer = Consumer::new(source);
        let result = consumer.run(sink).await;

        drop(consumer.into_source());
        let failures = attachments.unwind();
        if !failures.is_empty() {
            warn!("{} probe(s) failed to detach cleanly", failures.len());
        }
        drop(backend);

        Ok(result?)
    }
}
